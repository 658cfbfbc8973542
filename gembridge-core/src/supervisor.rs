//! Subprocess supervisor: launch resolution, spawn, stdio task wiring,
//! the auth gate, emulated file-system tools, and crash recovery.
//!
//! The agent's stdin has exactly one writer: the serialized writer task
//! fed through [`AgentHandle::send_line`].

use crate::bridge::{self, BridgeState};
use crate::config::BridgeConfig;
use crate::framer;
use crate::rpc::{
    JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, ERROR_FILE_TOOL_IO, ERROR_INVALID_TOOL_PATH,
    METHOD_FS_READ_TEXT_FILE,
};
use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Delay before a crashed agent is relaunched.
pub const RESTART_DELAY: Duration = Duration::from_secs(2);

/// Agent process I/O: stdin writer, stdout reader, stderr reader, and the
/// child handle (absent for in-memory fakes).
pub type AgentIo = (
    Box<dyn tokio::io::AsyncWrite + Unpin + Send>,
    Box<dyn tokio::io::AsyncBufRead + Unpin + Send>,
    Box<dyn tokio::io::AsyncBufRead + Unpin + Send>,
    Option<Child>,
);

/// Function for starting the agent process; injected so tests can run
/// the bridge against an in-memory agent.
pub type AgentStarterFn = Arc<
    dyn Fn(Arc<BridgeConfig>) -> Pin<Box<dyn std::future::Future<Output = Result<AgentIo>> + Send>>
        + Send
        + Sync,
>;

pub struct AgentHandle {
    starter: AgentStarterFn,
    stdin_tx: RwLock<Option<mpsc::UnboundedSender<String>>>,
    kill_tx: RwLock<Option<mpsc::UnboundedSender<()>>>,
}

impl AgentHandle {
    pub fn new(starter: AgentStarterFn) -> Self {
        Self {
            starter,
            stdin_tx: RwLock::new(None),
            kill_tx: RwLock::new(None),
        }
    }

    /// Queue one line for the serialized stdin writer.
    pub fn send_line(&self, line: String) -> Result<()> {
        let guard = match self.stdin_tx.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(tx) => tx
                .send(line)
                .map_err(|e| anyhow!("agent stdin channel closed: {}", e)),
            None => Err(anyhow!("agent is not running")),
        }
    }

    /// Ask the exit monitor to kill the agent. The monitor handles the
    /// exit broadcast and restart scheduling.
    pub fn kill(&self) {
        let guard = match self.kill_tx.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(());
        }
    }

    fn set_stdin(&self, tx: mpsc::UnboundedSender<String>) {
        let mut guard = match self.stdin_tx.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(tx);
    }

    fn set_kill(&self, tx: mpsc::UnboundedSender<()>) {
        let mut guard = match self.kill_tx.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(tx);
    }
}

// ============================================================================
// Launch resolution
// ============================================================================

#[derive(Debug)]
pub struct ResolvedLaunch {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Walk the candidate list: explicit path, repo-local `node_modules/.bin`
/// entries, then global names on PATH. Falls back to the package runner
/// with an offline-preferred environment.
pub fn resolve_launch(config: &BridgeConfig, project_root: &Path) -> ResolvedLaunch {
    if let Some(path) = &config.agent_path {
        return ResolvedLaunch {
            program: path.clone(),
            args: Vec::new(),
            env: HashMap::new(),
        };
    }

    for name in &config.agent_names {
        let local = project_root.join("node_modules").join(".bin").join(name);
        if local.exists() {
            return ResolvedLaunch {
                program: local,
                args: Vec::new(),
                env: HashMap::new(),
            };
        }
    }

    for name in &config.agent_names {
        if let Ok(found) = which::which(name) {
            return ResolvedLaunch {
                program: found,
                args: Vec::new(),
                env: HashMap::new(),
            };
        }
    }

    let mut env = HashMap::new();
    env.insert("npm_config_prefer_offline".to_string(), "true".to_string());
    ResolvedLaunch {
        program: PathBuf::from("npx"),
        args: vec!["-y".to_string(), config.agent_package.clone()],
        env,
    }
}

async fn probe_version(program: &Path) {
    let probe = tokio::time::timeout(
        Duration::from_secs(5),
        Command::new(program).arg("--version").output(),
    )
    .await;
    match probe {
        Ok(Ok(output)) => {
            let version = String::from_utf8_lossy(&output.stdout);
            let line = version.lines().next().unwrap_or("").trim();
            info!("Agent version: {}", line);
        }
        Ok(Err(e)) => debug!("Version probe failed: {}", e),
        Err(_) => debug!("Version probe timed out"),
    }
}

/// Real starter: resolves and spawns the agent with piped stdio in the
/// canonicalized project root.
pub fn real_agent_starter() -> AgentStarterFn {
    Arc::new(|config: Arc<BridgeConfig>| {
        Box::pin(async move {
            let root = tokio::fs::canonicalize(&config.project_root)
                .await
                .with_context(|| format!("bad project root {:?}", config.project_root))?;
            let launch = resolve_launch(&config, &root);
            info!(
                "Starting agent: {:?} {:?} (cwd {:?})",
                launch.program, launch.args, root
            );
            probe_version(&launch.program).await;

            let mut cmd = Command::new(&launch.program);
            cmd.args(&launch.args).args(&config.agent_args);
            if let Some(model) = &config.model {
                cmd.arg("--model").arg(model);
            }
            if let Some(mode) = &config.approval_mode {
                cmd.arg("--approval-mode").arg(mode);
            }
            cmd.current_dir(&root)
                .env("FORCE_COLOR", "1")
                .envs(&config.env)
                .envs(&launch.env)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            let mut child = cmd.spawn().context("failed to spawn agent process")?;

            let stdin = child.stdin.take().ok_or_else(|| anyhow!("no agent stdin"))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| anyhow!("no agent stdout"))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| anyhow!("no agent stderr"))?;

            Ok::<AgentIo, anyhow::Error>((
                Box::new(stdin),
                Box::new(BufReader::new(stdout)),
                Box::new(BufReader::new(stderr)),
                Some(child),
            ))
        })
    })
}

// ============================================================================
// Spawn and task wiring
// ============================================================================

pub async fn spawn_agent(state: BridgeState) -> Result<()> {
    let (stdin, stdout, stderr, child) = (state.agent.starter)(state.config.clone()).await?;

    // Serialized stdin writer: the only place that writes to the agent.
    let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
    state.agent.set_stdin(stdin_tx);

    let mut stdin_writer = stdin;
    tokio::spawn(async move {
        while let Some(line) = stdin_rx.recv().await {
            if let Err(e) = stdin_writer.write_all(line.as_bytes()).await {
                error!("Failed to write to agent stdin: {}", e);
                break;
            }
            if let Err(e) = stdin_writer.write_all(b"\n").await {
                error!("Failed to write to agent stdin: {}", e);
                break;
            }
            if let Err(e) = stdin_writer.flush().await {
                error!("Failed to flush agent stdin: {}", e);
                break;
            }
        }
        debug!("Agent stdin writer ended");
    });

    // Stdout reader: frame classification and dispatch.
    let state_stdout = state.clone();
    tokio::spawn(async move {
        let mut lines = stdout.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(frame) = framer::classify_line(&line) {
                bridge::handle_agent_frame(&state_stdout, frame).await;
            }
        }
        debug!("Agent stdout reader ended");
    });

    // Stderr reader: rolling log plus debug tracing.
    let state_stderr = state.clone();
    tokio::spawn(async move {
        let mut lines = stderr.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            state_stderr.log_line(&line);
            debug!("agent stderr: {}", line);
        }
        debug!("Agent stderr reader ended");
    });

    let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();
    state.agent.set_kill(kill_tx);

    if let Some(mut child) = child {
        let state_exit = state.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                _ = kill_rx.recv() => {
                    if let Err(e) = child.kill().await {
                        error!("Failed to kill agent: {}", e);
                    }
                    child.wait().await.ok().and_then(|s| s.code())
                }
            };
            bridge::handle_agent_exit(&state_exit, code);
        });
    }

    Ok(())
}

pub fn write_frame_to_agent(state: &BridgeState, message: &JsonRpcMessage) -> Result<()> {
    let line = serde_json::to_string(message)?;
    state.agent.send_line(line)
}

/// Auth-code submission: write the trimmed code to the agent and open the
/// gate.
pub fn submit_auth_code(state: &BridgeState, code: &str) -> Result<()> {
    state.agent.send_line(code.trim().to_string())?;
    state.lock_core().auth_url = None;
    info!("Auth code submitted; gate cleared");
    Ok(())
}

pub fn kill_agent(state: &BridgeState) {
    state.agent.kill();
}

// ============================================================================
// Emulated file-system tools
// ============================================================================

/// Service an `fs/read_text_file` or `fs/write_text_file` request coming
/// from the agent. The response goes back over stdin; these frames are
/// never broadcast or stored.
pub async fn handle_fs_request(state: &BridgeState, request: &JsonRpcRequest) {
    let response = if request.method == METHOD_FS_READ_TEXT_FILE {
        handle_fs_read(state, request).await
    } else {
        handle_fs_write(state, request).await
    };

    if let Err(e) = write_frame_to_agent(state, &JsonRpcMessage::Response(response)) {
        error!("Failed to respond to agent file tool: {}", e);
    }
}

async fn handle_fs_read(state: &BridgeState, request: &JsonRpcRequest) -> JsonRpcResponse {
    let path = match request_path(request) {
        Some(path) => path,
        None => {
            return JsonRpcResponse::err(
                request.id.clone(),
                ERROR_INVALID_TOOL_PATH,
                "missing path parameter",
            )
        }
    };

    let full = match resolve_contained(&state.config.project_root, &path) {
        Ok(full) => full,
        Err(e) => {
            warn!("Refusing file read outside project root: {}", e);
            return JsonRpcResponse::err(request.id.clone(), ERROR_INVALID_TOOL_PATH, e.to_string());
        }
    };

    match tokio::fs::read_to_string(&full).await {
        Ok(content) => JsonRpcResponse::ok(request.id.clone(), json!({"content": content})),
        // A missing file reads as empty, not as an error.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            JsonRpcResponse::ok(request.id.clone(), json!({"content": ""}))
        }
        Err(e) => JsonRpcResponse::err(request.id.clone(), ERROR_FILE_TOOL_IO, e.to_string()),
    }
}

async fn handle_fs_write(state: &BridgeState, request: &JsonRpcRequest) -> JsonRpcResponse {
    let path = match request_path(request) {
        Some(path) => path,
        None => {
            return JsonRpcResponse::err(
                request.id.clone(),
                ERROR_INVALID_TOOL_PATH,
                "missing path parameter",
            )
        }
    };
    let content = request
        .params
        .as_ref()
        .and_then(|p| p.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let full = match resolve_contained(&state.config.project_root, &path) {
        Ok(full) => full,
        Err(e) => {
            warn!("Refusing file write outside project root: {}", e);
            return JsonRpcResponse::err(request.id.clone(), ERROR_INVALID_TOOL_PATH, e.to_string());
        }
    };

    if let Some(parent) = full.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return JsonRpcResponse::err(request.id.clone(), ERROR_FILE_TOOL_IO, e.to_string());
        }
    }

    match tokio::fs::write(&full, content).await {
        Ok(()) => {
            state.lock_core().modified_files.insert(full);
            JsonRpcResponse {
                jsonrpc: crate::rpc::JSONRPC_VERSION.to_string(),
                id: request.id.clone(),
                result: Some(Value::Null),
                error: None,
            }
        }
        Err(e) => JsonRpcResponse::err(request.id.clone(), ERROR_FILE_TOOL_IO, e.to_string()),
    }
}

fn request_path(request: &JsonRpcRequest) -> Option<String> {
    request
        .params
        .as_ref()
        .and_then(|p| p.get("path"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Resolve `raw` against the project root, refusing any path whose
/// canonical form escapes it. `..` components are resolved lexically
/// first, then the deepest existing ancestor is canonicalized so
/// symlinks cannot smuggle the path outside.
pub fn resolve_contained(root: &Path, raw: &str) -> Result<PathBuf> {
    let root = std::fs::canonicalize(root)
        .with_context(|| format!("project root {:?} does not resolve", root))?;

    let joined = {
        let p = Path::new(raw);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            root.join(p)
        }
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            std::path::Component::ParentDir => {
                if !normalized.pop() {
                    bail!("path {:?} escapes the project root", raw);
                }
            }
            std::path::Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }

    let mut existing = normalized.clone();
    let mut tail: Vec<OsString> = Vec::new();
    while !existing.exists() {
        match existing.file_name() {
            Some(name) => {
                tail.push(name.to_owned());
                if !existing.pop() {
                    break;
                }
            }
            None => break,
        }
    }

    let canon = std::fs::canonicalize(&existing).unwrap_or(existing);
    let mut full = canon;
    for part in tail.iter().rev() {
        full.push(part);
    }

    if !full.starts_with(&root) {
        bail!("path {:?} escapes the project root", raw);
    }
    Ok(full)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_resolves_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let full = resolve_contained(dir.path(), "src/main.rs").unwrap();
        assert!(full.starts_with(std::fs::canonicalize(dir.path()).unwrap()));
        assert!(full.ends_with("src/main.rs"));
    }

    #[test]
    fn dotdot_escape_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_contained(dir.path(), "../outside.txt").is_err());
        assert!(resolve_contained(dir.path(), "a/../../outside.txt").is_err());
    }

    #[test]
    fn absolute_path_outside_root_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_contained(dir.path(), "/etc/passwd").is_err());
    }

    #[test]
    fn absolute_path_inside_root_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let inside = dir.path().join("notes.txt");
        std::fs::write(&inside, "hi").unwrap();
        let full = resolve_contained(dir.path(), inside.to_str().unwrap()).unwrap();
        assert!(full.ends_with("notes.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();
        assert!(resolve_contained(dir.path(), "link/secret.txt").is_err());
    }

    #[test]
    fn explicit_agent_path_wins() {
        let config = BridgeConfig {
            agent_path: Some(PathBuf::from("/opt/agent/bin/gemini")),
            ..BridgeConfig::default()
        };
        let launch = resolve_launch(&config, Path::new("/tmp"));
        assert_eq!(launch.program, PathBuf::from("/opt/agent/bin/gemini"));
        assert!(launch.args.is_empty());
    }

    #[test]
    fn repo_local_binary_is_preferred_over_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let bin_dir = dir.path().join("node_modules").join(".bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let local = bin_dir.join("gemini");
        std::fs::write(&local, "#!/bin/sh\n").unwrap();

        let config = BridgeConfig {
            agent_names: vec!["gemini".to_string()],
            ..BridgeConfig::default()
        };
        let launch = resolve_launch(&config, dir.path());
        assert_eq!(launch.program, local);
    }

    #[test]
    fn package_runner_fallback_prefers_offline() {
        let config = BridgeConfig {
            agent_names: vec!["definitely-not-on-path-xyz".to_string()],
            ..BridgeConfig::default()
        };
        let launch = resolve_launch(&config, Path::new("/nonexistent-root"));
        assert_eq!(launch.program, PathBuf::from("npx"));
        assert_eq!(launch.args, vec!["-y", "@google/gemini-cli"]);
        assert_eq!(
            launch.env.get("npm_config_prefer_offline").map(String::as_str),
            Some("true")
        );
    }
}
