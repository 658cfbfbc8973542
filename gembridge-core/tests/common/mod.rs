//! Shared harness: an in-memory agent wired through duplex pipes and a
//! channel-backed WebSocket, so the full bridge runs without spawning
//! processes or binding ports.

use anyhow::anyhow;
use axum::extract::ws::Message;
use futures::channel::mpsc as futures_mpsc;
use futures::StreamExt;
use gembridge_core::bridge::{self, BridgeState, ReplayQuery};
use gembridge_core::config::BridgeConfig;
use gembridge_core::supervisor::{AgentIo, AgentStarterFn};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use uuid::Uuid;

/// The test's view of the fake agent: what the bridge wrote to its
/// stdin, and a writer for its stdout.
pub struct FakeAgent {
    pub stdin: BufReader<DuplexStream>,
    pub stdout: DuplexStream,
}

pub fn fake_agent_starter() -> (AgentStarterFn, FakeAgent) {
    let (stdin_writer, stdin_reader) = tokio::io::duplex(1 << 16);
    let (stdout_writer, stdout_reader) = tokio::io::duplex(1 << 16);
    let (_stderr_writer, stderr_reader) = tokio::io::duplex(1 << 16);

    let io: AgentIo = (
        Box::new(stdin_writer),
        Box::new(BufReader::new(stdout_reader)),
        Box::new(BufReader::new(stderr_reader)),
        None,
    );
    let slot = Mutex::new(Some(io));
    let starter: AgentStarterFn = Arc::new(move |_config| {
        let io = slot.lock().expect("starter slot").take();
        Box::pin(async move { io.ok_or_else(|| anyhow!("fake agent already started")) })
    });

    (
        starter,
        FakeAgent {
            stdin: BufReader::new(stdin_reader),
            stdout: stdout_writer,
        },
    )
}

pub fn test_config(project_root: &std::path::Path) -> BridgeConfig {
    BridgeConfig {
        project_root: project_root.to_path_buf(),
        ..BridgeConfig::default()
    }
}

/// A connected fake client: a sender for inbound frames and a receiver
/// for everything the bridge pushes.
pub struct FakeClient {
    pub to_bridge: futures_mpsc::UnboundedSender<Result<Message, axum::Error>>,
    pub from_bridge: futures_mpsc::UnboundedReceiver<Message>,
}

pub fn connect_client(state: &BridgeState, query: ReplayQuery) -> FakeClient {
    let (out_tx, out_rx) = futures_mpsc::unbounded::<Message>();
    let (in_tx, in_rx) = futures_mpsc::unbounded::<Result<Message, axum::Error>>();
    let client_id = Uuid::new_v4();

    let state = state.clone();
    tokio::spawn(async move {
        bridge::handle_socket_io(out_tx, in_rx, state, client_id, query).await;
    });

    FakeClient {
        to_bridge: in_tx,
        from_bridge: out_rx,
    }
}

impl FakeClient {
    pub fn send_json(&self, value: &Value) {
        self.to_bridge
            .unbounded_send(Ok(Message::Text(value.to_string().into())))
            .expect("client send");
    }

    /// Next JSON frame from the bridge, with a deadline.
    pub async fn recv_json(&mut self) -> Value {
        let message = tokio::time::timeout(Duration::from_secs(5), self.from_bridge.next())
            .await
            .expect("timed out waiting for frame")
            .expect("bridge closed the socket");
        match message {
            Message::Text(text) => serde_json::from_str(&text).expect("frame is JSON"),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    /// True when nothing is queued for this client right now.
    pub fn is_idle(&mut self) -> bool {
        matches!(self.from_bridge.try_next(), Err(_))
    }
}

impl FakeAgent {
    /// Next line the bridge wrote to the agent's stdin, parsed.
    pub async fn recv_json(&mut self) -> Value {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), self.stdin.read_line(&mut line))
            .await
            .expect("timed out waiting for agent stdin")
            .expect("agent stdin closed");
        serde_json::from_str(line.trim()).expect("stdin line is JSON")
    }

    pub async fn recv_line(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), self.stdin.read_line(&mut line))
            .await
            .expect("timed out waiting for agent stdin")
            .expect("agent stdin closed");
        line.trim_end().to_string()
    }

    /// Emit one stdout line from the agent.
    pub async fn emit_line(&mut self, line: &str) {
        self.stdout
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .expect("agent stdout write");
        self.stdout.flush().await.expect("agent stdout flush");
    }

    pub async fn emit_json(&mut self, value: &Value) {
        self.emit_line(&value.to_string()).await;
    }
}

/// Let the bridge's spawned tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
