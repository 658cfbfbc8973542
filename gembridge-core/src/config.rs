//! Bridge server configuration: TOML file with serde defaults, CLI
//! overrides applied by the binary.

use crate::tag_parser::{TransformMode, DEFAULT_BLOCK_TAG, DEFAULT_JSON_TAG};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Listen port for the WebSocket endpoint.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub debug: bool,

    /// Model identifier passed to the agent on launch.
    #[serde(default)]
    pub model: Option<String>,

    /// Approval mode string passed to the agent on launch.
    #[serde(default)]
    pub approval_mode: Option<String>,

    /// Absolute path to the agent binary. When unset, discovery walks the
    /// candidate list and falls back to the package runner.
    #[serde(default)]
    pub agent_path: Option<PathBuf>,

    /// Executable names probed on PATH when no explicit path is given.
    #[serde(default = "default_agent_names")]
    pub agent_names: Vec<String>,

    /// Package name for the package-runner fallback.
    #[serde(default = "default_agent_package")]
    pub agent_package: String,

    /// Extra arguments appended to the agent command line.
    #[serde(default = "default_agent_args")]
    pub agent_args: Vec<String>,

    /// Project root the agent runs in; canonicalized at startup.
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,

    /// Outgoing transform over assistant text chunks.
    #[serde(default)]
    pub transform_mode: TransformMode,

    #[serde(default = "default_json_tag")]
    pub json_tag: String,

    #[serde(default = "default_block_tag")]
    pub block_tag: String,

    /// Downstream host receiving the end-of-turn checkpoint hook, with
    /// its session identifier and shared secret. All three are required
    /// for the hook to fire.
    #[serde(default)]
    pub checkpoint_host: Option<String>,

    #[serde(default)]
    pub checkpoint_session: Option<String>,

    #[serde(default)]
    pub checkpoint_secret: Option<String>,

    /// Extra environment for the agent subprocess.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_port() -> u16 {
    4444
}

fn default_agent_names() -> Vec<String> {
    vec!["gemini".to_string(), "gemini-cli".to_string()]
}

fn default_agent_package() -> String {
    "@google/gemini-cli".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec!["--experimental-acp".to_string()]
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_json_tag() -> String {
    DEFAULT_JSON_TAG.to_string()
}

fn default_block_tag() -> String {
    DEFAULT_BLOCK_TAG.to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            debug: false,
            model: None,
            approval_mode: None,
            agent_path: None,
            agent_names: default_agent_names(),
            agent_package: default_agent_package(),
            agent_args: default_agent_args(),
            project_root: default_project_root(),
            transform_mode: TransformMode::default(),
            json_tag: default_json_tag(),
            block_tag: default_block_tag(),
            checkpoint_host: None,
            checkpoint_session: None,
            checkpoint_secret: None,
            env: HashMap::new(),
        }
    }
}

impl BridgeConfig {
    /// Whether the checkpoint hook is fully configured.
    pub fn checkpoint_enabled(&self) -> bool {
        self.checkpoint_host.is_some()
            && self.checkpoint_session.is_some()
            && self.checkpoint_secret.is_some()
    }
}

pub fn get_config_path() -> PathBuf {
    let home = if cfg!(target_os = "windows") {
        std::env::var("USERPROFILE").unwrap_or_default()
    } else {
        std::env::var("HOME").unwrap_or_default()
    };

    PathBuf::from(home)
        .join(".config")
        .join("gembridge")
        .join("bridge.toml")
}

pub fn load_config() -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    let config_path = get_config_path();

    if !config_path.exists() {
        debug!("Config file does not exist, using defaults");
        return Ok(BridgeConfig::default());
    }

    debug!("Loading config from: {:?}", config_path);

    let content = fs::read_to_string(&config_path)?;

    let config: BridgeConfig = toml::from_str(&content).map_err(|e| {
        format!(
            "Failed to parse config: {}\n\nExpected format:\nport = 4444\ndebug = false\nproject_root = \"/path/to/project\"\n# agent_path = \"/usr/local/bin/gemini\"\n# transform_mode = \"event\"\n\n[env]\nKEY = \"value\"",
            e
        )
    })?;

    debug!("Loaded config: {:?}", config);

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.port, 4444);
        assert_eq!(config.transform_mode, TransformMode::Event);
        assert_eq!(config.json_tag, "SYS_JSON");
        assert!(!config.checkpoint_enabled());
    }

    #[test]
    fn parses_minimal_toml() {
        let config: BridgeConfig = toml::from_str("port = 5000\n").unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.agent_package, "@google/gemini-cli");
    }

    #[test]
    fn parses_transform_mode() {
        let config: BridgeConfig = toml::from_str("transform_mode = \"both\"\n").unwrap();
        assert_eq!(config.transform_mode, TransformMode::Both);
    }

    #[test]
    fn checkpoint_requires_all_three() {
        let config: BridgeConfig =
            toml::from_str("checkpoint_host = \"http://localhost:3000\"\n").unwrap();
        assert!(!config.checkpoint_enabled());

        let config: BridgeConfig = toml::from_str(
            "checkpoint_host = \"http://localhost:3000\"\ncheckpoint_session = \"s\"\ncheckpoint_secret = \"k\"\n",
        )
        .unwrap();
        assert!(config.checkpoint_enabled());
    }
}
