//! End-of-turn checkpoint hook: POSTs the turn's modified-file set to a
//! configured downstream host.

use crate::config::BridgeConfig;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct CheckpointPayload {
    #[serde(rename = "sessionId")]
    session_id: String,
    turn: i64,
    files: Vec<String>,
}

/// Fire the hook for one completed turn. Never blocks the dispatch path;
/// failures are logged and dropped.
pub fn emit_checkpoint(
    http: &reqwest::Client,
    config: &BridgeConfig,
    turn: i64,
    files: BTreeSet<PathBuf>,
) {
    let (host, session, secret) = match (
        &config.checkpoint_host,
        &config.checkpoint_session,
        &config.checkpoint_secret,
    ) {
        (Some(host), Some(session), Some(secret)) => {
            (host.clone(), session.clone(), secret.clone())
        }
        _ => return,
    };

    let payload = CheckpointPayload {
        session_id: session,
        turn,
        files: files
            .into_iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
    };

    let url = format!("{}/api/checkpoints", host.trim_end_matches('/'));
    let http = http.clone();
    tokio::spawn(async move {
        debug!(
            "Posting checkpoint for turn {} ({} files)",
            payload.turn,
            payload.files.len()
        );
        let result = http
            .post(&url)
            .header("x-bridge-secret", secret)
            .json(&payload)
            .send()
            .await;
        match result {
            Ok(resp) if !resp.status().is_success() => {
                warn!("Checkpoint hook returned status {}", resp.status());
            }
            Ok(_) => {}
            Err(e) => warn!("Checkpoint hook failed: {}", e),
        }
    });
}
