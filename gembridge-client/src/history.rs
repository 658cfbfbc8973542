//! One-shot history retrieval: open a short-lived connection with replay
//! parameters, capture the replayed conversation until the stream goes
//! quiet, and return it.

use crate::error::ClientError;
use crate::model::Conversation;
use crate::session::{SessionClient, SessionOptions};
use crate::transport::{ReplayParams, Transport, TransportOptions};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct HistoryOptions {
    pub url: String,
    pub replay: ReplayParams,
    /// Quiet period after the first replay frame (and the deadline when
    /// nothing arrives at all).
    pub idle_ms: u64,
    pub diff_context: i64,
}

impl HistoryOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            replay: ReplayParams::default(),
            idle_ms: 1500,
            diff_context: crate::diff::DEFAULT_DIFF_CONTEXT as i64,
        }
    }
}

/// Fetch a historical slice of the bridge's retained conversation.
pub async fn fetch_history(options: HistoryOptions) -> Result<Conversation, ClientError> {
    let (session, outbound, mut events) = SessionClient::new(SessionOptions {
        diff_context: options.diff_context,
        ..SessionOptions::default()
    });

    // Host events are not needed for a capture; drain them so the
    // channel never backs up.
    tokio::spawn(async move { while events.recv().await.is_some() {} });

    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    let transport = Transport::connect(
        TransportOptions {
            url: options.url,
            reconnect: false,
            replay: options.replay,
        },
        frames_tx,
    );
    transport.attach_session(outbound);

    let idle = Duration::from_millis(options.idle_ms.max(1));
    loop {
        match tokio::time::timeout(idle, frames_rx.recv()).await {
            Ok(Some(frame)) => session.handle_frame(&frame),
            Ok(None) => break,
            Err(_) => break,
        }
    }

    transport.dispose();
    Ok(session.conversation())
}
