//! WebSocket transport: connect with replay query parameters, forward
//! frames both ways, reconnect on a fixed backoff until disposed, and
//! track pending requests so they can reject with a closed-transport
//! error when the connection goes away.

use crate::error::ClientError;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use gembridge_core::rpc::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};

/// Fixed backoff between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct ReplayParams {
    /// Count of turns, not frames.
    pub limit: Option<u64>,
    /// Exclusive millisecond lower bound.
    pub since: Option<i64>,
    /// Exclusive millisecond upper bound.
    pub before: Option<i64>,
}

impl ReplayParams {
    fn query_pairs(&self) -> Vec<String> {
        let mut pairs = Vec::new();
        if let Some(limit) = self.limit {
            pairs.push(format!("limit={}", limit));
        }
        if let Some(since) = self.since {
            pairs.push(format!("since={}", since));
        }
        if let Some(before) = self.before {
            pairs.push(format!("before={}", before));
        }
        pairs
    }
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub url: String,
    pub reconnect: bool,
    pub replay: ReplayParams,
}

impl TransportOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: true,
            replay: ReplayParams::default(),
        }
    }
}

type PendingMap = Arc<DashMap<String, oneshot::Sender<Result<JsonRpcResponse, ClientError>>>>;

pub struct Transport {
    out_tx: mpsc::UnboundedSender<WsMessage>,
    pending: PendingMap,
    disposed: Arc<AtomicBool>,
    next_id: AtomicI64,
}

impl Transport {
    /// Connect (and keep reconnecting, if configured) in a background
    /// task. Incoming frames are delivered to `frames` in arrival order.
    pub fn connect(
        options: TransportOptions,
        frames: mpsc::UnboundedSender<JsonRpcMessage>,
    ) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            out_tx,
            pending: Arc::new(DashMap::new()),
            disposed: Arc::new(AtomicBool::new(false)),
            next_id: AtomicI64::new(1),
        });

        tokio::spawn(run_loop(
            options,
            frames,
            out_rx,
            transport.pending.clone(),
            transport.disposed.clone(),
        ));

        transport
    }

    /// Drain a session's outbound frame stream into this transport.
    pub fn attach_session(
        self: &Arc<Self>,
        mut outbound: mpsc::UnboundedReceiver<JsonRpcMessage>,
    ) {
        let transport = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                if transport.send_frame(&frame).is_err() {
                    break;
                }
            }
        });
    }

    pub fn send_frame(&self, frame: &JsonRpcMessage) -> Result<(), ClientError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let text = serde_json::to_string(frame)?;
        self.out_tx
            .send(WsMessage::Text(text.into()))
            .map_err(|_| ClientError::Closed)
    }

    /// Issue a request and await its response. Transport-minted ids live
    /// in their own `t_` namespace so they never collide with a
    /// session's numeric ids.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, ClientError> {
        let id = format!("t_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Value::String(id.clone()),
            method: method.to_string(),
            params,
        };
        if let Err(e) = self.send_frame(&JsonRpcMessage::Request(request)) {
            self.pending.remove(&id);
            return Err(e);
        }

        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Stop the transport for good; pending requests reject with a
    /// closed-transport error and no further reconnects happen.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        reject_pending(&self.pending);
        let _ = self.out_tx.send(WsMessage::Close(None));
    }
}

fn reject_pending(pending: &PendingMap) {
    let keys: Vec<String> = pending.iter().map(|entry| entry.key().clone()).collect();
    for key in keys {
        if let Some((_, tx)) = pending.remove(&key) {
            let _ = tx.send(Err(ClientError::Closed));
        }
    }
}

fn build_url(options: &TransportOptions) -> String {
    let pairs = options.replay.query_pairs();
    if pairs.is_empty() {
        return options.url.clone();
    }
    let separator = if options.url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", options.url, separator, pairs.join("&"))
}

async fn run_loop(
    options: TransportOptions,
    frames: mpsc::UnboundedSender<JsonRpcMessage>,
    mut out_rx: mpsc::UnboundedReceiver<WsMessage>,
    pending: PendingMap,
    disposed: Arc<AtomicBool>,
) {
    let url = build_url(&options);

    loop {
        if disposed.load(Ordering::SeqCst) {
            break;
        }

        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                debug!("Connected to {}", url);
                let (mut sink, mut source) = stream.split();

                loop {
                    tokio::select! {
                        outgoing = out_rx.recv() => match outgoing {
                            Some(message) => {
                                if sink.send(message).await.is_err() {
                                    debug!("WebSocket send failed");
                                    break;
                                }
                            }
                            // Transport handle dropped; nothing left to do.
                            None => return,
                        },
                        incoming = source.next() => match incoming {
                            Some(Ok(WsMessage::Text(text))) => {
                                if text.as_str() == "pong" {
                                    continue;
                                }
                                match serde_json::from_str::<JsonRpcMessage>(&text) {
                                    Ok(frame) => {
                                        if let JsonRpcMessage::Response(resp) = &frame {
                                            let key = resp.id.as_str()
                                                .map(str::to_string)
                                                .unwrap_or_else(|| resp.id.to_string());
                                            if let Some((_, tx)) = pending.remove(&key) {
                                                let _ = tx.send(Ok(resp.clone()));
                                            }
                                        }
                                        let _ = frames.send(frame);
                                    }
                                    Err(e) => debug!("Dropping unparseable frame: {}", e),
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | None => {
                                debug!("WebSocket closed");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                debug!("WebSocket error: {}", e);
                                break;
                            }
                        },
                    }
                }
            }
            Err(e) => warn!("Failed to connect to {}: {}", url, e),
        }

        // The connection is gone; anything in flight rejects now.
        reject_pending(&pending);

        if disposed.load(Ordering::SeqCst) || !options.reconnect {
            break;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }

    reject_pending(&pending);
}
