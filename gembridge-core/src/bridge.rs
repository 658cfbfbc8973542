//! Session/turn multiplexer: the replay ring, turn counter, hidden-mode
//! table and client fan-out, plus the per-connection WebSocket handler.
//!
//! All mutable bridge state lives in one [`BridgeCore`] behind a single
//! mutex; the lock is only held for short non-awaiting sections. Client
//! sockets are written exclusively by their per-client sender task, and
//! agent stdin is written exclusively by the supervisor's writer task.

use crate::checkpoint;
use crate::config::BridgeConfig;
use crate::framer::StdoutFrame;
use crate::logfile::BridgeLog;
use crate::rpc::{
    is_end_of_turn, HiddenMode, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, METHOD_AUTHENTICATE, METHOD_AUTH_URL,
    METHOD_FS_READ_TEXT_FILE, METHOD_FS_WRITE_TEXT_FILE, METHOD_REPLAY, METHOD_SESSION_PROMPT,
    METHOD_SESSION_UPDATE, METHOD_STRUCTURED_EVENT, METHOD_SUBMIT_AUTH_CODE,
};
use crate::supervisor::{self, AgentHandle, AgentStarterFn};
use crate::tag_parser::StreamTransform;
use anyhow::{anyhow, Result};
use axum::extract::ws::Message;
use dashmap::DashMap;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

pub type ClientId = Uuid;

/// Bound on the replay ring; oldest entries are evicted first.
pub const RING_CAPACITY: usize = 2000;

// Internal message type for WebSocket communication. Usually raw JSON-RPC
// frames, plus the plaintext ping/pong keepalive.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    JsonRpc(JsonRpcMessage),
    Pong,
}

/// One retained protocol event, tagged with the turn that produced it and
/// that turn's hidden mode.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub timestamp: i64,
    pub turn: i64,
    pub hidden: HiddenMode,
    pub frame: JsonRpcMessage,
}

/// The mutable core of the bridge. Every field is protected by the single
/// mutex in [`BridgeState`]; mutations never cross an await point while
/// holding it.
#[derive(Debug, Default)]
pub struct BridgeCore {
    pub ring: VecDeque<EventRecord>,
    pub turn: i64,
    pub hidden_modes: HashMap<i64, HiddenMode>,
    /// Pending OAuth URL; `Some` means the auth gate is closed.
    pub auth_url: Option<String>,
    pub session_id: Option<String>,
    pub modified_files: BTreeSet<PathBuf>,
    pub shutting_down: bool,
}

impl BridgeCore {
    pub fn current_hidden(&self) -> HiddenMode {
        self.hidden_modes
            .get(&self.turn)
            .copied()
            .unwrap_or_default()
    }

    /// Append a record for the current turn, evicting from the front when
    /// over capacity and dropping hidden-mode entries older than the
    /// oldest retained turn.
    pub fn append_record(&mut self, frame: JsonRpcMessage, hidden: HiddenMode) -> EventRecord {
        let timestamp = self
            .ring
            .back()
            .map(|r| r.timestamp.max(now_ms()))
            .unwrap_or_else(now_ms);
        let record = EventRecord {
            timestamp,
            turn: self.turn,
            hidden,
            frame,
        };
        self.ring.push_back(record.clone());
        while self.ring.len() > RING_CAPACITY {
            self.ring.pop_front();
        }
        if let Some(oldest) = self.ring.front().map(|r| r.turn) {
            self.hidden_modes.retain(|turn, _| *turn >= oldest);
        }
        record
    }

    /// Reset state scoped to the subprocess lifetime. Called when the
    /// subprocess is replaced; turn identifiers restart from zero.
    pub fn reset_for_new_agent(&mut self) {
        self.ring.clear();
        self.hidden_modes.clear();
        self.turn = 0;
        self.session_id = None;
        self.auth_url = None;
        self.modified_files.clear();
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct BridgeState {
    pub config: Arc<BridgeConfig>,
    pub core: Arc<Mutex<BridgeCore>>,
    /// Per-client sender channels; the receiving task is the only writer
    /// to that client's socket.
    pub clients: Arc<DashMap<ClientId, mpsc::UnboundedSender<ClientMessage>>>,
    pub agent: Arc<AgentHandle>,
    pub transform: Arc<Mutex<StreamTransform>>,
    pub log: Option<Arc<BridgeLog>>,
    pub http: reqwest::Client,
}

impl BridgeState {
    /// Production constructor: opens the rolling log in the project root
    /// (fatal when unwritable) and uses the real process starter.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let log = Arc::new(BridgeLog::open(&config.project_root)?);
        let mut state = Self::with_agent_starter(config, supervisor::real_agent_starter());
        state.log = Some(log);
        Ok(state)
    }

    pub fn with_agent_starter(config: BridgeConfig, starter: AgentStarterFn) -> Self {
        let transform = StreamTransform::new(
            config.transform_mode,
            &config.json_tag,
            &config.block_tag,
        );
        Self {
            config: Arc::new(config),
            core: Arc::new(Mutex::new(BridgeCore::default())),
            clients: Arc::new(DashMap::new()),
            agent: Arc::new(AgentHandle::new(starter)),
            transform: Arc::new(Mutex::new(transform)),
            log: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn log_line(&self, line: &str) {
        if let Some(log) = &self.log {
            log.append(line);
        }
    }

    pub(crate) fn lock_core(&self) -> std::sync::MutexGuard<'_, BridgeCore> {
        match self.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_transform(&self) -> std::sync::MutexGuard<'_, StreamTransform> {
        match self.transform.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Replay window requested on the connection URL. `limit` counts turns,
/// not frames; `since`/`before` are exclusive millisecond bounds.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplayQuery {
    pub limit: Option<usize>,
    pub since: Option<i64>,
    pub before: Option<i64>,
}

// ============================================================================
// WebSocket handling
// ============================================================================

/// Per-connection driver, generic over the socket halves so integration
/// tests can run it against channel-backed fakes.
pub async fn handle_socket_io<W, R>(
    mut ws_sender: W,
    mut ws_receiver: R,
    state: BridgeState,
    client_id: ClientId,
    query: ReplayQuery,
) where
    W: Sink<Message> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();
    state.clients.insert(client_id, tx.clone());

    // Outgoing pump: the only writer to this client's socket.
    let tx_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let ws_message = match message {
                ClientMessage::JsonRpc(frame) => match serde_json::to_string(&frame) {
                    Ok(json_str) => Message::Text(json_str.into()),
                    Err(_) => continue,
                },
                ClientMessage::Pong => Message::Text("pong".into()),
            };
            if ws_sender.send(ws_message).await.is_err() {
                debug!("WebSocket send failed for: {}", client_id);
                break;
            }
        }
    });

    // Late-joiner catch-up precedes any live traffic to this client.
    send_replay(&state, client_id, &query);

    let state_rx = state.clone();
    let rx_task = tokio::spawn(async move {
        trace!("Starting WebSocket receive loop for: {}", client_id);
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if text.trim() == "ping" {
                        if let Some(tx) = state_rx.clients.get(&client_id) {
                            let _ = tx.send(ClientMessage::Pong);
                        }
                    } else if let Err(e) = handle_client_frame(&state_rx, client_id, &text).await {
                        error!("Error handling client frame: {}", e);
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!("WebSocket closed for: {}", client_id);
                    break;
                }
                Ok(other) => {
                    debug!("Ignoring non-text message for {}: {:?}", client_id, other);
                }
                Err(e) => {
                    debug!("WebSocket error for {}: {}", client_id, e);
                    break;
                }
            }
        }
        trace!("WebSocket receive loop ended for: {}", client_id);
    });

    tokio::select! {
        _ = tx_task => {},
        _ = rx_task => {},
    }

    state.clients.remove(&client_id);
    debug!("WebSocket connection closed: {}", client_id);
}

/// Drain the replay slice to a newly connected client, then re-announce a
/// pending auth URL if any.
fn send_replay(state: &BridgeState, client_id: ClientId, query: &ReplayQuery) {
    let (slice, auth_url) = {
        let core = state.lock_core();
        (replay_slice(&core, query), core.auth_url.clone())
    };

    if let Some(tx) = state.clients.get(&client_id) {
        for (index, record) in slice.iter().enumerate() {
            let _ = tx.send(ClientMessage::JsonRpc(replay_envelope(record, index)));
        }
        if let Some(url) = auth_url {
            let _ = tx.send(ClientMessage::JsonRpc(auth_url_notification(&url)));
        }
    }
}

/// Compute the replay slice: time-window filters first, then keep only
/// the last `limit` distinct turn ids.
pub fn replay_slice(core: &BridgeCore, query: &ReplayQuery) -> Vec<EventRecord> {
    let mut entries: Vec<EventRecord> = core
        .ring
        .iter()
        .filter(|r| query.since.map(|s| r.timestamp > s).unwrap_or(true))
        .filter(|r| query.before.map(|b| r.timestamp < b).unwrap_or(true))
        .cloned()
        .collect();

    if let Some(limit) = query.limit {
        let mut distinct: Vec<i64> = Vec::new();
        for record in &entries {
            if distinct.last() != Some(&record.turn) {
                distinct.push(record.turn);
            }
        }
        let keep: Vec<i64> = distinct.into_iter().rev().take(limit).collect();
        entries.retain(|r| keep.contains(&r.turn));
    }

    entries
}

/// Wrap a stored event for replay. The original turn id and hidden mode
/// ride inside `data` as non-protocol fields.
pub fn replay_envelope(record: &EventRecord, index: usize) -> JsonRpcMessage {
    let mut data = serde_json::to_value(&record.frame).unwrap_or(Value::Null);
    if let Some(obj) = data.as_object_mut() {
        obj.insert(
            crate::rpc::REPLAY_TURN_FIELD.to_string(),
            json!(record.turn),
        );
        obj.insert(
            crate::rpc::REPLAY_HIDDEN_FIELD.to_string(),
            json!(record.hidden),
        );
    }
    JsonRpcMessage::Notification(JsonRpcNotification::new(
        METHOD_REPLAY,
        Some(json!({
            "timestamp": record.timestamp,
            "replayId": format!("{}-{}", record.timestamp, index),
            "data": data,
        })),
    ))
}

fn auth_url_notification(url: &str) -> JsonRpcMessage {
    JsonRpcMessage::Notification(JsonRpcNotification::new(
        METHOD_AUTH_URL,
        Some(json!({"url": url})),
    ))
}

// ============================================================================
// Inbound frames (from clients)
// ============================================================================

pub async fn handle_client_frame(
    state: &BridgeState,
    client_id: ClientId,
    text: &str,
) -> Result<()> {
    let message: JsonRpcMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            // Parse errors drop the frame, never the connection.
            warn!("Dropping unparseable client frame: {}", e);
            return Ok(());
        }
    };

    match &message {
        JsonRpcMessage::Notification(notif) if notif.method == METHOD_SUBMIT_AUTH_CODE => {
            let code = notif
                .params
                .as_ref()
                .and_then(|p| p.get("code"))
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("submitAuthCode without code"))?;
            supervisor::submit_auth_code(state, code)
        }
        JsonRpcMessage::Request(req) if req.method == METHOD_AUTHENTICATE => {
            supervisor::write_frame_to_agent(state, &message)
        }
        _ => {
            let auth_pending = state.lock_core().auth_url.is_some();
            if auth_pending {
                debug!(
                    "Dropping client frame while authentication is pending: {:?}",
                    message.method()
                );
                return Ok(());
            }
            match &message {
                JsonRpcMessage::Request(req) if req.method == METHOD_SESSION_PROMPT => {
                    handle_prompt(state, client_id, req)
                }
                _ => supervisor::write_frame_to_agent(state, &message),
            }
        }
    }
}

/// A prompt opens a new turn: bump the counter, record the frame, echo it
/// to the other clients, then forward it (hidden-mode metadata stripped)
/// to the agent.
fn handle_prompt(state: &BridgeState, sender: ClientId, request: &JsonRpcRequest) -> Result<()> {
    let hidden = prompt_hidden_mode(request);

    let (record, index) = {
        let mut core = state.lock_core();
        core.turn += 1;
        let turn = core.turn;
        core.hidden_modes.insert(turn, hidden);
        let record = core.append_record(JsonRpcMessage::Request(request.clone()), hidden);
        (record, core.ring.len().saturating_sub(1))
    };

    // Real-time peer echo: every other client sees the prompt wrapped in
    // a replay envelope carrying the fresh turn id and hidden mode.
    let envelope = replay_envelope(&record, index);
    broadcast(state, &envelope, Some(sender));

    let stripped = strip_hidden_meta(request);
    supervisor::write_frame_to_agent(state, &JsonRpcMessage::Request(stripped))
}

/// The hidden-mode hint rides on the first prompt item's metadata.
fn prompt_hidden_mode(request: &JsonRpcRequest) -> HiddenMode {
    let meta_hidden = request
        .params
        .as_ref()
        .and_then(|p| p.get("prompt"))
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(|item| item.get("meta"))
        .and_then(|meta| meta.get("hidden"));
    HiddenMode::from_meta(meta_hidden)
}

/// Remove the hidden-mode metadata before the frame reaches the agent.
fn strip_hidden_meta(request: &JsonRpcRequest) -> JsonRpcRequest {
    let mut request = request.clone();
    if let Some(items) = request
        .params
        .as_mut()
        .and_then(|p| p.get_mut("prompt"))
        .and_then(Value::as_array_mut)
    {
        for item in items {
            let empty = item
                .get_mut("meta")
                .and_then(Value::as_object_mut)
                .map(|meta| {
                    meta.remove("hidden");
                    meta.is_empty()
                });
            if empty == Some(true) {
                if let Some(obj) = item.as_object_mut() {
                    obj.remove("meta");
                }
            }
        }
    }
    request
}

// ============================================================================
// Outbound frames (from the agent via the framer)
// ============================================================================

pub async fn handle_agent_frame(state: &BridgeState, frame: StdoutFrame) {
    match frame {
        StdoutFrame::JsonRpc(message) => match &message {
            JsonRpcMessage::Request(req)
                if req.method == METHOD_FS_READ_TEXT_FILE
                    || req.method == METHOD_FS_WRITE_TEXT_FILE =>
            {
                supervisor::handle_fs_request(state, req).await;
            }
            _ => dispatch_outbound(state, &message),
        },
        StdoutFrame::AuthUrl(url) => {
            info!("Agent requested authentication");
            let record = {
                let mut core = state.lock_core();
                core.auth_url = Some(url.clone());
                let hidden = core.current_hidden();
                core.append_record(auth_url_notification(&url), hidden)
            };
            broadcast(state, &record.frame, None);
        }
        StdoutFrame::Log(line) => {
            state.log_line(&line);
            debug!("agent: {}", line);
        }
    }
}

/// Feed a frame through the outgoing transform, then apply the outbound
/// policy to each resulting frame in order: record stream-of-record
/// frames in the ring, broadcast, and fire the checkpoint hook at end of
/// turn.
fn dispatch_outbound(state: &BridgeState, message: &JsonRpcMessage) {
    let frames = state.lock_transform().process(message);

    for frame in frames {
        if let JsonRpcMessage::Response(resp) = &frame {
            capture_session_id(state, resp);
            if is_auth_failure(resp) {
                warn!("Authentication failure reported by agent; restarting it");
                broadcast(state, &frame, None);
                supervisor::kill_agent(state);
                continue;
            }
        }

        let end_of_turn = is_end_of_turn(&frame);

        let checkpoint_work = {
            let mut core = state.lock_core();
            if is_stream_of_record(&frame) {
                let hidden = core.current_hidden();
                core.append_record(frame.clone(), hidden);
            }
            if end_of_turn && !core.modified_files.is_empty() {
                Some((core.turn, std::mem::take(&mut core.modified_files)))
            } else {
                None
            }
        };

        broadcast(state, &frame, None);

        if let Some((turn, files)) = checkpoint_work {
            checkpoint::emit_checkpoint(&state.http, &state.config, turn, files);
        }
    }
}

fn capture_session_id(state: &BridgeState, response: &JsonRpcResponse) {
    let session_id = response
        .result
        .as_ref()
        .and_then(|r| r.get("sessionId"))
        .and_then(Value::as_str);
    if let Some(session_id) = session_id {
        let mut core = state.lock_core();
        if core.session_id.as_deref() != Some(session_id) {
            info!("Agent session established: {}", session_id);
            core.session_id = Some(session_id.to_string());
        }
    }
}

fn is_auth_failure(response: &JsonRpcResponse) -> bool {
    response
        .error
        .as_ref()
        .map(|e| {
            let message = e.message.to_ascii_lowercase();
            message.contains("not authenticated")
                || message.contains("authentication required")
                || message.contains("please sign in")
        })
        .unwrap_or(false)
}

/// Frames relevant to replay: session updates, permission requests,
/// auth-URL announcements and structured events. Responses, cancellations
/// and internal tool replies are not stored.
pub fn is_stream_of_record(message: &JsonRpcMessage) -> bool {
    match message {
        JsonRpcMessage::Notification(notif) => matches!(
            notif.method.as_str(),
            METHOD_SESSION_UPDATE | METHOD_AUTH_URL | METHOD_STRUCTURED_EVENT
        ),
        JsonRpcMessage::Request(req) => req.method == crate::rpc::METHOD_REQUEST_PERMISSION,
        JsonRpcMessage::Response(_) => false,
    }
}

pub fn broadcast(state: &BridgeState, message: &JsonRpcMessage, except: Option<ClientId>) {
    for entry in state.clients.iter() {
        if Some(*entry.key()) == except {
            continue;
        }
        let _ = entry.value().send(ClientMessage::JsonRpc(message.clone()));
    }
}

/// Exit handling: announce, clear subprocess-scoped auth/session state,
/// and schedule a restart unless the bridge is shutting down.
pub fn handle_agent_exit(state: &BridgeState, code: Option<i32>) {
    let message = format!(
        "agent exited with code {}",
        code.map(|c| c.to_string()).unwrap_or_else(|| "?".to_string())
    );
    state.log_line(&message);
    info!("{}", message);

    let shutting_down = {
        let mut core = state.lock_core();
        core.session_id = None;
        core.auth_url = None;
        core.shutting_down
    };

    let exit_notification = JsonRpcMessage::Notification(JsonRpcNotification::new(
        crate::rpc::METHOD_AGENT_EXIT,
        Some(json!({"code": code})),
    ));
    broadcast(state, &exit_notification, None);

    if shutting_down {
        return;
    }

    let state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(supervisor::RESTART_DELAY).await;
        if state.lock_core().shutting_down {
            return;
        }
        // A replacement subprocess begins a fresh session: the turn
        // counter restarts and the retained history with it.
        state.lock_core().reset_for_new_agent();
        if let Err(e) = supervisor::spawn_agent(state.clone()).await {
            error!("Failed to restart agent: {}", e);
        }
    });
}
