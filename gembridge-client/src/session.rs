//! The conversation reconstructor: consumes bridge frames and rebuilds
//! an ordered in-memory conversation with rectified streaming chunks, a
//! tool-call lifecycle, permission handling and per-turn hidden-mode
//! gating.
//!
//! Internal state is always updated regardless of emission gating, so a
//! later visibility toggle or an export sees the full truth. Every event
//! handed to the host carries a strictly monotonic `seq`; the host must
//! sort by it when interleaving chat messages with side-channel events.

use crate::diff::{clamp_context, normalize_diff, DEFAULT_DIFF_CONTEXT};
use crate::error::ClientError;
use crate::model::{
    AssistantMessage, ChatMessage, Conversation, PartKind, PendingApproval, PermissionOption,
    ToolCall, ToolStatus, UserMessage,
};
use crate::rectify::rectify;
use crate::title::parse_title;
use gembridge_core::bridge::now_ms;
use gembridge_core::rpc::{
    HiddenMode, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    METHOD_AGENT_EXIT, METHOD_AUTH_URL, METHOD_PROVIDE_PERMISSION, METHOD_REPLAY,
    METHOD_REQUEST_PERMISSION, METHOD_SESSION_CANCEL, METHOD_SESSION_NEW, METHOD_SESSION_PROMPT,
    METHOD_SESSION_UPDATE, METHOD_STRUCTURED_EVENT, METHOD_SUBMIT_AUTH_CODE,
    REPLAY_HIDDEN_FIELD, REPLAY_TURN_FIELD,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub cwd: String,
    pub model: Option<String>,
    /// Context lines for computed unified diffs; negative values fall
    /// back to the default of 3.
    pub diff_context: i64,
    /// Resume an existing agent session instead of opening a new one.
    pub session_id: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            cwd: ".".to_string(),
            model: None,
            diff_context: DEFAULT_DIFF_CONTEXT as i64,
            session_id: None,
        }
    }
}

/// Ordering metadata attached to every host notification.
#[derive(Debug, Clone)]
pub struct EventMeta {
    pub seq: u64,
    pub timestamp: i64,
    pub replay_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    UserMessage {
        message: UserMessage,
    },
    AssistantDelta {
        message_id: String,
        kind: PartKind,
        delta: String,
        full: String,
    },
    ToolCallUpdated {
        call: ToolCall,
    },
    ToolCallCompleted {
        call: ToolCall,
    },
    /// Fired exactly once per assistant message, when its turn ends.
    AssistantFinal {
        message: AssistantMessage,
    },
    TurnCompleted {
        reason: String,
    },
    StructuredEvent {
        event_type: String,
        payload: Option<Value>,
        error: Option<String>,
        raw: String,
    },
    PermissionRequested {
        approval: PendingApproval,
    },
    AuthUrl {
        url: String,
    },
    AgentExit {
        code: Option<i64>,
    },
}

pub type SessionNotification = (SessionEvent, EventMeta);

struct SessionInner {
    conversation: Conversation,
    seq: u64,
    cwd: String,
    model: Option<String>,
    session_id: Option<String>,
    in_turn: bool,
    turn_hidden: HiddenMode,
    active_assistant: Option<usize>,
    prompt_request_id: Option<Value>,
    pending_approvals: HashMap<String, PendingApproval>,
    /// Substituted time source while a replay envelope is processed, so
    /// minted identifiers are reproducible.
    clock_override: Option<i64>,
    replay_id: Option<String>,
    replay_hidden: Option<HiddenMode>,
    diff_context: usize,
    next_request_id: i64,
}

impl SessionInner {
    fn now(&self) -> i64 {
        self.clock_override.unwrap_or_else(now_ms)
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn effective_hidden(&self) -> HiddenMode {
        self.replay_hidden.unwrap_or(self.turn_hidden)
    }
}

pub struct SessionClient {
    inner: Mutex<SessionInner>,
    outbound: mpsc::UnboundedSender<JsonRpcMessage>,
    events: mpsc::UnboundedSender<SessionNotification>,
}

impl SessionClient {
    /// Build a reconstructor. Returns the client plus the outbound frame
    /// stream (for the transport to drain) and the host event stream.
    pub fn new(
        options: SessionOptions,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<JsonRpcMessage>,
        mpsc::UnboundedReceiver<SessionNotification>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            inner: Mutex::new(SessionInner {
                conversation: Conversation::default(),
                seq: 0,
                cwd: options.cwd,
                model: options.model,
                session_id: options.session_id,
                in_turn: false,
                turn_hidden: HiddenMode::None,
                active_assistant: None,
                prompt_request_id: None,
                pending_approvals: HashMap::new(),
                clock_override: None,
                replay_id: None,
                replay_hidden: None,
                diff_context: clamp_context(options.diff_context),
                next_request_id: 1,
            }),
            outbound: outbound_tx,
            events: events_tx,
        });
        (client, outbound_rx, events_rx)
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, inner: &mut SessionInner, seq: u64, event: SessionEvent) {
        let meta = EventMeta {
            seq,
            timestamp: inner.now(),
            replay_id: inner.replay_id.clone(),
        };
        let _ = self.events.send((event, meta));
    }

    fn send(&self, frame: JsonRpcMessage) -> Result<(), ClientError> {
        self.outbound.send(frame).map_err(|_| ClientError::Closed)
    }

    // ========================================================================
    // Host-facing API
    // ========================================================================

    /// Current conversation snapshot.
    pub fn conversation(&self) -> Conversation {
        self.lock().conversation.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().session_id.clone()
    }

    pub fn set_session_id(&self, session_id: String) {
        self.lock().session_id = Some(session_id);
    }

    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.lock().pending_approvals.values().cloned().collect()
    }

    /// Ask the bridge for a fresh agent session in the configured
    /// working directory. The session id is captured from the response
    /// when it arrives.
    pub fn new_session(&self) -> Result<(), ClientError> {
        let (id, cwd, model) = {
            let mut inner = self.lock();
            let id = inner.next_request_id;
            inner.next_request_id += 1;
            (id, inner.cwd.clone(), inner.model.clone())
        };
        let mut params = json!({"cwd": cwd});
        if let Some(model) = model {
            params["model"] = json!(model);
        }
        self.send(JsonRpcMessage::Request(JsonRpcRequest::new(
            json!(id),
            METHOD_SESSION_NEW,
            Some(params),
        )))
    }

    /// Submit a prompt, opening a turn. The prompt is recorded locally
    /// with a generated identifier; there is no wait for a server echo.
    pub fn prompt(&self, text: &str, hidden: HiddenMode) -> Result<(), ClientError> {
        let frame = {
            let mut inner = self.lock();
            let session_id = inner.session_id.clone().ok_or(ClientError::NoSession)?;

            inner.turn_hidden = hidden;
            inner.in_turn = true;
            inner.active_assistant = None;

            let seq = inner.next_seq();
            let timestamp = inner.now();
            let message = UserMessage {
                id: format!("user_{}", timestamp),
                text: text.to_string(),
                hidden: hidden.suppresses_user(),
                timestamp,
                seq,
            };
            inner
                .conversation
                .messages
                .push(ChatMessage::User(message.clone()));
            if !hidden.suppresses_user() {
                self.emit(&mut inner, seq, SessionEvent::UserMessage { message });
            }

            let request_id = inner.next_request_id;
            inner.next_request_id += 1;
            inner.prompt_request_id = Some(json!(request_id));

            let mut item = json!({"type": "text", "text": text});
            if hidden != HiddenMode::None {
                item["meta"] = json!({"hidden": hidden});
            }
            JsonRpcMessage::Request(JsonRpcRequest::new(
                json!(request_id),
                METHOD_SESSION_PROMPT,
                Some(json!({"sessionId": session_id, "prompt": [item]})),
            ))
        };
        self.send(frame)
    }

    /// Cancel the current turn. The client optimistically leaves in-turn
    /// state and synthesizes a turn-completed event; cancellation is not
    /// an error.
    pub fn cancel(&self) -> Result<(), ClientError> {
        let session_id = self.lock().session_id.clone();
        self.send(JsonRpcMessage::Notification(JsonRpcNotification::new(
            METHOD_SESSION_CANCEL,
            Some(json!({"sessionId": session_id})),
        )))?;
        let mut inner = self.lock();
        self.finish_turn(&mut inner, "canceled");
        Ok(())
    }

    /// Deliver the OAuth code announced via the auth URL.
    pub fn submit_auth_code(&self, code: &str) -> Result<(), ClientError> {
        self.send(JsonRpcMessage::Notification(JsonRpcNotification::new(
            METHOD_SUBMIT_AUTH_CODE,
            Some(json!({"code": code})),
        )))
    }

    /// Resolve a pending approval with the selected option. Replies to
    /// the original request and additionally sends the
    /// `session/provide_permission` mirror; some agents require both.
    pub fn resolve_permission(
        &self,
        request_key: &str,
        option_id: &str,
    ) -> Result<(), ClientError> {
        let approval = self
            .lock()
            .pending_approvals
            .remove(request_key)
            .ok_or_else(|| ClientError::UnknownPermissionRequest(request_key.to_string()))?;
        let session_id = self.lock().session_id.clone();
        self.send_permission_outcome(&approval.request_id, option_id, session_id)
    }

    fn send_permission_outcome(
        &self,
        request_id: &Value,
        option_id: &str,
        session_id: Option<String>,
    ) -> Result<(), ClientError> {
        let outcome = json!({"outcome": {"outcome": "selected", "optionId": option_id}});
        self.send(JsonRpcMessage::Response(JsonRpcResponse::ok(
            request_id.clone(),
            outcome.clone(),
        )))?;
        self.send(JsonRpcMessage::Notification(JsonRpcNotification::new(
            METHOD_PROVIDE_PERMISSION,
            Some(json!({
                "sessionId": session_id,
                "requestId": request_id,
                "outcome": outcome["outcome"],
            })),
        )))
    }

    // ========================================================================
    // Frame intake
    // ========================================================================

    pub fn handle_frame(&self, message: &JsonRpcMessage) {
        match message {
            JsonRpcMessage::Notification(notif) => match notif.method.as_str() {
                METHOD_SESSION_UPDATE => self.handle_session_update(notif.params.as_ref()),
                METHOD_REPLAY => self.handle_replay(notif.params.as_ref()),
                METHOD_STRUCTURED_EVENT => self.handle_structured_event(notif.params.as_ref()),
                METHOD_AUTH_URL => self.handle_auth_url(notif.params.as_ref()),
                METHOD_AGENT_EXIT => self.handle_agent_exit(notif.params.as_ref()),
                other => debug!("Ignoring notification: {}", other),
            },
            JsonRpcMessage::Request(req) if req.method == METHOD_REQUEST_PERMISSION => {
                self.handle_permission_request(req)
            }
            JsonRpcMessage::Request(req) => debug!("Ignoring request: {}", req.method),
            JsonRpcMessage::Response(resp) => self.handle_response(resp),
        }
    }

    fn handle_session_update(&self, params: Option<&Value>) {
        let Some(update) = params.and_then(|p| p.get("update")) else {
            warn!("session/update without update payload");
            return;
        };
        let kind = update
            .get("sessionUpdate")
            .and_then(Value::as_str)
            .unwrap_or_default();

        match kind {
            "agent_message_chunk" => self.apply_chunk(PartKind::Text, update),
            "agent_thought_chunk" => self.apply_chunk(PartKind::Thought, update),
            "tool_call" => self.handle_tool_call(update),
            "tool_call_update" => self.handle_tool_call_update(update),
            "end_of_turn" => {
                let mut inner = self.lock();
                self.finish_turn(&mut inner, "end_turn");
            }
            other => debug!("Ignoring session update kind: {}", other),
        }
    }

    /// Open-or-extend the current part of the requested kind.
    /// Rectification is scoped to that part, not to the flat accumulator.
    fn apply_chunk(&self, kind: PartKind, update: &Value) {
        let incoming = update
            .get("content")
            .and_then(|c| c.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        let mut inner = self.lock();
        let seq = inner.next_seq();
        let hidden = inner.effective_hidden();

        let index = self.ensure_active_assistant(&mut inner, seq);
        let Some(ChatMessage::Assistant(message)) = inner.conversation.messages.get_mut(index)
        else {
            return;
        };

        if message.current_part_mut(kind).is_none() {
            message.open_part(kind);
        }
        let Some(part) = message.current_part_mut(kind) else {
            return;
        };

        let delta = rectify(part, incoming);
        part.push_str(&delta);
        message.accumulator_mut(kind).push_str(&delta);
        message.seq = seq;

        let full = message.accumulator_mut(kind).clone();
        let message_id = message.id.clone();
        let event = SessionEvent::AssistantDelta {
            message_id,
            kind,
            delta,
            full,
        };
        if !hidden.suppresses_assistant() {
            self.emit(&mut inner, seq, event);
        }
    }

    fn ensure_active_assistant(&self, inner: &mut SessionInner, seq: u64) -> usize {
        if let Some(index) = inner.active_assistant {
            return index;
        }
        let timestamp = inner.now();
        let hidden = inner.effective_hidden().suppresses_assistant();
        let message = AssistantMessage::new(format!("assistant_{}", timestamp), hidden, timestamp, seq);
        inner
            .conversation
            .messages
            .push(ChatMessage::Assistant(message));
        let index = inner.conversation.messages.len() - 1;
        inner.active_assistant = Some(index);
        index
    }

    fn handle_tool_call(&self, update: &Value) {
        let Some(id) = tool_call_id(update) else {
            warn!("tool_call without id");
            return;
        };

        let mut inner = self.lock();

        // A resent id mutates the existing call instead of violating
        // per-message id uniqueness.
        if let Some(index) = inner.active_assistant {
            if let Some(ChatMessage::Assistant(message)) = inner.conversation.messages.get(index) {
                if message.tool_call(&id).is_some() {
                    drop(inner);
                    self.handle_tool_call_update(update);
                    return;
                }
            }
        }

        let seq = inner.next_seq();
        let hidden = inner.effective_hidden();
        let timestamp = inner.now();
        let diff_context = inner.diff_context;

        let mut call = build_tool_call(&id, update, timestamp, seq);
        apply_content_items(&mut call, update, diff_context);
        let terminal = call.status.is_terminal();

        let index = self.ensure_active_assistant(&mut inner, seq);
        let Some(ChatMessage::Assistant(message)) = inner.conversation.messages.get_mut(index)
        else {
            return;
        };
        message.push_tool_call(call.clone());
        message.seq = seq;

        if !hidden.suppresses_assistant() {
            self.emit(&mut inner, seq, SessionEvent::ToolCallUpdated { call: call.clone() });
            if terminal {
                let seq = inner.next_seq();
                self.emit(&mut inner, seq, SessionEvent::ToolCallCompleted { call });
            }
        }
    }

    fn handle_tool_call_update(&self, update: &Value) {
        let Some(id) = tool_call_id(update) else {
            warn!("tool_call_update without id");
            return;
        };

        let mut inner = self.lock();
        let seq = inner.next_seq();
        let hidden = inner.effective_hidden();
        let diff_context = inner.diff_context;

        let Some(index) = inner.active_assistant else {
            warn!("tool_call_update with no active assistant message");
            return;
        };
        let Some(ChatMessage::Assistant(message)) = inner.conversation.messages.get_mut(index)
        else {
            return;
        };
        let Some(call) = message.tool_call_mut(&id) else {
            warn!("tool_call_update for unknown call: {}", id);
            return;
        };

        let was_terminal = call.status.is_terminal();
        if let Some(status) = update.get("status").and_then(Value::as_str) {
            call.status = ToolStatus::from_wire(status);
        }
        if let Some(title) = update.get("title").and_then(Value::as_str) {
            call.title = title.to_string();
            let parsed = parse_title(title);
            if !parsed.input.is_empty() {
                call.input = Some(parsed.input);
            }
            if parsed.working_dir.is_some() {
                call.working_dir = parsed.working_dir;
            }
            if parsed.description.is_some() {
                call.description = parsed.description;
            }
            if parsed.args.is_some() {
                call.args = parsed.args;
            }
        }
        apply_content_items(call, update, diff_context);
        call.seq = seq;

        let snapshot = call.clone();
        let now_terminal = snapshot.status.is_terminal();
        message.seq = seq;

        if !hidden.suppresses_assistant() {
            self.emit(
                &mut inner,
                seq,
                SessionEvent::ToolCallUpdated {
                    call: snapshot.clone(),
                },
            );
            if now_terminal && !was_terminal {
                let seq = inner.next_seq();
                self.emit(&mut inner, seq, SessionEvent::ToolCallCompleted { call: snapshot });
            }
        }
    }

    /// End the turn: finalize the active assistant message (final-text
    /// exactly once) and report completion.
    fn finish_turn(&self, mut inner: &mut SessionInner, reason: &str) {
        inner.in_turn = false;
        inner.prompt_request_id = None;
        let hidden = inner.effective_hidden();

        if let Some(index) = inner.active_assistant.take() {
            if let Some(ChatMessage::Assistant(message)) = inner.conversation.messages.get_mut(index)
            {
                message.stop_reason = Some(reason.to_string());
                if !message.final_emitted {
                    message.final_emitted = true;
                    let snapshot = message.clone();
                    if !hidden.suppresses_assistant() {
                        let seq = inner.next_seq();
                        self.emit(
                            &mut inner,
                            seq,
                            SessionEvent::AssistantFinal { message: snapshot },
                        );
                    }
                }
            }
        }

        let seq = inner.next_seq();
        self.emit(
            &mut inner,
            seq,
            SessionEvent::TurnCompleted {
                reason: reason.to_string(),
            },
        );
    }

    fn handle_response(&self, response: &JsonRpcResponse) {
        if let Some(session_id) = response
            .result
            .as_ref()
            .and_then(|r| r.get("sessionId"))
            .and_then(Value::as_str)
        {
            self.lock().session_id = Some(session_id.to_string());
        }

        let mut inner = self.lock();
        if inner.prompt_request_id.as_ref() == Some(&response.id) {
            let stop_reason = response
                .result
                .as_ref()
                .and_then(|r| r.get("stopReason"))
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(reason) = stop_reason {
                self.finish_turn(&mut inner, &reason);
            } else if response.error.is_some() {
                self.finish_turn(&mut inner, "error");
            }
        }
    }

    fn handle_permission_request(&self, request: &JsonRpcRequest) {
        let params = request.params.clone().unwrap_or(Value::Null);
        let options = parse_permission_options(&params);

        let mut inner = self.lock();
        let hidden = inner.effective_hidden();

        if hidden.suppresses_assistant() {
            // Hidden turn: auto-reject without surfacing the request.
            let option_id = options
                .iter()
                .find(|o| o.kind.starts_with("deny") || o.kind.starts_with("reject"))
                .or_else(|| options.first())
                .map(|o| o.option_id.clone());
            let session_id = inner.session_id.clone();
            drop(inner);
            if let Some(option_id) = option_id {
                if let Err(e) =
                    self.send_permission_outcome(&request.id, &option_id, session_id)
                {
                    warn!("Failed to auto-reject hidden permission request: {}", e);
                }
            }
            return;
        }

        let seq = inner.next_seq();
        let timestamp = inner.now();

        let tool_call = params
            .get("toolCall")
            .map(|tc| {
                let id = tool_call_id(tc).unwrap_or_else(|| format!("perm_{}", timestamp));
                build_tool_call(&id, tc, timestamp, seq)
            })
            .unwrap_or_else(|| build_tool_call("unknown", &Value::Null, timestamp, seq));

        let approval = PendingApproval {
            request_id: request.id.clone(),
            tool_call,
            options,
        };
        inner
            .pending_approvals
            .insert(request.id.to_string(), approval.clone());
        self.emit(&mut inner, seq, SessionEvent::PermissionRequested { approval });
    }

    fn handle_structured_event(&self, params: Option<&Value>) {
        let Some(params) = params else { return };
        let mut inner = self.lock();
        let seq = inner.next_seq();
        let hidden = inner.effective_hidden();
        let event = SessionEvent::StructuredEvent {
            event_type: params
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            payload: params.get("payload").cloned(),
            error: params
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string),
            raw: params
                .get("raw")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        };
        if !hidden.suppresses_assistant() {
            self.emit(&mut inner, seq, event);
        }
    }

    fn handle_auth_url(&self, params: Option<&Value>) {
        let url = params
            .and_then(|p| p.get("url"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut inner = self.lock();
        let seq = inner.next_seq();
        self.emit(&mut inner, seq, SessionEvent::AuthUrl { url });
    }

    fn handle_agent_exit(&self, params: Option<&Value>) {
        let code = params.and_then(|p| p.get("code")).and_then(Value::as_i64);
        let mut inner = self.lock();
        let seq = inner.next_seq();
        self.emit(&mut inner, seq, SessionEvent::AgentExit { code });
    }

    // ========================================================================
    // Replay intake
    // ========================================================================

    /// Process one replay envelope: substitute the clock with the
    /// envelope timestamp, thread the replay id and hidden mode through
    /// the handlers, and synthesize a user message for replayed prompts.
    fn handle_replay(&self, params: Option<&Value>) {
        let Some(params) = params else { return };
        let timestamp = params.get("timestamp").and_then(Value::as_i64);
        let replay_id = params
            .get("replayId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(mut data) = params.get("data").cloned() else {
            warn!("replay envelope without data");
            return;
        };

        let hidden = data
            .get(REPLAY_HIDDEN_FIELD)
            .map(|h| HiddenMode::from_meta(Some(h)))
            .unwrap_or_default();
        if let Some(obj) = data.as_object_mut() {
            obj.remove(REPLAY_HIDDEN_FIELD);
            obj.remove(REPLAY_TURN_FIELD);
        }

        let frame: JsonRpcMessage = match serde_json::from_value(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Unparseable replayed frame: {}", e);
                return;
            }
        };

        {
            let mut inner = self.lock();
            inner.clock_override = timestamp;
            inner.replay_id = replay_id;
            inner.replay_hidden = Some(hidden);
            // Subsequent live frames of this turn inherit the mode.
            inner.turn_hidden = hidden;
        }

        match &frame {
            JsonRpcMessage::Request(req) if req.method == METHOD_SESSION_PROMPT => {
                self.synthesize_user_message(req, hidden);
            }
            _ => self.handle_frame(&frame),
        }

        let mut inner = self.lock();
        inner.clock_override = None;
        inner.replay_id = None;
        inner.replay_hidden = None;
    }

    /// A replayed (or peer-echoed) prompt becomes a local user message
    /// and opens its turn.
    fn synthesize_user_message(&self, request: &JsonRpcRequest, hidden: HiddenMode) {
        let text = request
            .params
            .as_ref()
            .and_then(|p| p.get("prompt"))
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .and_then(|item| item.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut inner = self.lock();
        inner.in_turn = true;
        inner.active_assistant = None;

        let seq = inner.next_seq();
        let timestamp = inner.now();
        let message = UserMessage {
            id: format!("user_{}", timestamp),
            text,
            hidden: hidden.suppresses_user(),
            timestamp,
            seq,
        };
        inner
            .conversation
            .messages
            .push(ChatMessage::User(message.clone()));
        if !hidden.suppresses_user() {
            self.emit(&mut inner, seq, SessionEvent::UserMessage { message });
        }
    }
}

// ============================================================================
// Wire helpers
// ============================================================================

fn tool_call_id(value: &Value) -> Option<String> {
    value
        .get("toolCallId")
        .or_else(|| value.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn build_tool_call(id: &str, update: &Value, timestamp: i64, seq: u64) -> ToolCall {
    let title = update
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or(id)
        .to_string();
    let parsed = parse_title(&title);
    let name = update
        .get("name")
        .or_else(|| update.get("kind"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            parsed
                .input
                .split_whitespace()
                .next()
                .map(str::to_string)
        })
        .unwrap_or_else(|| title.clone());
    let status = update
        .get("status")
        .and_then(Value::as_str)
        .map(ToolStatus::from_wire)
        .unwrap_or(ToolStatus::Queued);

    ToolCall {
        id: id.to_string(),
        name,
        title,
        status,
        input: (!parsed.input.is_empty()).then_some(parsed.input),
        args: parsed.args,
        description: parsed.description,
        working_dir: parsed.working_dir,
        result: None,
        diff: None,
        timestamp,
        seq,
    }
}

/// Fold `content` items into the call: text-ish items accumulate into
/// `result`, diff payloads normalize into `diff`.
fn apply_content_items(call: &mut ToolCall, update: &Value, diff_context: usize) {
    let Some(items) = update.get("content").and_then(Value::as_array) else {
        return;
    };
    for item in items {
        if let Some(diff) = normalize_diff(item, diff_context) {
            call.diff = Some(diff);
        } else if let Some(text) = item_text(item) {
            call.result.get_or_insert_with(String::new).push_str(&text);
        }
    }
}

fn item_text(item: &Value) -> Option<String> {
    if let Some(text) = item.as_str() {
        return Some(text.to_string());
    }
    if let Some(text) = item.get("text").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    item.get("content")
        .and_then(|c| c.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn parse_permission_options(params: &Value) -> Vec<PermissionOption> {
    params
        .get("options")
        .and_then(Value::as_array)
        .map(|options| {
            options
                .iter()
                .filter_map(|option| {
                    let option_id = option
                        .get("optionId")
                        .or_else(|| option.get("id"))
                        .and_then(Value::as_str)?
                        .to_string();
                    Some(PermissionOption {
                        option_id,
                        kind: option
                            .get("kind")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        label: option
                            .get("label")
                            .or_else(|| option.get("name"))
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}
