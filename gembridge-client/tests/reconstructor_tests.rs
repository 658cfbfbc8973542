//! End-to-end reconstructor scenarios: frames in, conversation model and
//! ordered host events out.

use gembridge_client::{
    ChatMessage, ContentPart, HiddenMode, JsonRpcMessage, SessionClient, SessionEvent,
    SessionNotification, SessionOptions, ToolStatus,
};
use gembridge_core::rpc::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, METHOD_PROVIDE_PERMISSION,
    METHOD_REPLAY, METHOD_REQUEST_PERMISSION, METHOD_SESSION_UPDATE,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

fn session() -> (
    Arc<SessionClient>,
    mpsc::UnboundedReceiver<JsonRpcMessage>,
    mpsc::UnboundedReceiver<SessionNotification>,
) {
    SessionClient::new(SessionOptions {
        session_id: Some("s1".to_string()),
        ..SessionOptions::default()
    })
}

fn update(update: Value) -> JsonRpcMessage {
    JsonRpcMessage::Notification(JsonRpcNotification::new(
        METHOD_SESSION_UPDATE,
        Some(json!({"sessionId": "s1", "update": update})),
    ))
}

fn text_chunk(text: &str) -> JsonRpcMessage {
    update(json!({
        "sessionUpdate": "agent_message_chunk",
        "content": {"type": "text", "text": text},
    }))
}

fn thought_chunk(text: &str) -> JsonRpcMessage {
    update(json!({
        "sessionUpdate": "agent_thought_chunk",
        "content": {"type": "text", "text": text},
    }))
}

fn end_of_turn() -> JsonRpcMessage {
    update(json!({"sessionUpdate": "end_of_turn"}))
}

fn drain(
    events: &mut mpsc::UnboundedReceiver<SessionNotification>,
) -> Vec<SessionNotification> {
    let mut out = Vec::new();
    while let Ok(notification) = events.try_recv() {
        out.push(notification);
    }
    out
}

#[tokio::test]
async fn interleaved_text_and_tool_content() {
    let (client, _outbound, mut events) = session();

    client.handle_frame(&text_chunk("Starting analysis..."));
    client.handle_frame(&update(json!({
        "sessionUpdate": "tool_call",
        "id": "ls-1",
        "title": "ls",
        "status": "running",
    })));
    client.handle_frame(&text_chunk("Found files."));
    client.handle_frame(&end_of_turn());

    let conversation = client.conversation();
    assert_eq!(conversation.messages.len(), 1);
    let ChatMessage::Assistant(message) = &conversation.messages[0] else {
        panic!("expected assistant message");
    };

    assert_eq!(message.content.len(), 3);
    match &message.content[0] {
        ContentPart::Text { text } => assert_eq!(text, "Starting analysis..."),
        other => panic!("expected text part, got {:?}", other),
    }
    match &message.content[1] {
        ContentPart::ToolCall { call } => {
            assert_eq!(call.id, "ls-1");
            assert_eq!(call.status, ToolStatus::Running);
        }
        other => panic!("expected tool call part, got {:?}", other),
    }
    match &message.content[2] {
        ContentPart::Text { text } => assert_eq!(text, "Found files."),
        other => panic!("expected text part, got {:?}", other),
    }

    assert_eq!(message.text, "Starting analysis...Found files.");
    assert_eq!(message.stop_reason.as_deref(), Some("end_turn"));

    let notifications = drain(&mut events);
    let finals = notifications
        .iter()
        .filter(|(e, _)| matches!(e, SessionEvent::AssistantFinal { .. }))
        .count();
    assert_eq!(finals, 1, "final-text event fires exactly once");
}

#[tokio::test]
async fn overlapping_resend_stays_one_part() {
    let (client, _outbound, _events) = session();

    client.handle_frame(&text_chunk("Hello"));
    client.handle_frame(&text_chunk("lo world"));

    let conversation = client.conversation();
    let ChatMessage::Assistant(message) = &conversation.messages[0] else {
        panic!("expected assistant message");
    };
    assert_eq!(message.content.len(), 1);
    match &message.content[0] {
        ContentPart::Text { text } => assert_eq!(text, "Hello world"),
        other => panic!("expected text part, got {:?}", other),
    }
    assert_eq!(message.text, "Hello world");
}

#[tokio::test]
async fn rectification_is_scoped_to_the_current_part() {
    let (client, _outbound, _events) = session();

    client.handle_frame(&thought_chunk("Thinking about files..."));
    client.handle_frame(&update(json!({
        "sessionUpdate": "tool_call",
        "id": "ls-2",
        "title": "ls",
        "status": "running",
    })));
    client.handle_frame(&thought_chunk("Found"));
    client.handle_frame(&thought_chunk("Found it"));

    let conversation = client.conversation();
    let ChatMessage::Assistant(message) = &conversation.messages[0] else {
        panic!("expected assistant message");
    };

    assert_eq!(message.content.len(), 3);
    match &message.content[0] {
        ContentPart::Thought { thought } => assert_eq!(thought, "Thinking about files..."),
        other => panic!("expected thought part, got {:?}", other),
    }
    assert!(matches!(&message.content[1], ContentPart::ToolCall { .. }));
    match &message.content[2] {
        ContentPart::Thought { thought } => assert_eq!(thought, "Found it"),
        other => panic!("expected thought part, got {:?}", other),
    }

    assert_eq!(message.thought, "Thinking about files...Found it");
}

#[tokio::test]
async fn tool_call_update_mutates_and_completes() {
    let (client, _outbound, mut events) = session();

    client.handle_frame(&update(json!({
        "sessionUpdate": "tool_call",
        "id": "write-1",
        "title": "write_file [current working directory /srv/app] (save changes)",
        "status": "in_progress",
    })));
    client.handle_frame(&update(json!({
        "sessionUpdate": "tool_call_update",
        "id": "write-1",
        "status": "completed",
        "content": [
            {"type": "text", "text": "wrote 2 files"},
            {"type": "diff", "path": "a.txt", "oldText": "x\n", "newText": "y\n"},
        ],
    })));

    let conversation = client.conversation();
    let ChatMessage::Assistant(message) = &conversation.messages[0] else {
        panic!("expected assistant message");
    };
    let call = message.tool_call("write-1").expect("tool call");
    assert_eq!(call.status, ToolStatus::Completed);
    assert_eq!(call.working_dir.as_deref(), Some("/srv/app"));
    assert_eq!(call.description.as_deref(), Some("save changes"));
    assert_eq!(call.input.as_deref(), Some("write_file"));
    assert_eq!(call.result.as_deref(), Some("wrote 2 files"));
    let diff = call.diff.as_ref().expect("diff");
    assert_eq!(diff.path.as_deref(), Some("a.txt"));
    assert!(diff.unified.contains("-x"));
    assert!(diff.unified.contains("+y"));

    let notifications = drain(&mut events);
    let completed = notifications
        .iter()
        .filter(|(e, _)| matches!(e, SessionEvent::ToolCallCompleted { .. }))
        .count();
    assert_eq!(completed, 1);
}

#[tokio::test]
async fn seq_is_strictly_monotonic_across_event_kinds() {
    let (client, _outbound, mut events) = session();
    client.prompt("hello", HiddenMode::None).unwrap();

    client.handle_frame(&text_chunk("A"));
    client.handle_frame(&JsonRpcMessage::Notification(JsonRpcNotification::new(
        "bridge/structured_event",
        Some(json!({"sessionId": "s1", "type": "sys_json", "payload": {"k": 1}, "raw": "{\"k\":1}"})),
    )));
    client.handle_frame(&text_chunk("AB"));
    client.handle_frame(&end_of_turn());

    let notifications = drain(&mut events);
    assert!(notifications.len() >= 4);
    let mut last = 0;
    for (_, meta) in &notifications {
        assert!(meta.seq > last, "seq must strictly increase");
        last = meta.seq;
    }
}

#[tokio::test]
async fn prompt_response_with_stop_reason_ends_turn() {
    let (client, mut outbound, mut events) = session();
    client.prompt("do it", HiddenMode::None).unwrap();

    let prompt_frame = outbound.try_recv().unwrap();
    let JsonRpcMessage::Request(prompt_request) = prompt_frame else {
        panic!("expected prompt request");
    };

    client.handle_frame(&text_chunk("done"));
    client.handle_frame(&JsonRpcMessage::Response(JsonRpcResponse::ok(
        prompt_request.id.clone(),
        json!({"stopReason": "end_turn"}),
    )));

    let notifications = drain(&mut events);
    let reasons: Vec<String> = notifications
        .iter()
        .filter_map(|(e, _)| match e {
            SessionEvent::TurnCompleted { reason } => Some(reason.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec!["end_turn".to_string()]);

    // The assistant message was finalized with the stop reason.
    let conversation = client.conversation();
    let ChatMessage::Assistant(message) = &conversation.messages[1] else {
        panic!("expected assistant message");
    };
    assert_eq!(message.stop_reason.as_deref(), Some("end_turn"));
}

#[tokio::test]
async fn permission_request_surfaces_and_resolves_with_double_signal() {
    let (client, mut outbound, mut events) = session();

    let request = JsonRpcRequest::new(
        json!(42),
        METHOD_REQUEST_PERMISSION,
        Some(json!({
            "sessionId": "s1",
            "toolCall": {"id": "rm-1", "title": "rm -rf build (clean)"},
            "options": [
                {"optionId": "allow", "kind": "allow_once", "label": "Allow"},
                {"optionId": "deny", "kind": "deny", "label": "Deny"},
            ],
        })),
    );
    client.handle_frame(&JsonRpcMessage::Request(request));

    let notifications = drain(&mut events);
    let approval = notifications
        .iter()
        .find_map(|(e, _)| match e {
            SessionEvent::PermissionRequested { approval } => Some(approval.clone()),
            _ => None,
        })
        .expect("permission event");
    assert_eq!(approval.tool_call.id, "rm-1");
    assert_eq!(approval.tool_call.description.as_deref(), Some("clean"));
    assert_eq!(approval.options.len(), 2);

    client.resolve_permission("42", "allow").unwrap();

    let response = outbound.try_recv().unwrap();
    match response {
        JsonRpcMessage::Response(resp) => {
            assert_eq!(resp.id, json!(42));
            let result = resp.result.unwrap();
            assert_eq!(result["outcome"]["outcome"], "selected");
            assert_eq!(result["outcome"]["optionId"], "allow");
        }
        other => panic!("expected response, got {:?}", other),
    }

    let mirror = outbound.try_recv().unwrap();
    match mirror {
        JsonRpcMessage::Notification(notif) => {
            assert_eq!(notif.method, METHOD_PROVIDE_PERMISSION);
            let params = notif.params.unwrap();
            assert_eq!(params["outcome"]["optionId"], "allow");
        }
        other => panic!("expected notification, got {:?}", other),
    }

    assert!(client.pending_approvals().is_empty());
}

#[tokio::test]
async fn hidden_turn_auto_rejects_permissions() {
    let (client, mut outbound, mut events) = session();
    client.prompt("covert", HiddenMode::Assistant).unwrap();
    let _prompt = outbound.try_recv().unwrap();
    let _ = drain(&mut events);

    let request = JsonRpcRequest::new(
        json!(7),
        METHOD_REQUEST_PERMISSION,
        Some(json!({
            "sessionId": "s1",
            "toolCall": {"id": "rm-2", "title": "rm"},
            "options": [
                {"optionId": "allow", "kind": "allow_once", "label": "Allow"},
                {"optionId": "deny-once", "kind": "reject_once", "label": "Reject"},
            ],
        })),
    );
    client.handle_frame(&JsonRpcMessage::Request(request));

    // No user-visible event.
    let notifications = drain(&mut events);
    assert!(notifications
        .iter()
        .all(|(e, _)| !matches!(e, SessionEvent::PermissionRequested { .. })));

    // Auto-selected the first deny/reject option.
    let response = outbound.try_recv().unwrap();
    match response {
        JsonRpcMessage::Response(resp) => {
            let result = resp.result.unwrap();
            assert_eq!(result["outcome"]["optionId"], "deny-once");
        }
        other => panic!("expected response, got {:?}", other),
    }
    assert!(client.pending_approvals().is_empty());
}

#[tokio::test]
async fn hidden_assistant_suppresses_but_records() {
    let (client, _outbound, mut events) = session();
    client.prompt("quiet", HiddenMode::Assistant).unwrap();
    let _ = drain(&mut events);

    client.handle_frame(&text_chunk("invisible text"));
    client.handle_frame(&end_of_turn());

    let notifications = drain(&mut events);
    assert!(notifications
        .iter()
        .all(|(e, _)| !matches!(e, SessionEvent::AssistantDelta { .. })));
    assert!(notifications
        .iter()
        .all(|(e, _)| !matches!(e, SessionEvent::AssistantFinal { .. })));
    // Turn completion is still reported.
    assert!(notifications
        .iter()
        .any(|(e, _)| matches!(e, SessionEvent::TurnCompleted { .. })));

    // The model keeps the full truth.
    let conversation = client.conversation();
    let ChatMessage::Assistant(message) = &conversation.messages[1] else {
        panic!("expected assistant message");
    };
    assert_eq!(message.text, "invisible text");
    assert!(message.hidden);
}

#[tokio::test]
async fn replayed_prompt_synthesizes_user_message() {
    let (client, _outbound, mut events) = session();

    let prompt = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "session/prompt",
        "params": {"sessionId": "s1", "prompt": [{"type": "text", "text": "peer prompt"}]},
        "_turn": 3,
        "_hidden": "user",
    });
    let envelope = JsonRpcMessage::Notification(JsonRpcNotification::new(
        METHOD_REPLAY,
        Some(json!({"timestamp": 111222, "replayId": "111222-0", "data": prompt})),
    ));
    client.handle_frame(&envelope);

    // Hidden mode `user` suppresses the user-side event.
    let notifications = drain(&mut events);
    assert!(notifications
        .iter()
        .all(|(e, _)| !matches!(e, SessionEvent::UserMessage { .. })));

    // But the message is recorded, with the envelope's clock.
    let conversation = client.conversation();
    assert_eq!(conversation.messages.len(), 1);
    let ChatMessage::User(user) = &conversation.messages[0] else {
        panic!("expected user message");
    };
    assert_eq!(user.text, "peer prompt");
    assert!(user.hidden);
    assert_eq!(user.timestamp, 111222);
    assert_eq!(user.id, "user_111222");
}

#[tokio::test]
async fn replayed_update_threads_replay_id_and_timestamp() {
    let (client, _outbound, mut events) = session();

    let chunk = json!({
        "jsonrpc": "2.0",
        "method": "session/update",
        "params": {
            "sessionId": "s1",
            "update": {
                "sessionUpdate": "agent_message_chunk",
                "content": {"type": "text", "text": "replayed"},
            },
        },
        "_turn": 1,
        "_hidden": "none",
    });
    let envelope = JsonRpcMessage::Notification(JsonRpcNotification::new(
        METHOD_REPLAY,
        Some(json!({"timestamp": 424242, "replayId": "424242-5", "data": chunk})),
    ));
    client.handle_frame(&envelope);

    let notifications = drain(&mut events);
    let (event, meta) = notifications
        .iter()
        .find(|(e, _)| matches!(e, SessionEvent::AssistantDelta { .. }))
        .expect("delta event");
    match event {
        SessionEvent::AssistantDelta { delta, .. } => assert_eq!(delta, "replayed"),
        _ => unreachable!(),
    }
    assert_eq!(meta.timestamp, 424242);
    assert_eq!(meta.replay_id.as_deref(), Some("424242-5"));

    // Identifiers minted under the substituted clock are reproducible.
    let conversation = client.conversation();
    let ChatMessage::Assistant(message) = &conversation.messages[0] else {
        panic!("expected assistant message");
    };
    assert_eq!(message.id, "assistant_424242");
    assert_eq!(message.timestamp, 424242);
}

#[tokio::test]
async fn structured_event_reaches_the_host() {
    let (client, _outbound, mut events) = session();
    client.handle_frame(&JsonRpcMessage::Notification(JsonRpcNotification::new(
        "bridge/structured_event",
        Some(json!({
            "sessionId": "s1",
            "type": "sys_block",
            "error": "expected value at line 1 column 1",
            "raw": "not json",
        })),
    )));

    let notifications = drain(&mut events);
    match &notifications[0].0 {
        SessionEvent::StructuredEvent {
            event_type,
            payload,
            error,
            raw,
        } => {
            assert_eq!(event_type, "sys_block");
            assert!(payload.is_none());
            assert!(error.is_some());
            assert_eq!(raw, "not json");
        }
        other => panic!("expected structured event, got {:?}", other),
    }
}
