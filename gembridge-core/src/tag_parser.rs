//! Streaming extraction of structured side-channel events from the
//! assistant's text stream.
//!
//! The agent may embed `<SYS_JSON>...</SYS_JSON>` and
//! `<SYS_BLOCK>...</SYS_BLOCK>` regions (tag names configurable) in its
//! ordinary message chunks. The parser is fed chunks in arrival order and
//! returns alternating text and event parts for each chunk, holding back
//! any trailing bytes that could still turn into a tag delimiter in the
//! next chunk. "Tag not yet closed" is an ordinary parser outcome, never
//! an error.

use crate::rpc::{
    is_end_of_turn, JsonRpcMessage, JsonRpcNotification, METHOD_SESSION_UPDATE,
    METHOD_STRUCTURED_EVENT,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

pub const DEFAULT_JSON_TAG: &str = "SYS_JSON";
pub const DEFAULT_BLOCK_TAG: &str = "SYS_BLOCK";

/// What the transform does with tagged regions.
///
/// `Event` strips them from the text and emits structured events in
/// position; `Raw` passes everything through untouched; `Both` emits the
/// events and keeps the raw tagged text in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformMode {
    #[default]
    Event,
    Raw,
    Both,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkPart {
    Text(String),
    Event {
        event_type: String,
        payload: Option<Value>,
        error: Option<String>,
        raw: String,
    },
}

#[derive(Debug, Clone)]
struct TagSpec {
    open: String,
    close: String,
    event_type: String,
}

impl TagSpec {
    fn new(name: &str) -> Self {
        Self {
            open: format!("<{}>", name),
            close: format!("</{}>", name),
            event_type: name.to_ascii_lowercase(),
        }
    }
}

#[derive(Debug)]
enum ParserState {
    /// Between tags. `held` is a trailing suffix that is a strict prefix
    /// of some open delimiter.
    Outside { held: String },
    /// Inside tag `tag`. `held` is a trailing suffix that is a strict
    /// prefix of the expected close delimiter; it must not be appended to
    /// `captured` or a split end-tag would corrupt the payload.
    Inside {
        tag: usize,
        captured: String,
        held: String,
    },
}

pub struct TagParser {
    mode: TransformMode,
    tags: Vec<TagSpec>,
    state: ParserState,
}

impl TagParser {
    pub fn new(mode: TransformMode, json_tag: &str, block_tag: &str) -> Self {
        Self {
            mode,
            tags: vec![TagSpec::new(json_tag), TagSpec::new(block_tag)],
            state: ParserState::Outside { held: String::new() },
        }
    }

    pub fn with_defaults(mode: TransformMode) -> Self {
        Self::new(mode, DEFAULT_JSON_TAG, DEFAULT_BLOCK_TAG)
    }

    /// Feed one text chunk, returning the ordered parts it resolves to.
    /// May return nothing when the whole chunk is held pending more input.
    pub fn push_chunk(&mut self, chunk: &str) -> Vec<ChunkPart> {
        if self.mode == TransformMode::Raw {
            return vec![ChunkPart::Text(chunk.to_string())];
        }

        let mut parts: Vec<ChunkPart> = Vec::new();
        let mut buf = match &mut self.state {
            ParserState::Outside { held } | ParserState::Inside { held, .. } => {
                let mut b = std::mem::take(held);
                b.push_str(chunk);
                b
            }
        };

        loop {
            match &mut self.state {
                ParserState::Outside { .. } => {
                    match find_earliest_open(&buf, &self.tags) {
                        Some((idx, tag)) => {
                            if idx > 0 {
                                push_text(&mut parts, &buf[..idx]);
                            }
                            buf = buf[idx + self.tags[tag].open.len()..].to_string();
                            self.state = ParserState::Inside {
                                tag,
                                captured: String::new(),
                                held: String::new(),
                            };
                        }
                        None => {
                            let keep = longest_held_suffix(
                                &buf,
                                self.tags.iter().map(|t| t.open.as_str()),
                            );
                            let text_end = buf.len() - keep.len();
                            if text_end > 0 {
                                push_text(&mut parts, &buf[..text_end]);
                            }
                            self.state = ParserState::Outside { held: keep };
                            break;
                        }
                    }
                }
                ParserState::Inside { tag, captured, .. } => {
                    let tag = *tag;
                    let close = self.tags[tag].close.clone();
                    match buf.find(&close) {
                        Some(idx) => {
                            captured.push_str(&buf[..idx]);
                            let raw = std::mem::take(captured);
                            buf = buf[idx + close.len()..].to_string();
                            self.close_region(&mut parts, tag, raw);
                            self.state = ParserState::Outside { held: String::new() };
                        }
                        None => {
                            let keep =
                                longest_held_suffix(&buf, std::iter::once(close.as_str()));
                            captured.push_str(&buf[..buf.len() - keep.len()]);
                            if let ParserState::Inside { held, .. } = &mut self.state {
                                *held = keep;
                            }
                            break;
                        }
                    }
                }
            }
        }

        parts
    }

    /// Flush in-flight state at end of turn. Returns text to inject as an
    /// ordinary assistant chunk before the stop frame is forwarded. An
    /// unterminated tag is reopened in the text; no phantom event is
    /// emitted.
    pub fn flush(&mut self) -> Option<String> {
        let state = std::mem::replace(
            &mut self.state,
            ParserState::Outside { held: String::new() },
        );
        match state {
            ParserState::Outside { held } if held.is_empty() => None,
            ParserState::Outside { held } => Some(held),
            ParserState::Inside { tag, captured, held } => {
                Some(format!("{}{}{}", self.tags[tag].open, captured, held))
            }
        }
    }

    fn close_region(&self, parts: &mut Vec<ChunkPart>, tag: usize, raw: String) {
        let spec = &self.tags[tag];
        let (payload, error) = match serde_json::from_str::<Value>(raw.trim()) {
            Ok(value) => (Some(value), None),
            Err(e) => {
                debug!("Tag payload failed to parse as JSON: {}", e);
                (None, Some(e.to_string()))
            }
        };
        let failed = error.is_some();

        parts.push(ChunkPart::Event {
            event_type: spec.event_type.clone(),
            payload,
            error,
            raw: raw.clone(),
        });

        // In `both` mode the raw tagged span always stays in the text
        // stream; in `event` mode it is re-inlined only when the payload
        // failed to parse, so no content is lost.
        if self.mode == TransformMode::Both || failed {
            push_text(parts, &format!("{}{}{}", spec.open, raw, spec.close));
        }
    }
}

fn push_text(parts: &mut Vec<ChunkPart>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(ChunkPart::Text(existing)) = parts.last_mut() {
        existing.push_str(text);
    } else {
        parts.push(ChunkPart::Text(text.to_string()));
    }
}

fn find_earliest_open(buf: &str, tags: &[TagSpec]) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    for (i, tag) in tags.iter().enumerate() {
        if let Some(idx) = buf.find(&tag.open) {
            if best.map(|(b, _)| idx < b).unwrap_or(true) {
                best = Some((idx, i));
            }
        }
    }
    best
}

/// The longest suffix of `buf` that is a strict prefix of any delimiter
/// in `delims`. Held back until the next chunk decides whether it
/// completes a tag.
fn longest_held_suffix<'a>(buf: &str, delims: impl Iterator<Item = &'a str>) -> String {
    let mut best = 0usize;
    for delim in delims {
        let max = delim.len().saturating_sub(1).min(buf.len());
        for k in (1..=max).rev() {
            if k <= best {
                break;
            }
            if buf.is_char_boundary(buf.len() - k) && buf.ends_with(&delim[..k]) {
                best = k;
                break;
            }
        }
    }
    buf[buf.len() - best..].to_string()
}

// ============================================================================
// Frame-level transform
// ============================================================================

/// Applies the tag parser to outgoing `agent_message_chunk` frames and
/// re-serializes the parts into wire frames: text parts become ordinary
/// assistant chunks, event parts become `bridge/structured_event`
/// notifications inserted at the exact position. Stop-of-turn frames
/// flush the parser first.
pub struct StreamTransform {
    parser: TagParser,
    last_session_id: Option<String>,
}

impl StreamTransform {
    pub fn new(mode: TransformMode, json_tag: &str, block_tag: &str) -> Self {
        Self {
            parser: TagParser::new(mode, json_tag, block_tag),
            last_session_id: None,
        }
    }

    /// Transform one outgoing frame into zero or more frames, preserving
    /// left-to-right positional order of text and extracted events.
    pub fn process(&mut self, message: &JsonRpcMessage) -> Vec<JsonRpcMessage> {
        if let Some(session_id) = crate::rpc::extract_session_id(message) {
            self.last_session_id = Some(session_id);
        }

        if let Some(text) = assistant_chunk_text(message) {
            let parts = self.parser.push_chunk(&text);
            return parts
                .into_iter()
                .map(|part| self.part_to_frame(message, part))
                .collect();
        }

        if is_end_of_turn(message) {
            let mut out = Vec::new();
            if let Some(text) = self.parser.flush() {
                out.push(self.synthesize_chunk(&text));
            }
            out.push(message.clone());
            return out;
        }

        vec![message.clone()]
    }

    fn part_to_frame(&self, original: &JsonRpcMessage, part: ChunkPart) -> JsonRpcMessage {
        match part {
            ChunkPart::Text(text) => chunk_with_text(original, &text),
            ChunkPart::Event {
                event_type,
                payload,
                error,
                raw,
            } => {
                let mut params = json!({
                    "sessionId": self.last_session_id,
                    "type": event_type,
                    "raw": raw,
                });
                if let Some(payload) = payload {
                    params["payload"] = payload;
                }
                if let Some(error) = error {
                    params["error"] = Value::String(error);
                }
                JsonRpcMessage::Notification(JsonRpcNotification::new(
                    METHOD_STRUCTURED_EVENT,
                    Some(params),
                ))
            }
        }
    }

    fn synthesize_chunk(&self, text: &str) -> JsonRpcMessage {
        JsonRpcMessage::Notification(JsonRpcNotification::new(
            METHOD_SESSION_UPDATE,
            Some(json!({
                "sessionId": self.last_session_id,
                "update": {
                    "sessionUpdate": "agent_message_chunk",
                    "content": {"type": "text", "text": text},
                },
            })),
        ))
    }
}

/// The text of an `agent_message_chunk` update, if the frame is one.
fn assistant_chunk_text(message: &JsonRpcMessage) -> Option<String> {
    match message {
        JsonRpcMessage::Notification(notif) if notif.method == METHOD_SESSION_UPDATE => {
            let update = notif.params.as_ref()?.get("update")?;
            if update.get("sessionUpdate")?.as_str()? != "agent_message_chunk" {
                return None;
            }
            let content = update.get("content")?;
            if content.get("type").and_then(Value::as_str) != Some("text") {
                return None;
            }
            content.get("text")?.as_str().map(str::to_string)
        }
        _ => None,
    }
}

fn chunk_with_text(original: &JsonRpcMessage, text: &str) -> JsonRpcMessage {
    let mut frame = original.clone();
    if let JsonRpcMessage::Notification(notif) = &mut frame {
        if let Some(text_slot) = notif
            .params
            .as_mut()
            .and_then(|p| p.get_mut("update"))
            .and_then(|u| u.get_mut("content"))
            .and_then(|c| c.get_mut("text"))
        {
            *text_slot = Value::String(text.to_string());
        }
    }
    frame
}
