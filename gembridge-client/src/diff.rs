//! Normalizing the several diff payload shapes agents attach to tool
//! calls into one `{path?, unified, oldTextLength?, newTextLength?}`
//! summary. When only before/after texts are supplied, a unified diff is
//! computed at a configurable context width.

use crate::model::DiffSummary;
use diffy::DiffOptions;
use serde_json::Value;

pub const DEFAULT_DIFF_CONTEXT: usize = 3;

/// Clamp a host-supplied context count to a usable value.
pub fn clamp_context(context: i64) -> usize {
    if context < 0 {
        DEFAULT_DIFF_CONTEXT
    } else {
        context as usize
    }
}

pub fn unified_diff(old: &str, new: &str, context: usize) -> String {
    DiffOptions::new()
        .set_context_len(context)
        .create_patch(old, new)
        .to_string()
}

/// Try to read a diff out of a tool-call content item. Recognized shapes:
///
/// - `{"type": "diff", "oldText": ..., "newText": ..., "path": ...}`
/// - an embedded `diff` (or `content.diff`) object carrying one of
///   `unified` / `patch` / `diff`, or a `before` / `after` text pair
pub fn normalize_diff(item: &Value, context: usize) -> Option<DiffSummary> {
    if item.get("type").and_then(Value::as_str) == Some("diff") {
        return Some(from_old_new(item, context));
    }

    let embedded = item
        .get("diff")
        .or_else(|| item.get("content").and_then(|c| c.get("diff")))?;
    let path = string_field(embedded, "path").or_else(|| string_field(item, "path"));

    let unified = string_field(embedded, "unified")
        .or_else(|| string_field(embedded, "patch"))
        .or_else(|| string_field(embedded, "diff"));

    if let Some(unified) = unified {
        return Some(DiffSummary {
            path,
            unified,
            old_text_length: None,
            new_text_length: None,
        });
    }

    let before = string_field(embedded, "before")?;
    let after = string_field(embedded, "after").unwrap_or_default();
    Some(DiffSummary {
        path,
        unified: unified_diff(&before, &after, context),
        old_text_length: Some(before.len()),
        new_text_length: Some(after.len()),
    })
}

fn from_old_new(item: &Value, context: usize) -> DiffSummary {
    let old_text = string_field(item, "oldText").unwrap_or_default();
    let new_text = string_field(item, "newText").unwrap_or_default();
    DiffSummary {
        path: string_field(item, "path"),
        unified: unified_diff(&old_text, &new_text, context),
        old_text_length: Some(old_text.len()),
        new_text_length: Some(new_text.len()),
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}
