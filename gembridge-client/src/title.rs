//! Information recovery from free-text tool titles.
//!
//! Agents encode the invocation in the title as
//! `command [current working directory PATH] (description)`, where the
//! description may itself contain (nested) parentheses, or as
//! `input(s): {json}`. The parser pulls the pieces apart without assuming
//! any of them is present.

use serde_json::Value;

const WORKING_DIR_PREFIX: &str = "[current working directory ";
const ARGS_MARKER: &str = "input(s):";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedTitle {
    /// The residual command text after removing the recognized pieces.
    pub input: String,
    pub working_dir: Option<String>,
    pub description: Option<String>,
    /// Parsed `input(s): {json}` payload; a parse failure stores the raw
    /// substring as a JSON string.
    pub args: Option<Value>,
}

pub fn parse_title(title: &str) -> ParsedTitle {
    if let Some(pos) = title.find(ARGS_MARKER) {
        let raw = title[pos + ARGS_MARKER.len()..].trim();
        let args = match serde_json::from_str::<Value>(raw) {
            Ok(value) => value,
            Err(_) => Value::String(raw.to_string()),
        };
        return ParsedTitle {
            input: title[..pos].trim().to_string(),
            working_dir: None,
            description: None,
            args: Some(args),
        };
    }

    let mut remaining = title.to_string();

    let working_dir = extract_working_dir(&mut remaining);
    let description = extract_trailing_description(&mut remaining);

    ParsedTitle {
        input: remaining.trim().to_string(),
        working_dir,
        description,
        args: None,
    }
}

fn extract_working_dir(text: &mut String) -> Option<String> {
    let start = text.find(WORKING_DIR_PREFIX)?;
    let after_prefix = start + WORKING_DIR_PREFIX.len();
    let close = text[after_prefix..].find(']')? + after_prefix;

    let dir = text[after_prefix..close].trim().to_string();
    text.replace_range(start..=close, "");
    Some(dir)
}

/// The last balanced parenthesized group at the very end of the string,
/// located by right-to-left bracket balancing.
fn extract_trailing_description(text: &mut String) -> Option<String> {
    let trimmed_len = text.trim_end().len();
    let bytes = text.as_bytes();
    if trimmed_len == 0 || bytes[trimmed_len - 1] != b')' {
        return None;
    }

    let mut depth = 0i32;
    let mut open = None;
    for i in (0..trimmed_len).rev() {
        match bytes[i] {
            b')' => depth += 1,
            b'(' => {
                depth -= 1;
                if depth == 0 {
                    open = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }

    let open = open?;
    let description = text[open + 1..trimmed_len - 1].to_string();
    text.replace_range(open.., "");
    Some(description)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_command() {
        let parsed = parse_title("ls -la");
        assert_eq!(parsed.input, "ls -la");
        assert!(parsed.working_dir.is_none());
        assert!(parsed.description.is_none());
        assert!(parsed.args.is_none());
    }

    #[test]
    fn working_dir_bracket() {
        let parsed = parse_title("git status [current working directory /home/dev/proj]");
        assert_eq!(parsed.input, "git status");
        assert_eq!(parsed.working_dir.as_deref(), Some("/home/dev/proj"));
    }

    #[test]
    fn trailing_description() {
        let parsed = parse_title("rm -rf build (clean the build tree)");
        assert_eq!(parsed.input, "rm -rf build");
        assert_eq!(parsed.description.as_deref(), Some("clean the build tree"));
    }

    #[test]
    fn nested_parens_in_description() {
        let parsed = parse_title("cargo test (run tests (unit only))");
        assert_eq!(parsed.input, "cargo test");
        assert_eq!(parsed.description.as_deref(), Some("run tests (unit only)"));
    }

    #[test]
    fn parens_in_command_are_not_a_description() {
        // The group must sit at the very end.
        let parsed = parse_title("echo (a) done");
        assert_eq!(parsed.input, "echo (a) done");
        assert!(parsed.description.is_none());
    }

    #[test]
    fn all_pieces_together() {
        let parsed = parse_title(
            "npm install [current working directory /srv/app] (install deps (production))",
        );
        assert_eq!(parsed.input, "npm install");
        assert_eq!(parsed.working_dir.as_deref(), Some("/srv/app"));
        assert_eq!(
            parsed.description.as_deref(),
            Some("install deps (production)")
        );
    }

    #[test]
    fn args_json_form() {
        let parsed = parse_title(r#"read_file input(s): {"path": "src/main.rs"}"#);
        assert_eq!(parsed.input, "read_file");
        assert_eq!(parsed.args, Some(json!({"path": "src/main.rs"})));
    }

    #[test]
    fn args_parse_failure_keeps_raw_substring() {
        let parsed = parse_title("tool input(s): {not json");
        assert_eq!(parsed.input, "tool");
        assert_eq!(parsed.args, Some(Value::String("{not json".to_string())));
    }

    #[test]
    fn unbalanced_trailing_paren_is_left_alone() {
        let parsed = parse_title("weird )");
        assert_eq!(parsed.input, "weird )");
        assert!(parsed.description.is_none());
    }
}
