//! Classifies lines read from the agent subprocess's stdout.
//!
//! Each non-blank line is either a JSON-RPC frame, an OAuth URL
//! announcement buried in terminal noise, or plain log output. Parse
//! failures on `{`-prefixed lines are downgraded to log output; they must
//! never kill the stdout reader.

use crate::rpc::JsonRpcMessage;
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

#[derive(Debug, Clone)]
pub enum StdoutFrame {
    JsonRpc(JsonRpcMessage),
    AuthUrl(String),
    Log(String),
}

// CSI (`ESC [ ... letter`) and OSC (`ESC ] ... BEL`) sequences, plus the
// bare `[?25h` / `[2K` style remnants some agents emit without the ESC
// byte intact.
static CSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("csi regex"));
static OSC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\][^\x07]*\x07").expect("osc regex"));
static BARE_CONTROL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\?[0-9;]*[A-Za-z]|\[[0-9;]*[GJK]").expect("bare regex"));

static OAUTH_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https://accounts\.google\.com/o/oauth2/v2/auth\?[^\s"'\x1b]+"#)
        .expect("oauth regex")
});

/// Classify one stdout line. Returns `None` for blank lines.
pub fn classify_line(line: &str) -> Option<StdoutFrame> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.starts_with('{') {
        match serde_json::from_str::<JsonRpcMessage>(trimmed) {
            Ok(message) => return Some(StdoutFrame::JsonRpc(message)),
            Err(e) => {
                debug!("Downgrading unparseable JSON line to log output: {}", e);
                return Some(StdoutFrame::Log(line.to_string()));
            }
        }
    }

    let stripped = strip_terminal_controls(line);
    if let Some(m) = OAUTH_URL.find(&stripped) {
        return Some(StdoutFrame::AuthUrl(m.as_str().to_string()));
    }

    Some(StdoutFrame::Log(line.to_string()))
}

/// Remove terminal-control escape sequences so URL scanning sees clean
/// text. Pure, no shared state.
pub fn strip_terminal_controls(input: &str) -> String {
    let pass1 = CSI.replace_all(input, "");
    let pass2 = OSC.replace_all(&pass1, "");
    BARE_CONTROL.replace_all(&pass2, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_lines_are_skipped() {
        assert!(classify_line("").is_none());
        assert!(classify_line("   \t").is_none());
    }

    #[test]
    fn json_lines_parse() {
        let frame = classify_line(r#"{"jsonrpc":"2.0","method":"session/update","params":{}}"#)
            .expect("frame");
        assert!(matches!(frame, StdoutFrame::JsonRpc(_)));
    }

    #[test]
    fn bad_json_downgrades_to_log() {
        let frame = classify_line(r#"{"jsonrpc": oops"#).expect("frame");
        match frame {
            StdoutFrame::Log(line) => assert!(line.contains("oops")),
            other => panic!("expected log frame, got {:?}", other),
        }
    }

    #[test]
    fn auth_url_detected_through_ansi_noise() {
        let line = "\x1b[33mPlease visit \x1b[4mhttps://accounts.google.com/o/oauth2/v2/auth?client_id=abc&scope=x\x1b[0m to sign in";
        let frame = classify_line(line).expect("frame");
        match frame {
            StdoutFrame::AuthUrl(url) => {
                assert!(url.starts_with("https://accounts.google.com/o/oauth2/v2/auth?"));
                assert!(url.ends_with("scope=x"));
            }
            other => panic!("expected auth url, got {:?}", other),
        }
    }

    #[test]
    fn bare_control_remnants_are_stripped() {
        let stripped = strip_terminal_controls("[?25l[2Khello[1G");
        assert_eq!(stripped, "hello");
    }

    #[test]
    fn ordinary_output_is_log() {
        let frame = classify_line("Loaded 3 MCP servers").expect("frame");
        assert!(matches!(frame, StdoutFrame::Log(_)));
    }
}
