use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("No active session")]
    NoSession,

    #[error("Unknown permission request: {0}")]
    UnknownPermissionRequest(String),

    #[error("Transport closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ClientError::WebSocket("handshake failed".to_string());
        assert_eq!(err.to_string(), "WebSocket error: handshake failed");
        assert_eq!(ClientError::Closed.to_string(), "Transport closed");
    }
}
