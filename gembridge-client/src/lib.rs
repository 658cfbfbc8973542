pub mod diff;
pub mod error;
pub mod history;
pub mod model;
pub mod rectify;
pub mod session;
pub mod title;
pub mod transport;

pub use error::ClientError;
pub use history::{fetch_history, HistoryOptions};
pub use model::{
    AssistantMessage, ChatMessage, ContentPart, Conversation, DiffSummary, PartKind,
    PendingApproval, PermissionOption, ToolCall, ToolStatus, UserMessage,
};
pub use session::{EventMeta, SessionClient, SessionEvent, SessionNotification, SessionOptions};
pub use transport::{ReplayParams, Transport, TransportOptions};

// The wire types come from the core crate; re-export the ones clients
// touch directly.
pub use gembridge_core::rpc::{HiddenMode, JsonRpcError, JsonRpcMessage};
