use thiserror::Error;

/// Errors from the realtime crate.
///
/// Connection-level failures feed the state machine's reconnect path;
/// they surface to callers only when their own action fails (send on a
/// closed socket, malformed frame).
#[derive(Debug, Error)]
pub enum Error {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection closed: {code} {reason}")]
    Closed { code: u16, reason: String },

    #[error("send failed: {0}")]
    Send(String),

    #[error("deserialization failed: {0}")]
    Deserialize(#[from] serde_json::Error),
}
