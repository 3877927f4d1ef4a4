// ── Core error types ──
//
// User-facing errors from dashsync-core. Producer and storage failures
// are wrapped in domain-appropriate variants; consumers never see raw
// serde or I/O errors in their pattern matches.

use thiserror::Error;

use crate::persist::PersistError;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Fetch errors ─────────────────────────────────────────────────
    #[error("fetch failed after {attempts} attempt(s): {message}")]
    FetchExhausted { message: String, attempts: u32 },

    #[error("fetch failed: {0}")]
    Fetch(String),

    // ── Persistence errors ───────────────────────────────────────────
    #[error(transparent)]
    Persist(#[from] PersistError),

    // ── Lookup errors ────────────────────────────────────────────────
    #[error("sync queue item not found: {id}")]
    ItemNotFound { id: String },

    #[error("widget not found: {id}")]
    WidgetNotFound { id: String },

    #[error("unknown widget kind: {kind}")]
    UnknownWidgetKind { kind: String },

    #[error("layout preset not found: {id}")]
    PresetNotFound { id: String },

    // ── Operation errors ─────────────────────────────────────────────
    #[error("invalid operation: {message}")]
    InvalidOperation { message: String },
}

impl CoreError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}
