// dashsync-core: client-side state layer — durable cache, query
// coordination, offline sync queue, and dashboard layout store.

pub mod cache;
pub mod error;
pub mod layout;
pub mod persist;
pub mod query;
pub mod queue;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use cache::{CacheEntry, CacheService};
pub use error::CoreError;
pub use persist::{FileBackend, MemoryBackend, PersistError, StorageBackend};
pub use query::{Query, QueryConfig, QueryState};
pub use queue::{
    ConflictStrategy, DrainProgress, DrainSummary, NewOperation, OperationType, SendError,
    SyncQueue, SyncQueueConfig, SyncQueueItem, SyncStatus, SyncTransport,
};
pub use stream::StateStream;

// Re-export layout types at the crate root for ergonomics.
pub use layout::{
    Breakpoint, LayoutSnapshot, LayoutStore, Widget, WidgetPosition, WidgetSize, WidgetTemplate,
};
