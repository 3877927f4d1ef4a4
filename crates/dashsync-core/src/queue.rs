// ── Offline sync queue ──
//
// Ordered, persisted list of pending mutations drained sequentially
// when connectivity returns. Deletes carry priority 0 so tombstones are
// never superseded by stale updates; failed items retry up to a ceiling
// and then freeze until a human intervenes; server-side version
// conflicts park the item for explicit resolution. The full item list
// is persisted after every mutation so a closed session loses nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::persist::{self, StorageBackend};

/// Key under which the queue is persisted.
const QUEUE_KEY: &str = "dashsync:queue";

// ── Item model ──────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Completed,
    Failed,
    /// Server-side version advanced past this mutation; requires
    /// explicit resolution, not an ordinary retry.
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Re-queue the original client payload.
    #[default]
    ClientWins,
    /// Re-queue an externally supplied merged payload.
    ManualMerge,
}

/// One queued mutation. Timestamps round-trip as RFC 3339 strings in
/// the persisted form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: Uuid,
    pub operation: OperationType,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: SyncStatus,
    /// Deletes are 0, everything else 1 — tombstones drain first.
    pub priority: u8,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Server payload captured when a conflict was detected.
    #[serde(default)]
    pub server_payload: Option<Value>,
}

/// Input for [`SyncQueue::add_operation`].
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub operation: OperationType,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Value,
}

// ── Transport seam ──────────────────────────────────────────────────

/// Outcome of sending one item to the server.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("server version conflict")]
    Conflict { server_payload: Value },

    #[error("transient send failure: {0}")]
    Transient(String),
}

/// The injected server boundary. Implementations send one mutation and
/// report success, a transient failure, or a version conflict.
pub trait SyncTransport: Send + Sync {
    fn send(
        &self,
        item: &SyncQueueItem,
    ) -> impl std::future::Future<Output = Result<(), SendError>> + Send;
}

// ── Progress / summary ──────────────────────────────────────────────

/// Aggregate drain progress for UI consumption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainProgress {
    pub processed: usize,
    pub total: usize,
}

impl DrainProgress {
    /// `processed / total` as a whole percentage; 100 when idle.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            100
        } else {
            ((self.processed * 100) / self.total) as u8
        }
    }
}

/// Outcome of one drain, distinguishing partial success from total
/// failure so a user can discern what needs manual attention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub completed: usize,
    pub failed: usize,
    pub conflicts: usize,
}

impl DrainSummary {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.conflicts
    }
}

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SyncQueueConfig {
    /// Retry ceiling for new items. Default: 3.
    pub max_retries: u32,
    /// Strategy applied by `resolve_conflict` when none is given.
    pub default_strategy: ConflictStrategy,
}

impl Default for SyncQueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            default_strategy: ConflictStrategy::default(),
        }
    }
}

// ── SyncQueue ───────────────────────────────────────────────────────

/// Persisted offline mutation queue.
pub struct SyncQueue {
    items: Mutex<Vec<SyncQueueItem>>,
    backend: Arc<dyn StorageBackend>,
    config: SyncQueueConfig,
    draining: AtomicBool,
    progress: watch::Sender<DrainProgress>,
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncQueue")
            .field("items", &self.items)
            .field("config", &self.config)
            .field("draining", &self.draining)
            .finish_non_exhaustive()
    }
}

impl SyncQueue {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self::with_config(backend, SyncQueueConfig::default())
    }

    pub fn with_config(backend: Arc<dyn StorageBackend>, config: SyncQueueConfig) -> Self {
        let (progress, _) = watch::channel(DrainProgress::default());
        Self {
            items: Mutex::new(Vec::new()),
            backend,
            config,
            draining: AtomicBool::new(false),
            progress,
        }
    }

    /// Restore a queue from the backend. A missing record yields an
    /// empty queue; a corrupt or stale-schema record fails loudly.
    /// Items persisted mid-send (`syncing`) are demoted to `pending` —
    /// the drain was interrupted and delivery is at-least-once.
    pub fn load(
        backend: Arc<dyn StorageBackend>,
        config: SyncQueueConfig,
    ) -> Result<Self, CoreError> {
        let queue = Self::with_config(backend, config);

        if let Some(raw) = queue.backend.read(QUEUE_KEY)? {
            let mut restored: Vec<SyncQueueItem> = persist::decode(&raw)?;
            for item in &mut restored {
                if item.status == SyncStatus::Syncing {
                    debug!(id = %item.id, "demoting interrupted item to pending");
                    item.status = SyncStatus::Pending;
                }
            }
            *queue.lock_items() = restored;
        }

        Ok(queue)
    }

    // ── Mutations ────────────────────────────────────────────────────

    /// Queue a mutation that could not reach the server. Returns the
    /// new item's id.
    pub fn add_operation(&self, op: NewOperation) -> Uuid {
        let id = Uuid::new_v4();
        let priority = match op.operation {
            OperationType::Delete => 0,
            OperationType::Create | OperationType::Update => 1,
        };

        let item = SyncQueueItem {
            id,
            operation: op.operation,
            entity_type: op.entity_type,
            entity_id: op.entity_id,
            payload: op.payload,
            created_at: Utc::now(),
            retry_count: 0,
            max_retries: self.config.max_retries,
            status: SyncStatus::Pending,
            priority,
            last_error: None,
            server_payload: None,
        };

        self.lock_items().push(item);
        self.persist();
        id
    }

    /// Drain the queue sequentially through `transport`.
    ///
    /// Idempotent against concurrent invocation: an overlapping call
    /// observes the re-entrancy guard and returns an empty summary.
    /// Selection covers `pending` items plus `failed` items below the
    /// retry ceiling, ordered by ascending `(priority, created_at)`.
    pub async fn process_queue<T: SyncTransport>(&self, transport: &T) -> DrainSummary {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("drain already in progress, skipping");
            return DrainSummary::default();
        }

        let summary = self.drain(transport).await;
        self.draining.store(false, Ordering::SeqCst);
        summary
    }

    async fn drain<T: SyncTransport>(&self, transport: &T) -> DrainSummary {
        let mut eligible: Vec<(Uuid, u8, DateTime<Utc>)> = self
            .lock_items()
            .iter()
            .filter(|i| {
                i.status == SyncStatus::Pending
                    || (i.status == SyncStatus::Failed && i.retry_count < i.max_retries)
            })
            .map(|i| (i.id, i.priority, i.created_at))
            .collect();
        eligible.sort_by_key(|&(_, priority, created_at)| (priority, created_at));

        let total = eligible.len();
        let mut summary = DrainSummary::default();
        let _ = self.progress.send(DrainProgress {
            processed: 0,
            total,
        });

        for (processed, (id, _, _)) in eligible.into_iter().enumerate() {
            // Snapshot the item after marking it syncing; it may have
            // been cleared between selection and now.
            let Some(item) = self.transition(id, SyncStatus::Syncing) else {
                continue;
            };

            match transport.send(&item).await {
                Ok(()) => {
                    self.transition(id, SyncStatus::Completed);
                    summary.completed += 1;
                }
                Err(SendError::Conflict { server_payload }) => {
                    info!(id = %id, "sync conflict, parking for resolution");
                    self.update_item(id, |i| {
                        i.status = SyncStatus::Conflict;
                        i.last_error = Some("server version conflict".into());
                        i.server_payload = Some(server_payload.clone());
                    });
                    summary.conflicts += 1;
                }
                Err(SendError::Transient(message)) => {
                    warn!(id = %id, error = %message, "sync send failed");
                    self.update_item(id, |i| {
                        i.status = SyncStatus::Failed;
                        i.retry_count += 1;
                        i.last_error = Some(message.clone());
                    });
                    summary.failed += 1;
                }
            }

            let _ = self.progress.send(DrainProgress {
                processed: processed + 1,
                total,
            });
        }

        summary
    }

    /// Manually re-queue one terminally failed item.
    ///
    /// Only `failed` items qualify; conflicted items go through
    /// [`resolve_conflict`](Self::resolve_conflict) instead.
    pub fn retry_operation(&self, id: Uuid) -> Result<(), CoreError> {
        {
            let mut items = self.lock_items();
            let item = items
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or_else(|| CoreError::ItemNotFound { id: id.to_string() })?;

            if item.status != SyncStatus::Failed {
                return Err(CoreError::invalid(format!(
                    "item {id} is not failed (status: {})",
                    item.status
                )));
            }

            item.status = SyncStatus::Pending;
            item.retry_count = 0;
            item.last_error = None;
        }
        self.persist();
        Ok(())
    }

    /// Re-queue every failed item.
    pub fn retry_all_failed(&self) {
        {
            let mut items = self.lock_items();
            for item in items.iter_mut().filter(|i| i.status == SyncStatus::Failed) {
                item.status = SyncStatus::Pending;
                item.retry_count = 0;
                item.last_error = None;
            }
        }
        self.persist();
    }

    /// Drop acknowledged items.
    pub fn clear_completed(&self) {
        self.lock_items()
            .retain(|i| i.status != SyncStatus::Completed);
        self.persist();
    }

    /// Resolve a parked conflict and re-queue the item as `pending`.
    ///
    /// `ClientWins` keeps the original payload; `ManualMerge` requires
    /// `merged_payload`.
    pub fn resolve_conflict(
        &self,
        id: Uuid,
        strategy: ConflictStrategy,
        merged_payload: Option<Value>,
    ) -> Result<(), CoreError> {
        let merged = match strategy {
            ConflictStrategy::ClientWins => None,
            ConflictStrategy::ManualMerge => Some(merged_payload.ok_or_else(|| {
                CoreError::invalid("manual merge requires a merged payload")
            })?),
        };

        {
            let mut items = self.lock_items();
            let item = items
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or_else(|| CoreError::ItemNotFound { id: id.to_string() })?;

            if item.status != SyncStatus::Conflict {
                return Err(CoreError::invalid(format!(
                    "item {id} is not in conflict (status: {})",
                    item.status
                )));
            }

            if let Some(payload) = merged {
                item.payload = payload;
            }
            item.status = SyncStatus::Pending;
            item.retry_count = 0;
            item.last_error = None;
            item.server_payload = None;
        }
        self.persist();
        Ok(())
    }

    // ── Observation ──────────────────────────────────────────────────

    /// Snapshot of all items in insertion order.
    pub fn items(&self) -> Vec<SyncQueueItem> {
        self.lock_items().clone()
    }

    pub fn item(&self, id: Uuid) -> Option<SyncQueueItem> {
        self.lock_items().iter().find(|i| i.id == id).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.lock_items()
            .iter()
            .filter(|i| i.status == SyncStatus::Pending)
            .count()
    }

    /// Subscribe to drain progress updates.
    pub fn subscribe_progress(&self) -> watch::Receiver<DrainProgress> {
        self.progress.subscribe()
    }

    // ── Internals ────────────────────────────────────────────────────

    fn lock_items(&self) -> std::sync::MutexGuard<'_, Vec<SyncQueueItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set an item's status, persist, and return the updated snapshot.
    fn transition(&self, id: Uuid, status: SyncStatus) -> Option<SyncQueueItem> {
        self.update_item(id, |i| i.status = status)
    }

    fn update_item(
        &self,
        id: Uuid,
        mutate: impl FnOnce(&mut SyncQueueItem),
    ) -> Option<SyncQueueItem> {
        let snapshot = {
            let mut items = self.lock_items();
            let item = items.iter_mut().find(|i| i.id == id)?;
            mutate(item);
            item.clone()
        };
        self.persist();
        Some(snapshot)
    }

    /// Serialize the full list after every mutation. Storage failures
    /// degrade to memory-only with a warning; pending operations then
    /// survive only as long as the process.
    fn persist(&self) {
        let items = self.lock_items().clone();
        match persist::encode(&items) {
            Ok(raw) => {
                if let Err(e) = self.backend.write(QUEUE_KEY, &raw) {
                    warn!(error = %e, "sync queue persist failed");
                }
            }
            Err(e) => warn!(error = %e, "sync queue encode failed"),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
