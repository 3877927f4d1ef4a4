// ── Query coordinator ──
//
// Wraps an asynchronous producer per cache key with stale-while-
// revalidate semantics: cached data is served immediately and refreshed
// in the background, never hidden behind a loading state. Fetches retry
// with exponential backoff; every issued fetch carries a monotonic
// sequence number so a superseded response can never overwrite fresher
// data. Background triggers (interval refetch, cache fan-in) are owned
// by the coordinator via explicit start()/stop(), independent of any
// view lifecycle.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::CacheService;
use crate::error::CoreError;
use crate::stream::StateStream;

// ── Configuration ───────────────────────────────────────────────────

/// Tuning knobs for one query.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// Age past which a cached value is considered stale. Default: 5 min.
    pub stale_time: Duration,

    /// Time-to-live written into the cache on success. Default: 30 min.
    /// Staleness and expiry are independent: stale data is still
    /// servable, expired data is not.
    pub cache_time: Duration,

    /// Total fetch attempts per refresh. Default: 3.
    pub retry_count: u32,

    /// Base backoff delay; attempt `n` waits `retry_delay * 2^n`.
    /// Default: 1 s.
    pub retry_delay: Duration,

    /// Fixed-interval background refetch, enabled via `start()`.
    pub refetch_interval: Option<Duration>,

    /// Whether `notify_focus()` triggers a refetch when stale.
    pub refetch_on_focus: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(5 * 60),
            cache_time: Duration::from_secs(30 * 60),
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
            refetch_interval: None,
            refetch_on_focus: true,
        }
    }
}

// ── Observable state ────────────────────────────────────────────────

/// Per-key query state derived from the cache plus in-flight flags.
///
/// `is_loading` is true only while no cached value of any staleness
/// exists yet; `is_fetching` covers background revalidation.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    pub data: Option<T>,
    pub is_loading: bool,
    pub is_fetching: bool,
    pub is_stale: bool,
    pub error: Option<Arc<CoreError>>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            is_loading: false,
            is_fetching: false,
            is_stale: false,
            error: None,
            last_updated: None,
        }
    }
}

type BoxFetcher<T> =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<T, CoreError>> + Send>> + Send + Sync>;

// ── Query ───────────────────────────────────────────────────────────

/// A stale-while-revalidate query bound to one cache key.
///
/// Cheaply cloneable; all clones share state, the in-flight guard, and
/// the fetch sequence.
pub struct Query<T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static> {
    inner: Arc<QueryInner<T>>,
}

impl<T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct QueryInner<T> {
    key: String,
    cache: Arc<CacheService>,
    fetcher: BoxFetcher<T>,
    config: QueryConfig,
    state: watch::Sender<QueryState<T>>,
    /// Sequence of the most recently issued fetch; completions with an
    /// older sequence are discarded (request fencing).
    issued: AtomicU64,
    in_flight: AtomicBool,
    started: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl<T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static> Query<T> {
    pub fn new<F, Fut>(cache: Arc<CacheService>, key: impl Into<String>, fetcher: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CoreError>> + Send + 'static,
    {
        Self::with_config(cache, key, fetcher, QueryConfig::default())
    }

    pub fn with_config<F, Fut>(
        cache: Arc<CacheService>,
        key: impl Into<String>,
        fetcher: F,
        config: QueryConfig,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CoreError>> + Send + 'static,
    {
        let fetcher: BoxFetcher<T> = Arc::new(move || Box::pin(fetcher()));
        let (state, _) = watch::channel(QueryState::default());

        Self {
            inner: Arc::new(QueryInner {
                key: key.into(),
                cache,
                fetcher,
                config,
                state,
                issued: AtomicU64::new(0),
                in_flight: AtomicBool::new(false),
                started: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Current state snapshot.
    pub fn state(&self) -> QueryState<T> {
        self.inner.state.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> StateStream<QueryState<T>> {
        StateStream::new(self.inner.state.subscribe())
    }

    // ── Observation ──────────────────────────────────────────────────

    /// First observation of the key.
    ///
    /// Reads the cache: a hit is served immediately (stale or not) and,
    /// if stale, a background revalidation fires; a miss fires a fetch
    /// with `is_loading` set. Returns the state as of this call — a
    /// cached value is always present in the returned snapshot, never
    /// hidden behind a spinner.
    pub fn observe(&self) -> QueryState<T> {
        match self.inner.cache.get::<T>(&self.inner.key) {
            Some(entry) => {
                let is_stale = entry_is_stale(entry.written_at, self.inner.config.stale_time);
                self.inner.state.send_modify(|s| {
                    s.data = Some(entry.value);
                    s.is_loading = false;
                    s.is_stale = is_stale;
                    s.last_updated = Some(entry.written_at);
                });
                if is_stale {
                    self.spawn_fetch();
                }
            }
            None => {
                self.inner.state.send_modify(|s| {
                    if s.data.is_none() {
                        s.is_loading = true;
                    }
                });
                self.spawn_fetch();
            }
        }
        self.state()
    }

    /// Fetch now, bypassing staleness checks, and await the outcome.
    /// A refetch already in flight is joined, not duplicated.
    pub async fn refetch(&self) -> QueryState<T> {
        if self
            .inner
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(key = %self.inner.key, "refetch already in flight, joining");
            // The running fetch clears `in_flight` inside its final
            // state publication, so waking on a state change and seeing
            // the flag down means the outcome is already visible.
            let mut rx = self.inner.state.subscribe();
            while self.inner.in_flight.load(Ordering::SeqCst) {
                if rx.changed().await.is_err() {
                    break;
                }
            }
            return self.state();
        }
        run_fetch(Arc::clone(&self.inner)).await;
        self.state()
    }

    /// Drop the cached value and fence any in-flight fetch so its
    /// late result is discarded.
    pub fn invalidate(&self) {
        self.inner.issued.fetch_add(1, Ordering::SeqCst);
        self.inner.cache.invalidate(&self.inner.key);
        self.inner.state.send_modify(|s| s.is_stale = true);
    }

    /// Window/tab focus regained: refetch only if currently stale.
    pub fn notify_focus(&self) {
        if self.inner.config.refetch_on_focus && self.inner.state.borrow().is_stale {
            self.spawn_fetch();
        }
    }

    // ── Background tasks ─────────────────────────────────────────────

    /// Start background synchronization: a cache fan-in listener (other
    /// coordinators writing this key update our state without a fetch)
    /// and, if configured, the interval refetch. Idempotent.
    pub fn start(&self) {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let cancel = self.cancel_token();

        let inner = Arc::clone(&self.inner);
        let listener_cancel = cancel.clone();
        tokio::spawn(async move {
            cache_listener(inner, listener_cancel).await;
        });

        if let Some(every) = self.inner.config.refetch_interval {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                interval_refetch(inner, cancel, every).await;
            });
        }
    }

    /// Stop background synchronization. A later `start()` resumes.
    pub fn stop(&self) {
        let mut guard = self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard.cancel();
        *guard = CancellationToken::new();
        self.inner.started.store(false, Ordering::SeqCst);
    }

    fn cancel_token(&self) -> CancellationToken {
        self.inner
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fire a background fetch unless one is already in flight.
    fn spawn_fetch(&self) {
        if self
            .inner
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(key = %self.inner.key, "fetch already in flight, not duplicating");
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_fetch(inner).await;
        });
    }
}

// ── Fetch execution ─────────────────────────────────────────────────

fn entry_is_stale(written_at: DateTime<Utc>, stale_time: Duration) -> bool {
    let threshold =
        chrono::Duration::from_std(stale_time).unwrap_or_else(|_| chrono::Duration::zero());
    Utc::now() - written_at > threshold
}

/// One fetch cycle: flag, retry with backoff, fence, apply.
/// The caller must have won the `in_flight` guard.
async fn run_fetch<T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static>(
    inner: Arc<QueryInner<T>>,
) {
    let seq = inner.issued.fetch_add(1, Ordering::SeqCst) + 1;

    inner.state.send_modify(|s| {
        s.is_fetching = true;
        if s.data.is_none() {
            s.is_loading = true;
        }
    });

    let result = fetch_with_retry(&inner).await;

    // Fencing: if a newer fetch was issued (or the key invalidated)
    // while this one ran, its result must not overwrite fresher state.
    if inner.issued.load(Ordering::SeqCst) != seq {
        debug!(key = %inner.key, seq, "discarding superseded fetch result");
        inner.state.send_modify(|s| {
            s.is_fetching = false;
            s.is_loading = false;
            // Cleared inside the closure so a joined refetch waking on
            // this notification already sees the flight as finished.
            inner.in_flight.store(false, Ordering::SeqCst);
        });
        return;
    }

    match result {
        Ok(value) => {
            inner
                .cache
                .set(&inner.key, &value, inner.config.cache_time);
            inner.state.send_modify(|s| {
                s.data = Some(value);
                s.is_loading = false;
                s.is_fetching = false;
                s.is_stale = false;
                s.error = None;
                s.last_updated = Some(Utc::now());
                inner.in_flight.store(false, Ordering::SeqCst);
            });
        }
        Err(e) => {
            warn!(key = %inner.key, error = %e, "fetch exhausted retries");
            // A previously cached value is retained and flagged stale,
            // never cleared on failure.
            inner.state.send_modify(|s| {
                s.is_loading = false;
                s.is_fetching = false;
                s.is_stale = s.data.is_some();
                s.error = Some(Arc::new(e));
                inner.in_flight.store(false, Ordering::SeqCst);
            });
        }
    }
}

async fn fetch_with_retry<T>(inner: &QueryInner<T>) -> Result<T, CoreError> {
    let attempts = inner.config.retry_count.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        match (inner.fetcher)().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!(key = %inner.key, attempt, error = %e, "fetch attempt failed");
                last_error = Some(e);
                if attempt + 1 < attempts {
                    tokio::time::sleep(backoff_delay(inner.config.retry_delay, attempt)).await;
                }
            }
        }
    }

    Err(CoreError::FetchExhausted {
        message: last_error.map(|e| e.to_string()).unwrap_or_default(),
        attempts,
    })
}

/// `retry_delay * 2^attempt`, saturating.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
}

// ── Background tasks ────────────────────────────────────────────────

/// Re-read the cache whenever another writer mutates this key, so all
/// coordinators observing the key converge on one fetch's result.
async fn cache_listener<T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static>(
    inner: Arc<QueryInner<T>>,
    cancel: CancellationToken,
) {
    let mut rx = inner.cache.subscribe(&inner.key);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(entry) = inner.cache.get::<T>(&inner.key) {
                    inner.state.send_modify(|s| {
                        if s.last_updated != Some(entry.written_at) {
                            s.data = Some(entry.value);
                            s.is_loading = false;
                            s.is_stale = false;
                            s.error = None;
                            s.last_updated = Some(entry.written_at);
                        }
                    });
                }
            }
        }
    }
}

/// Fixed-interval background refetch, reusing the retry/backoff path.
async fn interval_refetch<T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static>(
    inner: Arc<QueryInner<T>>,
    cancel: CancellationToken,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if inner
                    .in_flight
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    run_fetch(Arc::clone(&inner)).await;
                }
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
