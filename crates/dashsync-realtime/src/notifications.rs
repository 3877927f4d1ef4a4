// ── Notification stream (SSE) ──
//
// Consumes the server's `text/event-stream` endpoint over a reqwest
// byte stream and fans parsed notifications out through broadcast
// channels. Reconnects with exponential backoff; a missed heartbeat
// window tears the connection down into the same reconnect path.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::backoff::ReconnectConfig;
use crate::error::Error;
use crate::state::{ConnectionState, StatePublisher};

const CHANNEL_CAPACITY: usize = 256;

// ── Notification ────────────────────────────────────────────────────

/// A server-pushed notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Category, e.g. `"order"`, `"inventory"`, `"system"`.
    #[serde(rename = "type")]
    pub kind: String,

    pub title: String,

    pub message: String,

    /// Optional link target for the notification.
    #[serde(default)]
    pub href: Option<String>,

    #[serde(default)]
    pub metadata: Option<serde_json::Value>,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

// ── SSE wire parsing ────────────────────────────────────────────────

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser.
///
/// Feed raw chunks as they arrive; complete events come out once their
/// terminating blank line has been seen. Comment lines and unknown
/// fields are skipped per the SSE grammar.
#[derive(Default)]
pub(crate) struct SseParser {
    buffer: String,
    event: String,
    data_lines: Vec<String>,
}

impl SseParser {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        // Only consume fully terminated lines; a partial line stays
        // buffered until the next chunk completes it.
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = value.to_string(),
                "data" => self.data_lines.push(value.to_string()),
                // `id` and `retry` are not used by this client.
                _ => {}
            }
        }

        events
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.event.is_empty() && self.data_lines.is_empty() {
            return None;
        }
        let event = SseEvent {
            event: if self.event.is_empty() {
                "message".to_string()
            } else {
                std::mem::take(&mut self.event)
            },
            data: self.data_lines.join("\n"),
        };
        self.event.clear();
        self.data_lines.clear();
        Some(event)
    }
}

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub url: Url,
    pub reconnect: ReconnectConfig,
    /// Tear the connection down if no frame (heartbeat included)
    /// arrives within this window. Default: 45s.
    pub liveness_timeout: Duration,
}

impl NotificationConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            reconnect: ReconnectConfig::default(),
            liveness_timeout: Duration::from_secs(45),
        }
    }
}

// ── NotificationStream ──────────────────────────────────────────────

/// Handle to a running notification stream.
///
/// Subscribe before or after connecting; the background task owns the
/// connection and keeps reconnecting until [`shutdown`](Self::shutdown).
pub struct NotificationStream {
    all_tx: broadcast::Sender<Arc<Notification>>,
    by_kind: Arc<DashMap<String, broadcast::Sender<Arc<Notification>>>>,
    state: Arc<StatePublisher>,
    cancel: CancellationToken,
}

impl NotificationStream {
    /// Spawn the background connection loop. Returns immediately; watch
    /// [`state`](Self::state) to observe the first connection attempt.
    pub fn connect(config: NotificationConfig) -> Self {
        let (all_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let by_kind: Arc<DashMap<String, broadcast::Sender<Arc<Notification>>>> =
            Arc::new(DashMap::new());
        let state = Arc::new(StatePublisher::new());
        let cancel = CancellationToken::new();

        tokio::spawn(sse_loop(
            config,
            all_tx.clone(),
            Arc::clone(&by_kind),
            Arc::clone(&state),
            cancel.clone(),
        ));

        Self {
            all_tx,
            by_kind,
            state,
            cancel,
        }
    }

    /// Catch-all subscription to every notification.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Notification>> {
        self.all_tx.subscribe()
    }

    /// Subscription filtered to one notification kind.
    pub fn subscribe_kind(&self, kind: &str) -> broadcast::Receiver<Arc<Notification>> {
        self.by_kind
            .entry(kind.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Stop the background task. Terminal for this handle.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.state.set(ConnectionState::Disconnected);
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Background loop ─────────────────────────────────────────────────

async fn sse_loop(
    config: NotificationConfig,
    all_tx: broadcast::Sender<Arc<Notification>>,
    by_kind: Arc<DashMap<String, broadcast::Sender<Arc<Notification>>>>,
    state: Arc<StatePublisher>,
    cancel: CancellationToken,
) {
    let client = reqwest::Client::new();
    // Shared with the read loop so a heartbeat can reset the counter.
    let attempts = AtomicU32::new(0);

    loop {
        state.set(ConnectionState::Connecting);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = read_stream(&client, &config, &all_tx, &by_kind, &state, &attempts, &cancel) => {
                if cancel.is_cancelled() {
                    break;
                }
                match result {
                    Ok(()) => tracing::info!("notification stream ended, reconnecting"),
                    Err(e) => tracing::warn!(error = %e, "notification stream error"),
                }

                let attempt = attempts.load(Ordering::SeqCst);
                if config.reconnect.exhausted(attempt) {
                    tracing::error!(attempt, "notification reconnect limit reached, giving up");
                    state.set(ConnectionState::Error);
                    break;
                }

                let delay = config.reconnect.delay_for(attempt);
                state.set(ConnectionState::Reconnecting { attempt });
                tracing::info!(
                    delay_ms = delay.as_millis() as u64,
                    attempt,
                    "waiting before reconnect"
                );

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                attempts.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    state.set(match state.current() {
        ConnectionState::Error => ConnectionState::Error,
        _ => ConnectionState::Disconnected,
    });
    tracing::debug!("notification loop exiting");
}

/// One connection lifecycle: request, then read frames until the stream
/// drops or the liveness window expires.
async fn read_stream(
    client: &reqwest::Client,
    config: &NotificationConfig,
    all_tx: &broadcast::Sender<Arc<Notification>>,
    by_kind: &DashMap<String, broadcast::Sender<Arc<Notification>>>,
    state: &StatePublisher,
    attempts: &AtomicU32,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    tracing::info!(url = %config.url, "connecting to notification stream");

    let response = client
        .get(config.url.clone())
        .header("Accept", "text/event-stream")
        .send()
        .await
        .map_err(|e| Error::Connect(e.to_string()))?
        .error_for_status()
        .map_err(|e| Error::Connect(e.to_string()))?;

    state.set(ConnectionState::Connected);
    attempts.store(0, Ordering::SeqCst);

    let mut stream = response.bytes_stream();
    let mut parser = SseParser::new();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(config.liveness_timeout) => {
                return Err(Error::Connect(format!(
                    "no frame within {:?}, assuming dead connection",
                    config.liveness_timeout
                )));
            }
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                let text = String::from_utf8_lossy(&bytes);
                for event in parser.feed(&text) {
                    handle_event(&event, all_tx, by_kind, attempts);
                }
            }
            Some(Err(e)) => return Err(Error::Connect(e.to_string())),
            None => return Ok(()),
        }
    }
}

fn handle_event(
    event: &SseEvent,
    all_tx: &broadcast::Sender<Arc<Notification>>,
    by_kind: &DashMap<String, broadcast::Sender<Arc<Notification>>>,
    attempts: &AtomicU32,
) {
    match event.event.as_str() {
        "notification" => match serde_json::from_str::<Notification>(&event.data) {
            Ok(notification) => {
                let notification = Arc::new(notification);
                // Send errors just mean no active subscribers.
                let _ = all_tx.send(Arc::clone(&notification));
                if let Some(tx) = by_kind.get(&notification.kind) {
                    let _ = tx.send(notification);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed notification payload");
            }
        },
        "heartbeat" => {
            tracing::trace!("notification heartbeat");
            attempts.store(0, Ordering::SeqCst);
        }
        "connected" => {
            tracing::debug!("notification stream acknowledged");
        }
        other => {
            tracing::trace!(event = other, "ignoring unrecognized SSE event");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
