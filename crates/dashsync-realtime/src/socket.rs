// ── Collaboration socket ──
//
// WebSocket link for multi-user dashboard presence: cursor positions,
// typing indicators, room membership. The server forgets membership the
// moment a connection drops, so every reconnect replays `room_join` for
// each room the client was in.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::backoff::ReconnectConfig;
use crate::error::Error;
use crate::state::{ConnectionState, StatePublisher};

const CHANNEL_CAPACITY: usize = 256;
const OUTBOUND_CAPACITY: usize = 64;

// ── Message envelope ────────────────────────────────────────────────

/// Well-known message kinds. The envelope carries the kind as a plain
/// string so domain-specific types pass through untouched.
pub mod kind {
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ROOM_JOIN: &str = "room_join";
    pub const ROOM_LEAVE: &str = "room_leave";
    pub const ROOM_STATE: &str = "room_state";
    pub const PRESENCE_JOIN: &str = "presence_join";
    pub const PRESENCE_LEAVE: &str = "presence_leave";
    pub const CURSOR_MOVE: &str = "cursor_move";
    pub const TYPING_START: &str = "typing_start";
    pub const TYPING_STOP: &str = "typing_stop";
}

/// Wire envelope for every collaboration message, in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollabMessage {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub room_id: Option<String>,

    pub sender_id: String,

    #[serde(default)]
    pub sender_name: Option<String>,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub data: Option<serde_json::Value>,

    pub message_id: Uuid,
}

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CollabConfig {
    pub url: Url,
    /// Stable client identity stamped on every outbound envelope.
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub reconnect: ReconnectConfig,
    /// Tear the connection down if nothing arrives within this window.
    /// Default: 45s.
    pub liveness_timeout: Duration,
}

impl CollabConfig {
    pub fn new(url: Url, sender_id: impl Into<String>) -> Self {
        Self {
            url,
            sender_id: sender_id.into(),
            sender_name: None,
            reconnect: ReconnectConfig::default(),
            liveness_timeout: Duration::from_secs(45),
        }
    }
}

// ── CollabSocket ────────────────────────────────────────────────────

/// Handle to the collaboration link. Cheap to clone.
#[derive(Clone)]
pub struct CollabSocket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    config: CollabConfig,
    state: StatePublisher,
    incoming: broadcast::Sender<Arc<CollabMessage>>,
    outbound: Mutex<Option<mpsc::Sender<CollabMessage>>>,
    rooms: Mutex<HashSet<String>>,
    attempts: AtomicU32,
    /// Set by manual `disconnect()`; the loop must not reconnect.
    suppress: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl CollabSocket {
    pub fn new(config: CollabConfig) -> Self {
        let (incoming, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SocketInner {
                config,
                state: StatePublisher::new(),
                incoming,
                outbound: Mutex::new(None),
                rooms: Mutex::new(HashSet::new()),
                attempts: AtomicU32::new(0),
                suppress: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Start (or restart after a manual disconnect) the connection
    /// loop. Attempts reset to zero; a fresh cancellation token replaces
    /// any cancelled one.
    pub fn connect(&self) {
        let inner = Arc::clone(&self.inner);
        inner.suppress.store(false, Ordering::SeqCst);
        inner.attempts.store(0, Ordering::SeqCst);

        let cancel = {
            let mut guard = lock(&inner.cancel);
            // Only a live loop blocks a restart; `Disconnected` and
            // `Error` both mean the previous loop has exited.
            let running = !guard.is_cancelled()
                && matches!(
                    inner.state.current(),
                    ConnectionState::Connecting
                        | ConnectionState::Connected
                        | ConnectionState::Reconnecting { .. }
                );
            if running {
                tracing::debug!("collab socket already running");
                return;
            }
            *guard = CancellationToken::new();
            guard.clone()
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        *lock(&inner.outbound) = Some(outbound_tx);

        tokio::spawn(socket_loop(inner, outbound_rx, cancel));
    }

    /// Tear the link down and suppress reconnection until the next
    /// `connect()`.
    pub fn disconnect(&self) {
        self.inner.suppress.store(true, Ordering::SeqCst);
        lock(&self.inner.cancel).cancel();
        *lock(&self.inner.outbound) = None;
        self.inner.state.set(ConnectionState::Disconnected);
    }

    /// Join a room. Membership is remembered and replayed on reconnect.
    pub fn join_room(&self, room_id: &str) -> Result<(), Error> {
        lock(&self.inner.rooms).insert(room_id.to_string());
        self.send(kind::ROOM_JOIN, Some(room_id), None)
    }

    pub fn leave_room(&self, room_id: &str) -> Result<(), Error> {
        lock(&self.inner.rooms).remove(room_id);
        self.send(kind::ROOM_LEAVE, Some(room_id), None)
    }

    /// Queue an outbound envelope.
    pub fn send(
        &self,
        message_kind: &str,
        room_id: Option<&str>,
        data: Option<serde_json::Value>,
    ) -> Result<(), Error> {
        let message = self.inner.envelope(message_kind, room_id, data);
        let guard = lock(&self.inner.outbound);
        let tx = guard
            .as_ref()
            .ok_or_else(|| Error::Send("socket is not connected".to_string()))?;
        tx.try_send(message)
            .map_err(|e| Error::Send(e.to_string()))
    }

    /// Subscribe to every inbound message.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CollabMessage>> {
        self.inner.incoming.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn rooms(&self) -> Vec<String> {
        lock(&self.inner.rooms).iter().cloned().collect()
    }
}

impl SocketInner {
    fn envelope(
        &self,
        message_kind: &str,
        room_id: Option<&str>,
        data: Option<serde_json::Value>,
    ) -> CollabMessage {
        CollabMessage {
            kind: message_kind.to_string(),
            room_id: room_id.map(String::from),
            sender_id: self.config.sender_id.clone(),
            sender_name: self.config.sender_name.clone(),
            timestamp: Utc::now(),
            data,
            message_id: Uuid::new_v4(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Background loop ─────────────────────────────────────────────────

async fn socket_loop(
    inner: Arc<SocketInner>,
    mut outbound_rx: mpsc::Receiver<CollabMessage>,
    cancel: CancellationToken,
) {
    loop {
        inner.state.set(ConnectionState::Connecting);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = run_connection(&inner, &mut outbound_rx, &cancel) => {
                if cancel.is_cancelled() || inner.suppress.load(Ordering::SeqCst) {
                    break;
                }
                match result {
                    Ok(()) => tracing::info!("collab socket disconnected, reconnecting"),
                    Err(e) => tracing::warn!(error = %e, "collab socket error"),
                }

                let attempt = inner.attempts.load(Ordering::SeqCst);
                if inner.config.reconnect.exhausted(attempt) {
                    tracing::error!(attempt, "collab reconnect limit reached, giving up");
                    // Mark this loop dead so a manual `connect()` can
                    // start a fresh one out of the error state.
                    cancel.cancel();
                    inner.state.set(ConnectionState::Error);
                    return;
                }

                let delay = inner.config.reconnect.delay_for(attempt);
                inner.state.set(ConnectionState::Reconnecting { attempt });
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
                inner.attempts.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    if !matches!(inner.state.current(), ConnectionState::Error) {
        inner.state.set(ConnectionState::Disconnected);
    }
    tracing::debug!("collab socket loop exiting");
}

/// One connection lifecycle: dial, replay room membership, then pump
/// frames in both directions until the link drops.
async fn run_connection(
    inner: &SocketInner,
    outbound_rx: &mut mpsc::Receiver<CollabMessage>,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    tracing::info!(url = %inner.config.url, "connecting collab socket");

    let (ws_stream, _response) = tokio_tungstenite::connect_async(inner.config.url.as_str())
        .await
        .map_err(|e| Error::Connect(e.to_string()))?;

    inner.state.set(ConnectionState::Connected);
    inner.attempts.store(0, Ordering::SeqCst);

    let (mut write, mut read) = ws_stream.split();

    // Presence restoration: the server forgot us when the last
    // connection dropped.
    let rooms: Vec<String> = lock(&inner.rooms).iter().cloned().collect();
    for room_id in rooms {
        tracing::debug!(room_id = %room_id, "replaying room membership");
        let message = inner.envelope(kind::ROOM_JOIN, Some(&room_id), None);
        send_frame(&mut write, &message).await?;
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(inner.config.liveness_timeout) => {
                return Err(Error::Connect(format!(
                    "no frame within {:?}, assuming dead connection",
                    inner.config.liveness_timeout
                )));
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(message) => send_frame(&mut write, &message).await?,
                    // All senders dropped; manual disconnect in flight.
                    None => return Ok(()),
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if let Some(reply) = handle_text_frame(inner, &text) {
                            send_frame(&mut write, &reply).await?;
                        }
                    }
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        // tungstenite answers protocol pings itself.
                        inner.attempts.store(0, Ordering::SeqCst);
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        return match frame {
                            // Abnormal closes count against the
                            // reconnect budget like any other error.
                            Some(cf) if !close_is_clean(cf.code) => Err(Error::Closed {
                                code: cf.code.into(),
                                reason: cf.reason.to_string(),
                            }),
                            Some(cf) => {
                                tracing::info!(code = %cf.code, reason = %cf.reason, "close frame");
                                Ok(())
                            }
                            None => Ok(()),
                        };
                    }
                    Some(Err(e)) => return Err(Error::Connect(e.to_string())),
                    None => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

fn close_is_clean(code: tungstenite::protocol::frame::coding::CloseCode) -> bool {
    use tungstenite::protocol::frame::coding::CloseCode;
    matches!(code, CloseCode::Normal | CloseCode::Away)
}

async fn send_frame<S>(write: &mut S, message: &CollabMessage) -> Result<(), Error>
where
    S: SinkExt<tungstenite::Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(message)?;
    write
        .send(tungstenite::Message::text(json))
        .await
        .map_err(|e| Error::Send(e.to_string()))
}

/// Parse an inbound text frame, fan it out, and produce a reply when
/// the protocol calls for one (`ping` -> `pong`).
fn handle_text_frame(inner: &SocketInner, text: &str) -> Option<CollabMessage> {
    let message: CollabMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(error = %e, "dropping malformed collab frame");
            return None;
        }
    };

    // Application-level heartbeat.
    if message.kind == kind::PING {
        inner.attempts.store(0, Ordering::SeqCst);
    }

    let reply = (message.kind == kind::PING).then(|| inner.envelope(kind::PONG, None, None));

    let _ = inner.incoming.send(Arc::new(message));
    reply
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_inner() -> SocketInner {
        let (incoming, _) = broadcast::channel(16);
        SocketInner {
            config: CollabConfig::new(
                Url::parse("ws://localhost:9/collab").unwrap(),
                "merchant-42",
            ),
            state: StatePublisher::new(),
            incoming,
            outbound: Mutex::new(None),
            rooms: Mutex::new(HashSet::new()),
            attempts: AtomicU32::new(0),
            suppress: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    #[test]
    fn envelope_uses_camel_case_wire_names() {
        let inner = test_inner();
        let message = inner.envelope(kind::CURSOR_MOVE, Some("dashboard:main"), None);
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["type"], "cursor_move");
        assert_eq!(json["roomId"], "dashboard:main");
        assert_eq!(json["senderId"], "merchant-42");
        assert!(json.get("messageId").is_some());
        assert!(json.get("room_id").is_none());
    }

    #[test]
    fn inbound_ping_produces_a_pong_reply() {
        let inner = test_inner();
        inner.attempts.store(5, Ordering::SeqCst);
        let mut rx = inner.incoming.subscribe();

        let ping = serde_json::json!({
            "type": "ping",
            "senderId": "server",
            "timestamp": "2026-08-01T09:30:00Z",
            "messageId": Uuid::new_v4(),
        });
        let reply = handle_text_frame(&inner, &ping.to_string()).unwrap();

        assert_eq!(reply.kind, kind::PONG);
        // Ping doubles as a heartbeat.
        assert_eq!(inner.attempts.load(Ordering::SeqCst), 0);
        // The ping is still fanned out to subscribers.
        assert_eq!(rx.try_recv().unwrap().kind, kind::PING);
    }

    #[test]
    fn domain_messages_pass_through_without_a_reply() {
        let inner = test_inner();
        let mut rx = inner.incoming.subscribe();

        let frame = serde_json::json!({
            "type": "annotation_added",
            "roomId": "dashboard:main",
            "senderId": "other-user",
            "timestamp": "2026-08-01T09:30:00Z",
            "data": { "widget": "revenue-chart" },
            "messageId": Uuid::new_v4(),
        });
        let reply = handle_text_frame(&inner, &frame.to_string());

        assert!(reply.is_none());
        let received = rx.try_recv().unwrap();
        assert_eq!(received.kind, "annotation_added");
        assert_eq!(received.data.as_ref().unwrap()["widget"], "revenue-chart");
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let inner = test_inner();
        let mut rx = inner.incoming.subscribe();

        assert!(handle_text_frame(&inner, "{truncated").is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_without_connect_is_an_error() {
        let socket = CollabSocket::new(CollabConfig::new(
            Url::parse("ws://localhost:9/collab").unwrap(),
            "merchant-42",
        ));
        let err = socket.send(kind::TYPING_START, Some("room"), None).unwrap_err();
        assert!(matches!(err, Error::Send(_)));
    }

    #[test]
    fn room_membership_is_tracked_locally() {
        let socket = CollabSocket::new(CollabConfig::new(
            Url::parse("ws://localhost:9/collab").unwrap(),
            "merchant-42",
        ));
        // Sends fail while disconnected but membership is still
        // recorded for replay.
        let _ = socket.join_room("dashboard:main");
        let _ = socket.join_room("dashboard:alerts");
        let _ = socket.leave_room("dashboard:alerts");

        assert_eq!(socket.rooms(), vec!["dashboard:main".to_string()]);
    }
}
