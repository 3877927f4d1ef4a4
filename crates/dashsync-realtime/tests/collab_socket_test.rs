//! Integration tests for the collaboration socket against a local
//! WebSocket server.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use dashsync_realtime::socket::kind;
use dashsync_realtime::{CollabConfig, CollabMessage, CollabSocket, ConnectionState, ReconnectConfig};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

/// Accept WebSocket connections and forward every inbound text frame
/// (tagged with a connection ordinal) to the test body. `drop_after`
/// closes each connection after that many received frames.
async fn spawn_server(drop_after: Option<usize>) -> (Url, mpsc::UnboundedReceiver<(usize, CollabMessage)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut conn = 0usize;
        while let Ok((stream, _)) = listener.accept().await {
            let ws = match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => ws,
                Err(_) => continue,
            };
            let tx = tx.clone();
            let conn_id = conn;
            conn += 1;

            tokio::spawn(async move {
                let (mut write, mut read) = ws.split();
                let mut seen = 0usize;
                while let Some(Ok(frame)) = read.next().await {
                    if let Message::Text(text) = frame {
                        if let Ok(message) = serde_json::from_str::<CollabMessage>(&text) {
                            let _ = tx.send((conn_id, message));
                        }
                        seen += 1;
                        if drop_after.is_some_and(|n| seen >= n) {
                            let _ = write.close().await;
                            return;
                        }
                    }
                }
            });
        }
    });

    let url = Url::parse(&format!("ws://{addr}/collab")).unwrap();
    (url, rx)
}

fn fast_config(url: Url) -> CollabConfig {
    CollabConfig {
        reconnect: ReconnectConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_attempts: Some(5),
        },
        liveness_timeout: Duration::from_secs(5),
        ..CollabConfig::new(url, "merchant-42")
    }
}

async fn wait_for_state(
    rx: &mut tokio::sync::watch::Receiver<ConnectionState>,
    want: ConnectionState,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *rx.borrow_and_update() == want {
                return;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {want}"));
}

async fn recv_frame(
    rx: &mut mpsc::UnboundedReceiver<(usize, CollabMessage)>,
) -> (usize, CollabMessage) {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("server saw no frame")
        .unwrap()
}

#[tokio::test]
async fn outbound_messages_reach_the_server() {
    let (url, mut frames) = spawn_server(None).await;
    let socket = CollabSocket::new(fast_config(url));
    socket.connect();

    let mut state = socket.state();
    wait_for_state(&mut state, ConnectionState::Connected).await;

    socket
        .send(
            kind::CURSOR_MOVE,
            Some("dashboard:main"),
            Some(serde_json::json!({"x": 120, "y": 48})),
        )
        .unwrap();

    let (_, message) = recv_frame(&mut frames).await;
    assert_eq!(message.kind, kind::CURSOR_MOVE);
    assert_eq!(message.room_id.as_deref(), Some("dashboard:main"));
    assert_eq!(message.sender_id, "merchant-42");

    socket.disconnect();
}

#[tokio::test]
async fn room_membership_replays_on_reconnect() {
    // Server drops each connection after one frame, forcing reconnects.
    let (url, mut frames) = spawn_server(Some(1)).await;
    let socket = CollabSocket::new(fast_config(url));
    socket.connect();

    let mut state = socket.state();
    wait_for_state(&mut state, ConnectionState::Connected).await;
    socket.join_room("dashboard:main").unwrap();

    // Connection 0: the explicit join, after which the server hangs up.
    let (conn, message) = recv_frame(&mut frames).await;
    assert_eq!((conn, message.kind.as_str()), (0, kind::ROOM_JOIN));

    // Connection 1: the replayed join, sent without any client call.
    let (conn, message) = recv_frame(&mut frames).await;
    assert_eq!((conn, message.kind.as_str()), (1, kind::ROOM_JOIN));
    assert_eq!(message.room_id.as_deref(), Some("dashboard:main"));

    socket.disconnect();
}

#[tokio::test]
async fn manual_disconnect_suppresses_reconnection() {
    let (url, mut frames) = spawn_server(None).await;
    let socket = CollabSocket::new(fast_config(url));
    socket.connect();

    let mut state = socket.state();
    wait_for_state(&mut state, ConnectionState::Connected).await;

    socket.disconnect();
    wait_for_state(&mut state, ConnectionState::Disconnected).await;

    // No automatic redial during the manual window: sends fail and the
    // server sees nothing.
    assert!(socket.send(kind::TYPING_START, None, None).is_err());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*state.borrow_and_update(), ConnectionState::Disconnected);

    // connect() after a manual disconnect starts clean.
    socket.connect();
    wait_for_state(&mut state, ConnectionState::Connected).await;
    socket.send(kind::TYPING_START, Some("dashboard:main"), None).unwrap();

    let (_, message) = recv_frame(&mut frames).await;
    assert_eq!(message.kind, kind::TYPING_START);

    socket.disconnect();
}

#[tokio::test(flavor = "multi_thread")]
async fn abnormal_server_close_triggers_a_redial() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = Url::parse(&format!("ws://{addr}/collab")).unwrap();

    // Every connection is told to go away with a non-normal code.
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                let frame = CloseFrame {
                    code: CloseCode::Error,
                    reason: "server restarting".into(),
                };
                let _ = ws.send(Message::Close(Some(frame))).await;
            }
        }
    });

    let socket = CollabSocket::new(fast_config(url));
    socket.connect();

    let mut state = socket.state();
    wait_for_state(&mut state, ConnectionState::Connected).await;
    // The close code reads as a failure, not a quiet goodbye, so the
    // client backs off and dials again.
    wait_for_state(&mut state, ConnectionState::Reconnecting { attempt: 0 }).await;
    wait_for_state(&mut state, ConnectionState::Connected).await;

    socket.disconnect();
}

#[tokio::test]
async fn connect_after_exhaustion_recovers() {
    // Reserve a port, then shut the listener down so dials fail.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let url = Url::parse(&format!("ws://{addr}/collab")).unwrap();
    let socket = CollabSocket::new(CollabConfig {
        reconnect: ReconnectConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            max_attempts: Some(1),
        },
        ..CollabConfig::new(url, "merchant-42")
    });
    socket.connect();

    let mut state = socket.state();
    wait_for_state(&mut state, ConnectionState::Error).await;

    // Bring a server up on the reserved port; a manual connect() must
    // start a fresh loop instead of staying stuck in the error state.
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    let (_write, mut read) = ws.split();
                    while read.next().await.is_some() {}
                }
            });
        }
    });

    socket.connect();
    wait_for_state(&mut state, ConnectionState::Connected).await;

    socket.disconnect();
}
