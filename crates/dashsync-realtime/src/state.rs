// ── Connection state machine ──

use tokio::sync::watch;

/// Observable link health. Consumers never see sockets or streams, only
/// this state over a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out a backoff delay before attempt `attempt + 1`.
    Reconnecting {
        attempt: u32,
    },
    /// Reconnect ceiling exhausted; terminal until a manual `connect()`.
    Error,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Shared publisher for a connection's state.
pub(crate) struct StatePublisher {
    tx: watch::Sender<ConnectionState>,
}

impl StatePublisher {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::debug!(from = %current, to = %state, "connection state change");
                *current = state;
                true
            }
        });
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    pub(crate) fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }
}
