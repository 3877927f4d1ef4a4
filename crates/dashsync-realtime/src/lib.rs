// dashsync-realtime: server-push plumbing for the dashboard — an SSE
// notification stream and a collaboration WebSocket, both with
// state-machine reconnection and exponential backoff.

pub mod backoff;
pub mod error;
pub mod notifications;
pub mod socket;
pub mod state;

pub use backoff::ReconnectConfig;
pub use error::Error;
pub use notifications::{Notification, NotificationConfig, NotificationStream};
pub use socket::{kind, CollabConfig, CollabMessage, CollabSocket};
pub use state::ConnectionState;
