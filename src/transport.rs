use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::frame::RequestFrame;

/// An error raised by a [`Transport`] implementation. Left deliberately thin —
/// the byte-level framing, socket I/O, and TLS that would produce one are
/// outside this crate; only the message a caller wants surfaced matters here.
#[derive(Debug, Clone)]
pub struct TransportError(pub String);

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TransportError {}

impl From<&str> for TransportError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TransportError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Events a [`Transport`] pushes to the controller's background listener.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Message(Value),
}

/// The bidirectional framed channel capability this crate consumes.
///
/// Framing, socket I/O, and TLS are all the implementor's concern; this crate
/// only needs to drive connect/disconnect/send and observe the three signals
/// above. A caller-supplied implementation might sit on a WebSocket, a Unix
/// socket, an in-process channel (see [`crate::testing::MemoryTransport`]), or
/// anything else that can carry JSON frames.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identifies the remote endpoint, used in error messages.
    fn host(&self) -> &str;

    /// Whether the transport currently considers itself connected.
    fn is_connected(&self) -> bool;

    /// The controller calls this after driving `connect`/`disconnect` to record
    /// the outcome; implementors don't need to track it themselves beyond
    /// honoring it in `is_connected`.
    fn set_connected(&self, connected: bool);

    /// Perform link setup within the deadline.
    async fn connect(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Perform link teardown.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Enqueue one outbound request frame.
    async fn send(&self, frame: RequestFrame) -> Result<(), TransportError>;

    /// Subscribe to this transport's `connected`/`disconnected`/`message` signals.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
