use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::ConnectionError;

/// Named, typed signals a [`crate::ConnectionToCore`] broadcasts to any number
/// of subscribers. Backed by [`tokio::sync::broadcast`] rather than a
/// hand-rolled generic event-emitter — multi-subscriber fan-out is exactly
/// what that channel type is for.
#[derive(Debug, Clone)]
pub enum Signal {
    /// The handshake completed and `send_request` calls may now proceed.
    Connected,
    /// Teardown completed, either orderly or because the transport died.
    /// Carries the fatal error that triggered teardown, if any.
    Disconnected(Option<ConnectionError>),
    /// A server-initiated event frame, forwarded opaquely.
    Event(Value),
}

pub(crate) const SIGNAL_CHANNEL_CAPACITY: usize = 256;

pub(crate) fn channel(capacity: usize) -> (broadcast::Sender<Signal>, broadcast::Receiver<Signal>) {
    broadcast::channel(capacity)
}
