use std::time::Duration;

/// Construction-time knobs for a [`crate::ConnectionToCore`].
///
/// This is deliberately not a file-backed registry — version-matching remote
/// hosts and persisting connection info across process runs belongs to the
/// caller's own `Transport`/discovery layer, outside this crate's scope.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for `Transport::connect` when no explicit timeout is given to
    /// `connect`/the auto-connect path (default: 30s).
    pub connect_timeout: Duration,
    /// Default per-request timeout applied when `send_request` is called
    /// without an explicit one (default: none — requests wait indefinitely
    /// unless the caller opts in).
    pub default_request_timeout: Option<Duration>,
    /// Capacity of the broadcast channel backing [`crate::signals::Signal`]
    /// fan-out (default: 256, matching the corpus's transport channel default).
    pub signal_channel_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            default_request_timeout: None,
            signal_channel_capacity: crate::signals::SIGNAL_CHANNEL_CAPACITY,
        }
    }
}
