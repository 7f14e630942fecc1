use std::fmt;

/// The taxonomy of failures a [`crate::ConnectionToCore`] can surface.
///
/// These are kinds, not distinct Rust types: every failure is a [`ConnectionError`]
/// tagged with one of these variants, mirroring how the rest of the crate's
/// error handling favors one enum with a `Display` impl over a tree of types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport termination observed, or a disconnect-adjacent inbound error remapped.
    Disconnected,
    /// A per-request deadline elapsed before a response arrived.
    Timeout,
    /// The request was mass-cancelled by a disconnect in progress.
    Cancelled,
    /// `Transport::send` rejected.
    TransportSend,
    /// `after_connect` or `before_disconnect` returned an error.
    HookFailure,
    /// Any other inbound error payload, delivered verbatim.
    PassThrough,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::TransportSend => write!(f, "transport send error"),
            Self::HookFailure => write!(f, "hook failure"),
            Self::PassThrough => write!(f, "remote error"),
        }
    }
}

/// A single error type for every failure this crate can produce.
///
/// `Clone` is required so the same terminal failure can be observed by every
/// waiter racing a coalesced `connect`/`disconnect` [`futures::future::Shared`]
/// future.
#[derive(Debug, Clone)]
pub struct ConnectionError {
    pub kind: ErrorKind,
    pub message: String,
    /// The remote error's original name, when this wraps an inbound error payload
    /// (e.g. `"BrowserLaunchError"`). `None` for locally-raised errors.
    pub remote_name: Option<String>,
}

impl ConnectionError {
    #[must_use]
    pub fn disconnected(host: &str) -> Self {
        Self {
            kind: ErrorKind::Disconnected,
            message: format!("disconnected from {host}"),
            remote_name: None,
        }
    }

    #[must_use]
    pub fn timeout(command: &str, timeout_ms: u64) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: format!("{command} timed out after {timeout_ms}ms"),
            remote_name: None,
        }
    }

    #[must_use]
    pub fn cancelled(reason: &str) -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            message: reason.to_string(),
            remote_name: None,
        }
    }

    #[must_use]
    pub fn transport_send(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::TransportSend,
            message: message.into(),
            remote_name: None,
        }
    }

    #[must_use]
    pub fn hook_failure(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::HookFailure,
            message: message.into(),
            remote_name: None,
        }
    }

    #[must_use]
    pub fn pass_through(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::PassThrough,
            message: message.into(),
            remote_name: Some(name.into()),
        }
    }

    /// True if this is the `Cancelled` kind produced by `PendingMessages::cancel`.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.remote_name {
            Some(name) => write!(f, "{} ({name}): {}", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ConnectionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnected_names_host() {
        let err = ConnectionError::disconnected("core.example.com:9000");
        assert_eq!(err.kind, ErrorKind::Disconnected);
        assert!(err.message.contains("core.example.com:9000"));
    }

    #[test]
    fn timeout_display_includes_command_and_duration() {
        let err = ConnectionError::timeout("Page.navigate", 50);
        assert_eq!(err.to_string(), "timeout: Page.navigate timed out after 50ms");
    }

    #[test]
    fn pass_through_keeps_remote_name() {
        let err = ConnectionError::pass_through("BrowserLaunchError", "failed to spawn");
        assert_eq!(err.remote_name.as_deref(), Some("BrowserLaunchError"));
        assert_eq!(
            err.to_string(),
            "remote error (BrowserLaunchError): failed to spawn"
        );
    }

    #[test]
    fn is_cancelled_only_true_for_cancelled_kind() {
        assert!(ConnectionError::cancelled("superseded by disconnect").is_cancelled());
        assert!(!ConnectionError::timeout("x", 1).is_cancelled());
    }
}
