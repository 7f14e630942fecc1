use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::ConnectionError;

/// The type every handshake hook closure must return: a boxed, `Send` future
/// resolving to success or a [`ConnectionError`] of kind `HookFailure`.
pub type HookFuture = Pin<Box<dyn Future<Output = Result<(), ConnectionError>> + Send>>;

/// A handshake hook: an async procedure bracketing `connect`/`disconnect`.
///
/// Hooks receive nothing but must be idempotent — `before_disconnect` can run
/// twice for the same connection generation (once from an orderly `disconnect`,
/// once from [`crate::ConnectionToCore::on_connection_terminated`] if the
/// transport dies first).
pub type HookFn = Arc<dyn Fn() -> HookFuture + Send + Sync>;

/// The two handshake hook slots a [`crate::ConnectionToCore`] exposes.
#[derive(Clone, Default)]
pub struct Hooks {
    pub after_connect: Option<HookFn>,
    pub before_disconnect: Option<HookFn>,
}
