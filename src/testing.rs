//! An in-memory [`Transport`] double.
//!
//! Not gated behind `#[cfg(test)]` so both this crate's own tests and a
//! downstream integration test suite can exercise [`crate::ConnectionToCore`]
//! without a real socket, the way `tokio`'s own `io::duplex` stands in for a
//! live connection.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::frame::RequestFrame;
use crate::transport::{Transport, TransportError, TransportEvent};

type SendHook = Arc<dyn Fn(&RequestFrame) + Send + Sync>;

struct State {
    connected: bool,
    connect_calls: usize,
    connect_delay: Duration,
    fail_connect: bool,
    fail_disconnect: bool,
    fail_send: bool,
    on_send: Option<SendHook>,
}

/// A [`Transport`] backed by nothing but a broadcast channel, for tests.
///
/// By default `connect`/`disconnect`/`send` all succeed immediately. Use
/// `on_send` to script a responder, or the `fail_*`/`set_connect_delay`
/// setters to exercise error and timing paths.
pub struct MemoryTransport {
    host: String,
    state: Mutex<State>,
    tx: broadcast::Sender<TransportEvent>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            host: host.into(),
            state: Mutex::new(State {
                connected: false,
                connect_calls: 0,
                connect_delay: Duration::ZERO,
                fail_connect: false,
                fail_disconnect: false,
                fail_send: false,
                on_send: None,
            }),
            tx,
        }
    }

    /// Register a callback invoked synchronously from `send`, typically used
    /// to synthesize a matching response via `deliver`.
    pub fn on_send(&self, hook: impl Fn(&RequestFrame) + Send + Sync + 'static) {
        self.state.lock().on_send = Some(Arc::new(hook));
    }

    /// Push an inbound frame to the listener task as a `Message` event.
    pub fn deliver(&self, frame: Value) {
        let _ = self.tx.send(TransportEvent::Message(frame));
    }

    /// Simulate the remote end dropping the link.
    pub fn terminate(&self) {
        self.state.lock().connected = false;
        let _ = self.tx.send(TransportEvent::Disconnected);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    pub fn fail_next_connect(&self) {
        self.state.lock().fail_connect = true;
    }

    pub fn fail_disconnect(&self) {
        self.state.lock().fail_disconnect = true;
    }

    pub fn fail_send(&self) {
        self.state.lock().fail_send = true;
    }

    #[must_use]
    pub fn connect_calls(&self) -> usize {
        self.state.lock().connect_calls
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn host(&self) -> &str {
        &self.host
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    async fn connect(&self, _timeout: Duration) -> Result<(), TransportError> {
        let delay = self.state.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        state.connect_calls += 1;
        if state.fail_connect {
            state.fail_connect = false;
            return Err(TransportError::from("simulated connect failure"));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.fail_disconnect {
            state.fail_disconnect = false;
            return Err(TransportError::from("simulated disconnect failure"));
        }
        Ok(())
    }

    async fn send(&self, frame: RequestFrame) -> Result<(), TransportError> {
        let hook = {
            let mut state = self.state.lock();
            if state.fail_send {
                state.fail_send = false;
                return Err(TransportError::from("simulated send failure"));
            }
            state.on_send.clone()
        };
        if let Some(hook) = hook {
            hook(&frame);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.tx.subscribe()
    }
}
