use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::oneshot;

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::frame::{self, FrameKind, RequestFrame};
use crate::hooks::{HookFn, Hooks};
use crate::pending::PendingMessages;
use crate::signals::{self, Signal};
use crate::transport::{Transport, TransportEvent};

type GenerationFuture = Shared<BoxFuture<'static, Result<(), ConnectionError>>>;

#[derive(Default)]
struct State {
    connect_promise: Option<GenerationFuture>,
    disconnect_promise: Option<GenerationFuture>,
    is_connection_terminated: bool,
    is_sending_connect: bool,
    is_sending_disconnect: bool,
    connect_message_id: Option<String>,
    disconnect_message_id: Option<String>,
    did_auto_connect: bool,
}

struct Inner {
    transport: Arc<dyn Transport>,
    pending: PendingMessages,
    state: Mutex<State>,
    hooks: Mutex<Hooks>,
    has_active_sessions: Arc<dyn Fn() -> bool + Send + Sync>,
    signal_tx: broadcast::Sender<Signal>,
    config: ConnectionConfig,
}

/// The lifecycle state machine and in-flight request router for one logical
/// connection to a remote Core service.
///
/// Cheap to `Clone` — every clone is a handle onto the same shared state, so
/// it can be handed to handshake hooks, background tasks, and callers alike.
#[derive(Clone)]
pub struct ConnectionToCore {
    inner: Arc<Inner>,
}

impl ConnectionToCore {
    /// Build a controller over `transport`, with `has_active_sessions` always `false`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        Self::with_active_sessions_predicate(transport, config, Arc::new(|| false))
    }

    /// Build a controller with a custom `has_active_sessions` predicate, consulted
    /// by the handshake-abort check in `connect` (§4.2 step 3).
    #[must_use]
    pub fn with_active_sessions_predicate(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
        has_active_sessions: Arc<dyn Fn() -> bool + Send + Sync>,
    ) -> Self {
        let (signal_tx, _idle_rx) = signals::channel(config.signal_channel_capacity);
        let inner = Arc::new(Inner {
            transport,
            pending: PendingMessages::new(),
            state: Mutex::new(State::default()),
            hooks: Mutex::new(Hooks::default()),
            has_active_sessions,
            signal_tx,
            config,
        });
        spawn_listener(Arc::clone(&inner));
        Self { inner }
    }

    /// Set the hook run at the end of a successful `connect`, before the
    /// `Connected` signal is broadcast. Must be idempotent (see `set_before_disconnect`).
    pub fn set_after_connect(&self, hook: HookFn) {
        self.inner.hooks.lock().after_connect = Some(hook);
    }

    /// Set the hook run at the start of `disconnect` (after pending user
    /// requests are cancelled) and again, unconditionally, if the transport
    /// dies before an orderly disconnect — so this hook must be idempotent.
    pub fn set_before_disconnect(&self, hook: HookFn) {
        self.inner.hooks.lock().before_disconnect = Some(hook);
    }

    /// Subscribe to `Connected`/`Disconnected`/`Event` signals.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.inner.signal_tx.subscribe()
    }

    /// Whether the first `connect` on this generation was triggered implicitly
    /// by a `send_request` rather than an explicit call.
    #[must_use]
    pub fn did_auto_connect(&self) -> bool {
        self.inner.state.lock().did_auto_connect
    }

    /// Whether `disconnect` has been initiated for the current generation
    /// (disconnecting or already disconnected).
    #[must_use]
    pub fn is_disconnecting(&self) -> bool {
        self.inner.state.lock().disconnect_promise.is_some()
    }

    /// Number of requests currently awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Establish the logical connection, using the configured default timeout.
    /// Idempotent: concurrent and repeated calls share the same in-flight or
    /// resolved result.
    pub async fn connect(&self, is_auto_connect: bool) -> Result<(), ConnectionError> {
        self.connect_with_timeout(is_auto_connect, self.inner.config.connect_timeout)
            .await
    }

    /// `connect` with an explicit timeout for `Transport::connect`.
    pub async fn connect_with_timeout(
        &self,
        is_auto_connect: bool,
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        let fut = {
            let mut state = self.inner.state.lock();
            if let Some(existing) = &state.connect_promise {
                existing.clone()
            } else {
                // Starting a fresh generation: any earlier disconnect is now history.
                state.disconnect_promise = None;
                state.is_connection_terminated = false;
                state.did_auto_connect = is_auto_connect;
                let this = self.clone();
                let shared: GenerationFuture =
                    (async move { this.run_connect(is_auto_connect, timeout).await })
                        .boxed()
                        .shared();
                state.connect_promise = Some(shared.clone());
                shared
            }
        };
        fut.await
    }

    async fn run_connect(
        &self,
        is_auto_connect: bool,
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        let host = self.inner.transport.host().to_string();
        tracing::debug!(host = %host, auto_connect = is_auto_connect, "connect: starting");

        self.inner
            .transport
            .connect(timeout)
            .await
            .map_err(|e| ConnectionError::disconnected(&format!("{host} ({e})")))?;

        // Handshake-abort check (§4.2 step 3): a disconnect raced ahead of us
        // while the transport link was coming up.
        let disconnecting = self.inner.state.lock().disconnect_promise.is_some();
        let has_active = (self.inner.has_active_sessions)();
        if disconnecting && has_active && !is_auto_connect {
            tracing::warn!(host = %host, "connect: aborted by concurrent disconnect with active sessions");
            return Err(ConnectionError::disconnected(&host));
        }

        let after_connect = self.inner.hooks.lock().after_connect.clone();
        if let Some(after_connect) = after_connect {
            let _guard = SendingGuard::connect(Arc::clone(&self.inner));
            if let Err(e) = after_connect().await {
                tracing::error!(host = %host, error = %e, "connect: after_connect hook failed");
                return Err(ConnectionError::hook_failure(e.to_string()));
            }
        }

        self.inner.transport.set_connected(true);
        let _ = self.inner.signal_tx.send(Signal::Connected);
        tracing::debug!(host = %host, "connect: established");
        Ok(())
    }

    /// Orderly teardown. Idempotent: repeated calls share the same in-flight or
    /// resolved result. Always completes, even if `before_disconnect` or the
    /// transport's own `disconnect` fails (§4.2 step 6; §9 design note).
    pub async fn disconnect(&self, fatal_error: Option<ConnectionError>) -> Result<(), ConnectionError> {
        let fut = {
            let mut state = self.inner.state.lock();
            if let Some(existing) = &state.disconnect_promise {
                existing.clone()
            } else {
                let this = self.clone();
                let err_for_run = fatal_error.clone();
                let shared: GenerationFuture =
                    (async move { this.run_disconnect(err_for_run).await })
                        .boxed()
                        .shared();
                state.disconnect_promise = Some(shared.clone());
                shared
            }
        };
        fut.await
    }

    async fn run_disconnect(&self, fatal_error: Option<ConnectionError>) -> Result<(), ConnectionError> {
        let host = self.inner.transport.host().to_string();
        tracing::debug!(host = %host, "disconnect: starting");

        self.inner.pending.cancel(&ConnectionError::disconnected(&host));

        let before_disconnect = self.inner.hooks.lock().before_disconnect.clone();
        if let Some(before_disconnect) = before_disconnect {
            let _guard = SendingGuard::disconnect(Arc::clone(&self.inner));
            if let Err(e) = before_disconnect().await {
                tracing::error!(host = %host, error = %e, "disconnect: before_disconnect hook failed, teardown continues");
            }
        }

        if let Err(e) = self.inner.transport.disconnect().await {
            tracing::warn!(host = %host, error = %e, "disconnect: transport disconnect failed, teardown continues");
        }
        self.inner.transport.set_connected(false);
        let _ = self.inner.signal_tx.send(Signal::Disconnected(fatal_error));

        self.inner.state.lock().connect_promise = None;
        tracing::debug!(host = %host, "disconnect: complete");
        Ok(())
    }

    /// Enqueue an RPC call, auto-connecting first unless this call is itself
    /// running from within a handshake hook.
    pub async fn send_request(
        &self,
        command: impl Into<String>,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ConnectionError> {
        let command = command.into();
        let (is_connect, is_disconnect) = {
            let state = self.inner.state.lock();
            (state.is_sending_connect, state.is_sending_disconnect)
        };

        if !is_connect && !is_disconnect {
            self.connect(true).await?;
        }

        let is_internal = is_connect || is_disconnect;
        let effective_timeout = timeout.or(self.inner.config.default_request_timeout);
        let (id, receiver) = self.inner.pending.create(effective_timeout, is_internal);

        if is_internal {
            let mut state = self.inner.state.lock();
            if is_connect {
                state.connect_message_id = Some(id.clone());
            }
            if is_disconnect {
                state.disconnect_message_id = Some(id.clone());
            }
        }
        let _id_guard =
            is_internal.then(|| InternalIdGuard::new(Arc::clone(&self.inner), is_connect, is_disconnect));

        let frame = RequestFrame {
            message_id: id.clone(),
            command,
            args,
            send_time: now_ms(),
            command_id: None,
            start_time: None,
        };

        let result = self.race_send_and_response(frame, receiver, &id).await;

        match result {
            Err(e) if e.is_cancelled() && self.is_disconnecting() => {
                tracing::debug!(message_id = %id, "send_request: cancellation swallowed during disconnect");
                Ok(Value::Null)
            }
            other => other,
        }
    }

    /// Race the pending entry's receiver against `Transport::send`. The
    /// response wins if both are ready (`biased`); a send failure is only
    /// observable before any response has arrived, since once `send` succeeds
    /// this falls through to waiting on the receiver alone.
    async fn race_send_and_response(
        &self,
        frame: RequestFrame,
        mut receiver: oneshot::Receiver<Result<Value, ConnectionError>>,
        id: &str,
    ) -> Result<Value, ConnectionError> {
        let mut send_fut = self.inner.transport.send(frame);
        let mut send_done = false;
        loop {
            if send_done {
                return match (&mut receiver).await {
                    Ok(completion) => completion,
                    Err(_) => Err(ConnectionError::cancelled("pending entry dropped without completion")),
                };
            }
            tokio::select! {
                biased;
                resp = &mut receiver => {
                    return match resp {
                        Ok(completion) => completion,
                        Err(_) => Err(ConnectionError::cancelled("pending entry dropped without completion")),
                    };
                }
                send_result = &mut send_fut => {
                    match send_result {
                        Ok(()) => send_done = true,
                        Err(e) => {
                            self.inner.pending.delete(id);
                            return Err(ConnectionError::transport_send(e.to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Sole inbound dispatch: classify by tag and route.
    async fn on_message(&self, frame: Value) {
        match frame::classify(&frame) {
            Some(FrameKind::Response { response_id, data }) => {
                self.on_response(&response_id, data).await;
            }
            Some(FrameKind::Event(event)) => self.on_event(event),
            None => tracing::trace!("on_message: dropping unclassifiable frame"),
        }
    }

    async fn on_response(&self, response_id: &str, data: Value) {
        let Some(mut err) = frame::as_error_payload(&data) else {
            self.inner.pending.resolve(response_id, data);
            return;
        };

        let host = self.inner.transport.host().to_string();
        let disconnecting = self.is_disconnecting();
        let session_closed = err.name == "SessionClosedOrMissingError";
        let disconnect_adjacent = disconnecting || session_closed || err.is_disconnecting;
        err.is_disconnecting = false;

        let is_browser_launch_kind = matches!(
            err.name.as_str(),
            "BrowserLaunchError" | "DependenciesMissingError"
        );

        let mapped = if disconnect_adjacent && !is_browser_launch_kind {
            tracing::warn!(response_id, remote_name = %err.name, "on_response: remapping disconnect-adjacent error");
            ConnectionError::disconnected(&host)
        } else {
            ConnectionError::pass_through(err.name, err.message)
        };
        self.inner.pending.reject(response_id, mapped);
    }

    fn on_event(&self, frame: Value) {
        let _ = self.inner.signal_tx.send(Signal::Event(frame));
    }

    /// Transport-level termination observer; idempotent via `is_connection_terminated`.
    async fn on_connection_terminated(&self) {
        let already_seen = {
            let mut state = self.inner.state.lock();
            std::mem::replace(&mut state.is_connection_terminated, true)
        };
        if already_seen {
            return;
        }

        let host = self.inner.transport.host().to_string();
        tracing::warn!(host = %host, "on_connection_terminated: transport reported disconnection");
        let _ = self.inner.signal_tx.send(Signal::Disconnected(None));

        let (connect_id, disconnect_id, did_auto_connect) = {
            let state = self.inner.state.lock();
            (
                state.connect_message_id.clone(),
                state.disconnect_message_id.clone(),
                state.did_auto_connect,
            )
        };

        if let Some(id) = connect_id {
            if did_auto_connect {
                self.inner.pending.resolve(&id, Value::Null);
            } else {
                self.inner.pending.reject(&id, ConnectionError::disconnected(&host));
            }
        }
        if let Some(id) = disconnect_id {
            self.inner.pending.resolve(&id, Value::Null);
        }

        self.inner.pending.cancel(&ConnectionError::disconnected(&host));

        let before_disconnect = self.inner.hooks.lock().before_disconnect.clone();
        if let Some(before_disconnect) = before_disconnect {
            let _guard = SendingGuard::disconnect(Arc::clone(&self.inner));
            if let Err(e) = before_disconnect().await {
                tracing::error!(host = %host, error = %e, "on_connection_terminated: before_disconnect hook failed");
            }
        }
    }
}

/// RAII guard keeping `is_sending_connect`/`is_sending_disconnect` true for
/// exactly the duration of the corresponding handshake hook call, even if the
/// hook's future is dropped early.
struct SendingGuard {
    inner: Arc<Inner>,
    which: Which,
}

enum Which {
    Connect,
    Disconnect,
}

impl SendingGuard {
    fn connect(inner: Arc<Inner>) -> Self {
        inner.state.lock().is_sending_connect = true;
        Self {
            inner,
            which: Which::Connect,
        }
    }

    fn disconnect(inner: Arc<Inner>) -> Self {
        inner.state.lock().is_sending_disconnect = true;
        Self {
            inner,
            which: Which::Disconnect,
        }
    }
}

impl Drop for SendingGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        match self.which {
            Which::Connect => state.is_sending_connect = false,
            Which::Disconnect => state.is_sending_disconnect = false,
        }
    }
}

/// RAII guard clearing `connect_message_id`/`disconnect_message_id` once the
/// owning `send_request` call unwinds, per §4.2 step 6.
struct InternalIdGuard {
    inner: Arc<Inner>,
    is_connect: bool,
    is_disconnect: bool,
}

impl InternalIdGuard {
    fn new(inner: Arc<Inner>, is_connect: bool, is_disconnect: bool) -> Self {
        Self {
            inner,
            is_connect,
            is_disconnect,
        }
    }
}

impl Drop for InternalIdGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if self.is_connect {
            state.connect_message_id = None;
        }
        if self.is_disconnect {
            state.disconnect_message_id = None;
        }
    }
}

fn spawn_listener(inner: Arc<Inner>) {
    let handle = ConnectionToCore { inner };
    tokio::spawn(async move {
        let mut rx = handle.inner.transport.subscribe();
        loop {
            match rx.recv().await {
                Ok(TransportEvent::Message(frame)) => handle.on_message(frame).await,
                Ok(TransportEvent::Disconnected) => handle.on_connection_terminated().await,
                Ok(TransportEvent::Connected) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "transport event listener lagged; frames were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryTransport;
    use crate::transport::Transport as _;
    use std::time::Duration;

    fn new_connection() -> (ConnectionToCore, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new("core.test:9000"));
        let conn = ConnectionToCore::new(transport.clone(), ConnectionConfig::default());
        (conn, transport)
    }

    #[test_log::test(tokio::test)]
    async fn happy_path_round_trip() {
        let (conn, transport) = new_connection();
        transport.set_connected(true);

        let echo = transport.clone();
        transport.on_send(move |frame| {
            echo.deliver(serde_json::json!({
                "responseId": frame.message_id,
                "data": {"pong": true},
            }));
        });

        let result = conn
            .send_request("ping", serde_json::json!({}), None)
            .await
            .unwrap();
        assert_eq!(result["pong"], true);
    }

    #[tokio::test]
    async fn auto_connect_coalesces_concurrent_requests() {
        let (conn, transport) = new_connection();
        let echo = transport.clone();
        transport.on_send(move |frame| {
            echo.deliver(serde_json::json!({"responseId": frame.message_id, "data": {}}));
        });

        let a = conn.clone();
        let b = conn.clone();
        let (r1, r2) = tokio::join!(
            a.send_request("one", serde_json::json!({}), None),
            b.send_request("two", serde_json::json!({}), None),
        );
        assert!(r1.is_ok());
        assert!(r2.is_ok());
        assert_eq!(transport.connect_calls(), 1);
    }

    #[tokio::test]
    async fn timeout_rejects_and_discards_late_response() {
        let (conn, transport) = new_connection();
        transport.set_connected(true);
        // No responder registered — the request is left hanging until the timeout fires.

        let result = conn
            .send_request("slow", serde_json::json!({}), Some(Duration::from_millis(20)))
            .await;
        assert!(matches!(result, Err(e) if e.kind == crate::error::ErrorKind::Timeout));
    }

    #[test_log::test(tokio::test)]
    async fn disconnect_mid_flight_swallows_cancellation() {
        let (conn, transport) = new_connection();
        transport.set_connected(true);
        // No responder: the request stays pending until disconnect cancels it.

        let conn2 = conn.clone();
        let request = tokio::spawn(async move {
            conn2
                .send_request("slow", serde_json::json!({}), None)
                .await
        });

        // Give the request a moment to register before tearing down.
        tokio::time::sleep(Duration::from_millis(10)).await;
        conn.disconnect(None).await.unwrap();

        let result = request.await.unwrap().unwrap();
        assert_eq!(result, Value::Null);

        // A fresh connect cycle is possible afterward.
        transport.set_connected(true);
        let echo = transport.clone();
        transport.on_send(move |frame| {
            echo.deliver(serde_json::json!({"responseId": frame.message_id, "data": {}}));
        });
        assert!(conn.connect(false).await.is_ok());
    }

    #[tokio::test]
    async fn browser_launch_error_survives_disconnect() {
        let (conn, transport) = new_connection();
        transport.set_connected(true);
        let echo = transport.clone();
        transport.on_send(move |frame| {
            echo.deliver(serde_json::json!({
                "responseId": frame.message_id,
                "data": {"name": "BrowserLaunchError", "message": "no chrome binary"},
            }));
        });

        conn.disconnect(None).await.unwrap();
        transport.set_connected(true);

        let result = conn.send_request("launch", serde_json::json!({}), None).await;
        match result {
            Err(e) => {
                assert_eq!(e.kind, crate::error::ErrorKind::PassThrough);
                assert_eq!(e.remote_name.as_deref(), Some("BrowserLaunchError"));
            }
            Ok(_) => panic!("expected a pass-through error"),
        }
    }

    #[tokio::test]
    async fn is_disconnecting_error_remapped_and_scrubbed() {
        let (conn, transport) = new_connection();
        transport.set_connected(true);

        let id = {
            let (id, _rx) = conn.inner.pending.create(None, false);
            id
        };
        transport.deliver(serde_json::json!({
            "responseId": id,
            "data": {"name": "X", "isDisconnecting": true},
        }));

        // Give the listener task a turn to process the frame.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(conn.inner.pending.len() == 0);
    }

    #[tokio::test]
    async fn idempotent_disconnect_signals_once() {
        let (conn, transport) = new_connection();
        transport.set_connected(true);
        let mut signals = conn.subscribe();

        let a = conn.clone();
        let b = conn.clone();
        let c = conn.clone();
        let (r1, r2, r3) = tokio::join!(
            a.disconnect(None),
            b.disconnect(None),
            c.disconnect(None),
        );
        assert!(r1.is_ok() && r2.is_ok() && r3.is_ok());

        let mut disconnected_count = 0;
        while let Ok(signal) = signals.try_recv() {
            if matches!(signal, Signal::Disconnected(_)) {
                disconnected_count += 1;
            }
        }
        assert_eq!(disconnected_count, 1);
    }

    #[test_log::test(tokio::test)]
    async fn handshake_abort_when_disconnect_races_explicit_connect() {
        let transport = Arc::new(MemoryTransport::new("core.test:9000"));
        transport.set_connect_delay(Duration::from_millis(30));
        let conn = ConnectionToCore::with_active_sessions_predicate(
            transport.clone(),
            ConnectionConfig::default(),
            Arc::new(|| true),
        );

        let connecting = conn.clone();
        let connect_task = tokio::spawn(async move { connecting.connect(false).await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        // Force the disconnect_promise to exist before the connect's transport
        // handshake resolves, mirroring "disconnect initiated during connect".
        let conn2 = conn.clone();
        tokio::spawn(async move {
            let _ = conn2.disconnect(None).await;
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let result = connect_task.await.unwrap();
        assert!(matches!(
            result,
            Err(e) if e.kind == crate::error::ErrorKind::Disconnected
        ));
    }
}
