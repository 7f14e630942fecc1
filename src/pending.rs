use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::ConnectionError;

type Completion = Result<Value, ConnectionError>;

struct Entry {
    resolver: oneshot::Sender<Completion>,
    is_internal: bool,
    timeout_handle: Option<JoinHandle<()>>,
}

struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    next_id: AtomicU64,
}

impl Inner {
    /// Remove and complete the entry for `id`, if it's still present. Returns
    /// `true` if an entry was found (callers use this to decide whether to log).
    fn complete(&self, id: &str, result: Completion) -> bool {
        let entry = self.entries.lock().remove(id);
        let Some(entry) = entry else {
            return false;
        };
        if let Some(handle) = entry.timeout_handle {
            handle.abort();
        }
        // A dropped receiver (caller gave up) just means the send is a no-op.
        let _ = entry.resolver.send(result);
        true
    }
}

/// The table of in-flight requests awaiting a matching response.
///
/// Every mutating operation (`resolve`, `reject`, `delete`, `cancel`, and the
/// timeout sweep spawned by `create`) removes the entry from the map under the
/// lock before completing its resolver, which is what gives each entry
/// exactly-once completion even when two of these race.
#[derive(Clone)]
pub struct PendingMessages {
    inner: Arc<Inner>,
}

impl Default for PendingMessages {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingMessages {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Allocate a fresh id and register a pending entry. Returns the id and a
    /// receiver the caller should await for the eventual `resolve`/`reject`/`cancel`.
    pub fn create(
        &self,
        timeout: Option<Duration>,
        is_internal: bool,
    ) -> (String, oneshot::Receiver<Completion>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (resolver, receiver) = oneshot::channel();

        let timeout_handle = timeout.filter(|d| !d.is_zero()).map(|d| {
            let inner = Arc::clone(&self.inner);
            let timeout_id = id.clone();
            let timeout_ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
            tokio::spawn(async move {
                tokio::time::sleep(d).await;
                if inner.complete(
                    &timeout_id,
                    Err(ConnectionError::timeout(&timeout_id, timeout_ms)),
                ) {
                    tracing::debug!(message_id = %timeout_id, "pending request timed out");
                }
            })
        });

        self.inner.entries.lock().insert(
            id.clone(),
            Entry {
                resolver,
                is_internal,
                timeout_handle,
            },
        );

        (id, receiver)
    }

    /// Fulfil the entry for `id` with `data`. A no-op if the id is unknown
    /// (a late response after cancellation/timeout is discarded silently).
    pub fn resolve(&self, id: &str, data: Value) {
        self.inner.complete(id, Ok(data));
    }

    /// Fail the entry for `id` with `error`. A no-op if the id is unknown.
    pub fn reject(&self, id: &str, error: ConnectionError) {
        self.inner.complete(id, Err(error));
    }

    /// Remove the entry for `id` without resolving it, e.g. when the caller
    /// abandons the request after a send failure.
    pub fn delete(&self, id: &str) {
        if let Some(entry) = self.inner.entries.lock().remove(id) {
            if let Some(handle) = entry.timeout_handle {
                handle.abort();
            }
        }
    }

    /// Mass-fail every entry currently in the table with `error` and empty it.
    pub fn cancel(&self, error: &ConnectionError) {
        let drained: Vec<(String, Entry)> = self.inner.entries.lock().drain().collect();
        for (_, entry) in drained {
            if let Some(handle) = entry.timeout_handle {
                handle.abort();
            }
            let _ = entry.resolver.send(Err(error.clone()));
        }
    }

    /// Number of entries currently outstanding. Exposed for tests and diagnostics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the given id was registered as an internal (handshake) request.
    #[must_use]
    pub fn is_internal(&self, id: &str) -> bool {
        self.inner
            .entries
            .lock()
            .get(id)
            .is_some_and(|e| e.is_internal)
    }
}
