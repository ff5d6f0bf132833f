//! Pending-request registry and shared client state.
//!
//! Sequence numbers come from one monotonically increasing counter shared
//! across all endpoints, so correlation is global: the registry never
//! assumes a 1:1 mapping between a connection and a sequence range. Each
//! pending request records the endpoint key of the connection that carries
//! it, which is what scopes transport failures to a single connection.
//!
//! `resolve` and `fail` remove the entry before firing its sink, so a
//! racing duplicate delivery cannot complete a request twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::arena::ResponseArena;
use crate::error::{DubboError, Result};

/// Lifecycle of a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Registered, not yet handed to a connection.
    Waiting,
    /// Parked in the connection's write queue behind an in-progress write.
    Queued,
    /// Its frame is being written to the socket.
    Sending,
    /// Write completed; waiting for (more) response bytes.
    Receiving,
}

/// A completed response: status byte plus assembled body.
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    pub status: u8,
    pub body: Bytes,
}

type ResponseSink = oneshot::Sender<Result<ResponseFrame>>;

/// One in-flight request, owned by the registry from registration until
/// resolution or failure.
pub struct PendingRequest {
    pub sequence: u64,
    /// `host:port` of the connection carrying this request.
    pub endpoint: String,
    pub state: RequestState,
    pub created_at: Instant,
    sink: ResponseSink,
}

/// Process-wide table mapping sequence number to pending request state.
#[derive(Default)]
pub struct RequestRegistry {
    entries: HashMap<u64, PendingRequest>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request and return the receiver its response
    /// will be delivered on.
    pub fn register(
        &mut self,
        sequence: u64,
        endpoint: &str,
    ) -> oneshot::Receiver<Result<ResponseFrame>> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            sequence,
            PendingRequest {
                sequence,
                endpoint: endpoint.to_string(),
                state: RequestState::Waiting,
                created_at: Instant::now(),
                sink: tx,
            },
        );
        rx
    }

    /// Check whether a sequence number has a pending entry.
    pub fn contains(&self, sequence: u64) -> bool {
        self.entries.contains_key(&sequence)
    }

    /// Update the state of a pending request. Returns false if the entry
    /// was already resolved or failed.
    pub fn mark(&mut self, sequence: u64, state: RequestState) -> bool {
        match self.entries.get_mut(&sequence) {
            Some(entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    /// Resolve a pending request with its completed response.
    ///
    /// The entry is removed before the sink fires; resolving an unknown
    /// sequence is a no-op.
    pub fn resolve(&mut self, sequence: u64, frame: ResponseFrame) {
        if let Some(entry) = self.entries.remove(&sequence) {
            let _ = entry.sink.send(Ok(frame));
        }
    }

    /// Fail a pending request. Same at-most-once contract as [`resolve`].
    ///
    /// [`resolve`]: RequestRegistry::resolve
    pub fn fail(&mut self, sequence: u64, error: DubboError) {
        if let Some(entry) = self.entries.remove(&sequence) {
            let _ = entry.sink.send(Err(error));
        }
    }

    /// Remove every entry matching the predicate, failing each with an
    /// error built by `make_error`. Returns the removed sequence numbers.
    pub fn remove_matching(
        &mut self,
        predicate: impl Fn(&PendingRequest) -> bool,
        make_error: impl Fn() -> DubboError,
    ) -> Vec<u64> {
        let sequences: Vec<u64> = self
            .entries
            .values()
            .filter(|entry| predicate(entry))
            .map(|entry| entry.sequence)
            .collect();
        for &sequence in &sequences {
            if let Some(entry) = self.entries.remove(&sequence) {
                let _ = entry.sink.send(Err(make_error()));
            }
        }
        sequences
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Registry and arena guarded together.
///
/// Response completion touches both (read span, release span, fire sink),
/// so one mutex keeps those steps atomic. The lock is never held across an
/// await point.
pub struct SharedState {
    pub registry: RequestRegistry,
    pub arena: ResponseArena,
}

/// State shared between the orchestrator and every connection task,
/// injected at construction rather than kept in ambient globals.
pub struct Shared {
    state: Mutex<SharedState>,
    sequence: AtomicU64,
}

impl Shared {
    pub fn new(arena_capacity: usize) -> Self {
        Self {
            state: Mutex::new(SharedState {
                registry: RequestRegistry::new(),
                arena: ResponseArena::new(arena_capacity),
            }),
            sequence: AtomicU64::new(0),
        }
    }

    /// Next value of the global sequence counter.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Run a closure with the locked state.
    pub fn with<R>(&self, f: impl FnOnce(&mut SharedState) -> R) -> R {
        let mut guard = self.state.lock().expect("shared state poisoned");
        f(&mut guard)
    }

    /// Register a new pending request bound to an endpoint.
    pub fn register(
        &self,
        sequence: u64,
        endpoint: &str,
    ) -> oneshot::Receiver<Result<ResponseFrame>> {
        self.with(|state| state.registry.register(sequence, endpoint))
    }

    /// Update a pending request's state. Returns false if it is gone.
    pub fn mark(&self, sequence: u64, request_state: RequestState) -> bool {
        self.with(|state| state.registry.mark(sequence, request_state))
    }

    /// Resolve a request with the body assembled in the arena, then
    /// release its span.
    pub fn resolve_from_arena(&self, sequence: u64, status: u8) {
        self.with(|state| {
            let body = state
                .arena
                .read(sequence)
                .map(Bytes::copy_from_slice)
                .unwrap_or_default();
            state.arena.release(sequence);
            state.registry.resolve(sequence, ResponseFrame { status, body });
        });
    }

    /// Fail a request and release any arena span it holds.
    pub fn fail(&self, sequence: u64, error: DubboError) {
        self.with(|state| {
            state.arena.release(sequence);
            state.registry.fail(sequence, error);
        });
    }

    /// Fail the in-flight requests (`Sending` or `Receiving`) of one
    /// connection, releasing their spans. Requests on other connections
    /// are untouched.
    pub fn fail_in_flight(&self, endpoint: &str, reason: &str) -> usize {
        self.with(|state| {
            let sequences = state.registry.remove_matching(
                |entry| {
                    entry.endpoint == endpoint
                        && matches!(entry.state, RequestState::Sending | RequestState::Receiving)
                },
                || DubboError::Transport(reason.to_string()),
            );
            for sequence in &sequences {
                state.arena.release(*sequence);
            }
            sequences.len()
        })
    }

    /// Fail every pending request of one endpoint, whatever its state.
    /// Used when a connection exhausts its retry budget and is evicted.
    pub fn fail_endpoint(&self, endpoint: &str, reason: &str) -> usize {
        self.with(|state| {
            let sequences = state.registry.remove_matching(
                |entry| entry.endpoint == endpoint,
                || DubboError::Transport(reason.to_string()),
            );
            for sequence in &sequences {
                state.arena.release(*sequence);
            }
            sequences.len()
        })
    }

    /// Number of pending requests (diagnostic).
    pub fn pending_requests(&self) -> usize {
        self.with(|state| state.registry.len())
    }

    /// Bytes currently reserved in the arena (diagnostic).
    pub fn arena_usage(&self) -> usize {
        self.with(|state| state.arena.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_counter_is_monotonic() {
        let shared = Shared::new(64);
        let a = shared.next_sequence();
        let b = shared.next_sequence();
        let c = shared.next_sequence();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_resolve_fires_sink_once() {
        let mut registry = RequestRegistry::new();
        let rx = registry.register(7, "10.0.0.1:20880");

        registry.resolve(
            7,
            ResponseFrame {
                status: 20,
                body: Bytes::from_static(b"PING"),
            },
        );
        // Duplicate delivery after removal is a no-op.
        registry.resolve(
            7,
            ResponseFrame {
                status: 20,
                body: Bytes::from_static(b"DUP"),
            },
        );

        let frame = rx.await.unwrap().unwrap();
        assert_eq!(frame.body, Bytes::from_static(b"PING"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_fail_after_resolve_is_noop() {
        let mut registry = RequestRegistry::new();
        let rx = registry.register(1, "a:1");
        registry.resolve(
            1,
            ResponseFrame {
                status: 20,
                body: Bytes::new(),
            },
        );
        registry.fail(1, DubboError::ConnectionClosed);
        assert!(rx.await.unwrap().is_ok());
    }

    #[test]
    fn test_mark_missing_entry_returns_false() {
        let mut registry = RequestRegistry::new();
        assert!(!registry.mark(42, RequestState::Sending));
    }

    #[tokio::test]
    async fn test_fail_in_flight_is_scoped_to_endpoint() {
        let shared = Shared::new(256);

        let rx_a = shared.register(1, "a:20880");
        let rx_b = shared.register(2, "b:20880");
        shared.mark(1, RequestState::Receiving);
        shared.mark(2, RequestState::Receiving);
        shared.with(|state| {
            state.arena.alloc(1, 8).unwrap();
            state.arena.alloc(2, 8).unwrap();
        });

        let failed = shared.fail_in_flight("a:20880", "connect error");
        assert_eq!(failed, 1);

        // A failed with a transport error and its span was released.
        let err = rx_a.await.unwrap().unwrap_err();
        assert!(matches!(err, DubboError::Transport(_)));
        assert_eq!(shared.arena_usage(), 8);

        // B is untouched and still resolvable.
        shared.with(|state| state.arena.write(2, b"8 bytes!").unwrap());
        shared.resolve_from_arena(2, 20);
        let frame = rx_b.await.unwrap().unwrap();
        assert_eq!(frame.body, Bytes::from_static(b"8 bytes!"));
        assert_eq!(shared.arena_usage(), 0);
    }

    #[tokio::test]
    async fn test_fail_in_flight_skips_waiting_requests() {
        let shared = Shared::new(64);
        let rx = shared.register(5, "a:1");
        // Still Waiting: not yet handed to the socket, so a transport
        // error must not kill it.
        assert_eq!(shared.fail_in_flight("a:1", "boom"), 0);
        shared.mark(5, RequestState::Sending);
        assert_eq!(shared.fail_in_flight("a:1", "boom"), 1);
        assert!(rx.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_fail_endpoint_sweeps_all_states() {
        let shared = Shared::new(64);
        let rx1 = shared.register(1, "a:1");
        let rx2 = shared.register(2, "a:1");
        shared.mark(2, RequestState::Queued);
        assert_eq!(shared.fail_endpoint("a:1", "evicted"), 2);
        assert!(rx1.await.unwrap().is_err());
        assert!(rx2.await.unwrap().is_err());
        assert_eq!(shared.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_fail_releases_span() {
        let shared = Shared::new(64);
        let rx = shared.register(9, "a:1");
        shared.with(|state| state.arena.alloc(9, 32).unwrap());
        assert_eq!(shared.arena_usage(), 32);

        shared.fail(9, DubboError::Timeout(std::time::Duration::from_secs(1)));
        assert_eq!(shared.arena_usage(), 0);
        assert!(matches!(rx.await.unwrap().unwrap_err(), DubboError::Timeout(_)));
    }
}
