//! Test doubles for pooled connections.
//!
//! [`MockFactory`] hands out factories producing [`MockConnection`]s and
//! counts what happened to them, so tests can assert how many connections
//! were built, handshaken and closed without spawning real servers.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use session_pool::testing::{MockConnection, MockFactory};
//! use session_pool::{SessionId, SessionRegistry};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry: Arc<SessionRegistry<MockConnection>> = Arc::new(SessionRegistry::new());
//! let mock = MockFactory::new();
//!
//! let handle = registry.get_or_create(&SessionId::new("demo"));
//! let conn = handle.connect(mock.factory()).await.unwrap();
//! assert!(conn.is_open());
//! assert_eq!(mock.constructed(), 1);
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};

use crate::connection::{Connectable, ConnectionResult, TransportErrorObserver};
use crate::error::ConnectionError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Counters {
    constructed: AtomicUsize,
    handshakes: AtomicUsize,
    probes: AtomicUsize,
    closes: AtomicUsize,
}

#[derive(Debug, Default)]
struct Behavior {
    connect_delay: Duration,
    close_delay: Duration,
    construction_failure: Option<String>,
    handshake_failure: Option<String>,
    transport_failure_on_connect: bool,
    close_failure: bool,
}

/// Shared configuration and counters for mock connections.
#[derive(Debug, Clone, Default)]
pub struct MockFactory {
    counters: Arc<Counters>,
    behavior: Arc<Mutex<Behavior>>,
}

impl MockFactory {
    /// Create a factory whose connections always succeed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every handshake take `delay`.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        lock(&self.behavior).connect_delay = delay;
        self
    }

    /// Make every close take `delay`.
    pub fn with_close_delay(self, delay: Duration) -> Self {
        lock(&self.behavior).close_delay = delay;
        self
    }

    /// Make construction fail with [`ConnectionError::Spawn`].
    pub fn fail_construction(&self, reason: &str) {
        lock(&self.behavior).construction_failure = Some(reason.to_string());
    }

    /// Make handshakes fail with [`ConnectionError::Handshake`].
    pub fn fail_handshake(&self, reason: &str) {
        lock(&self.behavior).handshake_failure = Some(reason.to_string());
    }

    /// Make the transport die during the handshake, which still reports
    /// success.
    pub fn fail_transport_on_connect(&self, fail: bool) {
        lock(&self.behavior).transport_failure_on_connect = fail;
    }

    /// Make `close` report an error (the connection still ends up closed).
    pub fn fail_close(&self, fail: bool) {
        lock(&self.behavior).close_failure = fail;
    }

    /// Clear injected construction and handshake failures.
    pub fn succeed(&self) {
        let mut behavior = lock(&self.behavior);
        behavior.construction_failure = None;
        behavior.handshake_failure = None;
    }

    /// A one-shot factory suitable for [`SessionHandle::connect`](crate::SessionHandle::connect).
    pub fn factory(
        &self,
    ) -> impl FnOnce() -> BoxFuture<'static, ConnectionResult<MockConnection>> + Send + 'static
    {
        let counters = Arc::clone(&self.counters);
        let behavior = Arc::clone(&self.behavior);
        move || {
            async move {
                let serial = counters.constructed.fetch_add(1, Ordering::SeqCst);
                if let Some(reason) = lock(&behavior).construction_failure.clone() {
                    return Err(ConnectionError::Spawn(reason));
                }
                Ok(MockConnection {
                    serial,
                    counters,
                    behavior,
                    open: AtomicBool::new(false),
                    probe_failure: AtomicBool::new(false),
                    observer: Mutex::new(None),
                })
            }
            .boxed()
        }
    }

    /// Number of connections the factory built (including failed builds).
    pub fn constructed(&self) -> usize {
        self.counters.constructed.load(Ordering::SeqCst)
    }

    /// Number of handshakes attempted.
    pub fn handshakes(&self) -> usize {
        self.counters.handshakes.load(Ordering::SeqCst)
    }

    /// Number of liveness probes run.
    pub fn probes(&self) -> usize {
        self.counters.probes.load(Ordering::SeqCst)
    }

    /// Number of `close` calls.
    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }
}

/// In-memory connection produced by [`MockFactory`].
#[derive(Debug)]
pub struct MockConnection {
    serial: usize,
    counters: Arc<Counters>,
    behavior: Arc<Mutex<Behavior>>,
    open: AtomicBool,
    probe_failure: AtomicBool,
    observer: Mutex<Option<TransportErrorObserver>>,
}

impl MockConnection {
    /// Zero-based construction order within its factory.
    pub fn serial(&self) -> usize {
        self.serial
    }

    /// Whether the handshake completed and `close` has not run.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Make subsequent probes fail.
    pub fn set_probe_failure(&self, fail: bool) {
        self.probe_failure.store(fail, Ordering::SeqCst);
    }

    /// Simulate the transport dying underneath the connection.
    pub fn trigger_transport_error(&self) {
        self.open.store(false, Ordering::SeqCst);
        let observer = lock(&self.observer).clone();
        if let Some(observer) = observer {
            observer.notify(ConnectionError::Exited("mock transport died".into()));
        }
    }
}

#[async_trait]
impl Connectable for MockConnection {
    async fn connect(&self) -> ConnectionResult<()> {
        self.counters.handshakes.fetch_add(1, Ordering::SeqCst);
        let (delay, failure, dies) = {
            let behavior = lock(&self.behavior);
            (
                behavior.connect_delay,
                behavior.handshake_failure.clone(),
                behavior.transport_failure_on_connect,
            )
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = failure {
            return Err(ConnectionError::Handshake(reason));
        }
        self.open.store(true, Ordering::SeqCst);
        if dies {
            self.trigger_transport_error();
        }
        Ok(())
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        let (delay, fails) = {
            let behavior = lock(&self.behavior);
            (behavior.close_delay, behavior.close_failure)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fails {
            return Err(ConnectionError::Other("mock close failed".into()));
        }
        Ok(())
    }

    async fn probe(&self) -> ConnectionResult<()> {
        self.counters.probes.fetch_add(1, Ordering::SeqCst);
        if !self.is_open() || self.probe_failure.load(Ordering::SeqCst) {
            return Err(ConnectionError::Probe("mock connection is dead".into()));
        }
        Ok(())
    }

    fn on_transport_error(&self, observer: TransportErrorObserver) {
        *lock(&self.observer) = Some(observer);
    }
}
