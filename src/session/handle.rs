//! Per-session connection state machine.
//!
//! A [`SessionHandle`] owns at most one live connection. Connect attempts run
//! on their own task and are published as a shared future, so every caller
//! that arrives while an attempt is pending awaits the same outcome instead of
//! starting another one.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{SessionId, SessionState};
use crate::connection::{Connectable, ConnectionResult, TransportErrorObserver};
use crate::error::{ConnectionError, SessionError};
use crate::Result;

/// Default time allowed for closing a connection.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type AttemptOutput<C> = std::result::Result<Arc<C>, SessionError>;
type InFlight<C> = Shared<BoxFuture<'static, AttemptOutput<C>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A connection that has been built but not yet installed.
struct Pending<C> {
    resource: Weak<C>,
    /// First transport error reported before the attempt finished.
    failure: Option<ConnectionError>,
}

struct Inner<C> {
    state: SessionState,
    resource: Option<Arc<C>>,
    in_flight: Option<InFlight<C>>,
    pending: Option<Pending<C>>,
    /// Bumped by `cleanup` while an attempt is pending; the attempt compares
    /// it on completion to learn it was superseded.
    epoch: u64,
}

impl<C> Inner<C> {
    fn transition(&mut self, id: &SessionId, target: SessionState) {
        let from = self.state;
        if self.state.transition_to(target) {
            debug!(session = %id, %from, to = %target, "session state changed");
        }
    }

    fn connected_resource(&self) -> Option<Arc<C>> {
        if self.state.holds_resource() {
            self.resource.clone()
        } else {
            None
        }
    }

    /// Remove `stale` if it is still the installed resource.
    fn take_if_current(&mut self, id: &SessionId, stale: *const C) -> Option<Arc<C>> {
        let current = self.resource.as_ref().map(Arc::as_ptr)?;
        if !std::ptr::eq(current, stale) {
            return None;
        }
        let resource = self.resource.take();
        self.transition(id, SessionState::Disconnected);
        resource
    }

    /// Record a transport error against the connection being handshaken.
    /// Returns false if `target` is not that connection.
    fn fail_pending(&mut self, target: &Weak<C>, error: ConnectionError) -> bool {
        match &mut self.pending {
            Some(pending) if Weak::ptr_eq(&pending.resource, target) => {
                pending.failure.get_or_insert(error);
                true
            }
            _ => false,
        }
    }
}

enum Attempt<C> {
    Ready(Arc<C>),
    Pending(InFlight<C>),
}

enum Outcome<C> {
    Installed(Arc<C>),
    Superseded(Arc<C>),
    /// Built and handshaken, but its transport died before installation.
    Died(Arc<C>, ConnectionError),
    Failed(ConnectionError),
}

/// Handle to one pooled session.
pub struct SessionHandle<C: Connectable> {
    id: SessionId,
    created_at: Instant,
    last_used: Mutex<Instant>,
    inner: Mutex<Inner<C>>,
    close_timeout: Duration,
}

impl<C: Connectable> SessionHandle<C> {
    /// Create a disconnected handle.
    pub fn new(id: SessionId) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used: Mutex::new(now),
            inner: Mutex::new(Inner {
                state: SessionState::Disconnected,
                resource: None,
                in_flight: None,
                pending: None,
                epoch: 0,
            }),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    /// Set how long a close may take before it is abandoned.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// The session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    /// Whether a live connection is cached.
    pub fn is_connected(&self) -> bool {
        let inner = lock(&self.inner);
        inner.state == SessionState::Connected && inner.resource.is_some()
    }

    /// Whether a connect attempt is in flight.
    pub fn is_connecting(&self) -> bool {
        lock(&self.inner).in_flight.is_some()
    }

    /// Time of the last successful access.
    pub fn last_used(&self) -> Instant {
        *lock(&self.last_used)
    }

    /// Time since the last successful access.
    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_used())
    }

    /// Time since the handle was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Record an access. Never moves `last_used` backwards.
    pub(crate) fn touch(&self) {
        let now = Instant::now();
        let mut last = lock(&self.last_used);
        if now > *last {
            *last = now;
        }
    }

    /// Return a live connection, connecting with `factory` if needed.
    ///
    /// A cached connection is probed first; if the probe fails it is closed
    /// and a fresh connection is built within this same call. Concurrent
    /// callers share a single attempt and all observe its result.
    pub async fn connect<F, Fut>(self: &Arc<Self>, factory: F) -> Result<Arc<C>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ConnectionResult<C>> + Send + 'static,
    {
        if let Some(resource) = self.cached() {
            match resource.probe().await {
                Ok(()) => {
                    self.touch();
                    return Ok(resource);
                }
                Err(source) => self.invalidate(&resource, source).await,
            }
        }

        let resource = match self.begin_or_join(factory) {
            Attempt::Ready(resource) => resource,
            Attempt::Pending(attempt) => {
                let resource = attempt.await?;
                // Cleanup or a transport error may have removed it since.
                let current = self.cached();
                if !current.is_some_and(|current| Arc::ptr_eq(&current, &resource)) {
                    debug!(session = %self.id, "connection lost before the attempt was observed");
                    return Err(SessionError::ConnectionEstablish {
                        id: self.id.clone(),
                        source: ConnectionError::Closed,
                    });
                }
                resource
            }
        };
        self.touch();
        Ok(resource)
    }

    /// Return the cached connection after a liveness probe, without
    /// reconnecting. A failed probe disconnects the handle.
    pub async fn get_validated(&self) -> Option<Arc<C>> {
        let resource = self.cached()?;
        match resource.probe().await {
            Ok(()) => {
                self.touch();
                Some(resource)
            }
            Err(source) => {
                self.invalidate(&resource, source).await;
                None
            }
        }
    }

    /// Return the cached connection without probing it.
    pub fn get_unvalidated(&self) -> Option<Arc<C>> {
        let resource = self.cached();
        if resource.is_some() {
            self.touch();
        }
        resource
    }

    /// Close and forget the connection.
    ///
    /// Idempotent. Close failures are logged, never returned. A pending
    /// connect attempt is marked superseded: it closes whatever it built
    /// instead of installing it, and its waiters get
    /// [`SessionError::CleanedUp`].
    pub async fn cleanup(&self) {
        let resource = {
            let mut inner = lock(&self.inner);
            if inner.in_flight.is_some() {
                inner.epoch += 1;
            }
            let resource = inner.resource.take();
            inner.transition(&self.id, SessionState::Disconnected);
            resource
        };

        if let Some(resource) = resource {
            Self::close_quietly(&self.id, resource, self.close_timeout).await;
        }
    }

    fn cached(&self) -> Option<Arc<C>> {
        lock(&self.inner).connected_resource()
    }

    async fn invalidate(&self, stale: &Arc<C>, source: ConnectionError) {
        let removed = lock(&self.inner).take_if_current(&self.id, Arc::as_ptr(stale));
        if let Some(resource) = removed {
            let err = SessionError::ValidationFailed {
                id: self.id.clone(),
                source,
            };
            warn!("{err}");
            Self::close_quietly(&self.id, resource, self.close_timeout).await;
        }
    }

    fn begin_or_join<F, Fut>(self: &Arc<Self>, factory: F) -> Attempt<C>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ConnectionResult<C>> + Send + 'static,
    {
        let mut inner = lock(&self.inner);

        if let Some(attempt) = &inner.in_flight {
            debug!(session = %self.id, "joining in-flight connect");
            return Attempt::Pending(attempt.clone());
        }
        // Another caller reconnected between our probe and now.
        if let Some(resource) = inner.connected_resource() {
            return Attempt::Ready(resource);
        }

        let previous = inner.resource.take();
        inner.transition(&self.id, SessionState::Connecting);
        let epoch = inner.epoch;

        let task = tokio::spawn(Arc::clone(self).run_attempt(epoch, previous, factory));
        let id = self.id.clone();
        let handle = Arc::downgrade(self);
        let attempt = async move {
            match task.await {
                Ok(output) => output,
                Err(e) => {
                    if let Some(handle) = handle.upgrade() {
                        handle.abandon_attempt();
                    }
                    Err(SessionError::AttemptAborted {
                        id,
                        reason: e.to_string(),
                    })
                }
            }
        }
        .boxed()
        .shared();

        inner.in_flight = Some(attempt.clone());
        Attempt::Pending(attempt)
    }

    async fn run_attempt<F, Fut>(
        self: Arc<Self>,
        epoch: u64,
        previous: Option<Arc<C>>,
        factory: F,
    ) -> AttemptOutput<C>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ConnectionResult<C>> + Send + 'static,
    {
        if let Some(previous) = previous {
            Self::close_quietly(&self.id, previous, self.close_timeout).await;
        }

        let result = self.establish(factory).await;
        match self.record_outcome(epoch, result) {
            Outcome::Installed(resource) => {
                info!(session = %self.id, "session connected");
                Ok(resource)
            }
            Outcome::Superseded(resource) => {
                debug!(session = %self.id, "discarding connection built for a cleaned-up session");
                Self::close_quietly(&self.id, resource, self.close_timeout).await;
                Err(SessionError::CleanedUp(self.id.clone()))
            }
            Outcome::Died(resource, source) => {
                Self::close_quietly(&self.id, resource, self.close_timeout).await;
                let err = SessionError::ConnectionEstablish {
                    id: self.id.clone(),
                    source,
                };
                warn!("{err}");
                Err(err)
            }
            Outcome::Failed(source) => {
                let err = SessionError::ConnectionEstablish {
                    id: self.id.clone(),
                    source,
                };
                warn!("{err}");
                Err(err)
            }
        }
    }

    async fn establish<F, Fut>(self: &Arc<Self>, factory: F) -> ConnectionResult<Arc<C>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ConnectionResult<C>>,
    {
        let resource = Arc::new(factory().await?);
        lock(&self.inner).pending = Some(Pending {
            resource: Arc::downgrade(&resource),
            failure: None,
        });
        resource.on_transport_error(self.transport_observer(&resource));

        if let Err(e) = resource.connect().await {
            Self::close_quietly(&self.id, resource, self.close_timeout).await;
            return Err(e);
        }
        Ok(resource)
    }

    fn record_outcome(&self, epoch: u64, result: ConnectionResult<Arc<C>>) -> Outcome<C> {
        let outcome = {
            let mut inner = lock(&self.inner);
            inner.in_flight = None;
            let failure = inner.pending.take().and_then(|pending| pending.failure);
            match (result, failure) {
                (Ok(resource), _) if inner.epoch != epoch => Outcome::Superseded(resource),
                (Ok(resource), Some(error)) => {
                    inner.resource = None;
                    inner.transition(&self.id, SessionState::Failed);
                    inner.transition(&self.id, SessionState::Disconnected);
                    Outcome::Died(resource, error)
                }
                (Ok(resource), None) => {
                    inner.resource = Some(Arc::clone(&resource));
                    inner.transition(&self.id, SessionState::Connected);
                    Outcome::Installed(resource)
                }
                (Err(source), _) => {
                    inner.resource = None;
                    inner.transition(&self.id, SessionState::Failed);
                    inner.transition(&self.id, SessionState::Disconnected);
                    Outcome::Failed(source)
                }
            }
        };
        if matches!(outcome, Outcome::Installed(_)) {
            self.touch();
        }
        outcome
    }

    fn abandon_attempt(&self) {
        let mut inner = lock(&self.inner);
        inner.in_flight = None;
        inner.pending = None;
        if inner.state == SessionState::Connecting {
            inner.transition(&self.id, SessionState::Failed);
            inner.transition(&self.id, SessionState::Disconnected);
        }
    }

    fn transport_observer(self: &Arc<Self>, resource: &Arc<C>) -> TransportErrorObserver {
        let handle = Arc::downgrade(self);
        let target = Arc::downgrade(resource);
        TransportErrorObserver::new(move |error| {
            if let Some(handle) = handle.upgrade() {
                handle.on_transport_failure(&target, error);
            }
        })
    }

    fn on_transport_failure(&self, target: &Weak<C>, error: ConnectionError) {
        let removed = {
            let mut inner = lock(&self.inner);
            let removed = inner.take_if_current(&self.id, target.as_ptr());
            if removed.is_none() && inner.fail_pending(target, error.clone()) {
                debug!(session = %self.id, error = %error, "transport failed during connect");
                return;
            }
            removed
        };
        let Some(resource) = removed else {
            return;
        };
        warn!(session = %self.id, error = %error, "transport failed, session disconnected");

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let id = self.id.clone();
                let timeout = self.close_timeout;
                runtime.spawn(async move {
                    Self::close_quietly(&id, resource, timeout).await;
                });
            }
            Err(_) => debug!(session = %self.id, "no runtime to close dead connection"),
        }
    }

    async fn close_quietly(id: &SessionId, resource: Arc<C>, timeout: Duration) {
        let source = match tokio::time::timeout(timeout, resource.close()).await {
            Ok(Ok(())) => {
                debug!(session = %id, "connection closed");
                return;
            }
            Ok(Err(e)) => e,
            Err(_) => ConnectionError::Timeout,
        };
        let err = SessionError::Cleanup {
            id: id.clone(),
            source,
        };
        warn!("{err}");
    }
}

impl<C: Connectable> fmt::Debug for SessionHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("idle_for", &self.idle_for())
            .finish_non_exhaustive()
    }
}
