//! Capability interface for pooled connections.
//!
//! The session layer never talks a wire protocol itself. Anything that can
//! be connected, probed for liveness, closed, and that can report transport
//! failures asynchronously can be pooled by implementing [`Connectable`].

pub mod process;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

pub use crate::error::ConnectionError;
pub use process::{ProcessConfig, ProcessConnection, TransportConfig};

/// Result type returned by [`Connectable`] operations.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Callback a connection invokes when its transport fails on its own,
/// outside of any caller-driven operation.
#[derive(Clone)]
pub struct TransportErrorObserver {
    callback: Arc<dyn Fn(ConnectionError) + Send + Sync>,
}

impl TransportErrorObserver {
    /// Wrap a callback.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(ConnectionError) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Report a transport-level failure.
    pub fn notify(&self, error: ConnectionError) {
        (self.callback)(error)
    }
}

impl fmt::Debug for TransportErrorObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportErrorObserver").finish_non_exhaustive()
    }
}

/// A connection that can be pooled by a [`SessionHandle`](crate::SessionHandle).
#[async_trait]
pub trait Connectable: Send + Sync + 'static {
    /// Perform the connect handshake.
    async fn connect(&self) -> ConnectionResult<()>;

    /// Close the connection. Callers treat failures as best-effort.
    async fn close(&self) -> ConnectionResult<()>;

    /// Cheap liveness check. Must fail on a dead connection.
    async fn probe(&self) -> ConnectionResult<()>;

    /// Install the observer to call on asynchronous transport failure.
    ///
    /// Called once, before [`connect`](Connectable::connect). Implementations
    /// replace any previously installed observer.
    fn on_transport_error(&self, observer: TransportErrorObserver);
}
