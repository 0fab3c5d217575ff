//! # session-pool
//!
//! Pooled session manager for persistent, expensive-to-establish connections.
//!
//! Connections are cached per session, keyed by an ID derived from the
//! connection configuration. Concurrent requests for the same session share a
//! single connect attempt, idle sessions are evicted by a background sweep,
//! and the whole pool can be torn down in one call.
//!
//! ## Features
//!
//! - **Stable identities**: the same configuration maps to the same session
//! - **Connect deduplication**: one factory call and one handshake per attempt
//! - **Validation**: cached connections are probed before reuse
//! - **Idle eviction**: registry-owned reaper with a configurable timeout
//! - **Pluggable transports**: anything implementing [`Connectable`]
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use session_pool::{
//!     ProcessConfig, ProcessConnection, SessionId, SessionRegistry, TransportConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> session_pool::Result<()> {
//!     session_pool::logging::try_init().ok();
//!
//!     let registry: Arc<SessionRegistry<ProcessConnection>> =
//!         Arc::new(SessionRegistry::new());
//!
//!     let config = TransportConfig::Stdio(ProcessConfig::new("server").arg("--flag"));
//!     let id = SessionId::derive(&config, None)?;
//!
//!     let handle = registry.get_or_create(&id);
//!     let conn = handle
//!         .connect(move || async move { Ok(ProcessConnection::from_transport(config)) })
//!         .await?;
//!     println!("session {} connected, pid {:?}", id, conn.pid());
//!
//!     registry.cleanup_all().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod session;
pub mod testing;

// Re-export commonly used types
pub use connection::{
    Connectable, ConnectionResult, ProcessConfig, ProcessConnection, TransportConfig,
    TransportErrorObserver,
};
pub use error::{ConnectionError, Result, SessionError};
pub use session::{
    derive_session_id, RegistryConfig, RegistryStats, SessionHandle, SessionId, SessionRegistry,
    SessionState, SessionStats, ShutdownCoordinator, ShutdownReport,
};
