//! Session management module.
//!
//! This module provides session identity derivation, the per-session
//! connection state machine, the registry that pools handles, idle eviction,
//! and bulk shutdown.

mod handle;
mod id;
mod reaper;
mod registry;
mod shutdown;
mod state;

pub use handle::{SessionHandle, DEFAULT_CLOSE_TIMEOUT};
pub use id::{derive_session_id, SessionId, SESSION_ID_PREFIX};
pub use reaper::{ExpiryReaper, DEFAULT_IDLE_TIMEOUT, DEFAULT_SWEEP_INTERVAL};
pub use registry::{RegistryConfig, RegistryStats, SessionRegistry, SessionStats};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
pub use state::SessionState;
