//! Bulk teardown of a registry.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::SessionRegistry;
use crate::connection::Connectable;

/// Result of [`ShutdownCoordinator::cleanup_all`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// Number of sessions that were registered.
    pub sessions: usize,
    /// Cleanup tasks that panicked or were cancelled.
    pub failures: Vec<String>,
}

impl ShutdownReport {
    /// Whether every cleanup ran to completion.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Cleans up every session in a registry, for process teardown.
pub struct ShutdownCoordinator<C: Connectable> {
    registry: Arc<SessionRegistry<C>>,
}

impl<C: Connectable> ShutdownCoordinator<C> {
    /// Create a coordinator for `registry`.
    pub fn new(registry: Arc<SessionRegistry<C>>) -> Self {
        Self { registry }
    }

    /// Stop the reaper, empty the registry, and clean up every session
    /// concurrently.
    ///
    /// Never fails: individual problems are logged and collected in the
    /// report. Sessions in the middle of connecting are handled by
    /// [`SessionHandle::cleanup`](super::SessionHandle::cleanup), which lets
    /// the pending attempt close what it builds.
    pub async fn cleanup_all(&self) -> ShutdownReport {
        self.registry.reaper.stop();

        let sessions = self.registry.drain();
        let mut report = ShutdownReport {
            sessions: sessions.len(),
            failures: Vec::new(),
        };

        let mut tasks = JoinSet::new();
        for (id, handle) in sessions {
            tasks.spawn(async move {
                handle.cleanup().await;
                id
            });
        }

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(id) => debug!(session = %id, "session cleaned up"),
                Err(e) => {
                    warn!(error = %e, "session cleanup task failed");
                    report.failures.push(e.to_string());
                }
            }
        }

        info!(
            sessions = report.sessions,
            failures = report.failures.len(),
            "all sessions cleaned up"
        );
        report
    }
}
