//! Idle-session reaper.
//!
//! One background task per registry. It wakes every sweep interval, evicts
//! sessions idle past the timeout, and exits once the registry is empty.
//! The next [`SessionRegistry::get_or_create`] starts it again.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::SessionRegistry;
use crate::connection::Connectable;

/// Default time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default idle time after which a session is evicted.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Scheduler for a registry's periodic idle sweep.
#[derive(Debug)]
pub struct ExpiryReaper {
    task: Mutex<Option<JoinHandle<()>>>,
    interval: Duration,
}

impl ExpiryReaper {
    pub(super) fn new(interval: Duration) -> Self {
        Self {
            task: Mutex::new(None),
            interval,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the sweep task is scheduled.
    pub fn is_running(&self) -> bool {
        self.slot().as_ref().is_some_and(|task| !task.is_finished())
    }

    /// The time between sweeps.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the sweep task unless it is already running.
    pub(super) fn ensure_running<C: Connectable>(&self, registry: &Arc<SessionRegistry<C>>) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime, idle sessions will not be swept");
            return;
        };

        debug!(interval_secs = self.interval.as_secs(), "starting expiry reaper");
        *slot = Some(runtime.spawn(run(Arc::downgrade(registry), self.interval)));
    }

    /// Stop the sweep task.
    pub fn stop(&self) {
        if let Some(task) = self.slot().take() {
            task.abort();
            debug!("expiry reaper stopped");
        }
    }

    /// Clear the task slot if `registry` is empty. Returns whether the
    /// caller should exit.
    ///
    /// Runs under the slot lock so that a concurrent `get_or_create` either
    /// sees the slot cleared and restarts the task, or inserted before the
    /// emptiness check and keeps this one alive.
    fn retire_if_empty<C: Connectable>(&self, registry: &SessionRegistry<C>) -> bool {
        let mut slot = self.slot();
        if !registry.is_empty() {
            return false;
        }
        slot.take();
        true
    }
}

impl Drop for ExpiryReaper {
    fn drop(&mut self) {
        if let Some(task) = self.slot().take() {
            task.abort();
        }
    }
}

async fn run<C: Connectable>(registry: Weak<SessionRegistry<C>>, interval: Duration) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(registry) = registry.upgrade() else {
            return;
        };

        let evicted = registry.sweep_expired().await;
        if evicted > 0 {
            debug!(evicted, remaining = registry.len(), "idle sweep finished");
        }

        if registry.reaper.retire_if_empty(&registry) {
            debug!("registry empty, expiry reaper stopped");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{RegistryConfig, SessionId};
    use crate::testing::{MockConnection, MockFactory};

    fn registry(idle: u64, sweep: u64) -> Arc<SessionRegistry<MockConnection>> {
        Arc::new(SessionRegistry::with_config(RegistryConfig {
            idle_timeout: Duration::from_secs(idle),
            sweep_interval: Duration::from_secs(sweep),
            ..RegistryConfig::default()
        }))
    }

    #[test]
    fn test_defaults() {
        assert_eq!(DEFAULT_SWEEP_INTERVAL, Duration::from_secs(300));
        assert_eq!(DEFAULT_IDLE_TIMEOUT, Duration::from_secs(1800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_evicts_and_stops() {
        let registry = registry(30 * 60, 5 * 60);
        let mock = MockFactory::new();

        let handle = registry.get_or_create(&SessionId::new("sess_idle"));
        let conn = handle.connect(mock.factory()).await.unwrap();
        assert!(registry.is_reaper_running());

        // Idle for 30 min is not yet expired; the 35 min sweep evicts.
        time::sleep(Duration::from_secs(36 * 60)).await;

        assert_eq!(registry.stats().total_sessions, 0);
        assert!(!conn.is_open());
        assert_eq!(mock.closes(), 1);
        assert!(!registry.is_reaper_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_prevents_eviction() {
        let registry = registry(60, 10);
        let mock = MockFactory::new();
        let id = SessionId::new("sess_busy");

        let handle = registry.get_or_create(&id);
        handle.connect(mock.factory()).await.unwrap();

        for _ in 0..12 {
            time::sleep(Duration::from_secs(30)).await;
            assert!(handle.get_unvalidated().is_some());
        }

        assert!(registry.contains(id.as_str()));
        assert_eq!(mock.closes(), 0);
        assert!(registry.is_reaper_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_restarts_after_draining() {
        let registry = registry(60, 10);

        registry.get_or_create(&SessionId::new("first"));
        time::sleep(Duration::from_secs(75)).await;
        assert!(registry.is_empty());
        assert!(!registry.is_reaper_running());

        registry.get_or_create(&SessionId::new("second"));
        assert!(registry.is_reaper_running());

        time::sleep(Duration::from_secs(75)).await;
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_ends_when_registry_dropped() {
        let registry = registry(60, 10);
        registry.get_or_create(&SessionId::new("orphan"));
        drop(registry);
        // Nothing left to sweep; the task must not panic or spin.
        time::sleep(Duration::from_secs(30)).await;
    }
}
