//! Session registry and statistics.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::handle::DEFAULT_CLOSE_TIMEOUT;
use super::reaper::{ExpiryReaper, DEFAULT_IDLE_TIMEOUT, DEFAULT_SWEEP_INTERVAL};
use super::shutdown::{ShutdownCoordinator, ShutdownReport};
use super::{SessionHandle, SessionId, SessionState};
use crate::connection::Connectable;

/// Timing knobs for a [`SessionRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Sessions unused for longer than this are evicted.
    pub idle_timeout: Duration,
    /// How often the reaper looks for idle sessions.
    pub sweep_interval: Duration,
    /// Time allowed for closing one connection.
    pub close_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

/// Per-session entry in [`RegistryStats`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub id: SessionId,
    pub state: SessionState,
    pub connected: bool,
    #[serde(skip)]
    pub last_used: Instant,
    /// Time since the last successful access.
    pub idle: Duration,
    /// Time since the session was created.
    pub age: Duration,
}

/// Snapshot of a registry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub total_sessions: usize,
    pub connected_sessions: usize,
    pub per_session: Vec<SessionStats>,
}

/// Keyed store of session handles.
///
/// Handles are created lazily by [`get_or_create`](Self::get_or_create) and
/// leave the registry only through idle eviction, [`remove`](Self::remove),
/// or [`cleanup_all`](Self::cleanup_all).
pub struct SessionRegistry<C: Connectable> {
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle<C>>>>,
    config: RegistryConfig,
    pub(super) reaper: ExpiryReaper,
}

impl<C: Connectable> SessionRegistry<C> {
    /// Create an empty registry with default timings.
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create an empty registry with the given timings.
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            reaper: ExpiryReaper::new(config.sweep_interval),
            config,
        }
    }

    /// The registry timings.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionId, Arc<SessionHandle<C>>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, Arc<SessionHandle<C>>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the handle for `id`, creating a disconnected one if absent.
    ///
    /// Counts as an access, and restarts the idle reaper if it stopped.
    pub fn get_or_create(self: &Arc<Self>, id: &SessionId) -> Arc<SessionHandle<C>> {
        let handle = {
            let mut sessions = self.write();
            let handle = sessions
                .entry(id.clone())
                .or_insert_with(|| {
                    info!(session = %id, "session created");
                    Arc::new(
                        SessionHandle::new(id.clone())
                            .with_close_timeout(self.config.close_timeout),
                    )
                })
                .clone();
            // Touch under the write lock so a concurrent sweep cannot evict it
            // between lookup and return.
            handle.touch();
            handle
        };

        self.reaper.ensure_running(self);
        handle
    }

    /// Look up a handle without counting it as an access.
    pub fn get(&self, id: &str) -> Option<Arc<SessionHandle<C>>> {
        self.read().get(id).cloned()
    }

    /// Check if a session exists.
    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    /// Unregister a session. The handle is returned as-is; closing it is up
    /// to the caller.
    pub fn remove(&self, id: &str) -> Option<Arc<SessionHandle<C>>> {
        let removed = self.write().remove(id);
        if removed.is_some() {
            debug!(session = %id, "session removed");
        }
        removed
    }

    /// Snapshot of every registered session.
    pub fn all(&self) -> Vec<(SessionId, Arc<SessionHandle<C>>)> {
        self.read()
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Whether the idle reaper task is currently scheduled.
    pub fn is_reaper_running(&self) -> bool {
        self.reaper.is_running()
    }

    /// Current registry statistics.
    pub fn stats(&self) -> RegistryStats {
        let per_session: Vec<SessionStats> = self
            .all()
            .into_iter()
            .map(|(id, handle)| SessionStats {
                id,
                state: handle.state(),
                connected: handle.is_connected(),
                last_used: handle.last_used(),
                idle: handle.idle_for(),
                age: handle.age(),
            })
            .collect();

        RegistryStats {
            total_sessions: per_session.len(),
            connected_sessions: per_session.iter().filter(|s| s.connected).count(),
            per_session,
        }
    }

    /// Evict every session idle for longer than the idle timeout.
    ///
    /// Expired handles are removed atomically with respect to
    /// [`get_or_create`](Self::get_or_create), then cleaned up concurrently.
    /// Returns the number of evicted sessions.
    pub async fn sweep_expired(&self) -> usize {
        let expired = self.take_expired();
        let evicted = expired.len();

        let mut tasks = JoinSet::new();
        for (id, handle) in expired {
            let idle = handle.idle_for();
            tasks.spawn(async move {
                handle.cleanup().await;
                info!(session = %id, idle_secs = idle.as_secs(), "evicted idle session");
            });
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "idle session cleanup task failed");
            }
        }
        evicted
    }

    fn take_expired(&self) -> Vec<(SessionId, Arc<SessionHandle<C>>)> {
        let timeout = self.config.idle_timeout;
        let mut sessions = self.write();

        let ids: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, handle)| handle.idle_for() > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        ids.into_iter()
            .filter_map(|id| sessions.remove_entry(&id))
            .collect()
    }

    /// Remove every session at once.
    pub(super) fn drain(&self) -> Vec<(SessionId, Arc<SessionHandle<C>>)> {
        self.write().drain().collect()
    }

    /// Clean up and remove every session. See [`ShutdownCoordinator`].
    pub async fn cleanup_all(self: &Arc<Self>) -> ShutdownReport {
        ShutdownCoordinator::new(Arc::clone(self)).cleanup_all().await
    }
}

impl<C: Connectable> Default for SessionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnection, MockFactory};
    use std::collections::HashSet;

    fn registry() -> Arc<SessionRegistry<MockConnection>> {
        Arc::new(SessionRegistry::new())
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_handle() {
        let registry = registry();
        let id = SessionId::new("sess_a");

        let a = registry.get_or_create(&id);
        let b = registry.get_or_create(&id);

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(a.state(), SessionState::Disconnected);
        assert!(registry.is_reaper_running());
    }

    #[tokio::test]
    async fn test_get_does_not_create() {
        let registry = registry();
        assert!(registry.get("missing").is_none());
        assert!(!registry.contains("missing"));
        assert!(registry.is_empty());
        assert!(!registry.is_reaper_running());
    }

    #[tokio::test]
    async fn test_remove_does_not_close() {
        let registry = registry();
        let mock = MockFactory::new();
        let id = SessionId::new("sess_b");

        let handle = registry.get_or_create(&id);
        let conn = handle.connect(mock.factory()).await.unwrap();

        let removed = registry.remove(id.as_str()).unwrap();
        assert!(Arc::ptr_eq(&removed, &handle));
        assert!(registry.remove(id.as_str()).is_none());
        assert!(conn.is_open());
        assert_eq!(mock.closes(), 0);
    }

    #[tokio::test]
    async fn test_all_snapshot() {
        let registry = registry();
        for name in ["one", "two", "three"] {
            registry.get_or_create(&SessionId::new(name));
        }

        let ids: HashSet<String> = registry
            .all()
            .into_iter()
            .map(|(id, _)| id.to_string())
            .collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains("two"));
    }

    #[tokio::test]
    async fn test_stats() {
        let registry = registry();
        let mock = MockFactory::new();

        let connected = registry.get_or_create(&SessionId::new("connected"));
        connected.connect(mock.factory()).await.unwrap();
        registry.get_or_create(&SessionId::new("idle"));

        let stats = registry.stats();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.connected_sessions, 1);

        let entry = stats
            .per_session
            .iter()
            .find(|s| s.id.as_str() == "connected")
            .unwrap();
        assert!(entry.connected);
        assert_eq!(entry.state, SessionState::Connected);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["total_sessions"], 2);
        assert_eq!(json["connected_sessions"], 1);
        assert!(json["per_session"][0].get("last_used").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_only_idle() {
        let registry = Arc::new(SessionRegistry::with_config(RegistryConfig {
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(3600),
            ..RegistryConfig::default()
        }));
        let mock = MockFactory::new();

        let stale = registry.get_or_create(&SessionId::new("stale"));
        let stale_conn = stale.connect(mock.factory()).await.unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        registry.get_or_create(&SessionId::new("fresh"));
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(registry.sweep_expired().await, 1);
        assert!(!registry.contains("stale"));
        assert!(registry.contains("fresh"));
        assert!(!stale_conn.is_open());
        assert_eq!(mock.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_closes_concurrently() {
        let registry = Arc::new(SessionRegistry::with_config(RegistryConfig {
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(3600),
            ..RegistryConfig::default()
        }));
        let mock = MockFactory::new().with_close_delay(Duration::from_secs(2));

        for i in 0..4 {
            let handle = registry.get_or_create(&SessionId::new(format!("slow_{i}")));
            handle.connect(mock.factory()).await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        let started = Instant::now();
        assert_eq!(registry.sweep_expired().await, 4);
        // One close delay, not four.
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(mock.closes(), 4);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create() {
        let registry = registry();
        let id = SessionId::new("shared");

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            tasks.push(tokio::spawn(async move { registry.get_or_create(&id) }));
        }

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        assert_eq!(registry.len(), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    }
}
