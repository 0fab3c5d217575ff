//! Child-process backed connections.
//!
//! A [`ProcessConnection`] treats a spawned server process speaking over its
//! stdin/stdout as the connection. Whatever protocol runs over the pipes is
//! left to the caller via [`ProcessConnection::take_stdio`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Connectable, ConnectionError, ConnectionResult, TransportErrorObserver};

/// How often the exit watcher polls the child.
pub const DEFAULT_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Time allowed for the child to die after being killed.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How to launch a server process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Program to run.
    pub command: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Working directory for the child.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl ProcessConfig {
    /// Create a config for `command` with no arguments.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

/// Transport selection, tagged by `type` in its serialized form:
/// `{"type": "stdio", "command": "server", "args": ["--flag"]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// A child process spoken to over stdin/stdout.
    Stdio(ProcessConfig),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A connection backed by a child process.
pub struct ProcessConnection {
    config: ProcessConfig,
    child: Arc<Mutex<Option<Child>>>,
    stdio: Mutex<Option<(ChildStdin, ChildStdout)>>,
    observer: Arc<Mutex<Option<TransportErrorObserver>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    exit_poll_interval: Duration,
    close_timeout: Duration,
}

impl ProcessConnection {
    /// Create an unconnected process connection.
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            child: Arc::new(Mutex::new(None)),
            stdio: Mutex::new(None),
            observer: Arc::new(Mutex::new(None)),
            watcher: Mutex::new(None),
            exit_poll_interval: DEFAULT_EXIT_POLL_INTERVAL,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    /// Build from a tagged transport config.
    pub fn from_transport(config: TransportConfig) -> Self {
        match config {
            TransportConfig::Stdio(process) => Self::new(process),
        }
    }

    /// Set how often the exit watcher polls the child.
    pub fn with_exit_poll_interval(mut self, interval: Duration) -> Self {
        self.exit_poll_interval = interval;
        self
    }

    /// Set how long `close` waits for the killed child.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// The launch configuration.
    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// OS process ID of the running child.
    pub fn pid(&self) -> Option<u32> {
        lock(&self.child).as_ref().and_then(Child::id)
    }

    /// Take the child's stdin/stdout pipes. Returns `None` before connect or
    /// if they were already taken.
    pub fn take_stdio(&self) -> Option<(ChildStdin, ChildStdout)> {
        lock(&self.stdio).take()
    }

    fn spawn_watcher(&self) -> JoinHandle<()> {
        let child = Arc::clone(&self.child);
        let observer = Arc::clone(&self.observer);
        let interval = self.exit_poll_interval;
        let command = self.config.command.clone();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let error = {
                    let mut guard = lock(&child);
                    let Some(running) = guard.as_mut() else {
                        return;
                    };
                    match running.try_wait() {
                        Ok(None) => continue,
                        Ok(Some(status)) => {
                            guard.take();
                            ConnectionError::Exited(status.to_string())
                        }
                        Err(e) => ConnectionError::from(e),
                    }
                };

                debug!(command = %command, error = %error, "server process went away");
                let observer = lock(&observer).clone();
                if let Some(observer) = observer {
                    observer.notify(error);
                }
                return;
            }
        })
    }
}

#[async_trait]
impl Connectable for ProcessConnection {
    async fn connect(&self) -> ConnectionResult<()> {
        if lock(&self.child).is_some() {
            return Ok(());
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ConnectionError::Spawn(format!("{}: {e}", self.config.command)))?;

        if let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) {
            *lock(&self.stdio) = Some((stdin, stdout));
        }
        debug!(command = %self.config.command, pid = ?child.id(), "server process spawned");
        *lock(&self.child) = Some(child);

        let watcher = self.spawn_watcher();
        if let Some(previous) = lock(&self.watcher).replace(watcher) {
            previous.abort();
        }
        Ok(())
    }

    async fn close(&self) -> ConnectionResult<()> {
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }
        lock(&self.stdio).take();

        let Some(mut child) = lock(&self.child).take() else {
            return Ok(());
        };
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(());
        }

        match tokio::time::timeout(self.close_timeout, child.kill()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(command = %self.config.command, error = %e, "failed to kill server process");
                Err(e.into())
            }
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    async fn probe(&self) -> ConnectionResult<()> {
        let mut guard = lock(&self.child);
        let Some(child) = guard.as_mut() else {
            return Err(ConnectionError::Closed);
        };
        match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(ConnectionError::Exited(status.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn on_transport_error(&self, observer: TransportErrorObserver) {
        *lock(&self.observer) = Some(observer);
    }
}

impl Drop for ProcessConnection {
    fn drop(&mut self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use serde_json::json;

    #[test]
    fn test_transport_config_from_json() {
        let value = json!({"type": "stdio", "command": "server", "args": ["--flag"]});
        let config: TransportConfig = serde_json::from_value(value).unwrap();
        let TransportConfig::Stdio(process) = config;
        assert_eq!(process.command, "server");
        assert_eq!(process.args, vec!["--flag".to_string()]);
        assert!(process.env.is_empty());
        assert!(process.cwd.is_none());
    }

    #[test]
    fn test_typed_and_raw_config_share_identity() {
        let raw = json!({"type": "stdio", "command": "server", "args": ["--flag"]});
        let typed = TransportConfig::Stdio(ProcessConfig::new("server").arg("--flag"));
        assert_eq!(
            SessionId::derive(&raw, None).unwrap(),
            SessionId::derive(&typed, None).unwrap()
        );
    }

    #[test]
    fn test_builder() {
        let config = ProcessConfig::new("server")
            .arg("-v")
            .env("MODE", "test")
            .cwd("/tmp");
        assert_eq!(config.args, vec!["-v".to_string()]);
        assert_eq!(config.env.get("MODE").map(String::as_str), Some("test"));
        assert_eq!(config.cwd, Some(PathBuf::from("/tmp")));
    }

    #[tokio::test]
    async fn test_probe_before_connect() {
        let conn = ProcessConnection::new(ProcessConfig::new("sleep").arg("30"));
        assert!(matches!(conn.probe().await, Err(ConnectionError::Closed)));
        assert!(conn.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let conn = ProcessConnection::new(ProcessConfig::new("/nonexistent/session-pool-server"));
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Spawn(_)));
        assert!(conn.pid().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_probe_close() {
        let conn = ProcessConnection::new(ProcessConfig::new("sleep").arg("30"));
        conn.connect().await.unwrap();

        assert!(conn.pid().is_some());
        assert!(conn.probe().await.is_ok());
        assert!(conn.take_stdio().is_some());
        assert!(conn.take_stdio().is_none());

        conn.close().await.unwrap();
        assert!(conn.pid().is_none());
        assert!(matches!(conn.probe().await, Err(ConnectionError::Closed)));

        // Second close is a no-op.
        assert!(conn.close().await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_notifies_observer() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = ProcessConnection::new(ProcessConfig::new("sh").arg("-c").arg("exit 3"))
            .with_exit_poll_interval(Duration::from_millis(10));
        conn.on_transport_error(TransportErrorObserver::new(move |err| {
            let _ = tx.send(err);
        }));

        conn.connect().await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("observer was not notified")
            .expect("channel closed");
        assert!(matches!(err, ConnectionError::Exited(_)));
        assert!(conn.probe().await.is_err());
    }
}
