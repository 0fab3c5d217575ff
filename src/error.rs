//! Error types for session-pool.

use std::sync::Arc;

use thiserror::Error;

use crate::session::SessionId;

/// Failure reported by a [`Connectable`](crate::connection::Connectable)
/// implementation.
///
/// Cloneable so that a single failed connect attempt can hand the same cause
/// to every caller waiting on it.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    /// The underlying transport could not be created.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// The transport was created but the handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The liveness probe did not succeed.
    #[error("liveness probe failed: {0}")]
    Probe(String),

    /// The connection is closed or was never opened.
    #[error("connection closed")]
    Closed,

    /// The remote end went away.
    #[error("transport exited: {0}")]
    Exited(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// An operation did not finish in time.
    #[error("operation timed out")]
    Timeout,

    /// Any other transport-specific failure.
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Main error type for session operations.
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// Constructing the connection or running its handshake failed.
    #[error("failed to connect session {id}: {source}")]
    ConnectionEstablish {
        id: SessionId,
        #[source]
        source: ConnectionError,
    },

    /// The liveness probe failed on a previously connected session.
    ///
    /// Absorbed by the handle and turned into a state transition.
    #[error("validation failed for session {id}: {source}")]
    ValidationFailed {
        id: SessionId,
        #[source]
        source: ConnectionError,
    },

    /// Closing a connection failed. Logged, never returned.
    #[error("failed to close session {id}: {source}")]
    Cleanup {
        id: SessionId,
        #[source]
        source: ConnectionError,
    },

    /// The session was cleaned up while a connect attempt was pending.
    #[error("session {0} was cleaned up while connecting")]
    CleanedUp(SessionId),

    /// The task running the connect attempt panicked or was cancelled.
    #[error("connect attempt for session {id} aborted: {reason}")]
    AttemptAborted { id: SessionId, reason: String },

    /// The connection configuration could not be serialized for hashing.
    #[error("failed to derive session id: {0}")]
    Identity(String),
}

impl SessionError {
    /// The underlying connection failure, if there is one.
    pub fn connection_error(&self) -> Option<&ConnectionError> {
        match self {
            Self::ConnectionEstablish { source, .. }
            | Self::ValidationFailed { source, .. }
            | Self::Cleanup { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Convenience Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_establish_display() {
        let err = SessionError::ConnectionEstablish {
            id: SessionId::new("sess_00000001"),
            source: ConnectionError::Handshake("bad version".into()),
        };
        let message = err.to_string();
        assert!(message.contains("sess_00000001"));
        assert!(message.contains("bad version"));
    }

    #[test]
    fn test_cleaned_up_display() {
        let err = SessionError::CleanedUp(SessionId::new("sess_00000002"));
        assert!(err.to_string().contains("sess_00000002"));
        assert!(err.to_string().contains("cleaned up"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: ConnectionError = io_err.into();
        assert!(matches!(err, ConnectionError::Io(_)));
        assert!(err.to_string().contains("I/O error"));

        // Cloning shares the same io::Error.
        let cloned = err.clone();
        assert_eq!(cloned.to_string(), err.to_string());
    }

    #[test]
    fn test_connection_error_accessor() {
        let err = SessionError::ValidationFailed {
            id: SessionId::new("sess_x"),
            source: ConnectionError::Closed,
        };
        assert!(matches!(
            err.connection_error(),
            Some(ConnectionError::Closed)
        ));
        assert!(SessionError::Identity("x".into())
            .connection_error()
            .is_none());
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error as _;

        let err = SessionError::ConnectionEstablish {
            id: SessionId::new("sess_y"),
            source: ConnectionError::Timeout,
        };
        let source = err.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("operation timed out"));
    }
}
