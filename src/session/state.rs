//! Connection state machine.

use std::fmt;

use serde::Serialize;

/// Connection state of a session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No connection is held.
    #[default]
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// A live connection is cached.
    Connected,
    /// The last connect attempt failed. Transient; normalized to
    /// `Disconnected` as soon as the failure is recorded.
    Failed,
}

impl SessionState {
    /// Check if transition to target state is valid.
    ///
    /// Valid transitions:
    /// - Disconnected -> Connecting
    /// - Connecting -> Connected
    /// - Connecting -> Failed
    /// - Connecting -> Disconnected (cleanup while connecting)
    /// - Connected -> Disconnected
    /// - Failed -> Disconnected
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (*self, target),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Failed, Disconnected)
        )
    }

    /// Move to `target`, returning whether the state changed.
    ///
    /// Staying in the same state is a no-op. Invalid transitions leave the
    /// state untouched.
    pub fn transition_to(&mut self, target: SessionState) -> bool {
        if *self != target && self.can_transition_to(target) {
            *self = target;
            true
        } else {
            false
        }
    }

    /// Whether a connection may be handed out in this state.
    pub fn holds_resource(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}
