//! Session lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of the (at most one) session.
///
/// The fallback "simulating" presentation is not a state of this machine: it
/// runs concurrently whenever the state is anything other than [`Active`].
///
/// [`Active`]: SessionState::Active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// No session exists.
    Idle,
    /// Asking the attached device whether it can host a projection session.
    Probing,
    /// Bringing up the transport over the probed device link.
    TransportStarting,
    /// Running the secure-channel handshake over the transport.
    SecureHandshake,
    /// Control messages are flowing; live video owns the frame sink.
    Active,
    /// Owned resources are being released.
    ShuttingDown,
}

impl SessionState {
    /// Returns `true` for the three states in which bring-up work is in flight.
    pub fn is_bringing_up(self) -> bool {
        matches!(
            self,
            SessionState::Probing | SessionState::TransportStarting | SessionState::SecureHandshake
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Probing => "probing",
            SessionState::TransportStarting => "transport-starting",
            SessionState::SecureHandshake => "secure-handshake",
            SessionState::Active => "active",
            SessionState::ShuttingDown => "shutting-down",
        };
        f.write_str(name)
    }
}
