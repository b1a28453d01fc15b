//! Session state machine
//!
//! ```text
//! Idle -> Discovering | Connecting -> PeerKnown -> Ready <-> Resyncing
//! ```

use lockstep_shared::Role;

/// Lifecycle state of a lockstep session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// Not started, or stopped
    #[default]
    Idle,
    /// Host waiting for the first validly tagged packet
    Discovering,
    /// Peer address configured or being resolved, no packet seen yet
    Connecting,
    /// Peer heard from; waiting on gating transfers
    PeerKnown,
    /// Simulating
    Ready,
    /// Simulating while a state resync transfer is in flight
    Resyncing,
}

impl SessionState {
    /// Simulation steps may run in this state.
    pub fn can_simulate(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Resyncing)
    }

    /// A peer has been heard from.
    pub fn has_peer(self) -> bool {
        matches!(
            self,
            SessionState::PeerKnown | SessionState::Ready | SessionState::Resyncing
        )
    }

    pub fn as_u8(self) -> u8 {
        match self {
            SessionState::Idle => 0,
            SessionState::Discovering => 1,
            SessionState::Connecting => 2,
            SessionState::PeerKnown => 3,
            SessionState::Ready => 4,
            SessionState::Resyncing => 5,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Discovering,
            2 => SessionState::Connecting,
            3 => SessionState::PeerKnown,
            4 => SessionState::Ready,
            5 => SessionState::Resyncing,
            _ => SessionState::Idle,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Discovering => "discovering",
            SessionState::Connecting => "connecting",
            SessionState::PeerKnown => "peer-known",
            SessionState::Ready => "ready",
            SessionState::Resyncing => "resyncing",
        };
        f.write_str(name)
    }
}

/// Inputs to the readiness decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gates {
    /// Some gating transfer is unsatisfied
    pub gating_pending: bool,
    /// A state transfer is in flight (drives Resyncing)
    pub state_transfer_active: bool,
    /// Joiner has seen at least one transfer announcement
    pub offer_seen: bool,
    /// Joiner grace period after PeerKnown has elapsed
    pub grace_elapsed: bool,
}

/// Next state for a session that has a peer.
///
/// States before `PeerKnown` are driven by the transport, not by gates, and
/// are returned unchanged.
pub fn advance(current: SessionState, role: Role, gates: Gates) -> SessionState {
    match current {
        SessionState::PeerKnown => {
            let satisfied = match role {
                Role::Host => !gates.gating_pending,
                Role::Joiner => !gates.gating_pending && (gates.offer_seen || gates.grace_elapsed),
            };
            if satisfied {
                SessionState::Ready
            } else {
                SessionState::PeerKnown
            }
        }
        SessionState::Ready | SessionState::Resyncing => {
            if gates.state_transfer_active {
                SessionState::Resyncing
            } else {
                SessionState::Ready
            }
        }
        other => other,
    }
}
