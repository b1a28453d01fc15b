//! Session events, statistics and errors

use std::net::SocketAddr;
use std::time::Duration;

use crate::net::{RendezvousError, SocketError};

use super::config::InvalidConfig;
use super::state::SessionState;
use super::transfer::TransferKind;

/// High-level session events for the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// State machine moved
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// First validly tagged packet from the peer
    PeerConnected { addr: SocketAddr },
    /// Peer source port changed (NAT rebind)
    PeerPortChanged { old: u16, new: u16 },
    /// Host began pushing a payload
    TransferStarted {
        kind: TransferKind,
        size: u32,
        gating: bool,
    },
    /// Host received the peer's ack
    TransferCompleted { kind: TransferKind, size: u32 },
    /// Joiner verified and applied a payload
    TransferApplied { kind: TransferKind, size: u32 },
    /// Transfer passed its deadline unacknowledged
    TransferAbandoned { kind: TransferKind, size: u32 },
    /// Local and remote hashes disagree
    DesyncDetected {
        frame: u32,
        local_hash: u32,
        remote_hash: u32,
    },
    /// Joiner asked the Host for a resync
    ResyncRequested { frame: u32 },
    /// Rendezvous helper paired us with a peer
    RendezvousResolved { peer: SocketAddr },
    /// Rendezvous handshake failed; a fallback may follow
    RendezvousFailed { reason: String },
}

/// Connection statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub state: SessionState,
    pub local_frame: u32,
    pub peer: Option<SocketAddr>,
    /// Packets accepted from the peer
    pub received_packets: u64,
    /// Datagrams that failed to decode
    pub dropped_packets: u64,
    /// Time since the last accepted packet, `None` if nothing arrived yet
    pub last_received_age: Option<Duration>,
    pub last_remote_frame: Option<u32>,
    pub max_remote_frame: Option<u32>,
}

impl ConnectionStats {
    /// Peer endpoint as `ip:port`, empty if unknown.
    pub fn peer_endpoint(&self) -> String {
        self.peer.map(|addr| addr.to_string()).unwrap_or_default()
    }
}

/// Reasons `start()` can fail. The session is left idle.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid netplay configuration: {0}")]
    InvalidConfig(#[from] InvalidConfig),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),
}
