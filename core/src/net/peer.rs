//! Peer endpoint tracking
//!
//! The remote endpoint is either known up front (static or rendezvous) or
//! learned from the first validly tagged packet (auto-discovery, Host only).
//! Once known, the IP is pinned and only the port follows NAT rebinds.

use std::net::SocketAddr;

/// 16-bit shared-secret token. Zero means "no secret configured".
pub fn derive_token(secret: Option<&str>) -> u16 {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return 0;
    };
    let crc = crc32fast::hash(secret.as_bytes());
    let token = ((crc >> 16) ^ (crc & 0xFFFF)) as u16;
    if token == 0 { 1 } else { token }
}

/// Outcome of observing a packet source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerObservation {
    /// First peer learned in discovery mode
    Locked(SocketAddr),
    /// Same IP, new source port
    PortChanged { old: u16, new: u16 },
    /// Matches the current peer
    Same,
    /// Not from the peer; drop the packet
    Rejected,
}

/// Current remote endpoint.
#[derive(Debug, Clone)]
pub struct PeerResolver {
    peer: Option<SocketAddr>,
    discovering: bool,
}

impl PeerResolver {
    /// Resolver with a known peer.
    pub fn known(peer: SocketAddr) -> Self {
        Self {
            peer: Some(peer),
            discovering: false,
        }
    }

    /// Resolver that locks onto the first validly tagged sender.
    pub fn discover() -> Self {
        Self {
            peer: None,
            discovering: true,
        }
    }

    /// Resolver that knows nothing yet and accepts nobody (rendezvous pending).
    pub fn pending() -> Self {
        Self {
            peer: None,
            discovering: false,
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering && self.peer.is_none()
    }

    /// Switch a pending resolver to a known peer or to discovery.
    pub fn set_peer(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
        self.discovering = false;
    }

    pub fn start_discovery(&mut self) {
        self.peer = None;
        self.discovering = true;
    }

    /// Classify a packet source.
    ///
    /// `validly_tagged` is whether the packet carried an accepted token; only
    /// such packets may lock a peer in discovery mode.
    pub fn observe(&mut self, from: SocketAddr, validly_tagged: bool) -> PeerObservation {
        match self.peer {
            None => {
                if self.discovering && validly_tagged {
                    self.peer = Some(from);
                    self.discovering = false;
                    PeerObservation::Locked(from)
                } else {
                    PeerObservation::Rejected
                }
            }
            Some(peer) if peer.ip() != from.ip() => PeerObservation::Rejected,
            Some(peer) if peer.port() != from.port() => {
                self.peer = Some(from);
                PeerObservation::PortChanged {
                    old: peer.port(),
                    new: from.port(),
                }
            }
            Some(_) => PeerObservation::Same,
        }
    }
}
