//! Rendezvous-assisted peer discovery
//!
//! Both peers send `SNO_PUNCH1 <code>` to a helper server from their session
//! socket. The helper pairs requests by room code and answers each side with
//! the other side's observed address. The exchange is bounded and driven one
//! step per tick so it never blocks the session loop.
//!
//! ```text
//! -> "SNO_PUNCH1 ABCD1234\n"
//! <- "SNO_WAIT\n"                    (other side not here yet)
//! <- "SNO_PEER1 203.0.113.7 51234\n" (paired)
//! <- "SNO_NOROOM\n"                  (helper is full)
//! ```

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use super::socket::NetplaySocket;

/// Room code length bounds
pub const ROOM_CODE_MIN_LEN: usize = 8;
pub const ROOM_CODE_MAX_LEN: usize = 12;

const PUNCH_PREFIX: &str = "SNO_PUNCH1";
const PEER_PREFIX: &str = "SNO_PEER1";
const WAIT_REPLY: &str = "SNO_WAIT";
const NOROOM_REPLY: &str = "SNO_NOROOM";

/// Rendezvous failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RendezvousError {
    #[error("room code must be {ROOM_CODE_MIN_LEN}-{ROOM_CODE_MAX_LEN} alphanumeric characters")]
    InvalidRoomCode,

    #[error("rendezvous server has no free room")]
    NoRoom,

    #[error("no peer reply from rendezvous server within {0:?}")]
    TimedOut(Duration),
}

/// Normalize a room code the way the helper does: keep ASCII alphanumerics,
/// upper-cased, then check the length.
pub fn normalize_room_code(code: &str) -> Result<String, RendezvousError> {
    let code: String = code
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if !(ROOM_CODE_MIN_LEN..=ROOM_CODE_MAX_LEN).contains(&code.len()) {
        return Err(RendezvousError::InvalidRoomCode);
    }
    Ok(code)
}

/// Reply datagram from the helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousReply {
    Peer(SocketAddr),
    Wait,
    NoRoom,
}

impl RendezvousReply {
    /// Parse a reply line; `None` for anything else.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(data).ok()?;
        let mut parts = text.split_ascii_whitespace();

        match parts.next()? {
            PEER_PREFIX => {
                let ip: IpAddr = parts.next()?.parse().ok()?;
                let port: u16 = parts.next()?.parse().ok()?;
                if port == 0 || !ip.is_ipv4() {
                    return None;
                }
                Some(Self::Peer(SocketAddr::new(ip, port)))
            }
            WAIT_REPLY => Some(Self::Wait),
            NOROOM_REPLY => Some(Self::NoRoom),
            _ => None,
        }
    }
}

/// Progress of a rendezvous exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendezvousStatus {
    Pending,
    Resolved(SocketAddr),
    Failed(RendezvousError),
}

/// Non-blocking rendezvous exchange over the session socket.
#[derive(Debug)]
pub struct RendezvousClient {
    server: SocketAddr,
    request: Vec<u8>,
    deadline: Instant,
    timeout: Duration,
    resend: Duration,
    next_send: Instant,
    outcome: RendezvousStatus,
}

impl RendezvousClient {
    pub fn new(
        server: SocketAddr,
        room_code: &str,
        timeout: Duration,
        resend: Duration,
        now: Instant,
    ) -> Result<Self, RendezvousError> {
        let code = normalize_room_code(room_code)?;
        Ok(Self {
            server,
            request: format!("{PUNCH_PREFIX} {code}\n").into_bytes(),
            deadline: now + timeout,
            timeout,
            resend,
            next_send: now,
            outcome: RendezvousStatus::Pending,
        })
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Feed a reply. Replies not from the server IP are ignored.
    pub fn on_reply(&mut self, from: SocketAddr, reply: RendezvousReply) {
        if from.ip() != self.server.ip() || self.outcome != RendezvousStatus::Pending {
            return;
        }
        match reply {
            RendezvousReply::Peer(peer) => {
                tracing::info!(%peer, "Rendezvous paired");
                self.outcome = RendezvousStatus::Resolved(peer);
            }
            RendezvousReply::Wait => tracing::trace!("Rendezvous waiting for other side"),
            RendezvousReply::NoRoom => {
                tracing::warn!(server = %self.server, "Rendezvous server full");
                self.outcome = RendezvousStatus::Failed(RendezvousError::NoRoom);
            }
        }
    }

    /// Send the punch request when due and report progress.
    pub fn poll(&mut self, socket: &NetplaySocket, now: Instant) -> RendezvousStatus {
        if self.outcome != RendezvousStatus::Pending {
            return self.outcome.clone();
        }
        if now >= self.deadline {
            self.outcome = RendezvousStatus::Failed(RendezvousError::TimedOut(self.timeout));
            return self.outcome.clone();
        }
        if now >= self.next_send {
            socket.send_raw(self.server, &self.request);
            self.next_send = now + self.resend;
        }
        RendezvousStatus::Pending
    }
}
