//! Netplay socket layer
//!
//! One non-blocking UDP endpoint per session. Incoming datagrams are decoded
//! once here into [`Datagram`]; undecodable bytes are dropped.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};

use super::packet::Packet;
use super::rendezvous::RendezvousReply;

/// Buffer size for incoming datagrams
const RECV_BUFFER_SIZE: usize = 2048;

/// Largest chunk payload that keeps a chunk datagram under a typical MTU
pub const MAX_CHUNK_PAYLOAD: usize = 1400;

/// Socket setup errors
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("failed to bind UDP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to set non-blocking mode: {0}")]
    NonBlocking(#[source] io::Error),

    #[error("failed to resolve '{host}': {reason}")]
    Resolve { host: String, reason: String },
}

/// A decoded inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    /// Lockstep protocol packet
    Packet(Packet),
    /// Text reply from a rendezvous helper
    Rendezvous(RendezvousReply),
}

/// Non-blocking UDP socket carrying lockstep packets.
pub struct NetplaySocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
    recv_buf: Vec<u8>,
    recv_queue: VecDeque<(SocketAddr, Datagram)>,
    dropped: u64,
}

impl NetplaySocket {
    /// Bind to `0.0.0.0:port`. Port 0 picks any free port.
    pub fn bind(port: u16) -> Result<Self, SocketError> {
        Self::bind_addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Bind to an explicit address.
    pub fn bind_addr(addr: SocketAddr) -> Result<Self, SocketError> {
        let socket = UdpSocket::bind(addr).map_err(|source| SocketError::Bind {
            port: addr.port(),
            source,
        })?;

        socket
            .set_nonblocking(true)
            .map_err(SocketError::NonBlocking)?;

        let local_addr = socket.local_addr().map_err(|source| SocketError::Bind {
            port: addr.port(),
            source,
        })?;

        tracing::debug!(port = local_addr.port(), "NetplaySocket bound");

        Ok(Self {
            socket,
            local_addr,
            recv_buf: vec![0u8; RECV_BUFFER_SIZE],
            recv_queue: VecDeque::new(),
            dropped: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Datagrams dropped because they failed to decode.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Send a packet. Failures are transient noise and only traced.
    pub fn send_packet(&self, target: SocketAddr, packet: &Packet) {
        self.send_raw(target, &packet.to_bytes());
        tracing::trace!(kind = packet.kind_name(), %target, "Sent packet");
    }

    /// Send raw bytes (rendezvous requests).
    pub fn send_raw(&self, target: SocketAddr, bytes: &[u8]) {
        if let Err(e) = self.socket.send_to(bytes, target) {
            tracing::trace!(error = %e, %target, "Send failed");
        }
    }

    /// Next decoded datagram, draining the OS buffer first.
    pub fn poll(&mut self) -> Option<(SocketAddr, Datagram)> {
        if self.recv_queue.is_empty() {
            self.recv_all();
        }
        self.recv_queue.pop_front()
    }

    /// Receive every datagram currently available.
    fn recv_all(&mut self) {
        loop {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((len, from)) => {
                    let data = &self.recv_buf[..len];
                    match decode_datagram(data) {
                        Some(datagram) => self.recv_queue.push_back((from, datagram)),
                        None => {
                            self.dropped += 1;
                            tracing::trace!(%from, len, "Dropped undecodable datagram");
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // Windows reports ICMP port unreachable as ConnectionReset on UDP
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    tracing::trace!(error = %e, "Receive error");
                    break;
                }
            }
        }
    }
}

fn decode_datagram(data: &[u8]) -> Option<Datagram> {
    match Packet::decode(data) {
        Ok(packet) => Some(Datagram::Packet(packet)),
        Err(packet_err) => match RendezvousReply::parse(data) {
            Some(reply) => Some(Datagram::Rendezvous(reply)),
            None => {
                tracing::trace!(error = %packet_err, "Packet decode failed");
                None
            }
        },
    }
}

/// Resolve `host:port` to the first IPv4 address.
pub fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddr, SocketError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| SocketError::Resolve {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

    addrs
        .into_iter()
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| SocketError::Resolve {
            host: host.to_string(),
            reason: "no IPv4 address".to_string(),
        })
}
