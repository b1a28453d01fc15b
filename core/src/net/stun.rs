//! Best-effort public endpoint discovery (STUN binding, RFC 5389)
//!
//! Used by callers that want to tell a friend which address to put in a
//! static peer config. The session never calls this itself.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

use super::socket::{SocketError, resolve_ipv4};

const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const HEADER_LEN: usize = 20;
const FAMILY_IPV4: u8 = 0x01;

/// Public STUN servers tried in order.
pub const DEFAULT_STUN_SERVERS: &[(&str, u16)] = &[
    ("stun.cloudflare.com", 3478),
    ("stun.l.google.com", 19302),
    ("global.stun.twilio.com", 3478),
];

/// STUN query failures
#[derive(Debug, thiserror::Error)]
pub enum StunError {
    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error("STUN I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed STUN response: {0}")]
    Malformed(&'static str),

    #[error("STUN response carried no IPv4 mapped address")]
    NoMappedAddress,
}

pub type TransactionId = [u8; 12];

/// Encode a binding request with no attributes.
pub fn binding_request(txid: &TransactionId) -> [u8; HEADER_LEN] {
    let mut req = [0u8; HEADER_LEN];
    BigEndian::write_u16(&mut req[0..2], BINDING_REQUEST);
    BigEndian::write_u16(&mut req[2..4], 0);
    BigEndian::write_u32(&mut req[4..8], MAGIC_COOKIE);
    req[8..20].copy_from_slice(txid);
    req
}

fn parse_mapped(attr_type: u16, value: &[u8]) -> Option<SocketAddrV4> {
    if value.len() < 8 || value[1] != FAMILY_IPV4 {
        return None;
    }
    let mut port = BigEndian::read_u16(&value[2..4]);
    let mut addr = BigEndian::read_u32(&value[4..8]);

    if attr_type == ATTR_XOR_MAPPED_ADDRESS {
        port ^= (MAGIC_COOKIE >> 16) as u16;
        addr ^= MAGIC_COOKIE;
    }

    if port == 0 {
        return None;
    }
    Some(SocketAddrV4::new(Ipv4Addr::from(addr), port))
}

/// Parse a binding success response for `txid`.
///
/// XOR-MAPPED-ADDRESS wins over MAPPED-ADDRESS when both are present.
pub fn parse_binding_response(
    data: &[u8],
    txid: &TransactionId,
) -> Result<SocketAddrV4, StunError> {
    if data.len() < HEADER_LEN {
        return Err(StunError::Malformed("short header"));
    }
    if BigEndian::read_u16(&data[0..2]) != BINDING_SUCCESS {
        return Err(StunError::Malformed("not a binding success"));
    }
    if BigEndian::read_u32(&data[4..8]) != MAGIC_COOKIE {
        return Err(StunError::Malformed("bad magic cookie"));
    }
    if &data[8..20] != txid {
        return Err(StunError::Malformed("transaction id mismatch"));
    }

    let len = BigEndian::read_u16(&data[2..4]) as usize;
    let Some(mut attrs) = data.get(HEADER_LEN..HEADER_LEN + len) else {
        return Err(StunError::Malformed("truncated attributes"));
    };

    let mut mapped = None;
    while attrs.len() >= 4 {
        let attr_type = BigEndian::read_u16(&attrs[0..2]);
        let attr_len = BigEndian::read_u16(&attrs[2..4]) as usize;
        attrs = &attrs[4..];
        let Some(value) = attrs.get(..attr_len) else {
            break;
        };

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = parse_mapped(attr_type, value) {
                    return Ok(addr);
                }
            }
            ATTR_MAPPED_ADDRESS if mapped.is_none() => mapped = parse_mapped(attr_type, value),
            _ => {}
        }

        // Attributes are padded to 4 bytes
        let padded = (attr_len + 3) & !3;
        if padded > attrs.len() {
            break;
        }
        attrs = &attrs[padded..];
    }

    mapped.ok_or(StunError::NoMappedAddress)
}

/// Query one server from a socket bound to `local_port`.
pub fn query_server(
    host: &str,
    port: u16,
    local_port: u16,
    timeout: Duration,
) -> Result<SocketAddrV4, StunError> {
    let server = resolve_ipv4(host, port)?;
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_port)))?;
    socket.set_read_timeout(Some(timeout))?;

    let txid: TransactionId = rand::random();
    socket.send_to(&binding_request(&txid), server)?;

    let mut buf = [0u8; 1500];
    let (len, _) = socket.recv_from(&mut buf)?;
    parse_binding_response(&buf[..len], &txid)
}

/// Try each default server until one answers.
pub fn discover_public_endpoint(local_port: u16, timeout_per_server: Duration) -> Option<SocketAddrV4> {
    for (host, port) in DEFAULT_STUN_SERVERS {
        match query_server(host, *port, local_port, timeout_per_server) {
            Ok(addr) => {
                tracing::info!(server = *host, %addr, "Public endpoint discovered");
                return Some(addr);
            }
            Err(e) => tracing::debug!(server = *host, error = %e, "STUN query failed"),
        }
    }
    None
}
