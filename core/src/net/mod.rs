//! Networking for lockstep netplay
//!
//! - [`packet`] - Wire codec, decoded once at the socket boundary
//! - [`socket`] - Non-blocking UDP endpoint
//! - [`peer`] - Remote endpoint learning and NAT port tracking
//! - [`rendezvous`] - Helper-assisted peer address exchange
//! - [`stun`] - Public endpoint discovery for static setups
//!
//! # Architecture
//!
//! ```text
//!   UDP datagram
//!        |
//!   NetplaySocket --decode--> Datagram::{Packet, Rendezvous}
//!        |
//!   PeerResolver (source filter, port refresh)
//!        |
//!   LockstepSession dispatch
//! ```

pub mod packet;
pub mod peer;
pub mod rendezvous;
pub mod socket;
pub mod stun;

pub use packet::{DecodeError, InputPacket, Packet, TransferAck, TransferChunk, TransferInfo};
pub use peer::{PeerObservation, PeerResolver, derive_token};
pub use rendezvous::{RendezvousClient, RendezvousError, RendezvousReply, RendezvousStatus};
pub use socket::{Datagram, MAX_CHUNK_PAYLOAD, NetplaySocket, SocketError, resolve_ipv4};
pub use stun::{StunError, discover_public_endpoint};
