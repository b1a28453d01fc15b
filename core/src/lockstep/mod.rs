//! Deterministic lockstep session
//!
//! Both peers run the same simulation and advance frame N only once both
//! input masks for N are known. Local input is scheduled `input_delay` frames
//! ahead so the network has time to deliver it before it is needed.
//!
//! # Architecture
//!
//! - `LockstepSession`: owns the transport and runs receive, dispatch, send
//!   and simulate in one `tick()`
//! - `SessionRunner`: the same session on a dedicated thread
//! - `InputChannel`: delayed local inputs and the redundant resend window
//! - `TransferSender` / `TransferReceiver`: chunked, CRC-verified state and
//!   save memory pushes from Host to Joiner
//! - `DesyncDetector`: periodic region hashes compared across peers
//! - `FrameClock`: fixed timestep with bounded catch-up
//!
//! # Frame Flow
//!
//! 1. Drain the socket and dispatch every decoded packet
//! 2. Record the local mask for `frame + input_delay` and send the window
//! 3. Push transfer chunks, expire stale transfers, update the state machine
//! 4. If both masks for `frame` are known, step the engine and hash on schedule
//!
//! # Module Structure
//!
//! - `config`: validated session parameters
//! - `ring`: frame-indexed fixed capacity storage
//! - `input_channel`: local/remote input bookkeeping
//! - `transfer`: chunked transfer protocol
//! - `desync`: hash comparison and resync rate limiting
//! - `state`: session state machine
//! - `scheduler`: frame clock
//! - `events`: events, stats and errors
//! - `session`: the session itself
//! - `runner`: scheduler thread

pub mod config;
pub mod desync;
pub mod events;
pub mod input_channel;
pub mod ring;
mod runner;
pub mod scheduler;
mod session;
pub mod state;
pub mod transfer;

#[cfg(test)]
mod tests;

pub use config::{InvalidConfig, SessionConfig};
pub use events::{ConnectionStats, SessionError, SessionEvent};
pub use runner::SessionRunner;
pub use session::{LockstepSession, MAX_PENDING_EVENTS, TickOutcome};
pub use state::SessionState;
pub use transfer::{MAX_TRANSFER_SIZE, TransferError, TransferKind};
