//! Lockstep Core - Peer-to-peer deterministic lockstep netplay
//!
//! Two peers run the same deterministic simulation and exchange only input
//! masks over UDP. Neither side predicts or rolls back: frame N is simulated
//! once both masks for N are known.
//!
//! # Architecture
//!
//! - [`LockstepSession`] - Transport, input exchange, state sync and desync
//!   recovery driven by one `tick()` per scheduler iteration
//! - [`SessionRunner`] - The same session on a dedicated thread
//! - [`SimulationEngine`] - Trait implemented by the simulation being driven
//! - [`SaveStorage`] - Durable home for persistent save memory
//! - [`InputHandle`] - Lock-free local input handoff from the capture context

pub mod engine;
pub mod input;
pub mod lockstep;
pub mod net;
pub mod save_store;
#[cfg(test)]
pub mod test_utils;

pub use engine::{EngineError, NoSaveStorage, SaveStorage, SimulationEngine, StateSnapshot};
pub use input::InputHandle;
pub use save_store::{MemorySaveStore, SaveFile};

// Re-export session types
pub use lockstep::{
    ConnectionStats, InvalidConfig, LockstepSession, SessionConfig, SessionError, SessionEvent,
    SessionRunner, SessionState, TickOutcome, TransferKind,
};

// Re-export settings so embedders need only one crate
pub use lockstep_shared::{NetplaySettings, PeerMode, Role, Tuning};
