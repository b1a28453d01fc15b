//! Collaborator traits consumed by the lockstep session
//!
//! The session never owns the simulation. It drives whatever implements
//! [`SimulationEngine`] one frame at a time and hands persistent save memory
//! to a [`SaveStorage`] when a transfer replaces it.

use std::io;

/// Error returned by a simulation engine when it rejects an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Snapshot could not be produced
    #[error("failed to save state: {0}")]
    SaveFailed(String),

    /// Snapshot was rejected (wrong size, wrong core, corrupt contents)
    #[error("failed to load state: {0}")]
    LoadFailed(String),

    /// Save memory image was rejected
    #[error("failed to load save memory: {0}")]
    SaveMemoryRejected(String),
}

/// Serialized simulation state with a checksum of its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub data: Vec<u8>,
    pub checksum: u32,
}

impl StateSnapshot {
    /// Wrap serialized state, computing its CRC32.
    pub fn new(data: Vec<u8>) -> Self {
        let checksum = crc32fast::hash(&data);
        Self { data, checksum }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A deterministic, frame-stepped simulation.
///
/// Two instances fed identical input pairs from identical state must produce
/// identical memory. Only the session's scheduler thread calls into it.
pub trait SimulationEngine {
    /// Set the button mask for a controller port before the next frame.
    fn set_input_mask(&mut self, port: usize, mask: u16);

    /// Run exactly one frame.
    fn advance_frame(&mut self);

    /// Serialize the full simulation state.
    fn save_state(&mut self) -> Result<StateSnapshot, EngineError>;

    /// Replace the full simulation state.
    fn load_state(&mut self, data: &[u8]) -> Result<(), EngineError>;

    /// Small fixed window of deterministic memory used for desync hashing.
    fn hashable_region(&self) -> &[u8];

    /// Persistent save memory (battery-backed RAM). Empty if the simulation
    /// has none.
    fn persistent_memory(&self) -> &[u8];

    /// Replace persistent save memory.
    fn load_persistent_memory(&mut self, data: &[u8]) -> Result<(), EngineError>;
}

impl<E: SimulationEngine + ?Sized> SimulationEngine for Box<E> {
    fn set_input_mask(&mut self, port: usize, mask: u16) {
        (**self).set_input_mask(port, mask)
    }

    fn advance_frame(&mut self) {
        (**self).advance_frame()
    }

    fn save_state(&mut self) -> Result<StateSnapshot, EngineError> {
        (**self).save_state()
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), EngineError> {
        (**self).load_state(data)
    }

    fn hashable_region(&self) -> &[u8] {
        (**self).hashable_region()
    }

    fn persistent_memory(&self) -> &[u8] {
        (**self).persistent_memory()
    }

    fn load_persistent_memory(&mut self, data: &[u8]) -> Result<(), EngineError> {
        (**self).load_persistent_memory(data)
    }
}

/// Durable storage for the save memory image.
pub trait SaveStorage: Send {
    /// Load the stored image, `None` if nothing has been stored yet.
    fn load(&mut self) -> io::Result<Option<Vec<u8>>>;

    /// Persist a new image, replacing the previous one.
    fn save(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Storage that keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSaveStorage;

impl SaveStorage for NoSaveStorage {
    fn load(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn save(&mut self, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_checksum_matches_crc32() {
        let snapshot = StateSnapshot::new(b"123456789".to_vec());
        // CRC-32/ISO-HDLC check value
        assert_eq!(snapshot.checksum, 0xCBF4_3926);
        assert_eq!(snapshot.len(), 9);
        assert!(!snapshot.is_empty());
    }

    #[test]
    fn test_no_save_storage() {
        let mut storage = NoSaveStorage;
        storage.save(&[1, 2, 3]).unwrap();
        assert_eq!(storage.load().unwrap(), None);
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::LoadFailed("size mismatch".to_string());
        assert!(err.to_string().contains("size mismatch"));
    }
}
