//! Shared test utilities for session and integration tests

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::engine::{EngineError, SimulationEngine, StateSnapshot};

// ============================================================================
// Mock Engine
// ============================================================================

/// Size of the mock engine's hashable work memory.
pub const MOCK_MEMORY_SIZE: usize = 64;

const SNAPSHOT_HEADER: usize = 4;

/// Deterministic engine that records every input pair it consumes.
///
/// Snapshots are `frame (u32 BE) | memory | padding`. The padding lets tests
/// force multi-chunk transfers.
#[derive(Debug, Clone)]
pub struct MockEngine {
    masks: [u16; 2],
    frame: u32,
    memory: [u8; MOCK_MEMORY_SIZE],
    save: Vec<u8>,
    padding: usize,
    /// `(port 0, port 1)` for every simulated frame, indexed by frame
    pub consumed: Vec<(u16, u16)>,
    pub state_loads: u32,
    pub save_loads: u32,
    /// Reject every `load_state` call
    pub reject_state: bool,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            masks: [0; 2],
            frame: 0,
            memory: [0; MOCK_MEMORY_SIZE],
            save: Vec::new(),
            padding: 0,
            consumed: Vec::new(),
            state_loads: 0,
            save_loads: 0,
            reject_state: false,
        }
    }

    pub fn with_save(mut self, save: Vec<u8>) -> Self {
        self.save = save;
        self
    }

    pub fn with_state_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    /// Flip bits in work memory so hashes diverge from a peer.
    pub fn corrupt(&mut self) {
        self.memory[0] ^= 0xA5;
    }

    /// Write save memory the way a running game would.
    pub fn write_save(&mut self, offset: usize, value: u8) {
        if offset < self.save.len() {
            self.save[offset] = value;
        }
    }

    pub fn save(&self) -> &[u8] {
        &self.save
    }
}

impl SimulationEngine for MockEngine {
    fn set_input_mask(&mut self, port: usize, mask: u16) {
        if let Some(slot) = self.masks.get_mut(port) {
            *slot = mask;
        }
    }

    fn advance_frame(&mut self) {
        let [p0, p1] = self.masks;
        self.consumed.push((p0, p1));

        let slot = self.frame as usize % MOCK_MEMORY_SIZE;
        let mixed = (p0 as u8) ^ (p0 >> 8) as u8 ^ (p1 as u8).rotate_left(3) ^ (p1 >> 8) as u8;
        self.memory[slot] = self.memory[slot].wrapping_mul(31).wrapping_add(mixed).wrapping_add(1);
        self.frame += 1;
    }

    fn save_state(&mut self) -> Result<StateSnapshot, EngineError> {
        let mut data = Vec::with_capacity(SNAPSHOT_HEADER + MOCK_MEMORY_SIZE + self.padding);
        data.extend_from_slice(&self.frame.to_be_bytes());
        data.extend_from_slice(&self.memory);
        data.resize(data.len() + self.padding, 0xEE);
        Ok(StateSnapshot::new(data))
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), EngineError> {
        if self.reject_state {
            return Err(EngineError::LoadFailed("rejected by test".into()));
        }
        if data.len() < SNAPSHOT_HEADER + MOCK_MEMORY_SIZE {
            return Err(EngineError::LoadFailed(format!("snapshot too short: {}", data.len())));
        }
        let mut frame = [0u8; SNAPSHOT_HEADER];
        frame.copy_from_slice(&data[..SNAPSHOT_HEADER]);
        self.frame = u32::from_be_bytes(frame);
        // Frames past the snapshot are re-run by the session
        self.consumed.truncate(self.frame as usize);
        self.memory
            .copy_from_slice(&data[SNAPSHOT_HEADER..SNAPSHOT_HEADER + MOCK_MEMORY_SIZE]);
        self.state_loads += 1;
        Ok(())
    }

    fn hashable_region(&self) -> &[u8] {
        &self.memory
    }

    fn persistent_memory(&self) -> &[u8] {
        &self.save
    }

    fn load_persistent_memory(&mut self, data: &[u8]) -> Result<(), EngineError> {
        self.save = data.to_vec();
        self.save_loads += 1;
        Ok(())
    }
}

// ============================================================================
// Network helpers
// ============================================================================

pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// One 60 Hz step, as derived from the default tick rate.
pub const STEP: Duration = Duration::from_nanos(1_000_000_000 / 60);

/// Synthetic clock for deterministic tick sequences.
#[derive(Debug, Clone, Copy)]
pub struct TestClock {
    now: Instant,
}

impl TestClock {
    pub fn new() -> Self {
        Self { now: Instant::now() }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn advance(&mut self, by: Duration) -> Instant {
        self.now += by;
        self.now
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}
