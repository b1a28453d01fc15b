//! Built-in demo simulation
//!
//! Two paddles on a 256x256 field chase a ball. Small enough to snapshot in
//! a single chunk, deterministic, and it writes a high score to save memory
//! so save propagation has something to carry.

use lockstep_core::{EngineError, SimulationEngine, StateSnapshot};

/// Bytes of work memory exposed for desync hashing.
pub const WORK_RAM_SIZE: usize = 64;

/// Bytes of battery-backed save memory.
pub const SAVE_RAM_SIZE: usize = 256;

const SNAPSHOT_SIZE: usize = 4 + WORK_RAM_SIZE;

// Work RAM layout
const P1_X: usize = 0;
const P1_Y: usize = 1;
const P2_X: usize = 2;
const P2_Y: usize = 3;
const BALL_X: usize = 4;
const BALL_Y: usize = 5;
const BALL_DX: usize = 6;
const BALL_DY: usize = 7;
const SCORE: usize = 8; // [p1, p2]
const RALLY: usize = 10; // u16 LE

// Save RAM layout
const HIGH_SCORE: usize = 0; // u16 LE
const GAMES_PLAYED: usize = 2; // u16 LE

// Button bits
pub const BUTTON_UP: u16 = 1 << 0;
pub const BUTTON_DOWN: u16 = 1 << 1;
pub const BUTTON_LEFT: u16 = 1 << 2;
pub const BUTTON_RIGHT: u16 = 1 << 3;

/// Deterministic two-player toy engine.
#[derive(Debug, Clone)]
pub struct DemoEngine {
    masks: [u16; 2],
    frame: u32,
    work: [u8; WORK_RAM_SIZE],
    save: Vec<u8>,
    /// CRC of work memory after every frame, for post-run comparison
    history: Vec<u32>,
}

impl Default for DemoEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoEngine {
    pub fn new() -> Self {
        let mut work = [0u8; WORK_RAM_SIZE];
        work[P1_X] = 16;
        work[P1_Y] = 128;
        work[P2_X] = 240;
        work[P2_Y] = 128;
        work[BALL_X] = 128;
        work[BALL_Y] = 128;
        work[BALL_DX] = 1;
        work[BALL_DY] = 1;

        Self {
            masks: [0; 2],
            frame: 0,
            work,
            save: vec![0; SAVE_RAM_SIZE],
            history: Vec::new(),
        }
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn history(&self) -> &[u32] {
        &self.history
    }

    pub fn high_score(&self) -> u16 {
        u16::from_le_bytes([self.save[HIGH_SCORE], self.save[HIGH_SCORE + 1]])
    }

    fn move_paddle(&mut self, x: usize, y: usize, mask: u16) {
        let step = |v: u8, neg: bool, pos: bool| match (neg, pos) {
            (true, false) => v.saturating_sub(2),
            (false, true) => v.saturating_add(2),
            _ => v,
        };
        self.work[x] = step(self.work[x], mask & BUTTON_LEFT != 0, mask & BUTTON_RIGHT != 0);
        self.work[y] = step(self.work[y], mask & BUTTON_UP != 0, mask & BUTTON_DOWN != 0);
    }

    fn move_ball(&mut self) {
        let dx = self.work[BALL_DX] as i8;
        let dy = self.work[BALL_DY] as i8;
        let x = self.work[BALL_X].wrapping_add_signed(dx);
        let y = self.work[BALL_Y].wrapping_add_signed(dy);

        if y == 0 || y == u8::MAX {
            self.work[BALL_DY] = (-dy) as u8;
        }

        let hits = |px: u8, py: u8| x.abs_diff(px) <= 2 && y.abs_diff(py) <= 8;
        if hits(self.work[P1_X], self.work[P1_Y]) || hits(self.work[P2_X], self.work[P2_Y]) {
            self.work[BALL_DX] = (-dx) as u8;
            let rally = u16::from_le_bytes([self.work[RALLY], self.work[RALLY + 1]]).wrapping_add(1);
            self.work[RALLY..RALLY + 2].copy_from_slice(&rally.to_le_bytes());
        }

        if x == 0 || x == u8::MAX {
            let scorer = if x == 0 { SCORE + 1 } else { SCORE };
            self.work[scorer] = self.work[scorer].wrapping_add(1);
            self.end_rally();
            self.work[BALL_X] = 128;
            self.work[BALL_Y] = (self.frame % 200) as u8 + 28;
            self.work[BALL_DX] = (-dx) as u8;
            return;
        }

        self.work[BALL_X] = x;
        self.work[BALL_Y] = y;
    }

    fn end_rally(&mut self) {
        let rally = u16::from_le_bytes([self.work[RALLY], self.work[RALLY + 1]]);
        if rally > self.high_score() {
            self.save[HIGH_SCORE..HIGH_SCORE + 2].copy_from_slice(&rally.to_le_bytes());
        }
        let games = u16::from_le_bytes([self.save[GAMES_PLAYED], self.save[GAMES_PLAYED + 1]]);
        self.save[GAMES_PLAYED..GAMES_PLAYED + 2].copy_from_slice(&games.wrapping_add(1).to_le_bytes());
        self.work[RALLY..RALLY + 2].fill(0);
    }
}

impl SimulationEngine for DemoEngine {
    fn set_input_mask(&mut self, port: usize, mask: u16) {
        if let Some(slot) = self.masks.get_mut(port) {
            *slot = mask;
        }
    }

    fn advance_frame(&mut self) {
        let [p1, p2] = self.masks;
        self.move_paddle(P1_X, P1_Y, p1);
        self.move_paddle(P2_X, P2_Y, p2);
        self.move_ball();
        self.frame = self.frame.wrapping_add(1);
        self.history.push(crc32fast::hash(&self.work));
    }

    fn save_state(&mut self) -> Result<StateSnapshot, EngineError> {
        let mut data = Vec::with_capacity(SNAPSHOT_SIZE);
        data.extend_from_slice(&self.frame.to_le_bytes());
        data.extend_from_slice(&self.work);
        Ok(StateSnapshot::new(data))
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), EngineError> {
        if data.len() != SNAPSHOT_SIZE {
            return Err(EngineError::LoadFailed(format!(
                "expected {SNAPSHOT_SIZE} bytes, got {}",
                data.len()
            )));
        }
        self.frame = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        self.work.copy_from_slice(&data[4..]);
        self.history.truncate(self.frame as usize);
        Ok(())
    }

    fn hashable_region(&self) -> &[u8] {
        &self.work
    }

    fn persistent_memory(&self) -> &[u8] {
        &self.save
    }

    fn load_persistent_memory(&mut self, data: &[u8]) -> Result<(), EngineError> {
        if data.len() != SAVE_RAM_SIZE {
            return Err(EngineError::SaveMemoryRejected(format!(
                "expected {SAVE_RAM_SIZE} bytes, got {}",
                data.len()
            )));
        }
        self.save.copy_from_slice(data);
        Ok(())
    }
}

/// Scripted player: wanders the paddle with a per-role LCG.
#[derive(Debug, Clone)]
pub struct InputBot {
    state: u32,
    held: u16,
}

impl InputBot {
    pub fn new(seed: u32) -> Self {
        Self {
            state: seed.wrapping_mul(2_654_435_761).max(1),
            held: 0,
        }
    }

    /// Mask for the given frame; changes direction every 16 frames.
    pub fn mask(&mut self, frame: u32) -> u16 {
        if frame % 16 == 0 {
            self.state = self.state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            self.held = ((self.state >> 24) as u16) & (BUTTON_UP | BUTTON_DOWN | BUTTON_LEFT | BUTTON_RIGHT);
        }
        self.held
    }
}
