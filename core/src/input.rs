//! Cross-thread local input handoff
//!
//! The input capture context writes, the session thread reads. Mask and
//! pause flag live in one atomic word so a reader never sees a torn pair.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

const MASK_BITS: u32 = 0xFFFF;
const PAUSE_BIT: u32 = 1 << 16;

/// Cloneable handle to the local input word.
#[derive(Debug, Clone, Default)]
pub struct InputHandle {
    word: Arc<AtomicU32>,
}

impl InputHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the 16-bit button mask, keeping the pause flag.
    pub fn set_mask(&self, mask: u16) {
        let _ = self
            .word
            .fetch_update(Ordering::Release, Ordering::Acquire, |word| {
                Some((word & PAUSE_BIT) | mask as u32)
            });
    }

    /// Pause or resume. While paused only keepalives are sent.
    pub fn set_paused(&self, paused: bool) {
        if paused {
            self.word.fetch_or(PAUSE_BIT, Ordering::Release);
        } else {
            self.word.fetch_and(!PAUSE_BIT, Ordering::Release);
        }
    }

    pub fn mask(&self) -> u16 {
        self.snapshot().0
    }

    pub fn is_paused(&self) -> bool {
        self.snapshot().1
    }

    /// `(mask, paused)` read in one load.
    pub fn snapshot(&self) -> (u16, bool) {
        let word = self.word.load(Ordering::Acquire);
        ((word & MASK_BITS) as u16, word & PAUSE_BIT != 0)
    }
}
