//! Desync detection
//!
//! Every `interval` frames both sides CRC a small deterministic memory
//! window and exchange `(frame, hash)`. A comparison only happens once both
//! hashes for the same frame exist, so a lost hash packet can never look
//! like divergence.

use std::time::{Duration, Instant};

use super::ring::FrameRing;

/// Hashes for one frame that disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub frame: u32,
    pub local: u32,
    pub remote: u32,
}

/// Hash of the deterministic memory window.
pub fn region_hash(region: &[u8]) -> u32 {
    crc32fast::hash(region)
}

#[derive(Debug)]
pub struct DesyncDetector {
    interval: u32,
    local: FrameRing<u32>,
    remote: FrameRing<u32>,
    compared: FrameRing<bool>,
    latest_local: Option<(u32, u32)>,
}

impl DesyncDetector {
    pub fn new(interval: u32, capacity: usize) -> Self {
        Self {
            interval: interval.max(1),
            local: FrameRing::new(capacity),
            remote: FrameRing::new(capacity),
            compared: FrameRing::new(capacity),
            latest_local: None,
        }
    }

    /// Whether the state after reaching `frame` gets hashed.
    pub fn is_hash_frame(&self, frame: u32) -> bool {
        frame != 0 && frame % self.interval == 0
    }

    /// Most recent local hash, resent with every input transmit.
    pub fn latest_local(&self) -> Option<(u32, u32)> {
        self.latest_local
    }

    pub fn record_local(&mut self, frame: u32, hash: u32) -> Option<Mismatch> {
        self.local.insert(frame, hash);
        self.latest_local = Some((frame, hash));
        self.compare(frame)
    }

    pub fn record_remote(&mut self, frame: u32, hash: u32) -> Option<Mismatch> {
        self.remote.insert(frame, hash);
        self.compare(frame)
    }

    fn compare(&mut self, frame: u32) -> Option<Mismatch> {
        if self.compared.contains(frame) {
            return None;
        }
        let (local, remote) = (self.local.get(frame)?, self.remote.get(frame)?);
        self.compared.insert(frame, true);

        if local == remote {
            tracing::trace!(frame, hash = local, "Desync check passed");
            return None;
        }
        Some(Mismatch {
            frame,
            local,
            remote,
        })
    }
}

/// Minimum spacing between two firings.
#[derive(Debug)]
pub struct ResyncGate {
    min_interval: Duration,
    last: Option<Instant>,
}

impl ResyncGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// Fire if the interval elapsed since the previous firing.
    pub fn try_fire(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last
            && now.duration_since(last) < self.min_interval
        {
            return false;
        }
        self.last = Some(now);
        true
    }
}
