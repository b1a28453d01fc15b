//! Delayed, redundantly retransmitted input exchange
//!
//! Local input captured at frame `F` is scheduled for frame `F + delay`.
//! Each transmit resends the whole trailing window of scheduled frames, so
//! one surviving packet out of `window` repeats is enough.

use std::time::{Duration, Instant};

use crate::net::packet::InputPacket;

use super::ring::FrameRing;

#[derive(Debug)]
pub struct InputChannel {
    delay: u32,
    window: u32,
    sent: FrameRing<u16>,
    received: FrameRing<u16>,
    latest_target: Option<u32>,
    last_transmit: Option<(u32, Instant)>,
    last_remote_frame: Option<u32>,
    max_remote_frame: Option<u32>,
}

impl InputChannel {
    /// Channel with frames `0..delay` primed with an empty mask.
    pub fn new(capacity: usize, delay: u32, window: u32) -> Self {
        let mut sent = FrameRing::new(capacity);
        for frame in 0..delay {
            sent.insert(frame, 0);
        }
        Self {
            delay,
            window: window.max(1),
            sent,
            received: FrameRing::new(capacity),
            latest_target: delay.checked_sub(1),
            last_transmit: None,
            last_remote_frame: None,
            max_remote_frame: None,
        }
    }

    pub fn delay(&self) -> u32 {
        self.delay
    }

    /// Schedule `mask` captured at `frame`. Returns the target frame.
    ///
    /// A target that already has a mask keeps it: it may already be on the
    /// wire.
    pub fn record_local(&mut self, frame: u32, mask: u16) -> u32 {
        let target = frame + self.delay;
        if !self.sent.contains(target) {
            self.sent.insert(target, mask);
        }
        self.latest_target = Some(self.latest_target.map_or(target, |t| t.max(target)));
        target
    }

    pub fn on_remote(&mut self, input: &InputPacket) {
        self.received.insert(input.frame, input.mask);
        self.last_remote_frame = Some(input.frame);
        self.max_remote_frame = Some(self.max_remote_frame.map_or(input.frame, |m| m.max(input.frame)));
    }

    /// `(local, remote)` masks for `frame` when both are present.
    pub fn ready(&self, frame: u32) -> Option<(u16, u16)> {
        Some((self.sent.get(frame)?, self.received.get(frame)?))
    }

    pub fn has_remote(&self, frame: u32) -> bool {
        self.received.contains(frame)
    }

    pub fn last_remote_frame(&self) -> Option<u32> {
        self.last_remote_frame
    }

    pub fn max_remote_frame(&self) -> Option<u32> {
        self.max_remote_frame
    }

    /// Trailing window ending at the newest scheduled frame.
    pub fn window_packets(&self, token: u16) -> Vec<InputPacket> {
        let Some(target) = self.latest_target else {
            return Vec::new();
        };
        let start = target.saturating_sub(self.window - 1);
        (start..=target)
            .filter_map(|frame| {
                self.sent.get(frame).map(|mask| InputPacket {
                    frame,
                    mask,
                    token,
                })
            })
            .collect()
    }

    /// Throttle: transmit when the newest target moved or `interval` passed.
    pub fn transmit_due(&mut self, now: Instant, interval: Duration) -> bool {
        let Some(target) = self.latest_target else {
            return false;
        };
        let due = match self.last_transmit {
            Some((last_target, at)) => last_target != target || now.duration_since(at) >= interval,
            None => true,
        };
        if due {
            self.last_transmit = Some((target, now));
        }
        due
    }
}
