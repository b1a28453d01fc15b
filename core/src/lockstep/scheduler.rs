//! Fixed timestep frame clock with bounded catch-up
//!
//! The clock holds the deadline of the next step. A tick runs every step
//! whose deadline has passed, capped at `max_catch_up`. The deadline only
//! moves when a step actually executes, so a stall is recovered by running
//! more steps later rather than by dropping time.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct FrameClock {
    step: Duration,
    max_catch_up: u32,
    next: Option<Instant>,
}

impl FrameClock {
    pub fn new(step: Duration, max_catch_up: u32) -> Self {
        Self {
            step,
            max_catch_up: max_catch_up.max(1),
            next: None,
        }
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    /// Deadline of the next step, once the clock has started.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.next
    }

    /// Restart the schedule at `now`, forgetting any backlog.
    pub fn rebase(&mut self, now: Instant) {
        self.next = Some(now);
    }

    /// Steps due at `now`, capped. Starts the clock on first use.
    pub fn due_steps(&mut self, now: Instant) -> u32 {
        let next = *self.next.get_or_insert(now);
        if now < next {
            return 0;
        }
        let step_nanos = self.step.as_nanos().max(1);
        let behind = (now - next).as_nanos() / step_nanos + 1;
        behind.min(self.max_catch_up as u128) as u32
    }

    /// One step executed; move the deadline forward by exactly one step.
    pub fn complete_step(&mut self) {
        if let Some(next) = self.next.as_mut() {
            *next += self.step;
        }
    }
}
