//! Dedicated scheduler thread
//!
//! Moves a started [`LockstepSession`] and its engine onto a named thread
//! that ticks at the session's step rate. Other threads see a small set of
//! atomics and an event channel; the engine comes back from [`SessionRunner::stop`].

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::engine::SimulationEngine;
use crate::input::InputHandle;

use super::events::SessionEvent;
use super::session::LockstepSession;
use super::state::SessionState;

const NO_FRAME: u32 = u32::MAX;
const MIN_SLEEP: Duration = Duration::from_millis(1);
const IDLE_STEP: Duration = Duration::from_millis(16);

/// Status readable from any thread.
#[derive(Debug)]
struct SharedStatus {
    state: AtomicU8,
    local_frame: AtomicU32,
    last_remote_frame: AtomicU32,
}

impl SharedStatus {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Idle.as_u8()),
            local_frame: AtomicU32::new(0),
            last_remote_frame: AtomicU32::new(NO_FRAME),
        }
    }

    fn publish(&self, session: &LockstepSession) {
        self.state.store(session.state().as_u8(), Ordering::Release);
        self.local_frame.store(session.local_frame(), Ordering::Release);
        let remote = session.stats().last_remote_frame.unwrap_or(NO_FRAME);
        self.last_remote_frame.store(remote, Ordering::Release);
    }
}

/// A lockstep session running on its own thread.
pub struct SessionRunner<E> {
    thread: Option<JoinHandle<E>>,
    stop: Arc<AtomicBool>,
    status: Arc<SharedStatus>,
    events: Receiver<SessionEvent>,
    input: InputHandle,
}

impl<E> SessionRunner<E>
where
    E: SimulationEngine + Send + 'static,
{
    /// Spawn the scheduler thread. The session should already be started.
    pub fn spawn(mut session: LockstepSession, mut engine: E) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let status = Arc::new(SharedStatus::new());
        let (tx, events) = mpsc::channel();
        let input = session.input_handle();

        let thread = {
            let stop = Arc::clone(&stop);
            let status = Arc::clone(&status);
            thread::Builder::new()
                .name("lockstep-session".into())
                .spawn(move || {
                    tracing::debug!("Scheduler thread started");
                    while !stop.load(Ordering::Acquire) {
                        let outcome = session.tick(&mut engine);
                        status.publish(&session);
                        for event in session.drain_events() {
                            // Receiver gone means nobody is listening
                            let _ = tx.send(event);
                        }

                        let step = session.step_duration().unwrap_or(IDLE_STEP);
                        let sleep = if outcome.blocked {
                            if session.state().can_simulate() {
                                MIN_SLEEP
                            } else {
                                step
                            }
                        } else {
                            outcome
                                .next_deadline
                                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                                .unwrap_or(step)
                                .clamp(MIN_SLEEP, step.max(MIN_SLEEP))
                        };
                        thread::sleep(sleep);
                    }

                    session.stop();
                    status.publish(&session);
                    for event in session.drain_events() {
                        let _ = tx.send(event);
                    }
                    tracing::debug!("Scheduler thread stopped");
                    engine
                })?
        };

        Ok(Self {
            thread: Some(thread),
            stop,
            status,
            events,
            input,
        })
    }

    /// Stop the thread and take back the engine.
    ///
    /// Returns `None` if the scheduler thread panicked.
    pub fn stop(mut self) -> Option<E> {
        self.stop.store(true, Ordering::Release);
        self.thread.take().and_then(|thread| thread.join().ok())
    }
}

impl<E> SessionRunner<E> {
    pub fn input_handle(&self) -> InputHandle {
        self.input.clone()
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.status.state.load(Ordering::Acquire))
    }

    pub fn local_frame(&self) -> u32 {
        self.status.local_frame.load(Ordering::Acquire)
    }

    pub fn last_remote_frame(&self) -> Option<u32> {
        match self.status.last_remote_frame.load(Ordering::Acquire) {
            NO_FRAME => None,
            frame => Some(frame),
        }
    }

    /// Events produced since the last call.
    pub fn drain_events(&self) -> Vec<SessionEvent> {
        self.events.try_iter().collect()
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }
}

impl<E> Drop for SessionRunner<E> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
