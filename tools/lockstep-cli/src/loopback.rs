//! Loopback command - two peers on one machine
//!
//! Spawns a Host and a Joiner on 127.0.0.1, drives both with scripted input,
//! and checks afterwards that every frame both simulated produced the same
//! work memory and that save memory reached the Joiner.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Args;
use lockstep_core::{
    LockstepSession, NoSaveStorage, SessionRunner, SimulationEngine,
};
use lockstep_shared::NetplaySettings;

use crate::demo::{DemoEngine, InputBot};
use crate::log_event;

/// Arguments for the loopback command
#[derive(Args)]
pub struct LoopbackArgs {
    /// Frames both peers must simulate
    #[arg(long, default_value = "600")]
    pub frames: u32,

    /// Input delay in frames
    #[arg(long, default_value = "5")]
    pub input_delay: u32,

    /// Give up after this many seconds
    #[arg(long, default_value = "30")]
    pub timeout_secs: u64,
}

/// Index of the first frame whose work memory differs.
fn first_divergence(a: &[u32], b: &[u32]) -> Option<usize> {
    a.iter().zip(b).position(|(x, y)| x != y)
}

/// Execute the loopback command
pub fn execute(args: LoopbackArgs) -> Result<()> {
    let mut host_settings = NetplaySettings::host(0);
    host_settings.tuning.input_delay = args.input_delay;

    let mut host = LockstepSession::new();
    host.start(&host_settings, Box::new(NoSaveStorage))
        .context("Failed to start host")?;
    let port = host
        .local_addr()
        .context("Host has no local address")?
        .port();

    let mut joiner_settings = NetplaySettings::join(0, "127.0.0.1", port);
    joiner_settings.tuning.input_delay = args.input_delay;
    let mut joiner = LockstepSession::new();
    joiner
        .start(&joiner_settings, Box::new(NoSaveStorage))
        .context("Failed to start joiner")?;

    tracing::info!(port, frames = args.frames, "Loopback session started");

    let host = SessionRunner::spawn(host, DemoEngine::new()).context("Failed to spawn host")?;
    let joiner =
        SessionRunner::spawn(joiner, DemoEngine::new()).context("Failed to spawn joiner")?;

    let host_input = host.input_handle();
    let joiner_input = joiner.input_handle();
    let mut host_bot = InputBot::new(1);
    let mut joiner_bot = InputBot::new(2);

    let deadline = Instant::now() + Duration::from_secs(args.timeout_secs);
    while host.local_frame() < args.frames || joiner.local_frame() < args.frames {
        if Instant::now() >= deadline {
            bail!(
                "Timed out at host frame {} / joiner frame {}",
                host.local_frame(),
                joiner.local_frame()
            );
        }
        for event in host.drain_events() {
            log_event("host", &event);
        }
        for event in joiner.drain_events() {
            log_event("joiner", &event);
        }
        host_input.set_mask(host_bot.mask(host.local_frame()));
        joiner_input.set_mask(joiner_bot.mask(joiner.local_frame()));
        thread::sleep(Duration::from_millis(2));
    }

    let host_engine = host.stop().context("Host thread panicked")?;
    let joiner_engine = joiner.stop().context("Joiner thread panicked")?;

    if let Some(frame) = first_divergence(host_engine.history(), joiner_engine.history()) {
        bail!("Peers diverged at frame {frame}");
    }

    let compared = host_engine.history().len().min(joiner_engine.history().len());
    let saves_match = host_engine.persistent_memory() == joiner_engine.persistent_memory();
    tracing::info!(
        frames = compared,
        high_score = host_engine.high_score(),
        saves_match,
        "Loopback passed"
    );
    println!("ok: {compared} frames identical");
    Ok(())
}
