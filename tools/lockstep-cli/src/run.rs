//! Run command - demo simulation against a remote peer
//!
//! Settings come from `config.toml`, then command-line overrides. The session
//! runs on its own thread; this thread feeds scripted input and logs events.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, ValueEnum};
use lockstep_core::{LockstepSession, SaveFile, SaveStorage, SessionRunner, SimulationEngine};
use lockstep_shared::{AppConfig, NetplaySettings, PeerMode, Role};

use crate::demo::{DemoEngine, InputBot};
use crate::{log_event, parse_endpoint};

const SAVE_NAME: &str = "demo";
const POLL_INTERVAL: Duration = Duration::from_millis(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RoleArg {
    Host,
    Joiner,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Host => Role::Host,
            RoleArg::Joiner => Role::Joiner,
        }
    }
}

/// Arguments for the run command
#[derive(Args)]
pub struct RunArgs {
    /// Path to config.toml (defaults to the platform config directory)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Session role (overrides the config file)
    #[arg(long, value_enum)]
    pub role: Option<RoleArg>,

    /// Join a host directly at HOST:PORT (implies --role joiner)
    #[arg(long, value_name = "HOST:PORT", conflicts_with = "rendezvous")]
    pub join: Option<String>,

    /// Rendezvous helper at HOST:PORT
    #[arg(long, value_name = "HOST:PORT", requires = "room")]
    pub rendezvous: Option<String>,

    /// Rendezvous room code (8-12 letters or digits)
    #[arg(long)]
    pub room: Option<String>,

    /// Local UDP port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Shared secret both peers must agree on
    #[arg(long)]
    pub secret: Option<String>,

    /// Input delay in frames
    #[arg(long)]
    pub input_delay: Option<u32>,

    /// Stop after this many simulated frames
    #[arg(long, default_value = "3600")]
    pub frames: u32,
}

/// Apply command-line overrides on top of the configured settings.
fn apply_overrides(mut settings: NetplaySettings, args: &RunArgs) -> Result<NetplaySettings> {
    if let Some(role) = args.role {
        settings.role = role.into();
    }
    if let Some(port) = args.port {
        settings.local_port = port;
    }
    if let Some(secret) = &args.secret {
        settings.shared_secret = Some(secret.clone());
    }
    if let Some(delay) = args.input_delay {
        settings.tuning.input_delay = delay;
    }

    if let Some(target) = &args.join {
        let (host, port) = parse_endpoint(target)?;
        settings.role = Role::Joiner;
        settings.peer = PeerMode::Static { host, port };
    } else if let Some(helper) = &args.rendezvous {
        let (server_host, server_port) = parse_endpoint(helper)?;
        settings.peer = PeerMode::Rendezvous {
            server_host,
            server_port,
            room_code: args.room.clone().unwrap_or_default(),
            fallback_host: None,
            fallback_port: None,
        };
    } else if settings.role == Role::Host && args.role.is_some() {
        settings.peer = PeerMode::AutoDiscover;
    }

    Ok(settings)
}

/// Execute the run command
pub fn execute(args: RunArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .context("Failed to load configuration")?;

    let settings = apply_overrides(config.netplay.clone(), &args)?;

    let mut engine = DemoEngine::new();
    let mut storage = match config.save_dir() {
        Some(dir) => Some(SaveFile::in_dir(&dir, SAVE_NAME)),
        None => {
            tracing::warn!("No save directory available, save memory will not persist");
            None
        }
    };
    if let Some(file) = storage.as_mut()
        && let Some(data) = file.load().context("Failed to read save file")?
    {
        if let Err(e) = engine.load_persistent_memory(&data) {
            tracing::warn!(error = %e, "Ignoring incompatible save file");
        }
    }

    let mut session = LockstepSession::new();
    let storage: Box<dyn SaveStorage> = match storage {
        Some(file) => Box::new(file),
        None => Box::new(lockstep_core::NoSaveStorage),
    };
    session
        .start(&settings, storage)
        .context("Failed to start netplay session")?;

    tracing::info!(
        role = %settings.role,
        local = ?session.local_addr(),
        peer = %session.stats().peer_endpoint(),
        "Session started"
    );

    let runner = SessionRunner::spawn(session, engine).context("Failed to spawn session thread")?;
    let input = runner.input_handle();
    let mut bot = InputBot::new(settings.role.local_port_index() as u32 + 1);
    let label = settings.role.to_string();

    loop {
        for event in runner.drain_events() {
            log_event(&label, &event);
        }
        let frame = runner.local_frame();
        if frame >= args.frames {
            break;
        }
        if !runner.is_running() {
            bail!("Session thread exited unexpectedly");
        }
        input.set_mask(bot.mask(frame));
        thread::sleep(POLL_INTERVAL);
    }

    let remote = runner.last_remote_frame();
    let engine = runner.stop().context("Session thread panicked")?;
    tracing::info!(
        frames = engine.frame(),
        last_remote_frame = ?remote,
        high_score = engine.high_score(),
        digest = format_args!("{:08x}", engine.history().last().copied().unwrap_or(0)),
        "Session finished"
    );
    Ok(())
}
