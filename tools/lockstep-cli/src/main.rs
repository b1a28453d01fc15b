//! Lockstep CLI - Run and test lockstep netplay sessions
//!
//! # Commands
//!
//! - `lockstep run` - Run the demo simulation against a remote peer
//! - `lockstep loopback` - Two peers on 127.0.0.1, verify they stay in lockstep
//! - `lockstep stun` - Discover this machine's public UDP endpoint
//! - `lockstep config` - Print or write the effective configuration
//!
//! # Usage
//!
//! ```bash
//! # Host on the configured port and wait for a peer
//! lockstep run --role host
//!
//! # Join a host directly
//! lockstep run --join 203.0.113.7:7000
//!
//! # Meet through a rendezvous helper
//! lockstep run --role joiner --rendezvous helper.example.net:7100 --room ABCD1234
//! ```
//!
//! Logging follows `RUST_LOG` (default `info`).

mod config;
mod demo;
mod loopback;
mod run;
mod stun;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lockstep_core::SessionEvent;

/// Lockstep CLI - Run and test lockstep netplay sessions
#[derive(Parser)]
#[command(name = "lockstep")]
#[command(about = "Run and test deterministic lockstep netplay sessions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo simulation against a remote peer
    Run(run::RunArgs),

    /// Run two peers over loopback and verify identical simulation
    Loopback(loopback::LoopbackArgs),

    /// Discover the public UDP endpoint via STUN
    Stun(stun::StunArgs),

    /// Print or write the effective configuration
    Config(config::ConfigArgs),
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run::execute(args),
        Commands::Loopback(args) => loopback::execute(args),
        Commands::Stun(args) => stun::execute(args),
        Commands::Config(args) => config::execute(args),
    }
}

/// Split `host:port`.
pub(crate) fn parse_endpoint(value: &str) -> Result<(String, u16)> {
    let (host, port) = value
        .rsplit_once(':')
        .with_context(|| format!("expected HOST:PORT, got '{value}'"))?;
    let port = port
        .parse()
        .with_context(|| format!("invalid port in '{value}'"))?;
    Ok((host.to_string(), port))
}

/// Log a session event at a level matching its severity.
pub(crate) fn log_event(peer: &str, event: &SessionEvent) {
    match event {
        SessionEvent::DesyncDetected {
            frame,
            local_hash,
            remote_hash,
        } => tracing::warn!(
            peer,
            frame,
            local = format_args!("{local_hash:08x}"),
            remote = format_args!("{remote_hash:08x}"),
            "Desync"
        ),
        SessionEvent::TransferAbandoned { kind, size } => {
            tracing::warn!(peer, %kind, size, "Transfer abandoned")
        }
        SessionEvent::RendezvousFailed { reason } => {
            tracing::warn!(peer, reason = %reason, "Rendezvous failed")
        }
        other => tracing::info!(peer, event = ?other, "Session event"),
    }
}
