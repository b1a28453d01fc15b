//! STUN command - discover the public UDP endpoint

use std::time::Duration;

use anyhow::{Result, bail};
use clap::Args;
use lockstep_core::net::discover_public_endpoint;

/// Arguments for the stun command
#[derive(Args)]
pub struct StunArgs {
    /// Local UDP port to query from (0 picks any)
    #[arg(short, long, default_value = "0")]
    pub port: u16,

    /// Per-server response timeout in milliseconds
    #[arg(long, default_value = "1500")]
    pub timeout_ms: u64,
}

/// Execute the stun command
pub fn execute(args: StunArgs) -> Result<()> {
    let timeout = Duration::from_millis(args.timeout_ms);
    match discover_public_endpoint(args.port, timeout) {
        Some(endpoint) => {
            println!("{endpoint}");
            Ok(())
        }
        None => bail!("No STUN server answered"),
    }
}
