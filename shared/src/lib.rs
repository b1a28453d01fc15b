//! Shared types for the lockstep netplay workspace.
//!
//! - [`netplay`] - session role, peer acquisition mode and protocol tuning
//! - [`config`] - `config.toml` loading and saving

pub mod config;
pub mod netplay;

pub use config::{AppConfig, ConfigError, PathsConfig};
pub use netplay::{DEFAULT_NETPLAY_PORT, NetplaySettings, PeerMode, Role, Tuning};
