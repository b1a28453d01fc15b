//! Netplay settings shared by the session core and the launcher.
//!
//! These types describe how a lockstep session finds its peer and how the
//! protocol is tuned. They are plain serde data so they can live in the
//! `[netplay]` section of `config.toml`.

use serde::{Deserialize, Serialize};

/// Default local UDP port for lockstep sessions.
pub const DEFAULT_NETPLAY_PORT: u16 = 7000;

/// Session role, fixed for the lifetime of a session.
///
/// The Host owns the canonical simulation state and decides resyncs.
/// The Joiner receives state and may only request a resync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Host,
    Joiner,
}

impl Role {
    /// Controller port driven by this side's local input.
    ///
    /// The Host is always player 1 (port 0), the Joiner player 2 (port 1).
    pub const fn local_port_index(self) -> usize {
        match self {
            Role::Host => 0,
            Role::Joiner => 1,
        }
    }

    /// Controller port driven by the remote side's input.
    pub const fn remote_port_index(self) -> usize {
        match self {
            Role::Host => 1,
            Role::Joiner => 0,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Joiner => write!(f, "joiner"),
        }
    }
}

/// How the remote endpoint is acquired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PeerMode {
    /// Remote address resolved from configuration at start.
    Static { host: String, port: u16 },
    /// Host only: lock onto the first validly-tagged sender.
    #[default]
    AutoDiscover,
    /// Ask a rendezvous helper for the peer's observed address.
    ///
    /// If the handshake fails, the optional fallback address is used as a
    /// static peer; a Host without a fallback falls back to auto-discovery.
    Rendezvous {
        server_host: String,
        server_port: u16,
        room_code: String,
        #[serde(default)]
        fallback_host: Option<String>,
        #[serde(default)]
        fallback_port: Option<u16>,
    },
}

/// Protocol tuning parameters.
///
/// None of these values are architectural; the defaults are the values the
/// protocol was tuned with at 60 Hz.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Simulation steps per second
    pub tick_rate: u32,
    /// Frames between input capture and its simulated effect
    pub input_delay: u32,
    /// Trailing frames retransmitted with every input send
    pub resend_window: u32,
    /// Capacity of the frame-indexed ring buffers
    pub ring_size: u32,
    /// Bulk transfer chunk size in bytes
    pub chunk_size: u16,
    /// Chunks pushed per transfer per step
    pub chunks_per_tick: u32,
    /// Cadence of transfer info announcements
    pub info_interval_ms: u64,
    /// Frames between desync hashes
    pub hash_interval: u32,
    /// Maximum simulation steps executed in one tick
    pub max_catch_up: u32,
    /// Deadline for a gating transfer before it is abandoned
    pub transfer_deadline_ms: u64,
    /// Joiner wait for an initial state offer after the peer is known
    pub joiner_grace_ms: u64,
    /// Minimum time between two Host-side resync triggers
    pub resync_cooldown_ms: u64,
    /// Minimum time between two Joiner resync requests
    pub resync_request_interval_ms: u64,
    /// Overall rendezvous handshake budget
    pub rendezvous_timeout_ms: u64,
    /// Rendezvous request resend cadence
    pub rendezvous_resend_ms: u64,
    /// Frames between Host checks for changed save memory (0 disables)
    pub save_check_interval: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            input_delay: 5,
            resend_window: 16,
            ring_size: 256,
            chunk_size: 1024,
            chunks_per_tick: 6,
            info_interval_ms: 250,
            hash_interval: 60,
            max_catch_up: 60,
            transfer_deadline_ms: 10_000,
            joiner_grace_ms: 5_000,
            resync_cooldown_ms: 2_000,
            resync_request_interval_ms: 2_000,
            rendezvous_timeout_ms: 4_000,
            rendezvous_resend_ms: 250,
            save_check_interval: 300,
        }
    }
}

/// Complete netplay settings for one side of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetplaySettings {
    #[serde(default)]
    pub role: Role,
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    #[serde(default)]
    pub peer: PeerMode,
    /// Optional shared secret; when set, input and keepalive packets carry a
    /// token derived from it and mismatching packets are dropped.
    #[serde(default)]
    pub shared_secret: Option<String>,
    /// Host pushes its live state to the Joiner before simulation starts
    #[serde(default = "default_true")]
    pub sync_state_on_connect: bool,
    /// Host pushes its save memory to the Joiner before simulation starts
    #[serde(default = "default_true")]
    pub sync_save_on_connect: bool,
    #[serde(default)]
    pub tuning: Tuning,
}

impl Default for NetplaySettings {
    fn default() -> Self {
        Self {
            role: Role::Host,
            local_port: DEFAULT_NETPLAY_PORT,
            peer: PeerMode::AutoDiscover,
            shared_secret: None,
            sync_state_on_connect: true,
            sync_save_on_connect: true,
            tuning: Tuning::default(),
        }
    }
}

impl NetplaySettings {
    /// Host listening on `local_port` and discovering its peer.
    pub fn host(local_port: u16) -> Self {
        Self {
            role: Role::Host,
            local_port,
            ..Default::default()
        }
    }

    /// Joiner targeting a known host address.
    pub fn join(local_port: u16, host: impl Into<String>, port: u16) -> Self {
        Self {
            role: Role::Joiner,
            local_port,
            peer: PeerMode::Static {
                host: host.into(),
                port,
            },
            ..Default::default()
        }
    }
}

fn default_local_port() -> u16 {
    DEFAULT_NETPLAY_PORT
}

fn default_true() -> bool {
    true
}
