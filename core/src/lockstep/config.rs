//! Lockstep session configuration
//!
//! [`SessionConfig`] is the validated, runtime form of
//! [`NetplaySettings`]: durations instead of milliseconds, the shared secret
//! reduced to its wire token, and every cross-field rule checked once.

use std::time::Duration;

use lockstep_shared::{NetplaySettings, PeerMode, Role};

use crate::net::MAX_CHUNK_PAYLOAD;
use crate::net::derive_token;
use crate::net::rendezvous::normalize_room_code;

/// Rejected settings
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidConfig {
    #[error("a joiner cannot auto-discover its peer; configure a static or rendezvous peer")]
    JoinerCannotDiscover,

    #[error("input delay {delay} must be smaller than the ring size {ring}")]
    InputDelayTooLarge { delay: u32, ring: u32 },

    #[error("resend window {window} must be between 1 and the ring size {ring}")]
    ResendWindow { window: u32, ring: u32 },

    #[error("chunk size {0} must be between 1 and {MAX_CHUNK_PAYLOAD}")]
    ChunkSize(u16),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("rendezvous room code must be 8-12 alphanumeric characters")]
    RoomCode,
}

/// Validated session parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub role: Role,
    pub local_port: u16,
    pub peer: PeerMode,
    /// Wire token, 0 when no secret is configured
    pub token: u16,
    pub sync_state_on_connect: bool,
    pub sync_save_on_connect: bool,
    pub step: Duration,
    pub input_delay: u32,
    pub resend_window: u32,
    pub ring_size: usize,
    pub chunk_size: u16,
    pub chunks_per_tick: u32,
    pub info_interval: Duration,
    pub hash_interval: u32,
    pub max_catch_up: u32,
    pub transfer_deadline: Duration,
    pub joiner_grace: Duration,
    pub resync_cooldown: Duration,
    pub resync_request_interval: Duration,
    pub rendezvous_timeout: Duration,
    pub rendezvous_resend: Duration,
    pub save_check_interval: u32,
}

impl SessionConfig {
    /// Validate settings and convert them to runtime form.
    pub fn from_settings(settings: &NetplaySettings) -> Result<Self, InvalidConfig> {
        let t = &settings.tuning;

        if settings.role == Role::Joiner && settings.peer == PeerMode::AutoDiscover {
            return Err(InvalidConfig::JoinerCannotDiscover);
        }
        if t.ring_size == 0 {
            return Err(InvalidConfig::Zero("ring_size"));
        }
        if t.input_delay >= t.ring_size {
            return Err(InvalidConfig::InputDelayTooLarge {
                delay: t.input_delay,
                ring: t.ring_size,
            });
        }
        if t.resend_window == 0 || t.resend_window > t.ring_size {
            return Err(InvalidConfig::ResendWindow {
                window: t.resend_window,
                ring: t.ring_size,
            });
        }
        if t.chunk_size == 0 || t.chunk_size as usize > MAX_CHUNK_PAYLOAD {
            return Err(InvalidConfig::ChunkSize(t.chunk_size));
        }
        if t.tick_rate == 0 {
            return Err(InvalidConfig::Zero("tick_rate"));
        }
        if t.hash_interval == 0 {
            return Err(InvalidConfig::Zero("hash_interval"));
        }
        if t.chunks_per_tick == 0 {
            return Err(InvalidConfig::Zero("chunks_per_tick"));
        }
        if t.max_catch_up == 0 {
            return Err(InvalidConfig::Zero("max_catch_up"));
        }
        if let PeerMode::Rendezvous { room_code, .. } = &settings.peer {
            normalize_room_code(room_code).map_err(|_| InvalidConfig::RoomCode)?;
        }

        Ok(Self {
            role: settings.role,
            local_port: settings.local_port,
            peer: settings.peer.clone(),
            token: derive_token(settings.shared_secret.as_deref()),
            sync_state_on_connect: settings.sync_state_on_connect,
            sync_save_on_connect: settings.sync_save_on_connect,
            step: Duration::from_secs(1) / t.tick_rate,
            input_delay: t.input_delay,
            resend_window: t.resend_window,
            ring_size: t.ring_size as usize,
            chunk_size: t.chunk_size,
            chunks_per_tick: t.chunks_per_tick,
            info_interval: Duration::from_millis(t.info_interval_ms),
            hash_interval: t.hash_interval,
            max_catch_up: t.max_catch_up,
            transfer_deadline: Duration::from_millis(t.transfer_deadline_ms),
            joiner_grace: Duration::from_millis(t.joiner_grace_ms),
            resync_cooldown: Duration::from_millis(t.resync_cooldown_ms),
            resync_request_interval: Duration::from_millis(t.resync_request_interval_ms),
            rendezvous_timeout: Duration::from_millis(t.rendezvous_timeout_ms),
            rendezvous_resend: Duration::from_millis(t.rendezvous_resend_ms),
            save_check_interval: t.save_check_interval,
        })
    }
}
