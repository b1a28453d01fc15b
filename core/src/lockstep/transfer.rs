//! Chunked bulk transfer
//!
//! One mechanism for both payload kinds (full state, save memory). The Host
//! side pushes: it announces `(size, crc, chunk_size, chunk_count)` on a
//! fixed cadence and bursts a few chunks per step in round-robin order until
//! the peer acks. The Joiner side is passive: it fills a have-bitmap, checks
//! the CRC once every chunk is in, and acks only after the payload was
//! applied. There is no NACK; blind round-robin resend covers gaps.

use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use lockstep_shared::Role;

use crate::net::packet::{
    INFO_FLAG_GATING, Packet, TransferAck, TransferChunk, TransferInfo,
};

/// Upper bound on an announced payload the receiver will allocate for.
pub const MAX_TRANSFER_SIZE: u32 = 64 * 1024 * 1024;

/// Bytes of the frame tag in front of a state snapshot.
pub const STATE_FRAME_TAG: usize = 4;

/// Prefix `snapshot` with the frame it was taken at.
pub fn tag_state(frame: u32, snapshot: &[u8]) -> Vec<u8> {
    let mut payload = vec![0u8; STATE_FRAME_TAG];
    BigEndian::write_u32(&mut payload, frame);
    payload.extend_from_slice(snapshot);
    payload
}

/// Split a received state payload into `(frame, snapshot)`.
pub fn untag_state(mut payload: Vec<u8>) -> Option<(u32, Vec<u8>)> {
    if payload.len() < STATE_FRAME_TAG {
        return None;
    }
    let frame = BigEndian::read_u32(&payload[..STATE_FRAME_TAG]);
    payload.drain(..STATE_FRAME_TAG);
    Some((frame, payload))
}

/// Which payload a transfer carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    /// Full simulation state snapshot
    State,
    /// Persistent save memory image
    Save,
}

impl TransferKind {
    pub fn name(self) -> &'static str {
        match self {
            TransferKind::State => "state",
            TransferKind::Save => "save",
        }
    }

    fn info_packet(self, info: TransferInfo) -> Packet {
        match self {
            TransferKind::State => Packet::StateInfo(info),
            TransferKind::Save => Packet::SaveInfo(info),
        }
    }

    fn chunk_packet(self, chunk: TransferChunk) -> Packet {
        match self {
            TransferKind::State => Packet::StateChunk(chunk),
            TransferKind::Save => Packet::SaveChunk(chunk),
        }
    }

    pub fn ack_packet(self, ack: TransferAck) -> Packet {
        match self {
            TransferKind::State => Packet::StateAck(ack),
            TransferKind::Save => Packet::SaveAck(ack),
        }
    }
}

impl std::fmt::Display for TransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Transfer start failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("refusing to transfer an empty payload")]
    Empty,

    #[error("payload of {size} bytes exceeds the {max} byte transfer limit")]
    TooLarge { size: usize, max: usize },
}

// =============================================================================
// Sender
// =============================================================================

#[derive(Debug)]
struct OutgoingJob {
    payload: Vec<u8>,
    info: TransferInfo,
    cursor: u16,
    next_info: Instant,
    started: Instant,
    acked: bool,
}

impl OutgoingJob {
    fn chunk(&self, index: u16, chunk_size: usize) -> TransferChunk {
        let start = index as usize * chunk_size;
        let end = (start + chunk_size).min(self.payload.len());
        TransferChunk {
            index,
            chunk_count: self.info.chunk_count,
            payload: self.payload[start..end].to_vec(),
        }
    }
}

/// Push side of a transfer (Host).
#[derive(Debug)]
pub struct TransferSender {
    kind: TransferKind,
    chunk_size: u16,
    chunks_per_tick: u32,
    info_interval: Duration,
    job: Option<OutgoingJob>,
}

impl TransferSender {
    pub fn new(
        kind: TransferKind,
        chunk_size: u16,
        chunks_per_tick: u32,
        info_interval: Duration,
    ) -> Self {
        Self {
            kind,
            chunk_size: chunk_size.max(1),
            chunks_per_tick: chunks_per_tick.max(1),
            info_interval,
            job: None,
        }
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    /// Announcement of the current job, acked or not.
    pub fn info(&self) -> Option<TransferInfo> {
        self.job.as_ref().map(|job| job.info)
    }

    /// A job is still being pushed.
    pub fn is_active(&self) -> bool {
        self.job.as_ref().is_some_and(|job| !job.acked)
    }

    /// An unacknowledged gating job exists.
    pub fn gating_pending(&self) -> bool {
        self.job
            .as_ref()
            .is_some_and(|job| !job.acked && job.info.is_gating())
    }

    /// Start pushing `payload`.
    ///
    /// Returns `Ok(false)` when an unacknowledged job with the same size and
    /// CRC is already running; that job absorbs the request.
    pub fn start(&mut self, payload: Vec<u8>, gating: bool, now: Instant) -> Result<bool, TransferError> {
        if payload.is_empty() {
            return Err(TransferError::Empty);
        }

        let chunk_size = self.chunk_size as usize;
        let max = (chunk_size * u16::MAX as usize).min(MAX_TRANSFER_SIZE as usize);
        if payload.len() > max {
            return Err(TransferError::TooLarge {
                size: payload.len(),
                max,
            });
        }

        let size = payload.len() as u32;
        let crc = crc32fast::hash(&payload);

        if let Some(job) = &mut self.job
            && !job.acked
            && job.info.size == size
            && job.info.crc == crc
        {
            if gating {
                job.info.flags |= INFO_FLAG_GATING;
            }
            tracing::trace!(kind = %self.kind, size, crc, "Transfer already in flight");
            return Ok(false);
        }

        let info = TransferInfo {
            size,
            crc,
            chunk_size: self.chunk_size,
            chunk_count: payload.len().div_ceil(chunk_size) as u16,
            flags: if gating { INFO_FLAG_GATING } else { 0 },
        };

        tracing::debug!(
            kind = %self.kind,
            size,
            crc = format_args!("{crc:08x}"),
            chunks = info.chunk_count,
            gating,
            "Transfer started"
        );

        self.job = Some(OutgoingJob {
            payload,
            info,
            cursor: 0,
            next_info: now,
            started: now,
            acked: false,
        });
        Ok(true)
    }

    /// Queue the info announcement (when due) and one chunk burst.
    pub fn poll(&mut self, now: Instant, out: &mut Vec<Packet>) {
        let chunk_size = self.chunk_size as usize;
        let Some(job) = self.job.as_mut().filter(|job| !job.acked) else {
            return;
        };

        if now >= job.next_info {
            out.push(self.kind.info_packet(job.info));
            job.next_info = now + self.info_interval;
        }

        let count = job.info.chunk_count;
        let burst = self.chunks_per_tick.min(count as u32);
        for _ in 0..burst {
            let chunk = job.chunk(job.cursor, chunk_size);
            out.push(self.kind.chunk_packet(chunk));
            job.cursor = (job.cursor + 1) % count;
        }
    }

    /// Handle a peer ack. Returns true when it acknowledged the current job.
    pub fn on_ack(&mut self, ack: TransferAck) -> bool {
        match &mut self.job {
            Some(job) if !job.acked && job.info.size == ack.size && job.info.crc == ack.crc => {
                job.acked = true;
                tracing::info!(kind = %self.kind, size = ack.size, "Transfer acknowledged");
                true
            }
            _ => false,
        }
    }

    /// Abandon an unacknowledged job older than `deadline`.
    pub fn expire(&mut self, now: Instant, deadline: Duration) -> Option<TransferInfo> {
        let job = self.job.as_ref()?;
        if job.acked || now.duration_since(job.started) < deadline {
            return None;
        }
        let info = job.info;
        self.job = None;
        tracing::warn!(kind = %self.kind, size = info.size, "Transfer abandoned, peer never acknowledged");
        Some(info)
    }
}

// =============================================================================
// Receiver
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvPhase {
    Receiving,
    /// Complete and verified, waiting for the apply result
    Applying,
    Applied,
    /// Engine rejected the payload; stays unacked until abandoned
    Failed,
    Abandoned,
}

#[derive(Debug)]
struct IncomingJob {
    info: TransferInfo,
    buf: Vec<u8>,
    have: Vec<bool>,
    received: u16,
    started: Instant,
    phase: RecvPhase,
}

/// Result of an info announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoOutcome {
    /// New job allocated
    Started,
    /// Repeat of the job in progress
    Duplicate,
    /// Repeat of an already applied job; send this ack again
    Reack(TransferAck),
    /// Inconsistent or oversized announcement
    Rejected,
}

/// Result of a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Stale, out of range, wrong length, duplicate, or no job receiving
    Ignored,
    Progress { received: u16, count: u16 },
    /// All chunks in and CRC verified; apply and report back
    Completed(Vec<u8>),
    /// All chunks in but CRC mismatched; bitmap reset
    Corrupt,
}

/// Passive receive side of a transfer (Joiner).
#[derive(Debug)]
pub struct TransferReceiver {
    kind: TransferKind,
    job: Option<IncomingJob>,
    offers_seen: u32,
}

impl TransferReceiver {
    pub fn new(kind: TransferKind) -> Self {
        Self {
            kind,
            job: None,
            offers_seen: 0,
        }
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    /// Number of distinct announcements accepted so far.
    pub fn offers_seen(&self) -> u32 {
        self.offers_seen
    }

    /// Chunks received of the active job.
    pub fn progress(&self) -> Option<(u16, u16)> {
        self.job
            .as_ref()
            .map(|job| (job.received, job.info.chunk_count))
    }

    /// A job is in progress (receiving, applying, or failed and not yet abandoned).
    pub fn is_active(&self) -> bool {
        self.job.as_ref().is_some_and(|job| {
            matches!(
                job.phase,
                RecvPhase::Receiving | RecvPhase::Applying | RecvPhase::Failed
            )
        })
    }

    pub fn gating_pending(&self) -> bool {
        self.is_active() && self.job.as_ref().is_some_and(|job| job.info.is_gating())
    }

    pub fn on_info(&mut self, info: TransferInfo, now: Instant) -> InfoOutcome {
        if info.size == 0 || info.size > MAX_TRANSFER_SIZE || !info.is_consistent() {
            tracing::trace!(kind = %self.kind, ?info, "Rejected transfer announcement");
            return InfoOutcome::Rejected;
        }

        if let Some(job) = &self.job
            && job.info.size == info.size
            && job.info.crc == info.crc
        {
            return match job.phase {
                RecvPhase::Applied => InfoOutcome::Reack(TransferAck {
                    size: info.size,
                    crc: info.crc,
                }),
                _ => InfoOutcome::Duplicate,
            };
        }

        tracing::debug!(
            kind = %self.kind,
            size = info.size,
            chunks = info.chunk_count,
            gating = info.is_gating(),
            "Receiving transfer"
        );

        self.offers_seen += 1;
        self.job = Some(IncomingJob {
            info,
            buf: vec![0u8; info.size as usize],
            have: vec![false; info.chunk_count as usize],
            received: 0,
            started: now,
            phase: RecvPhase::Receiving,
        });
        InfoOutcome::Started
    }

    pub fn on_chunk(&mut self, chunk: &TransferChunk) -> ChunkOutcome {
        let kind = self.kind;
        let Some(job) = self.job.as_mut() else {
            return ChunkOutcome::Ignored;
        };
        if job.phase != RecvPhase::Receiving {
            return ChunkOutcome::Ignored;
        }

        let info = job.info;
        if chunk.chunk_count != info.chunk_count || chunk.index >= info.chunk_count {
            tracing::trace!(%kind, index = chunk.index, count = chunk.chunk_count, "Stale chunk");
            return ChunkOutcome::Ignored;
        }

        let chunk_size = info.chunk_size as usize;
        let start = chunk.index as usize * chunk_size;
        let expected = (info.size as usize - start).min(chunk_size);
        if chunk.payload.len() != expected || job.have[chunk.index as usize] {
            return ChunkOutcome::Ignored;
        }

        job.buf[start..start + expected].copy_from_slice(&chunk.payload);
        job.have[chunk.index as usize] = true;
        job.received += 1;

        if job.received < info.chunk_count {
            return ChunkOutcome::Progress {
                received: job.received,
                count: info.chunk_count,
            };
        }

        if crc32fast::hash(&job.buf) != info.crc {
            tracing::debug!(%kind, size = info.size, "Reassembled payload failed CRC, restarting");
            job.have.fill(false);
            job.received = 0;
            return ChunkOutcome::Corrupt;
        }

        job.phase = RecvPhase::Applying;
        ChunkOutcome::Completed(std::mem::take(&mut job.buf))
    }

    /// Payload applied; returns the ack to send.
    pub fn mark_applied(&mut self) -> Option<TransferAck> {
        let job = self.job.as_mut().filter(|job| job.phase == RecvPhase::Applying)?;
        job.phase = RecvPhase::Applied;
        Some(TransferAck {
            size: job.info.size,
            crc: job.info.crc,
        })
    }

    /// Payload rejected by the engine; the job stays unacked.
    pub fn mark_failed(&mut self) {
        if let Some(job) = self.job.as_mut().filter(|job| job.phase == RecvPhase::Applying) {
            job.phase = RecvPhase::Failed;
        }
    }

    /// Abandon an active job older than `deadline`.
    pub fn expire(&mut self, now: Instant, deadline: Duration) -> Option<TransferInfo> {
        let job = self.job.as_mut()?;
        let active = matches!(
            job.phase,
            RecvPhase::Receiving | RecvPhase::Applying | RecvPhase::Failed
        );
        if !active || now.duration_since(job.started) < deadline {
            return None;
        }
        job.phase = RecvPhase::Abandoned;
        job.buf = Vec::new();
        tracing::warn!(kind = %self.kind, size = job.info.size, "Transfer abandoned before completion");
        Some(job.info)
    }
}

// =============================================================================
// Role-bound channel
// =============================================================================

/// One payload kind, bound to the local role: Host pushes, Joiner receives.
#[derive(Debug)]
pub enum TransferChannel {
    Sender(TransferSender),
    Receiver(TransferReceiver),
}

impl TransferChannel {
    pub fn for_role(
        kind: TransferKind,
        role: Role,
        chunk_size: u16,
        chunks_per_tick: u32,
        info_interval: Duration,
    ) -> Self {
        match role {
            Role::Host => Self::Sender(TransferSender::new(
                kind,
                chunk_size,
                chunks_per_tick,
                info_interval,
            )),
            Role::Joiner => Self::Receiver(TransferReceiver::new(kind)),
        }
    }

    pub fn sender_mut(&mut self) -> Option<&mut TransferSender> {
        match self {
            Self::Sender(s) => Some(s),
            Self::Receiver(_) => None,
        }
    }

    pub fn receiver_mut(&mut self) -> Option<&mut TransferReceiver> {
        match self {
            Self::Receiver(r) => Some(r),
            Self::Sender(_) => None,
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            Self::Sender(s) => s.is_active(),
            Self::Receiver(r) => r.is_active(),
        }
    }

    pub fn gating_pending(&self) -> bool {
        match self {
            Self::Sender(s) => s.gating_pending(),
            Self::Receiver(r) => r.gating_pending(),
        }
    }

    pub fn poll(&mut self, now: Instant, out: &mut Vec<Packet>) {
        if let Self::Sender(s) = self {
            s.poll(now, out);
        }
    }

    pub fn expire(&mut self, now: Instant, deadline: Duration) -> Option<TransferInfo> {
        match self {
            Self::Sender(s) => s.expire(now, deadline),
            Self::Receiver(r) => r.expire(now, deadline),
        }
    }
}
