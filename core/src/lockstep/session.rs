//! Lockstep session
//!
//! Composes the transport, input channel, both transfer channels, the desync
//! detector and the frame clock. Everything is owned by one thread: `tick()`
//! runs receive, dispatch, send and simulate in strict sequence, so nothing
//! in here needs a lock. The only cross-thread input is the [`InputHandle`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use lockstep_shared::{NetplaySettings, PeerMode, Role};

use crate::engine::{EngineError, SaveStorage, SimulationEngine};
use crate::input::InputHandle;
use crate::net::{
    Datagram, NetplaySocket, Packet, PeerObservation, PeerResolver, RendezvousClient,
    RendezvousStatus, TransferAck, TransferChunk, TransferInfo, resolve_ipv4,
};

use super::config::SessionConfig;
use super::desync::{DesyncDetector, Mismatch, ResyncGate, region_hash};
use super::events::{ConnectionStats, SessionError, SessionEvent};
use super::input_channel::InputChannel;
use super::scheduler::FrameClock;
use super::state::{Gates, SessionState, advance};
use super::transfer::{
    ChunkOutcome, InfoOutcome, TransferChannel, TransferKind, tag_state, untag_state,
};

/// Maximum number of undrained events kept; the oldest are dropped.
pub const MAX_PENDING_EVENTS: usize = 256;

/// Result of one `tick()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickOutcome {
    /// Simulation steps executed
    pub steps: u32,
    /// The tick stopped early: not ready, missing input, or paused
    pub blocked: bool,
    /// Deadline of the next step
    pub next_deadline: Option<Instant>,
}

#[derive(Debug, Default)]
struct EventQueue {
    events: VecDeque<SessionEvent>,
}

impl EventQueue {
    fn push(&mut self, event: SessionEvent) {
        if self.events.len() >= MAX_PENDING_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    fn drain(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }
}

/// State that exists only between a successful `start()` and `stop()`.
struct ActiveSession {
    config: SessionConfig,
    socket: NetplaySocket,
    resolver: PeerResolver,
    rendezvous: Option<RendezvousClient>,
    fallback: Option<SocketAddr>,
    state: SessionState,
    frame: u32,
    inputs: InputChannel,
    state_transfer: TransferChannel,
    save_transfer: TransferChannel,
    desync: DesyncDetector,
    /// Host: cooldown between resync triggers. Joiner: resync request rate.
    resync_gate: ResyncGate,
    clock: FrameClock,
    storage: Box<dyn SaveStorage>,
    peer_known_at: Option<Instant>,
    last_received: Option<Instant>,
    received_packets: u64,
    last_keepalive: Option<Instant>,
    last_save_crc: Option<u32>,
    /// Joiner: verified snapshot taken ahead of the local frame, applied on arrival
    pending_state: Option<(u32, Vec<u8>)>,
    outbox: Vec<Packet>,
    events: EventQueue,
}

/// A two-peer lockstep netplay session.
///
/// # Example
///
/// ```rust,ignore
/// let mut session = LockstepSession::new();
/// let input = session.input_handle();
/// session.start(&NetplaySettings::host(7000), Box::new(NoSaveStorage))?;
///
/// loop {
///     input.set_mask(read_buttons());
///     session.tick(&mut engine);
///     for event in session.drain_events() { /* ... */ }
/// }
/// ```
pub struct LockstepSession {
    input: InputHandle,
    active: Option<Box<ActiveSession>>,
    events: EventQueue,
}

impl Default for LockstepSession {
    fn default() -> Self {
        Self::new()
    }
}

impl LockstepSession {
    pub fn new() -> Self {
        Self {
            input: InputHandle::new(),
            active: None,
            events: EventQueue::default(),
        }
    }

    /// Handle for the input capture context.
    pub fn input_handle(&self) -> InputHandle {
        self.input.clone()
    }

    pub fn start(
        &mut self,
        settings: &NetplaySettings,
        storage: Box<dyn SaveStorage>,
    ) -> Result<(), SessionError> {
        self.start_at(settings, storage, Instant::now())
    }

    /// Start with an explicit clock reading.
    ///
    /// On error nothing is left behind: the session stays idle and the
    /// socket, if it was bound, is closed.
    pub fn start_at(
        &mut self,
        settings: &NetplaySettings,
        storage: Box<dyn SaveStorage>,
        now: Instant,
    ) -> Result<(), SessionError> {
        self.stop();

        let config = SessionConfig::from_settings(settings)?;

        let (resolver, rendezvous, fallback, initial) = match &config.peer {
            PeerMode::Static { host, port } => (
                PeerResolver::known(resolve_ipv4(host, *port)?),
                None,
                None,
                SessionState::Connecting,
            ),
            PeerMode::AutoDiscover => (
                PeerResolver::discover(),
                None,
                None,
                SessionState::Discovering,
            ),
            PeerMode::Rendezvous {
                server_host,
                server_port,
                room_code,
                fallback_host,
                fallback_port,
            } => {
                let server = resolve_ipv4(server_host, *server_port)?;
                let fallback = match (fallback_host, fallback_port) {
                    (Some(host), Some(port)) => Some(resolve_ipv4(host, *port)?),
                    _ => None,
                };
                let client = RendezvousClient::new(
                    server,
                    room_code,
                    config.rendezvous_timeout,
                    config.rendezvous_resend,
                    now,
                )?;
                (
                    PeerResolver::pending(),
                    Some(client),
                    fallback,
                    SessionState::Connecting,
                )
            }
        };

        let socket = NetplaySocket::bind(config.local_port)?;

        let role = config.role;
        let resync_interval = match role {
            Role::Host => config.resync_cooldown,
            Role::Joiner => config.resync_request_interval,
        };
        let transfer = |kind| {
            TransferChannel::for_role(
                kind,
                role,
                config.chunk_size,
                config.chunks_per_tick,
                config.info_interval,
            )
        };

        let active = ActiveSession {
            inputs: InputChannel::new(config.ring_size, config.input_delay, config.resend_window),
            state_transfer: transfer(TransferKind::State),
            save_transfer: transfer(TransferKind::Save),
            desync: DesyncDetector::new(config.hash_interval, config.ring_size),
            resync_gate: ResyncGate::new(resync_interval),
            clock: FrameClock::new(config.step, config.max_catch_up),
            socket,
            resolver,
            rendezvous,
            fallback,
            state: SessionState::Idle,
            frame: 0,
            storage,
            peer_known_at: None,
            last_received: None,
            received_packets: 0,
            last_keepalive: None,
            last_save_crc: None,
            pending_state: None,
            outbox: Vec::new(),
            events: EventQueue::default(),
            config,
        };

        tracing::info!(
            role = %active.config.role,
            port = active.socket.port(),
            peer = ?active.resolver.peer(),
            "Lockstep session started"
        );

        let mut active = Box::new(active);
        active.set_state(initial, now);
        self.active = Some(active);
        Ok(())
    }

    /// Release the transport and discard all session state. Safe at any time.
    pub fn stop(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        let from = active.state;
        for event in active.events.drain() {
            self.events.push(event);
        }
        self.events.push(SessionEvent::StateChanged {
            from,
            to: SessionState::Idle,
        });
        tracing::info!(frame = active.frame, "Lockstep session stopped");
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn tick<E: SimulationEngine + ?Sized>(&mut self, engine: &mut E) -> TickOutcome {
        self.tick_at(Instant::now(), engine)
    }

    /// Run one scheduler tick at `now`.
    pub fn tick_at<E: SimulationEngine + ?Sized>(&mut self, now: Instant, engine: &mut E) -> TickOutcome {
        match self.active.as_mut() {
            Some(active) => active.tick(now, engine, &self.input),
            None => TickOutcome::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.active
            .as_ref()
            .map_or(SessionState::Idle, |active| active.state)
    }

    /// Frames simulated so far.
    pub fn local_frame(&self) -> u32 {
        self.active.as_ref().map_or(0, |active| active.frame)
    }

    /// Duration of one simulation step, `None` while idle.
    pub fn step_duration(&self) -> Option<Duration> {
        self.active.as_ref().map(|active| active.config.step)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().and_then(|active| active.resolver.peer())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().map(|active| active.socket.local_addr())
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> ConnectionStats {
        let Some(active) = self.active.as_ref() else {
            return ConnectionStats::default();
        };
        ConnectionStats {
            state: active.state,
            local_frame: active.frame,
            peer: active.resolver.peer(),
            received_packets: active.received_packets,
            dropped_packets: active.socket.dropped(),
            last_received_age: active
                .last_received
                .map(|at| now.saturating_duration_since(at)),
            last_remote_frame: active.inputs.last_remote_frame(),
            max_remote_frame: active.inputs.max_remote_frame(),
        }
    }

    /// Take all pending events.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut events = self.events.drain();
        if let Some(active) = self.active.as_mut() {
            events.extend(active.events.drain());
        }
        events
    }
}

impl Drop for LockstepSession {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ActiveSession {
    fn tick<E: SimulationEngine + ?Sized>(
        &mut self,
        now: Instant,
        engine: &mut E,
        input: &InputHandle,
    ) -> TickOutcome {
        self.pump(now, engine);
        self.drive_rendezvous(now);

        let (mask, paused) = input.snapshot();
        let mut outcome = TickOutcome::default();
        let mut first = true;

        while outcome.steps < self.config.max_catch_up && self.clock.due_steps(now) > 0 {
            if !first {
                self.pump(now, engine);
            }
            first = false;
            self.apply_pending_state(now, engine);

            self.transmit(now, mask, paused);
            self.push_transfers(now);
            self.expire_transfers(now);
            self.update_state(now);

            if paused {
                self.clock.rebase(now);
                outcome.blocked = true;
                break;
            }

            let ready = self
                .state
                .can_simulate()
                .then(|| self.inputs.ready(self.frame))
                .flatten();
            let Some((local, remote)) = ready else {
                outcome.blocked = true;
                break;
            };

            self.step(local, remote, now, engine);
            self.clock.complete_step();
            outcome.steps += 1;
        }

        outcome.next_deadline = self.clock.next_deadline();
        outcome
    }

    // =========================================================================
    // Receive
    // =========================================================================

    fn pump<E: SimulationEngine + ?Sized>(&mut self, now: Instant, engine: &mut E) {
        while let Some((from, datagram)) = self.socket.poll() {
            match datagram {
                Datagram::Packet(packet) => self.on_packet(from, packet, now, engine),
                Datagram::Rendezvous(reply) => {
                    if let Some(client) = self.rendezvous.as_mut() {
                        client.on_reply(from, reply);
                    }
                }
            }
        }
    }

    fn token_ok(&self, token: u32) -> bool {
        self.config.token == 0 || token == self.config.token as u32
    }

    fn on_packet<E: SimulationEngine + ?Sized>(
        &mut self,
        from: SocketAddr,
        packet: Packet,
        now: Instant,
        engine: &mut E,
    ) {
        let tagged = match &packet {
            Packet::Input(input) => Some(self.token_ok(input.token as u32)),
            Packet::KeepAlive { token } => Some(self.token_ok(*token)),
            _ => None,
        };
        if tagged == Some(false) {
            tracing::trace!(%from, kind = packet.kind_name(), "Dropped packet with bad token");
            return;
        }
        let validly_tagged = tagged == Some(true);

        match self.resolver.observe(from, validly_tagged) {
            PeerObservation::Rejected => {
                tracing::trace!(%from, kind = packet.kind_name(), "Dropped packet from unknown source");
                return;
            }
            PeerObservation::Locked(addr) => {
                tracing::info!(peer = %addr, "Discovered peer");
            }
            PeerObservation::PortChanged { old, new } => {
                tracing::info!(old, new, "Peer port changed");
                self.events.push(SessionEvent::PeerPortChanged { old, new });
            }
            PeerObservation::Same => {}
        }

        if !self.state.has_peer() {
            // Only a tagged packet proves the peer is there
            if !validly_tagged {
                return;
            }
            self.on_peer_known(from, now, engine);
        }

        self.received_packets += 1;
        self.last_received = Some(now);

        match packet {
            Packet::Input(input) => self.inputs.on_remote(&input),
            Packet::Hash { frame, hash } => {
                if let Some(mismatch) = self.desync.record_remote(frame, hash) {
                    self.on_desync(mismatch, now, engine);
                }
            }
            Packet::KeepAlive { .. } => {}
            Packet::ResyncRequest { frame } => {
                if self.config.role == Role::Host {
                    tracing::debug!(frame, "Peer requested resync");
                    self.trigger_resync(now, engine);
                }
            }
            Packet::StateInfo(info) => self.on_transfer_info(TransferKind::State, info, now),
            Packet::SaveInfo(info) => self.on_transfer_info(TransferKind::Save, info, now),
            Packet::StateChunk(chunk) => {
                self.on_transfer_chunk(TransferKind::State, &chunk, now, engine)
            }
            Packet::SaveChunk(chunk) => {
                self.on_transfer_chunk(TransferKind::Save, &chunk, now, engine)
            }
            Packet::StateAck(ack) => self.on_transfer_ack(TransferKind::State, ack),
            Packet::SaveAck(ack) => self.on_transfer_ack(TransferKind::Save, ack),
        }
    }

    fn on_transfer_ack(&mut self, kind: TransferKind, ack: TransferAck) {
        let acked = self
            .channel_mut(kind)
            .sender_mut()
            .is_some_and(|sender| sender.on_ack(ack));
        if acked {
            self.events.push(SessionEvent::TransferCompleted {
                kind,
                size: ack.size,
            });
        }
    }

    fn on_peer_known<E: SimulationEngine + ?Sized>(
        &mut self,
        addr: SocketAddr,
        now: Instant,
        engine: &mut E,
    ) {
        self.peer_known_at = Some(now);
        self.set_state(SessionState::PeerKnown, now);
        self.events.push(SessionEvent::PeerConnected { addr });

        if self.config.role == Role::Host {
            self.start_initial_sync(now, engine);
        }
    }

    fn start_initial_sync<E: SimulationEngine + ?Sized>(&mut self, now: Instant, engine: &mut E) {
        if self.config.sync_state_on_connect {
            match engine.save_state() {
                Ok(snapshot) => {
                    let payload = tag_state(self.frame, &snapshot.data);
                    self.start_transfer(TransferKind::State, payload, true, now);
                }
                Err(e) => tracing::warn!(error = %e, "Could not snapshot state for initial sync"),
            }
        }

        if self.config.sync_save_on_connect {
            let memory = engine.persistent_memory();
            if !memory.is_empty() {
                self.last_save_crc = Some(crc32fast::hash(memory));
                let memory = memory.to_vec();
                self.start_transfer(TransferKind::Save, memory, true, now);
            }
        }
    }

    fn channel_mut(&mut self, kind: TransferKind) -> &mut TransferChannel {
        match kind {
            TransferKind::State => &mut self.state_transfer,
            TransferKind::Save => &mut self.save_transfer,
        }
    }

    fn start_transfer(&mut self, kind: TransferKind, payload: Vec<u8>, gating: bool, now: Instant) {
        let size = payload.len() as u32;
        let Some(sender) = self.channel_mut(kind).sender_mut() else {
            return;
        };
        match sender.start(payload, gating, now) {
            Ok(true) => self
                .events
                .push(SessionEvent::TransferStarted { kind, size, gating }),
            Ok(false) => {}
            Err(e) => tracing::warn!(%kind, error = %e, "Transfer not started"),
        }
    }

    fn on_transfer_info(&mut self, kind: TransferKind, info: TransferInfo, now: Instant) {
        let Some(receiver) = self.channel_mut(kind).receiver_mut() else {
            return;
        };
        match receiver.on_info(info, now) {
            InfoOutcome::Reack(ack) => self.send(&kind.ack_packet(ack)),
            InfoOutcome::Started if kind == TransferKind::State => {
                // A newer snapshot supersedes one still waiting for its frame
                self.pending_state = None;
            }
            _ => {}
        }
    }

    fn on_transfer_chunk<E: SimulationEngine + ?Sized>(
        &mut self,
        kind: TransferKind,
        chunk: &TransferChunk,
        now: Instant,
        engine: &mut E,
    ) {
        let Some(receiver) = self.channel_mut(kind).receiver_mut() else {
            return;
        };
        match receiver.on_chunk(chunk) {
            ChunkOutcome::Completed(payload) => self.apply_transfer(kind, payload, now, engine),
            ChunkOutcome::Progress { received, count } => {
                tracing::trace!(%kind, received, count, "Transfer progress");
            }
            ChunkOutcome::Corrupt | ChunkOutcome::Ignored => {}
        }
    }

    fn apply_transfer<E: SimulationEngine + ?Sized>(
        &mut self,
        kind: TransferKind,
        payload: Vec<u8>,
        now: Instant,
        engine: &mut E,
    ) {
        let result = match kind {
            TransferKind::State => match untag_state(payload) {
                Some((frame, snapshot)) if frame > self.frame => {
                    tracing::debug!(frame, local = self.frame, "Holding state snapshot until its frame");
                    self.pending_state = Some((frame, snapshot));
                    return;
                }
                Some((frame, snapshot)) => self.restore_state(frame, &snapshot, now, engine),
                None => Err(EngineError::LoadFailed("state payload has no frame tag".into())),
            },
            TransferKind::Save => engine.load_persistent_memory(&payload).map(|()| {
                if let Err(e) = self.storage.save(&payload) {
                    tracing::warn!(error = %e, "Failed to persist received save memory");
                }
            }),
        };
        self.finish_apply(kind, result);
    }

    /// Apply a held snapshot once the local frame reaches it.
    fn apply_pending_state<E: SimulationEngine + ?Sized>(&mut self, now: Instant, engine: &mut E) {
        if self
            .pending_state
            .as_ref()
            .is_none_or(|(frame, _)| *frame > self.frame)
        {
            return;
        }
        let Some((frame, snapshot)) = self.pending_state.take() else {
            return;
        };
        let result = self.restore_state(frame, &snapshot, now, engine);
        self.finish_apply(TransferKind::State, result);
    }

    /// Load a snapshot taken at `frame` and re-run the frames simulated since.
    ///
    /// Both input rings still hold those frames, so the replay consumes the
    /// same input pairs the Host did and lands back on the local frame.
    fn restore_state<E: SimulationEngine + ?Sized>(
        &mut self,
        frame: u32,
        snapshot: &[u8],
        now: Instant,
        engine: &mut E,
    ) -> Result<(), EngineError> {
        let resume = self.frame;
        let replay: Option<Vec<(u16, u16)>> =
            (frame..resume).map(|f| self.inputs.ready(f)).collect();
        let Some(replay) = replay else {
            return Err(EngineError::LoadFailed(format!(
                "inputs for frames {frame}..{resume} are no longer buffered"
            )));
        };

        engine.load_state(snapshot)?;
        self.frame = frame;
        for (local, remote) in replay {
            self.step(local, remote, now, engine);
        }
        if resume > frame {
            tracing::debug!(from = frame, to = resume, "Replayed frames after state load");
        }
        Ok(())
    }

    fn finish_apply(&mut self, kind: TransferKind, result: Result<(), EngineError>) {
        let frame = self.frame;
        let Some(receiver) = self.channel_mut(kind).receiver_mut() else {
            return;
        };
        match result {
            Ok(()) => {
                if let Some(ack) = receiver.mark_applied() {
                    tracing::info!(%kind, size = ack.size, frame, "Transfer applied");
                    self.send(&kind.ack_packet(ack));
                    self.events.push(SessionEvent::TransferApplied {
                        kind,
                        size: ack.size,
                    });
                }
            }
            Err(e) => {
                tracing::warn!(%kind, error = %e, "Engine rejected transfer payload");
                receiver.mark_failed();
            }
        }
    }

    // =========================================================================
    // Desync handling
    // =========================================================================

    fn on_desync<E: SimulationEngine + ?Sized>(&mut self, mismatch: Mismatch, now: Instant, engine: &mut E) {
        tracing::warn!(
            frame = mismatch.frame,
            local = format_args!("{:08x}", mismatch.local),
            remote = format_args!("{:08x}", mismatch.remote),
            "Desync detected"
        );
        self.events.push(SessionEvent::DesyncDetected {
            frame: mismatch.frame,
            local_hash: mismatch.local,
            remote_hash: mismatch.remote,
        });

        match self.config.role {
            Role::Host => self.trigger_resync(now, engine),
            Role::Joiner => {
                if self.resync_gate.try_fire(now) {
                    self.send(&Packet::ResyncRequest {
                        frame: mismatch.frame,
                    });
                    self.events.push(SessionEvent::ResyncRequested {
                        frame: mismatch.frame,
                    });
                }
            }
        }
    }

    /// Host: push a fresh state snapshot unless one is in flight or the
    /// cooldown is running.
    fn trigger_resync<E: SimulationEngine + ?Sized>(&mut self, now: Instant, engine: &mut E) {
        if !self.state.can_simulate() || self.state_transfer.is_active() {
            return;
        }
        if !self.resync_gate.try_fire(now) {
            tracing::debug!("Resync suppressed by cooldown");
            return;
        }
        match engine.save_state() {
            Ok(snapshot) => {
                tracing::debug!(frame = self.frame, size = snapshot.len(), "Scheduling resync");
                let payload = tag_state(self.frame, &snapshot.data);
                self.start_transfer(TransferKind::State, payload, true, now);
                self.update_state(now);
            }
            Err(e) => tracing::warn!(error = %e, "Could not snapshot state for resync"),
        }
    }

    // =========================================================================
    // Send
    // =========================================================================

    fn send(&self, packet: &Packet) {
        if let Some(peer) = self.resolver.peer() {
            self.socket.send_packet(peer, packet);
        }
    }

    fn transmit(&mut self, now: Instant, mask: u16, paused: bool) {
        if !paused {
            self.inputs.record_local(self.frame, mask);
        }
        let Some(peer) = self.resolver.peer() else {
            return;
        };
        let token = self.config.token;

        if paused {
            let due = self
                .last_keepalive
                .is_none_or(|at| now.duration_since(at) >= self.config.step);
            if due {
                self.last_keepalive = Some(now);
                self.socket.send_packet(peer, &Packet::KeepAlive { token: token as u32 });
            }
            return;
        }

        if !self.inputs.transmit_due(now, self.config.step) {
            return;
        }
        for input in self.inputs.window_packets(token) {
            self.socket.send_packet(peer, &Packet::Input(input));
        }
        if let Some((frame, hash)) = self.desync.latest_local() {
            self.socket.send_packet(peer, &Packet::Hash { frame, hash });
        }
    }

    fn push_transfers(&mut self, now: Instant) {
        if !self.state.has_peer() {
            return;
        }
        let mut outbox = std::mem::take(&mut self.outbox);
        outbox.clear();
        self.state_transfer.poll(now, &mut outbox);
        self.save_transfer.poll(now, &mut outbox);
        for packet in &outbox {
            self.send(packet);
        }
        self.outbox = outbox;
    }

    fn expire_transfers(&mut self, now: Instant) {
        let deadline = self.config.transfer_deadline;
        for kind in [TransferKind::State, TransferKind::Save] {
            if let Some(info) = self.channel_mut(kind).expire(now, deadline) {
                if kind == TransferKind::State {
                    self.pending_state = None;
                }
                self.events.push(SessionEvent::TransferAbandoned {
                    kind,
                    size: info.size,
                });
            }
        }
    }

    // =========================================================================
    // State machine
    // =========================================================================

    fn set_state(&mut self, to: SessionState, now: Instant) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        tracing::info!(%from, %to, frame = self.frame, "Session state changed");
        self.events.push(SessionEvent::StateChanged { from, to });

        if to == SessionState::Ready && !from.can_simulate() {
            self.clock.rebase(now);
        }
    }

    fn update_state(&mut self, now: Instant) {
        let offers_seen = |channel: &mut TransferChannel| {
            channel
                .receiver_mut()
                .map_or(0, |receiver| receiver.offers_seen())
        };
        let offer_seen =
            offers_seen(&mut self.state_transfer) + offers_seen(&mut self.save_transfer) > 0;

        let gates = Gates {
            gating_pending: self.state_transfer.gating_pending()
                || self.save_transfer.gating_pending(),
            state_transfer_active: self.state_transfer.is_active(),
            offer_seen,
            grace_elapsed: self
                .peer_known_at
                .is_some_and(|at| now.duration_since(at) >= self.config.joiner_grace),
        };

        let next = advance(self.state, self.config.role, gates);
        self.set_state(next, now);
    }

    fn drive_rendezvous(&mut self, now: Instant) {
        let Some(client) = self.rendezvous.as_mut() else {
            return;
        };
        match client.poll(&self.socket, now) {
            RendezvousStatus::Pending => {}
            RendezvousStatus::Resolved(peer) => {
                self.rendezvous = None;
                self.resolver.set_peer(peer);
                self.events.push(SessionEvent::RendezvousResolved { peer });
            }
            RendezvousStatus::Failed(err) => {
                self.rendezvous = None;
                tracing::warn!(error = %err, "Rendezvous failed");
                self.events.push(SessionEvent::RendezvousFailed {
                    reason: err.to_string(),
                });

                if let Some(addr) = self.fallback {
                    tracing::info!(peer = %addr, "Using fallback peer address");
                    self.resolver.set_peer(addr);
                } else if self.config.role == Role::Host {
                    tracing::info!("Falling back to peer discovery");
                    self.resolver.start_discovery();
                    self.set_state(SessionState::Discovering, now);
                }
            }
        }
    }

    // =========================================================================
    // Simulate
    // =========================================================================

    fn step<E: SimulationEngine + ?Sized>(&mut self, local: u16, remote: u16, now: Instant, engine: &mut E) {
        let role = self.config.role;
        engine.set_input_mask(role.local_port_index(), local);
        engine.set_input_mask(role.remote_port_index(), remote);
        engine.advance_frame();
        self.frame += 1;

        if self.desync.is_hash_frame(self.frame) {
            let hash = region_hash(engine.hashable_region());
            self.send(&Packet::Hash {
                frame: self.frame,
                hash,
            });
            if let Some(mismatch) = self.desync.record_local(self.frame, hash) {
                self.on_desync(mismatch, now, engine);
            }
        }

        let interval = self.config.save_check_interval;
        if role == Role::Host && interval > 0 && self.frame % interval == 0 {
            self.propagate_save_memory(now, engine);
        }
    }

    /// Host: push save memory when it changed since the last push.
    fn propagate_save_memory<E: SimulationEngine + ?Sized>(&mut self, now: Instant, engine: &mut E) {
        if self.save_transfer.is_active() {
            return;
        }
        let memory = engine.persistent_memory();
        if memory.is_empty() {
            return;
        }
        let crc = crc32fast::hash(memory);
        if self.last_save_crc == Some(crc) {
            return;
        }
        self.last_save_crc = Some(crc);
        let memory = memory.to_vec();
        tracing::debug!(frame = self.frame, size = memory.len(), "Save memory changed, propagating");
        self.start_transfer(TransferKind::Save, memory, false, now);
    }
}
