//! End-to-end session tests over loopback UDP with a synthetic clock

use std::net::{SocketAddr, UdpSocket};
use std::time::Instant;

use lockstep_shared::{NetplaySettings, PeerMode, Role};

use super::transfer::tag_state;
use super::*;
use crate::engine::{NoSaveStorage, SaveStorage, SimulationEngine};
use crate::net::{InputPacket, Packet, TransferChunk, TransferInfo};
use crate::save_store::MemorySaveStore;
use crate::test_utils::{MockEngine, STEP, TestClock, loopback};

// ============================================================================
// Harness
// ============================================================================

struct Side {
    session: LockstepSession,
    engine: MockEngine,
    events: Vec<SessionEvent>,
}

impl Side {
    fn start(
        settings: &NetplaySettings,
        engine: MockEngine,
        storage: Box<dyn SaveStorage>,
        clock: &TestClock,
    ) -> Self {
        let mut session = LockstepSession::new();
        session
            .start_at(settings, storage, clock.now())
            .expect("session should start");
        Self {
            session,
            engine,
            events: Vec::new(),
        }
    }

    fn addr(&self) -> SocketAddr {
        loopback(self.session.local_addr().expect("bound socket").port())
    }

    fn tick(&mut self, now: Instant) -> TickOutcome {
        let outcome = self.session.tick_at(now, &mut self.engine);
        self.events.extend(self.session.drain_events());
        outcome
    }

    fn frame(&self) -> u32 {
        self.session.local_frame()
    }

    fn state(&self) -> SessionState {
        self.session.state()
    }

    fn position(&self, pred: impl Fn(&SessionEvent) -> bool) -> Option<usize> {
        self.events.iter().position(pred)
    }

    fn saw(&self, pred: impl Fn(&SessionEvent) -> bool) -> bool {
        self.position(pred).is_some()
    }
}

/// Forwards datagrams between a Joiner and a Host, dropping every Nth one.
struct LossyRelay {
    socket: UdpSocket,
    host: SocketAddr,
    joiner: Option<SocketAddr>,
    drop_every: u32,
    seen: u32,
    dropped: u32,
}

impl LossyRelay {
    fn new(host: SocketAddr, drop_every: u32) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind relay");
        socket.set_nonblocking(true).expect("nonblocking relay");
        Self {
            socket,
            host,
            joiner: None,
            drop_every,
            seen: 0,
            dropped: 0,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("relay address")
    }

    fn pump(&mut self) {
        let mut buf = [0u8; 2048];
        while let Ok((len, from)) = self.socket.recv_from(&mut buf) {
            let target = if from == self.host {
                match self.joiner {
                    Some(joiner) => joiner,
                    None => continue,
                }
            } else {
                self.joiner = Some(from);
                self.host
            };
            self.seen += 1;
            if self.seen % self.drop_every == 0 {
                self.dropped += 1;
                continue;
            }
            let _ = self.socket.send_to(&buf[..len], target);
        }
    }
}

/// Puts the Host behind a NAT whose public mapping can move.
///
/// The Joiner talks to the public side; the Host sees every packet from
/// `inside`. Host replies leave through the newest public socket, so
/// `rebind()` shows the Joiner a new source port on the same address.
struct NatRelay {
    public: Vec<UdpSocket>,
    /// Datagrams that arrived on each public socket
    received: Vec<u32>,
    inside: UdpSocket,
    host: SocketAddr,
    joiner: Option<SocketAddr>,
}

impl NatRelay {
    fn new(host: SocketAddr) -> Self {
        let inside = UdpSocket::bind("127.0.0.1:0").expect("bind nat inside");
        inside.set_nonblocking(true).expect("nonblocking nat");
        let mut nat = Self {
            public: Vec::new(),
            received: Vec::new(),
            inside,
            host,
            joiner: None,
        };
        nat.rebind();
        nat
    }

    /// Open a new public mapping; replies use it from now on.
    fn rebind(&mut self) {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind nat public");
        socket.set_nonblocking(true).expect("nonblocking nat");
        self.public.push(socket);
        self.received.push(0);
    }

    fn public_addr(&self) -> SocketAddr {
        self.public.last().expect("nat mapping").local_addr().expect("nat address")
    }

    fn pump(&mut self) {
        let mut buf = [0u8; 2048];
        for (socket, count) in self.public.iter().zip(self.received.iter_mut()) {
            while let Ok((len, from)) = socket.recv_from(&mut buf) {
                *count += 1;
                self.joiner = Some(from);
                let _ = self.inside.send_to(&buf[..len], self.host);
            }
        }
        let Some(current) = self.public.last() else {
            return;
        };
        while let Ok((len, from)) = self.inside.recv_from(&mut buf) {
            if let Some(joiner) = self.joiner.filter(|_| from == self.host) {
                let _ = current.send_to(&buf[..len], joiner);
            }
        }
    }
}

/// Minimal rendezvous helper: pairs the first two senders of room ABCD1234.
struct FakeHelper {
    socket: UdpSocket,
    waiting: Vec<SocketAddr>,
    full: bool,
}

impl FakeHelper {
    fn new(full: bool) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind helper");
        socket.set_nonblocking(true).expect("nonblocking helper");
        Self {
            socket,
            waiting: Vec::new(),
            full,
        }
    }

    fn port(&self) -> u16 {
        self.socket.local_addr().expect("helper address").port()
    }

    fn pump(&mut self) {
        let mut buf = [0u8; 256];
        while let Ok((len, from)) = self.socket.recv_from(&mut buf) {
            if &buf[..len] != b"SNO_PUNCH1 ABCD1234\n" {
                continue;
            }
            if self.full {
                let _ = self.socket.send_to(b"SNO_NOROOM\n", from);
                continue;
            }
            if !self.waiting.contains(&from) {
                self.waiting.push(from);
            }
            if let [a, b, ..] = self.waiting[..] {
                for (to, other) in [(a, b), (b, a)] {
                    let reply = format!("SNO_PEER1 {} {}\n", other.ip(), other.port());
                    let _ = self.socket.send_to(reply.as_bytes(), to);
                }
            } else {
                let _ = self.socket.send_to(b"SNO_WAIT\n", from);
            }
        }
    }
}

fn host_mask(frame: u32) -> u16 {
    (frame.wrapping_mul(7) & 0x0FFF) as u16 | 0x1000
}

fn joiner_mask(frame: u32) -> u16 {
    (frame.wrapping_mul(13) & 0x0FFF) as u16 | 0x2000
}

struct Pair {
    clock: TestClock,
    host: Side,
    joiner: Side,
    relay: Option<LossyRelay>,
    nat: Option<NatRelay>,
    helper: Option<FakeHelper>,
}

impl Pair {
    /// Host on an ephemeral port, Joiner pointed straight at it.
    fn direct(
        host_settings: NetplaySettings,
        host_engine: MockEngine,
        joiner_tuning: impl FnOnce(&mut NetplaySettings),
        joiner_engine: MockEngine,
        joiner_storage: Box<dyn SaveStorage>,
    ) -> Self {
        let clock = TestClock::new();
        let host = Side::start(&host_settings, host_engine, Box::new(NoSaveStorage), &clock);
        let mut settings = joiner_settings(host.addr());
        joiner_tuning(&mut settings);
        let joiner = Side::start(&settings, joiner_engine, joiner_storage, &clock);
        Self {
            clock,
            host,
            joiner,
            relay: None,
            nat: None,
            helper: None,
        }
    }

    fn tick(&mut self) {
        let now = self.clock.advance(STEP);

        self.host
            .session
            .input_handle()
            .set_mask(host_mask(self.host.frame()));
        self.host.tick(now);
        self.pump_middle();

        self.joiner
            .session
            .input_handle()
            .set_mask(joiner_mask(self.joiner.frame()));
        self.joiner.tick(now);
        self.pump_middle();
    }

    fn pump_middle(&mut self) {
        if let Some(relay) = self.relay.as_mut() {
            relay.pump();
        }
        if let Some(nat) = self.nat.as_mut() {
            nat.pump();
        }
        if let Some(helper) = self.helper.as_mut() {
            helper.pump();
        }
    }

    fn run(&mut self, ticks: u32) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    fn run_until(&mut self, max_ticks: u32, done: impl Fn(&Pair) -> bool) -> bool {
        for _ in 0..max_ticks {
            if done(self) {
                return true;
            }
            self.tick();
        }
        done(self)
    }

    fn both_past(&self, frame: u32) -> bool {
        self.host.frame() >= frame && self.joiner.frame() >= frame
    }

    fn assert_inputs_agree(&self, frames: usize) {
        let host = &self.host.engine.consumed;
        let joiner = &self.joiner.engine.consumed;
        assert!(host.len() >= frames && joiner.len() >= frames);
        assert_eq!(host[..frames], joiner[..frames]);
    }
}

fn joiner_settings(host: SocketAddr) -> NetplaySettings {
    NetplaySettings::join(0, host.ip().to_string(), host.port())
}

fn no_tuning(_: &mut NetplaySettings) {}

// ============================================================================
// Lockstep
// ============================================================================

#[test]
fn test_two_peers_consume_identical_inputs() {
    let mut pair = Pair::direct(
        NetplaySettings::host(0),
        MockEngine::new(),
        no_tuning,
        MockEngine::new(),
        Box::new(NoSaveStorage),
    );

    assert!(pair.run_until(2_000, |p| p.both_past(300)));
    pair.assert_inputs_agree(300);

    // Primed frames run on empty masks; the first captured input lands
    // exactly input_delay frames later
    let consumed = &pair.host.engine.consumed;
    assert!(consumed[..5].iter().all(|&pair| pair == (0, 0)));
    assert_eq!(consumed[5], (host_mask(0), joiner_mask(0)));

    // Initial state was synced once and no hash ever disagreed
    assert_eq!(pair.joiner.engine.state_loads, 1);
    let desync = |e: &SessionEvent| matches!(e, SessionEvent::DesyncDetected { .. });
    assert!(!pair.host.saw(desync));
    assert!(!pair.joiner.saw(desync));
}

#[test]
fn test_port_mapping_by_role() {
    let mut pair = Pair::direct(
        NetplaySettings::host(0),
        MockEngine::new(),
        no_tuning,
        MockEngine::new(),
        Box::new(NoSaveStorage),
    );
    assert!(pair.run_until(1_000, |p| p.both_past(60)));

    // Host drives port 0 on both machines
    let (p0, p1) = pair.joiner.engine.consumed[5];
    assert_eq!(p0 & 0xF000, 0x1000);
    assert_eq!(p1 & 0xF000, 0x2000);
}

#[test]
fn test_host_discovers_and_pins_joiner() {
    let mut pair = Pair::direct(
        NetplaySettings::host(0),
        MockEngine::new(),
        no_tuning,
        MockEngine::new(),
        Box::new(NoSaveStorage),
    );
    assert_eq!(pair.host.state(), SessionState::Discovering);
    assert_eq!(pair.host.session.peer_addr(), None);

    assert!(pair.run_until(100, |p| p.host.state().has_peer()));
    assert_eq!(pair.host.session.peer_addr(), Some(pair.joiner.addr()));
    assert!(pair.host.saw(|e| *e
        == SessionEvent::StateChanged {
            from: SessionState::Discovering,
            to: SessionState::PeerKnown,
        }));

    assert!(pair.run_until(1_000, |p| p.both_past(60)));
    assert_eq!(pair.host.session.peer_addr(), Some(pair.joiner.addr()));
    pair.assert_inputs_agree(60);
}

#[test]
fn test_peer_port_follows_nat_rebind() {
    let clock = TestClock::new();
    let host = Side::start(
        &NetplaySettings::host(0),
        MockEngine::new(),
        Box::new(NoSaveStorage),
        &clock,
    );
    let nat = NatRelay::new(host.addr());
    let first = nat.public_addr();
    let joiner = Side::start(
        &joiner_settings(first),
        MockEngine::new(),
        Box::new(NoSaveStorage),
        &clock,
    );
    let mut pair = Pair {
        clock,
        host,
        joiner,
        relay: None,
        nat: Some(nat),
        helper: None,
    };

    assert!(pair.run_until(1_000, |p| p.both_past(60)));
    assert_eq!(pair.joiner.session.peer_addr(), Some(first));

    let nat = pair.nat.as_mut().expect("nat relay");
    nat.rebind();
    let second = nat.public_addr();
    assert_ne!(first.port(), second.port());

    let frame = pair.joiner.frame();
    assert!(pair.run_until(1_000, |p| p.both_past(frame + 120)));

    assert!(pair.joiner.saw(|e| *e
        == SessionEvent::PeerPortChanged {
            old: first.port(),
            new: second.port(),
        }));
    assert_eq!(pair.joiner.session.peer_addr(), Some(second));

    // Joiner traffic now goes to the new mapping
    let nat = pair.nat.as_ref().expect("nat relay");
    assert!(nat.received[1] > 0);
    pair.assert_inputs_agree((frame + 120) as usize);
}

#[test]
fn test_lossy_link_stays_in_lockstep() {
    let clock = TestClock::new();
    let host = Side::start(
        &NetplaySettings::host(0),
        MockEngine::new(),
        Box::new(NoSaveStorage),
        &clock,
    );
    let relay = LossyRelay::new(host.addr(), 3);
    let joiner = Side::start(
        &joiner_settings(relay.addr()),
        MockEngine::new(),
        Box::new(NoSaveStorage),
        &clock,
    );
    let mut pair = Pair {
        clock,
        host,
        joiner,
        relay: Some(relay),
        nat: None,
        helper: None,
    };

    assert!(pair.run_until(3_000, |p| p.both_past(240)));
    pair.assert_inputs_agree(240);
    assert!(pair.relay.as_ref().is_some_and(|relay| relay.dropped > 100));
}

#[test]
fn test_paused_peer_stalls_the_other_side() {
    let mut pair = Pair::direct(
        NetplaySettings::host(0),
        MockEngine::new(),
        no_tuning,
        MockEngine::new(),
        Box::new(NoSaveStorage),
    );
    assert!(pair.run_until(1_000, |p| p.both_past(20)));

    let pause = pair.joiner.session.input_handle();
    pause.set_paused(true);
    pair.tick();
    let joiner_frame = pair.joiner.frame();

    pair.run(120);
    assert_eq!(pair.joiner.frame(), joiner_frame);
    assert!(pair.host.frame() <= joiner_frame + 6);

    // Keepalives keep the link warm while paused
    let stats = pair.host.session.stats_at(pair.clock.now());
    assert!(stats.last_received_age.is_some_and(|age| age <= STEP * 2));

    pause.set_paused(false);
    assert!(pair.run_until(1_000, |p| p.both_past(joiner_frame + 60)));
    pair.assert_inputs_agree((joiner_frame + 60) as usize);
}

// ============================================================================
// Transfers
// ============================================================================

#[test]
fn test_multi_chunk_state_sync_gates_ready() {
    // 4 byte frame tag + 4 byte engine frame + 64 byte memory + padding
    // = 5000 bytes, 5 chunks of 1024
    let mut pair = Pair::direct(
        NetplaySettings::host(0),
        MockEngine::new().with_state_padding(5000 - 72),
        no_tuning,
        MockEngine::new(),
        Box::new(NoSaveStorage),
    );
    assert!(pair.run_until(1_000, |p| p.both_past(10)));

    assert!(pair.host.saw(|e| *e
        == SessionEvent::TransferStarted {
            kind: TransferKind::State,
            size: 5000,
            gating: true,
        }));

    let completed = pair
        .host
        .position(|e| matches!(e, SessionEvent::TransferCompleted { kind: TransferKind::State, size: 5000 }))
        .expect("host saw ack");
    let host_ready = pair
        .host
        .position(|e| matches!(e, SessionEvent::StateChanged { to: SessionState::Ready, .. }))
        .expect("host became ready");
    assert!(completed < host_ready);

    let applied = pair
        .joiner
        .position(|e| matches!(e, SessionEvent::TransferApplied { kind: TransferKind::State, size: 5000 }))
        .expect("joiner applied state");
    let joiner_ready = pair
        .joiner
        .position(|e| matches!(e, SessionEvent::StateChanged { to: SessionState::Ready, .. }))
        .expect("joiner became ready");
    assert!(applied < joiner_ready);
    assert_eq!(pair.joiner.engine.state_loads, 1);
}

#[test]
fn test_save_memory_sync_and_propagation() {
    let mut host_settings = NetplaySettings::host(0);
    host_settings.tuning.save_check_interval = 60;
    let store = MemorySaveStore::new();

    let mut pair = Pair::direct(
        host_settings,
        MockEngine::new().with_save(vec![0x5A; 256]),
        no_tuning,
        MockEngine::new(),
        Box::new(store.clone()),
    );
    assert!(pair.run_until(1_000, |p| p.both_past(10)));

    assert_eq!(pair.joiner.engine.save(), &[0x5A; 256][..]);
    assert_eq!(store.data().as_deref(), Some(&[0x5A; 256][..]));
    assert_eq!(store.writes(), 1);

    // Unchanged memory is not pushed again
    pair.run(150);
    assert_eq!(store.writes(), 1);

    pair.host.engine.write_save(10, 0x77);
    assert!(pair.run_until(600, |p| p.joiner.engine.save().get(10) == Some(&0x77)));
    assert_eq!(store.writes(), 2);
    assert!(pair.host.saw(|e| *e
        == SessionEvent::TransferStarted {
            kind: TransferKind::Save,
            size: 256,
            gating: false,
        }));
}

#[test]
fn test_rejected_state_falls_back_after_deadline() {
    let mut host_settings = NetplaySettings::host(0);
    host_settings.tuning.transfer_deadline_ms = 500;
    let mut joiner_engine = MockEngine::new();
    joiner_engine.reject_state = true;

    let mut pair = Pair::direct(
        host_settings,
        MockEngine::new(),
        |settings| settings.tuning.transfer_deadline_ms = 500,
        joiner_engine,
        Box::new(NoSaveStorage),
    );

    assert!(pair.run_until(600, |p| p.both_past(30)));
    let abandoned = |e: &SessionEvent| {
        matches!(e, SessionEvent::TransferAbandoned { kind: TransferKind::State, .. })
    };
    assert!(pair.host.saw(abandoned));
    assert!(pair.joiner.saw(abandoned));
    assert_eq!(pair.joiner.engine.state_loads, 0);
    pair.assert_inputs_agree(30);
}

#[test]
fn test_joiner_grace_without_offers() {
    let mut host_settings = NetplaySettings::host(0);
    host_settings.sync_state_on_connect = false;
    host_settings.sync_save_on_connect = false;

    let mut pair = Pair::direct(
        host_settings,
        MockEngine::new(),
        |settings| settings.tuning.joiner_grace_ms = 300,
        MockEngine::new(),
        Box::new(NoSaveStorage),
    );

    pair.run(10);
    assert_eq!(pair.host.state(), SessionState::Ready);
    assert_eq!(pair.joiner.state(), SessionState::PeerKnown);

    assert!(pair.run_until(100, |p| p.joiner.state() == SessionState::Ready));
    assert!(pair.run_until(200, |p| p.both_past(30)));
    pair.assert_inputs_agree(30);
}

// ============================================================================
// Desync
// ============================================================================

#[test]
fn test_desync_triggers_state_resync() {
    let mut pair = Pair::direct(
        NetplaySettings::host(0),
        MockEngine::new(),
        no_tuning,
        MockEngine::new(),
        Box::new(NoSaveStorage),
    );
    assert!(pair.run_until(1_000, |p| p.both_past(30)));
    pair.joiner.engine.corrupt();

    assert!(pair.run_until(1_000, |p| p.joiner.engine.state_loads == 2));

    assert!(pair.host.saw(|e| matches!(e, SessionEvent::DesyncDetected { frame: 60, .. })));
    assert!(pair.joiner.saw(|e| matches!(e, SessionEvent::DesyncDetected { frame: 60, .. })));
    assert!(pair.joiner.saw(|e| matches!(e, SessionEvent::ResyncRequested { frame: 60 })));
    assert!(pair.host.saw(|e| matches!(
        e,
        SessionEvent::StateChanged {
            to: SessionState::Resyncing,
            ..
        }
    )));

    // The snapshot lands on the frame it was taken at
    assert_eq!(pair.joiner.engine.frame(), pair.joiner.frame());

    // Ten more hash checks: the resync converged, nothing diverges again
    let host_seen = pair.host.events.len();
    let joiner_seen = pair.joiner.events.len();
    let frame = pair.host.frame();
    assert!(pair.run_until(2_000, |p| p.both_past(frame + 600)));

    let desync = |e: &SessionEvent| matches!(e, SessionEvent::DesyncDetected { .. });
    assert!(!pair.host.events[host_seen..].iter().any(desync));
    assert!(!pair.joiner.events[joiner_seen..].iter().any(desync));
    assert_eq!(pair.joiner.engine.state_loads, 2);

    let resyncs = pair
        .host
        .events
        .iter()
        .filter(|e| matches!(e, SessionEvent::TransferStarted { kind: TransferKind::State, gating: true, .. }))
        .count();
    assert_eq!(resyncs, 2);

    pair.assert_inputs_agree((frame + 600) as usize);
}

#[test]
fn test_snapshot_ahead_of_joiner_waits_for_its_frame() {
    let mut clock = TestClock::new();
    let fake_host = UdpSocket::bind("127.0.0.1:0").expect("bind fake host");
    fake_host.set_nonblocking(true).expect("nonblocking fake host");
    let host_addr = fake_host.local_addr().expect("fake host address");

    let mut joiner = Side::start(
        &joiner_settings(host_addr),
        MockEngine::new(),
        Box::new(NoSaveStorage),
        &clock,
    );
    let joiner_addr = joiner.addr();

    // Host state as of frame 8
    let mut source = MockEngine::new();
    for _ in 0..8 {
        source.advance_frame();
    }
    source.corrupt();
    let snapshot = source.save_state().expect("snapshot");
    let payload = tag_state(8, &snapshot.data);
    let info = TransferInfo {
        size: payload.len() as u32,
        crc: crc32fast::hash(&payload),
        chunk_size: 1024,
        chunk_count: 1,
        flags: 0,
    };

    let send = |packet: Packet| {
        fake_host
            .send_to(&packet.to_bytes(), joiner_addr)
            .expect("send to joiner");
    };
    for frame in 0..20 {
        send(Packet::Input(InputPacket {
            frame,
            mask: host_mask(frame),
            token: 0,
        }));
    }
    send(Packet::StateInfo(info));
    send(Packet::StateChunk(TransferChunk {
        index: 0,
        chunk_count: 1,
        payload,
    }));

    for _ in 0..40 {
        joiner.tick(clock.advance(STEP));
    }

    assert_eq!(joiner.frame(), 20);
    assert_eq!(joiner.engine.state_loads, 1);
    assert_eq!(joiner.engine.frame(), joiner.frame());
    assert_eq!(joiner.engine.consumed.len(), 20);
    assert!(joiner.saw(|e| matches!(e, SessionEvent::TransferApplied { kind: TransferKind::State, .. })));

    // Loaded at frame 8, then frames 8..20 ran on top of the Host's memory
    let mut expected = source.clone();
    for frame in 8..20u32 {
        assert_eq!(joiner.engine.consumed[frame as usize], (host_mask(frame), 0));
        expected.set_input_mask(0, host_mask(frame));
        expected.set_input_mask(1, 0);
        expected.advance_frame();
    }
    assert_eq!(joiner.engine.memory(), expected.memory());

    let mut buf = [0u8; 2048];
    let mut acked = false;
    while let Ok((len, _)) = fake_host.recv_from(&mut buf) {
        if let Ok(Packet::StateAck(ack)) = Packet::decode(&buf[..len]) {
            acked |= ack.size == info.size && ack.crc == info.crc;
        }
    }
    assert!(acked);
}

// ============================================================================
// Admission and lifecycle
// ============================================================================

#[test]
fn test_mismatched_secret_never_connects() {
    let mut clock = TestClock::new();
    let mut host_settings = NetplaySettings::host(0);
    host_settings.shared_secret = Some("alpha".into());
    let mut host = Side::start(&host_settings, MockEngine::new(), Box::new(NoSaveStorage), &clock);

    let mut settings = joiner_settings(host.addr());
    settings.shared_secret = Some("bravo".into());
    let mut joiner = Side::start(&settings, MockEngine::new(), Box::new(NoSaveStorage), &clock);

    for _ in 0..60 {
        let now = clock.advance(STEP);
        host.tick(now);
        joiner.tick(now);
    }

    assert_eq!(host.state(), SessionState::Discovering);
    assert_eq!(host.session.peer_addr(), None);
    assert_eq!(joiner.state(), SessionState::Connecting);
    assert_eq!(host.frame(), 0);
}

#[test]
fn test_matching_secret_connects() {
    let mut host_settings = NetplaySettings::host(0);
    host_settings.shared_secret = Some("alpha".into());

    let mut pair = Pair::direct(
        host_settings,
        MockEngine::new(),
        |settings| settings.shared_secret = Some("alpha".into()),
        MockEngine::new(),
        Box::new(NoSaveStorage),
    );
    assert!(pair.run_until(1_000, |p| p.both_past(30)));
    assert!(pair.host.saw(|e| matches!(e, SessionEvent::PeerConnected { .. })));
}

#[test]
fn test_invalid_settings_leave_session_idle() {
    let mut session = LockstepSession::new();
    let settings = NetplaySettings {
        role: Role::Joiner,
        local_port: 0,
        peer: PeerMode::AutoDiscover,
        ..Default::default()
    };

    let err = session
        .start(&settings, Box::new(NoSaveStorage))
        .expect_err("joiner cannot discover");
    assert!(matches!(err, SessionError::InvalidConfig(InvalidConfig::JoinerCannotDiscover)));
    assert_eq!(session.state(), SessionState::Idle);
    assert!(!session.is_active());
    assert_eq!(session.local_addr(), None);
}

#[test]
fn test_bind_conflict_is_reported() {
    let blocker = UdpSocket::bind("0.0.0.0:0").expect("bind blocker");
    let port = blocker.local_addr().expect("blocker address").port();

    let mut session = LockstepSession::new();
    let err = session
        .start(&NetplaySettings::host(port), Box::new(NoSaveStorage))
        .expect_err("port is taken");
    assert!(matches!(err, SessionError::Socket(_)));
    assert_eq!(session.state(), SessionState::Idle);
}

#[test]
fn test_stop_is_safe_and_releases_port() {
    let mut session = LockstepSession::new();
    session.stop();
    assert!(session.drain_events().is_empty());

    session
        .start(&NetplaySettings::host(0), Box::new(NoSaveStorage))
        .expect("start");
    let port = session.local_addr().expect("bound").port();
    assert_eq!(session.state(), SessionState::Discovering);

    session.stop();
    session.stop();
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.local_frame(), 0);

    let events = session.drain_events();
    assert_eq!(
        events.last(),
        Some(&SessionEvent::StateChanged {
            from: SessionState::Discovering,
            to: SessionState::Idle,
        })
    );

    // Port is free again
    UdpSocket::bind(("0.0.0.0", port)).expect("port released");
}

#[test]
fn test_tick_while_idle_does_nothing() {
    let mut session = LockstepSession::new();
    let mut engine = MockEngine::new();
    let outcome = session.tick(&mut engine);
    assert_eq!(outcome, TickOutcome::default());
    assert!(engine.consumed.is_empty());
}

// ============================================================================
// Rendezvous
// ============================================================================

fn rendezvous_settings(role: Role, helper_port: u16) -> NetplaySettings {
    NetplaySettings {
        role,
        local_port: 0,
        peer: PeerMode::Rendezvous {
            server_host: "127.0.0.1".into(),
            server_port: helper_port,
            room_code: "abcd-1234".into(),
            fallback_host: None,
            fallback_port: None,
        },
        ..Default::default()
    }
}

#[test]
fn test_rendezvous_pairs_both_peers() {
    let clock = TestClock::new();
    let helper = FakeHelper::new(false);
    let host = Side::start(
        &rendezvous_settings(Role::Host, helper.port()),
        MockEngine::new(),
        Box::new(NoSaveStorage),
        &clock,
    );
    let joiner = Side::start(
        &rendezvous_settings(Role::Joiner, helper.port()),
        MockEngine::new(),
        Box::new(NoSaveStorage),
        &clock,
    );
    let mut pair = Pair {
        clock,
        host,
        joiner,
        relay: None,
        nat: None,
        helper: Some(helper),
    };

    assert!(pair.run_until(1_000, |p| p.both_past(30)));
    let resolved = |e: &SessionEvent| matches!(e, SessionEvent::RendezvousResolved { .. });
    assert!(pair.host.saw(resolved));
    assert!(pair.joiner.saw(resolved));
    assert_eq!(pair.host.session.peer_addr(), Some(pair.joiner.addr()));
    pair.assert_inputs_agree(30);
}

#[test]
fn test_rendezvous_no_room_falls_back_to_discovery() {
    let mut clock = TestClock::new();
    let mut helper = FakeHelper::new(true);
    let mut host = Side::start(
        &rendezvous_settings(Role::Host, helper.port()),
        MockEngine::new(),
        Box::new(NoSaveStorage),
        &clock,
    );
    assert_eq!(host.state(), SessionState::Connecting);

    for _ in 0..5 {
        host.tick(clock.advance(STEP));
        helper.pump();
    }

    assert!(host.saw(|e| matches!(e, SessionEvent::RendezvousFailed { .. })));
    assert_eq!(host.state(), SessionState::Discovering);
}

#[test]
fn test_rendezvous_timeout_uses_fallback_address() {
    let mut clock = TestClock::new();
    let silent = UdpSocket::bind("127.0.0.1:0").expect("bind silent helper");
    let fallback = loopback(40_000);

    let mut settings = rendezvous_settings(Role::Joiner, silent.local_addr().expect("addr").port());
    settings.tuning.rendezvous_timeout_ms = 500;
    if let PeerMode::Rendezvous {
        fallback_host,
        fallback_port,
        ..
    } = &mut settings.peer
    {
        *fallback_host = Some("127.0.0.1".into());
        *fallback_port = Some(fallback.port());
    }

    let mut joiner = Side::start(&settings, MockEngine::new(), Box::new(NoSaveStorage), &clock);
    assert_eq!(joiner.session.peer_addr(), None);

    for _ in 0..40 {
        joiner.tick(clock.advance(STEP));
    }

    assert!(joiner.saw(|e| matches!(e, SessionEvent::RendezvousFailed { .. })));
    assert_eq!(joiner.session.peer_addr(), Some(fallback));
    assert_eq!(joiner.state(), SessionState::Connecting);
}

// ============================================================================
// Runner
// ============================================================================

#[test]
fn test_runner_reaches_ready_and_returns_engine() {
    let mut host = LockstepSession::new();
    host.start(&NetplaySettings::host(0), Box::new(NoSaveStorage))
        .expect("host starts");
    let host_addr = loopback(host.local_addr().expect("bound").port());

    let mut joiner = LockstepSession::new();
    joiner
        .start(&joiner_settings(host_addr), Box::new(NoSaveStorage))
        .expect("joiner starts");

    let host = SessionRunner::spawn(host, MockEngine::new()).expect("spawn host");
    let joiner = SessionRunner::spawn(joiner, MockEngine::new()).expect("spawn joiner");

    let deadline = Instant::now() + std::time::Duration::from_secs(10);
    while (host.local_frame() < 30 || joiner.local_frame() < 30) && Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    assert!(host.state().can_simulate());
    assert!(joiner.last_remote_frame().is_some());
    assert!(
        joiner
            .drain_events()
            .iter()
            .any(|e| matches!(e, SessionEvent::PeerConnected { .. }))
    );

    let host_engine = host.stop().expect("host engine");
    let joiner_engine = joiner.stop().expect("joiner engine");
    let frames = host_engine.consumed.len().min(joiner_engine.consumed.len());
    assert!(frames >= 30);
    assert_eq!(host_engine.consumed[..frames], joiner_engine.consumed[..frames]);
}
