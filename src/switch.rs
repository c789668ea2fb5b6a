//! # Switch
//!
//! The protocol engine. A [`Switch`] owns every peer, line, channel, lookup
//! and timer of one node and never touches a socket or a clock:
//!
//! | Input | Entry point |
//! |-------|-------------|
//! | datagram from the network | [`Switch::receive`] |
//! | application request | [`Switch::open_channel`], [`Switch::send`], [`Switch::seek`], ... |
//! | deadline reached | [`Switch::handle_timeout`] |
//!
//! | Output | Where it goes |
//! |--------|---------------|
//! | wire bytes | the [`Transport`] given at construction |
//! | deliveries, failures, lookup results | [`Switch::poll_event`] |
//! | next deadline | [`Switch::next_timeout`] |
//!
//! Every operation takes the current `Instant` explicitly, so tests drive
//! time by hand and the async node only has to sleep until `next_timeout`.
//!
//! ## Builtin Channel Types
//!
//! | Type | Request | Answer |
//! |------|---------|--------|
//! | `seek` | `seek`: hashname | `see`: nearest alive peers |
//! | `peer` | `peer`: hashname, `paths` | none; triggers `connect` to the target |
//! | `connect` | `paths`, body = requester key | none; triggers opens |
//! | `path` | `priority`, alternate `paths` | `priority`, observed `path` |
//! | `relay` | `to`, body = datagram | none; forwarded once |
//! | `bridge` | `to` / `from` line ids, `path` | `end` or `err` |
//!
//! The lookup, mesh and NAT traversal halves live in `mesh` and `nat`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelKind, ChannelLimits, Effect, ReliableChannel};
use crate::config::{Seed, SwitchConfig};
use crate::crypto::{parse_public_key, seal_open, verify_open, LineCipher, LineSecret};
use crate::dht::{Election, Lookup, RoutingTable};
use crate::error::{ChannelError, Error, Result, SeekError, ERR_UNKNOWN_TYPE};
use crate::identity::{now_ms, Hashname, Keypair, LineId};
use crate::messages::{classify, ChannelId, Datagram, Header, LineFrame, Packet, Payload};
use crate::path::Path;
use crate::peer::{ChannelSlot, Peer, PathIn, SendOptions};
use crate::protocols::Transport;
use crate::raw::{RawChannel, RawPurpose};
use crate::relay::{BridgeRoute, BridgeTable, RelayThrottle};
use crate::scheduler::{Scheduler, TimerId};

// ============================================================================
// Builtins, Timers, Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    Seek,
    Peer,
    Connect,
    Path,
    Relay,
    Bridge,
}

impl Builtin {
    pub(crate) fn from_type(channel_type: &str) -> Option<Self> {
        match channel_type {
            "seek" => Some(Builtin::Seek),
            "peer" => Some(Builtin::Peer),
            "connect" => Some(Builtin::Connect),
            "path" => Some(Builtin::Path),
            "relay" => Some(Builtin::Relay),
            "bridge" => Some(Builtin::Bridge),
            _ => None,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Builtin::Seek => "seek",
            Builtin::Peer => "peer",
            Builtin::Connect => "connect",
            Builtin::Path => "path",
            Builtin::Relay => "relay",
            Builtin::Bridge => "bridge",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timer {
    Ack { peer: Hashname, channel: ChannelId },
    Resend { peer: Hashname, channel: ChannelId },
    Reap { peer: Hashname, channel: ChannelId },
    RawIdle { peer: Hashname, channel: ChannelId },
    PathSync { peer: Hashname },
    BridgeCheck { peer: Hashname },
    Maintenance,
}

/// Something the application should know about.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A packet for an application channel. The first one on a channel the
    /// peer opened announces the channel.
    Message {
        peer: Hashname,
        channel: ChannelId,
        channel_type: String,
        kind: ChannelKind,
        payload: Payload,
    },
    /// The channel is finished; reported once.
    ChannelError {
        peer: Hashname,
        channel: ChannelId,
        error: ChannelError,
    },
    /// A packet sent with `notify` was acknowledged.
    Acked {
        peer: Hashname,
        channel: ChannelId,
        seq: u32,
    },
    SeekComplete {
        target: Hashname,
        result: std::result::Result<Vec<Hashname>, SeekError>,
    },
    LineUp {
        peer: Hashname,
    },
}

/// Point-in-time counters for telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchStats {
    pub peers: usize,
    pub lines: usize,
    pub alive: usize,
    pub elected: usize,
    pub buckets: usize,
    pub channels: usize,
    pub lookups: usize,
    pub bridges: usize,
    pub relayed: u64,
    pub relay_dropped: u64,
    pub bridged: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) relayed: u64,
    pub(crate) relay_dropped: u64,
    pub(crate) dropped: u64,
}

pub(crate) fn peer_entry(peers: &mut HashMap<Hashname, Peer>, local: Hashname, hashname: Hashname) -> &mut Peer {
    peers
        .entry(hashname)
        .or_insert_with(|| Peer::new(hashname, &local))
}

fn reliable<'a>(
    peers: &'a mut HashMap<Hashname, Peer>,
    peer: &Hashname,
    channel: ChannelId,
) -> Option<&'a mut ReliableChannel> {
    match peers.get_mut(peer)?.channels.get_mut(&channel)? {
        ChannelSlot::Reliable(c) => Some(c),
        ChannelSlot::Raw(_) => None,
    }
}

fn raw<'a>(peers: &'a mut HashMap<Hashname, Peer>, peer: &Hashname, channel: ChannelId) -> Option<&'a mut RawChannel> {
    match peers.get_mut(peer)?.channels.get_mut(&channel)? {
        ChannelSlot::Raw(c) => Some(c),
        ChannelSlot::Reliable(_) => None,
    }
}

/// Make sure the peer has our half of a line ready.
fn prepare_line(peer: &mut Peer) -> std::result::Result<LineId, getrandom::Error> {
    if peer.secret.is_none() {
        peer.secret = Some(LineSecret::generate());
    }
    match peer.line_out {
        Some(line) => Ok(line),
        None => {
            let line = LineId::random()?;
            peer.line_out = Some(line);
            Ok(line)
        }
    }
}

// ============================================================================
// Switch
// ============================================================================

pub struct Switch<T: Transport> {
    pub(crate) keypair: Keypair,
    pub(crate) hashname: Hashname,
    pub(crate) config: SwitchConfig,
    pub(crate) transport: T,

    pub(crate) peers: HashMap<Hashname, Peer>,
    /// Our line ids, as carried by inbound line packets.
    pub(crate) lines: HashMap<LineId, Hashname>,
    pub(crate) handlers: HashMap<String, ChannelKind>,

    pub(crate) table: RoutingTable,
    pub(crate) election: Election,
    pub(crate) seeds: HashSet<Hashname>,
    /// Peers reached over a local network path.
    pub(crate) locals: HashSet<Hashname>,
    pub(crate) lookups: HashMap<Hashname, Lookup>,

    pub(crate) bridges: BridgeTable,
    pub(crate) throttle: RelayThrottle,
    pub(crate) public_paths: Vec<Path>,
    pub(crate) local_paths: Vec<Path>,

    pub(crate) timers: Scheduler<Timer>,
    pub(crate) events: VecDeque<Event>,
    pub(crate) maintenance: Option<TimerId>,
    last_open_at: u64,
    pub(crate) counters: Counters,
}

impl<T: Transport> Switch<T> {
    pub fn new(keypair: Keypair, config: SwitchConfig, transport: T) -> Self {
        let hashname = keypair.hashname();
        debug!(hashname = %hashname, "switch created");
        Self {
            table: RoutingTable::new(hashname),
            bridges: BridgeTable::new(config.bridge_timeout, config.bridge_dedup),
            throttle: RelayThrottle::new(config.relay_rate, config.relay_window, config.relay_tracked_peers),
            keypair,
            hashname,
            config,
            transport,
            peers: HashMap::new(),
            lines: HashMap::new(),
            handlers: HashMap::new(),
            election: Election::default(),
            seeds: HashSet::new(),
            locals: HashSet::new(),
            lookups: HashMap::new(),
            public_paths: Vec::new(),
            local_paths: Vec::new(),
            timers: Scheduler::new(),
            events: VecDeque::new(),
            maintenance: None,
            last_open_at: 0,
            counters: Counters::default(),
        }
    }

    pub fn hashname(&self) -> Hashname {
        self.hashname
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public_key_bytes()
    }

    pub fn config(&self) -> &SwitchConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn peer(&self, hashname: &Hashname) -> Option<&Peer> {
        self.peers.get(hashname)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Paths other peers have told us they see us on.
    pub fn public_paths(&self) -> &[Path] {
        &self.public_paths
    }

    /// Addresses bound on local interfaces, offered to local peers.
    pub fn set_local_paths(&mut self, paths: Vec<Path>) {
        for path in &paths {
            if !path.is_local() && path.is_direct() && !self.public_paths.contains(path) {
                self.public_paths.push(path.clone());
            }
        }
        self.local_paths = paths.into_iter().filter(Path::is_local).collect();
    }

    /// Register a handler for inbound channels of `channel_type`.
    pub fn listen(&mut self, channel_type: &str, kind: ChannelKind) -> Result<()> {
        if Builtin::from_type(channel_type).is_some() {
            return Err(Error::ReservedType(channel_type.to_string()));
        }
        self.handlers.insert(channel_type.to_string(), kind);
        Ok(())
    }

    /// Learn a peer's key and candidate paths without contacting it.
    pub fn add_peer(&mut self, key: &[u8], paths: impl IntoIterator<Item = Path>) -> Result<Hashname> {
        let key = parse_public_key(key)?;
        let hashname = Hashname::from_public_key(&key);
        if hashname == self.hashname {
            return Err(Error::SelfChannel);
        }
        let peer = peer_entry(&mut self.peers, self.hashname, hashname);
        peer.key = Some(key);
        for path in paths {
            if path.is_direct() {
                peer.add_candidate_path(path);
            }
        }
        Ok(hashname)
    }

    pub fn add_seed(&mut self, seed: &Seed) -> Result<Hashname> {
        let key = seed.key().map_err(|e| Error::InvalidSeed(e.to_string()))?;
        let hashname = self
            .add_peer(&key, seed.paths())
            .map_err(|e| Error::InvalidSeed(e.to_string()))?;
        if let Some(peer) = self.peers.get_mut(&hashname) {
            peer.seed = true;
            peer.bridging = seed.bridge;
        }
        self.seeds.insert(hashname);
        debug!(seed = %hashname.short(), paths = seed.paths().len(), "seed added");
        Ok(hashname)
    }

    /// Contact every seed with a seek for ourselves and start maintenance.
    pub fn online(&mut self, now: Instant) {
        info!(hashname = %self.hashname.short(), seeds = self.seeds.len(), "going online");
        let seeds: Vec<Hashname> = self.seeds.iter().copied().collect();
        for seed in seeds {
            self.probe(seed, now);
        }
        if let Some(id) = self.maintenance.take() {
            self.timers.cancel(id);
        }
        self.maintenance = Some(
            self.timers
                .schedule(now + self.config.mesh_interval, Timer::Maintenance),
        );
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn next_timeout(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn stats(&self) -> SwitchStats {
        SwitchStats {
            peers: self.peers.len(),
            lines: self.peers.values().filter(|p| p.has_line()).count(),
            alive: self.peers.values().filter(|p| p.alive).count(),
            elected: self.election.elected.len(),
            buckets: self.table.occupied_count(),
            channels: self.peers.values().map(|p| p.channels.len()).sum(),
            lookups: self.lookups.len(),
            bridges: self.bridges.len(),
            relayed: self.counters.relayed,
            relay_dropped: self.counters.relay_dropped,
            bridged: self.bridges.forwarded(),
            dropped: self.counters.dropped,
        }
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Process one datagram that arrived on `from`.
    pub fn receive(&mut self, bytes: &[u8], from: Path, now: Instant) {
        match classify(bytes) {
            Ok(Datagram::Keepalive) => trace!(from = %from, "keepalive"),
            Ok(Datagram::Open(body)) => self.receive_open(body, from, now),
            Ok(Datagram::Line(frame)) => self.receive_line(frame, bytes, from, now),
            Err(e) => {
                self.counters.dropped += 1;
                debug!(from = %from, error = %e, "dropping malformed datagram");
            }
        }
    }

    fn receive_open(&mut self, body: &[u8], from: Path, now: Instant) {
        let open = match verify_open(body) {
            Ok(open) => open,
            Err(e) => {
                self.counters.dropped += 1;
                debug!(from = %from, error = %e, "invalid open");
                return;
            }
        };
        if open.to != self.hashname {
            debug!(from = %from, to = %open.to.short(), "open addressed to another hashname");
            return;
        }
        let hashname = open.from;
        if hashname == self.hashname {
            return;
        }

        let peer = peer_entry(&mut self.peers, self.hashname, hashname);
        if peer.open_at.is_some_and(|at| open.at <= at) {
            debug!(peer = %hashname.short(), at = open.at, "stale open ignored");
            return;
        }
        let rekeyed = peer.line_in.is_some_and(|line| line != open.line);
        let had_line = peer.has_line();
        peer.key = Some(open.key);
        peer.open_at = Some(open.at);
        peer.line_in = Some(open.line);
        let line_out = match prepare_line(peer) {
            Ok(line) => line,
            Err(e) => {
                warn!(peer = %hashname.short(), error = %e, "cannot allocate line id");
                return;
            }
        };
        let Some(secret) = peer.secret.as_ref() else {
            return;
        };
        peer.cipher = Some(LineCipher::derive(secret, line_out, &open));
        let outcome = peer.path_in(&from, now);
        // an open that already names our line answers one of ours
        let reply = open.known != Some(line_out);
        let pending = peer.last_packet.take();
        let line_up = !had_line || rekeyed;
        self.lines.insert(line_out, hashname);

        if rekeyed {
            self.bridges.remove_requester(&hashname);
        }
        if line_up {
            info!(peer = %hashname.short(), path = %from, rekeyed, "line up");
            self.events.push_back(Event::LineUp { peer: hashname });
        }
        self.table.insert(hashname);
        self.note_local(hashname, &from);
        if reply {
            self.send_open(hashname, vec![from.clone()], now);
        }
        self.after_path_in(hashname, &from, outcome, now);
        if line_up {
            self.flush_channels(hashname, now);
        }
        if let Some((packet, options)) = pending
            && !(line_up && packet.header.seq.is_some())
        {
            trace!(peer = %hashname.short(), "replaying queued packet");
            self.send_packet(hashname, packet, options, now);
        }
    }

    /// Send everything reliable channels queued while the line was down.
    fn flush_channels(&mut self, hashname: Hashname, now: Instant) {
        let Some(peer) = self.peers.get_mut(&hashname) else {
            return;
        };
        let mut ids: Vec<ChannelId> = peer
            .channels
            .iter()
            .filter_map(|(id, slot)| match slot {
                ChannelSlot::Reliable(c) if c.needs_resend() => Some(*id),
                _ => None,
            })
            .collect();
        ids.sort_unstable();
        for id in ids {
            let Some(channel) = reliable(&mut self.peers, &hashname, id) else {
                continue;
            };
            let effects = channel.flush();
            trace!(peer = %hashname.short(), channel = id, packets = effects.len(), "flushing queued packets");
            self.apply_effects(hashname, id, effects, now);
        }
    }

    fn receive_line(&mut self, frame: LineFrame<'_>, bytes: &[u8], from: Path, now: Instant) {
        let Some(hashname) = self.lines.get(&frame.line).copied() else {
            match self.bridges.route(&frame.line, &frame.iv, now) {
                BridgeRoute::Forward(path) => {
                    trace!(line = %frame.line, to = %path, "bridging line packet");
                    self.transport.send(&path, bytes.to_vec());
                }
                BridgeRoute::Duplicate => trace!(line = %frame.line, "duplicate bridged packet"),
                BridgeRoute::Unknown => {
                    self.counters.dropped += 1;
                    debug!(line = %frame.line, from = %from, "unknown line");
                }
            }
            return;
        };
        let Some(cipher) = self.peers.get(&hashname).and_then(|p| p.cipher.as_ref()) else {
            debug!(peer = %hashname.short(), "line packet before handshake completed");
            return;
        };
        let plaintext = match cipher.open(&frame) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                self.counters.dropped += 1;
                debug!(peer = %hashname.short(), from = %from, error = %e, "line decrypt failed");
                return;
            }
        };
        match Packet::decode(&plaintext) {
            Ok(packet) => self.receive_packet(hashname, packet, from, now),
            Err(e) => {
                self.counters.dropped += 1;
                debug!(peer = %hashname.short(), error = %e, "invalid channel packet");
            }
        }
    }

    fn receive_packet(&mut self, hashname: Hashname, packet: Packet, from: Path, now: Instant) {
        let Some(c) = packet.header.c else {
            warn!(peer = %hashname.short(), "channel packet without channel id");
            return;
        };
        let Some(peer) = self.peers.get_mut(&hashname) else {
            return;
        };
        let outcome = peer.path_in(&from, now);
        let existing = peer.channels.get(&c).map(ChannelSlot::kind);
        self.note_local(hashname, &from);
        self.after_path_in(hashname, &from, outcome, now);

        match existing {
            Some(ChannelKind::Reliable) => self.receive_reliable(hashname, c, packet, now),
            Some(ChannelKind::Raw) => self.receive_raw(hashname, c, packet, &from, now),
            None => self.receive_new_channel(hashname, c, packet, from, now),
        }
    }

    fn receive_new_channel(&mut self, hashname: Hashname, c: ChannelId, packet: Packet, from: Path, now: Instant) {
        let Some(channel_type) = packet.header.channel_type.clone() else {
            // late or reordered traffic for a channel we never saw or already reaped
            debug!(peer = %hashname.short(), channel = c, "packet for unknown channel dropped");
            return;
        };
        if let Some(builtin) = Builtin::from_type(&channel_type) {
            if packet.header.seq.is_some() {
                debug!(peer = %hashname.short(), kind = builtin.as_str(), "sequenced builtin request dropped");
                return;
            }
            trace!(peer = %hashname.short(), kind = builtin.as_str(), channel = c, "builtin request");
            self.handle_builtin(builtin, hashname, c, packet, from, now);
            return;
        }

        let wire_kind = if packet.header.seq.is_some() {
            ChannelKind::Reliable
        } else {
            ChannelKind::Raw
        };
        let Some(registered) = self.handlers.get(&channel_type).copied().filter(|k| *k == wire_kind) else {
            debug!(peer = %hashname.short(), channel_type = %channel_type, "no handler for channel type");
            if !packet.header.is_terminal() {
                self.refuse(hashname, c, ERR_UNKNOWN_TYPE, now);
            }
            return;
        };

        debug!(peer = %hashname.short(), channel = c, channel_type = %channel_type, "inbound channel");
        let limits = ChannelLimits::from(&self.config);
        let raw_timeout = self.config.raw_timeout;
        let Some(peer) = self.peers.get_mut(&hashname) else {
            return;
        };
        match registered {
            ChannelKind::Reliable => {
                let channel = ReliableChannel::new(c, hashname, channel_type, false, limits);
                peer.channels.insert(c, ChannelSlot::Reliable(channel));
                self.receive_reliable(hashname, c, packet, now);
            }
            ChannelKind::Raw => {
                let channel = RawChannel::new(c, hashname, channel_type, RawPurpose::App, false, raw_timeout);
                peer.channels.insert(c, ChannelSlot::Raw(channel));
                self.receive_raw(hashname, c, packet, &from, now);
            }
        }
    }

    fn refuse(&mut self, to: Hashname, c: ChannelId, reason: &str, now: Instant) {
        let header = Header {
            c: Some(c),
            err: Some(reason.to_string()),
            ..Default::default()
        };
        self.send_packet(to, Packet::new(header), SendOptions::default(), now);
    }

    fn receive_reliable(&mut self, hashname: Hashname, c: ChannelId, packet: Packet, now: Instant) {
        let Some(channel) = reliable(&mut self.peers, &hashname, c) else {
            return;
        };
        let effects = channel.receive(packet, now);
        self.apply_effects(hashname, c, effects, now);
    }

    fn receive_raw(&mut self, hashname: Hashname, c: ChannelId, packet: Packet, from: &Path, now: Instant) {
        let Some(channel) = raw(&mut self.peers, &hashname, c) else {
            return;
        };
        channel.receive(&packet);
        let purpose = channel.purpose.clone();
        let channel_type = channel.channel_type.clone();
        let ended = channel.is_ended();
        if let Some(id) = channel.idle.take() {
            self.timers.cancel(id);
        }
        if ended {
            if let Some(peer) = self.peers.get_mut(&hashname) {
                peer.channels.remove(&c);
            }
        } else {
            let at = now + channel.timeout;
            channel.idle = Some(self.timers.schedule(at, Timer::RawIdle { peer: hashname, channel: c }));
        }

        match purpose {
            RawPurpose::App => {
                let event = match packet.header.err.clone() {
                    Some(reason) => Event::ChannelError {
                        peer: hashname,
                        channel: c,
                        error: ChannelError::Remote(reason),
                    },
                    None => Event::Message {
                        peer: hashname,
                        channel: c,
                        channel_type,
                        kind: ChannelKind::Raw,
                        payload: Payload::from_packet(packet),
                    },
                };
                self.events.push_back(event);
            }
            purpose => self.internal_reply(hashname, purpose, packet, from, now),
        }
    }

    fn handle_builtin(
        &mut self,
        builtin: Builtin,
        from: Hashname,
        c: ChannelId,
        packet: Packet,
        sender: Path,
        now: Instant,
    ) {
        match builtin {
            Builtin::Seek => self.handle_seek(from, c, packet, now),
            Builtin::Peer => self.handle_peer(from, packet, &sender, now),
            Builtin::Connect => self.handle_connect(from, packet, now),
            Builtin::Path => self.handle_path(from, c, packet, &sender, now),
            Builtin::Relay => self.handle_relay(from, packet, &sender, now),
            Builtin::Bridge => self.handle_bridge(from, c, packet, &sender, now),
        }
    }

    fn internal_reply(&mut self, from: Hashname, purpose: RawPurpose, packet: Packet, sender: &Path, now: Instant) {
        match purpose {
            RawPurpose::Lookup { target } => self.on_lookup_reply(from, target, packet, now),
            RawPurpose::Probe => self.on_probe_reply(from, packet, now),
            RawPurpose::PathProbe { path } => self.on_path_reply(from, path, packet, sender, now),
            RawPurpose::Bridge { target } => self.on_bridge_reply(from, target, packet, sender, now),
            RawPurpose::App => {}
        }
    }

    fn internal_failure(&mut self, from: Hashname, purpose: RawPurpose, now: Instant) {
        match purpose {
            RawPurpose::Lookup { target } => self.on_lookup_failure(from, target, now),
            RawPurpose::Probe => debug!(peer = %from.short(), "probe unanswered"),
            RawPurpose::PathProbe { path } => self.on_path_failure(from, &path),
            RawPurpose::Bridge { target } => {
                debug!(via = %from.short(), target = %target.short(), "bridge request unanswered")
            }
            RawPurpose::App => {}
        }
    }

    pub(crate) fn note_local(&mut self, hashname: Hashname, path: &Path) {
        if path.is_direct() && path.is_local() {
            self.locals.insert(hashname);
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    fn next_open_at(&mut self) -> u64 {
        let at = now_ms().max(self.last_open_at + 1);
        self.last_open_at = at;
        at
    }

    /// Send one open on each of `paths`, or on every known path when `paths`
    /// is empty. Returns whether anything was sent.
    pub(crate) fn send_open(&mut self, to: Hashname, paths: Vec<Path>, now: Instant) -> bool {
        let at = self.next_open_at();
        let Some(peer) = self.peers.get_mut(&to) else {
            return false;
        };
        if peer.key.is_none() {
            debug!(peer = %to.short(), "cannot open without a key");
            return false;
        }
        let line = match prepare_line(peer) {
            Ok(line) => line,
            Err(e) => {
                warn!(peer = %to.short(), error = %e, "cannot allocate line id");
                return false;
            }
        };
        let Some(secret) = peer.secret.as_ref() else {
            return false;
        };
        let bytes = match seal_open(&self.keypair, &to, line, at, peer.line_in, secret) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %to.short(), error = %e, "cannot seal open");
                return false;
            }
        };
        let paths = if paths.is_empty() {
            let mut all: Vec<Path> = peer
                .paths
                .iter()
                .map(|k| k.path.clone())
                .filter(Path::is_direct)
                .collect();
            all.extend(peer.relay_path().cloned());
            all
        } else {
            paths
        };
        if paths.is_empty() {
            debug!(peer = %to.short(), "no path to open on");
            return false;
        }
        peer.last_open = Some(now);
        self.lines.insert(line, to);

        trace!(peer = %to.short(), paths = paths.len(), at, "sending open");
        for path in &paths {
            self.transmit(to, path, bytes.clone(), now);
        }
        true
    }

    /// Put wire bytes for `to` on `path`, framing them for a relay if needed.
    pub(crate) fn transmit(&mut self, to: Hashname, path: &Path, bytes: Vec<u8>, now: Instant) {
        match path {
            Path::Relay { id } => self.send_relayed(*id, to, bytes, now),
            Path::Bridge { .. } => trace!(peer = %to.short(), path = %path, "bridge path is not directly sendable"),
            _ => self.transport.send(path, bytes),
        }
    }

    /// Encrypt and send a channel packet, opening the line first if needed.
    pub(crate) fn send_packet(&mut self, to: Hashname, packet: Packet, options: SendOptions, now: Instant) {
        let window = self.config.path_window;
        let Some(peer) = self.peers.get_mut(&to) else {
            debug!(peer = %to.short(), "send to unknown peer");
            return;
        };
        if !peer.has_line() {
            peer.last_packet = Some((packet, options));
            self.open_line(to, now);
            return;
        }

        let selection = peer.select_paths(&options, now, window);
        if !selection.paths.is_empty() {
            let (Some(line_in), Some(cipher)) = (peer.line_in, peer.cipher.as_ref()) else {
                return;
            };
            let sealed = packet
                .encode()
                .map_err(Error::from)
                .and_then(|plaintext| cipher.seal(line_in, &plaintext).map_err(Error::from));
            let wire = match sealed {
                Ok(wire) => wire,
                Err(e) => {
                    warn!(peer = %to.short(), error = %e, "cannot encode channel packet");
                    return;
                }
            };
            for path in &selection.paths {
                self.transmit(to, path, wire.clone(), now);
            }
        }
        if selection.settled {
            return;
        }

        debug!(peer = %to.short(), "no trusted path, re-opening");
        if let Some(peer) = self.peers.get_mut(&to) {
            peer.alive = false;
            peer.last_packet = Some((packet, options));
        }
        self.open_line(to, now);
    }

    /// Try to get a line to `to`: open on known paths, then ask whoever
    /// introduced it, then look it up.
    pub(crate) fn open_line(&mut self, to: Hashname, now: Instant) {
        let retry = self.config.open_retry;
        let reseek = self.config.reseek_interval;
        let Some(peer) = self.peers.get_mut(&to) else {
            return;
        };
        let recently = peer
            .last_open
            .is_some_and(|at| now.saturating_duration_since(at) < retry);
        let openable = peer.key.is_some() && !peer.paths.is_empty();
        let has_vias = !peer.vias.is_empty();
        let seek_due = peer
            .last_intro
            .is_none_or(|at| now.saturating_duration_since(at) >= reseek);

        let opened = openable && !recently && self.send_open(to, Vec::new(), now);
        if has_vias {
            self.introduce(to, now);
            return;
        }
        if opened || openable || !seek_due {
            return;
        }
        if let Some(peer) = self.peers.get_mut(&to) {
            peer.last_intro = Some(now);
        }
        debug!(peer = %to.short(), "no way to reach peer, seeking it");
        self.seek(to, now);
    }

    /// Open an internal raw channel and send its first packet.
    pub(crate) fn request(
        &mut self,
        to: Hashname,
        builtin: Builtin,
        purpose: RawPurpose,
        header: Header,
        options: SendOptions,
        now: Instant,
    ) -> Option<ChannelId> {
        if to == self.hashname {
            return None;
        }
        let timeout = self.config.seek_timeout;
        let peer = peer_entry(&mut self.peers, self.hashname, to);
        let c = peer.allocate_channel();
        let mut channel = RawChannel::new(c, to, builtin.as_str(), purpose, true, timeout);
        let packet = match channel.send(Packet::new(header)) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(peer = %to.short(), kind = builtin.as_str(), error = %e, "cannot encode request");
                return None;
            }
        };
        channel.idle = Some(
            self.timers
                .schedule(now + timeout, Timer::RawIdle { peer: to, channel: c }),
        );
        peer.channels.insert(c, ChannelSlot::Raw(channel));
        self.send_packet(to, packet, options, now);
        Some(c)
    }

    /// Answer a builtin request and end its channel.
    pub(crate) fn respond(&mut self, to: Hashname, c: ChannelId, mut header: Header, options: SendOptions, now: Instant) {
        header.c = Some(c);
        header.end = header.err.is_none();
        self.send_packet(to, Packet::new(header), options, now);
    }

    /// One-shot builtin packet that expects no answer.
    pub(crate) fn notify(
        &mut self,
        to: Hashname,
        builtin: Builtin,
        mut header: Header,
        body: Vec<u8>,
        options: SendOptions,
        now: Instant,
    ) {
        if to == self.hashname {
            return;
        }
        let c = peer_entry(&mut self.peers, self.hashname, to).allocate_channel();
        header.channel_type = Some(builtin.as_str().to_string());
        header.c = Some(c);
        header.end = true;
        self.send_packet(to, Packet::with_body(header, body), options, now);
    }

    // ========================================================================
    // Application Channels
    // ========================================================================

    /// Create a channel to `to`. Nothing is sent until the first
    /// [`Switch::send`].
    pub fn open_channel(&mut self, to: Hashname, channel_type: &str, kind: ChannelKind, now: Instant) -> Result<ChannelId> {
        if to == self.hashname {
            return Err(Error::SelfChannel);
        }
        if Builtin::from_type(channel_type).is_some() {
            return Err(Error::ReservedType(channel_type.to_string()));
        }
        let limits = ChannelLimits::from(&self.config);
        let raw_timeout = self.config.raw_timeout;
        let peer = peer_entry(&mut self.peers, self.hashname, to);
        let c = peer.allocate_channel();
        let slot = match kind {
            ChannelKind::Reliable => ChannelSlot::Reliable(ReliableChannel::new(c, to, channel_type, true, limits)),
            ChannelKind::Raw => {
                let mut channel = RawChannel::new(c, to, channel_type, RawPurpose::App, true, raw_timeout);
                channel.idle = Some(
                    self.timers
                        .schedule(now + raw_timeout, Timer::RawIdle { peer: to, channel: c }),
                );
                ChannelSlot::Raw(channel)
            }
        };
        peer.channels.insert(c, slot);
        debug!(peer = %to.short(), channel = c, channel_type, ?kind, "channel opened");
        Ok(c)
    }

    pub fn send(&mut self, to: Hashname, channel: ChannelId, payload: Payload, notify: bool, now: Instant) -> Result<()> {
        let peer = self.peers.get_mut(&to).ok_or(Error::UnknownPeer(to))?;
        let slot = peer
            .channels
            .get_mut(&channel)
            .ok_or(Error::UnknownChannel { peer: to, channel })?;
        match slot {
            ChannelSlot::Reliable(reliable) => {
                let packet = reliable.send(payload.into_packet(), notify, now)?;
                self.send_packet(to, packet, SendOptions::default(), now);
                self.sync_channel_timers(to, channel, now);
            }
            ChannelSlot::Raw(raw) => {
                if raw.is_ended() {
                    return Err(Error::ChannelEnded(channel));
                }
                let packet = raw.send(payload.into_packet())?;
                if let Some(id) = raw.idle.take() {
                    self.timers.cancel(id);
                }
                if raw.is_ended() {
                    peer.channels.remove(&channel);
                } else {
                    raw.idle = Some(
                        self.timers
                            .schedule(now + raw.timeout, Timer::RawIdle { peer: to, channel }),
                    );
                }
                self.send_packet(to, packet, SendOptions::default(), now);
            }
        }
        Ok(())
    }

    /// The application is done with the last packet delivered on a reliable
    /// channel; release the next one.
    pub fn delivered(&mut self, to: Hashname, channel: ChannelId, now: Instant) -> Result<()> {
        let peer = self.peers.get_mut(&to).ok_or(Error::UnknownPeer(to))?;
        match peer.channels.get_mut(&channel) {
            Some(ChannelSlot::Reliable(reliable)) => {
                let effects = reliable.delivered();
                self.apply_effects(to, channel, effects, now);
                Ok(())
            }
            Some(ChannelSlot::Raw(_)) => Ok(()),
            None => Err(Error::UnknownChannel { peer: to, channel }),
        }
    }

    /// Terminate a channel with `reason`, telling the peer.
    pub fn fail_channel(&mut self, to: Hashname, channel: ChannelId, reason: &str, now: Instant) -> Result<()> {
        let peer = self.peers.get_mut(&to).ok_or(Error::UnknownPeer(to))?;
        match peer.channels.get_mut(&channel) {
            Some(ChannelSlot::Reliable(reliable)) => {
                let effects: Vec<Effect> = reliable
                    .fail(ChannelError::Local(reason.to_string()), true)
                    .into_iter()
                    .filter(|e| !matches!(e, Effect::Fail(_)))
                    .collect();
                self.apply_effects(to, channel, effects, now);
            }
            Some(ChannelSlot::Raw(raw)) => {
                let header = Header {
                    err: Some(reason.to_string()),
                    ..Default::default()
                };
                let packet = raw.send(Packet::new(header))?;
                if let Some(id) = raw.idle.take() {
                    self.timers.cancel(id);
                }
                peer.channels.remove(&channel);
                self.send_packet(to, packet, SendOptions::default(), now);
            }
            None => return Err(Error::UnknownChannel { peer: to, channel }),
        }
        Ok(())
    }

    fn apply_effects(&mut self, peer: Hashname, channel: ChannelId, effects: Vec<Effect>, now: Instant) {
        for effect in effects {
            match effect {
                Effect::Send(packet) => self.send_packet(peer, packet, SendOptions::default(), now),
                Effect::Deliver(packet) => {
                    let channel_type = reliable(&mut self.peers, &peer, channel)
                        .map(|c| c.channel_type.clone())
                        .unwrap_or_default();
                    self.events.push_back(Event::Message {
                        peer,
                        channel,
                        channel_type,
                        kind: ChannelKind::Reliable,
                        payload: Payload::from_packet(packet),
                    });
                }
                Effect::Fail(error) => {
                    debug!(peer = %peer.short(), channel, error = %error, "channel failed");
                    self.events.push_back(Event::ChannelError { peer, channel, error });
                }
                Effect::Acked(seq) => self.events.push_back(Event::Acked { peer, channel, seq }),
                Effect::ArmAck => {
                    let at = now + self.config.auto_ack;
                    if let Some(c) = reliable(&mut self.peers, &peer, channel)
                        && c.timers.ack.is_none()
                    {
                        c.timers.ack = Some(self.timers.schedule(at, Timer::Ack { peer, channel }));
                    }
                }
            }
        }
        self.sync_channel_timers(peer, channel, now);
    }

    fn sync_channel_timers(&mut self, peer: Hashname, channel: ChannelId, now: Instant) {
        let resend_at = now + self.config.resend_interval;
        let reap_at = now + self.config.channel_timeout;
        let Some(c) = reliable(&mut self.peers, &peer, channel) else {
            return;
        };
        if c.needs_resend() {
            if c.timers.resend.is_none() {
                c.timers.resend = Some(self.timers.schedule(resend_at, Timer::Resend { peer, channel }));
            }
        } else if let Some(id) = c.timers.resend.take() {
            self.timers.cancel(id);
        }
        if c.is_ending() && c.timers.reap.is_none() {
            c.timers.reap = Some(self.timers.schedule(reap_at, Timer::Reap { peer, channel }));
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Run every timer due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        while let Some((_, timer)) = self.timers.pop_due(now) {
            match timer {
                Timer::Ack { peer, channel } => {
                    let Some(c) = reliable(&mut self.peers, &peer, channel) else {
                        continue;
                    };
                    c.timers.ack = None;
                    if let Some(ack) = c.ack() {
                        self.send_packet(peer, ack, SendOptions::default(), now);
                    }
                }
                Timer::Resend { peer, channel } => {
                    let Some(c) = reliable(&mut self.peers, &peer, channel) else {
                        continue;
                    };
                    c.timers.resend = None;
                    let effects = c.resend(now);
                    self.apply_effects(peer, channel, effects, now);
                }
                Timer::Reap { peer, channel } => self.reap(peer, channel),
                Timer::RawIdle { peer, channel } => self.raw_idle(peer, channel, now),
                Timer::PathSync { peer } => {
                    if let Some(p) = self.peers.get_mut(&peer) {
                        p.path_sync = None;
                    }
                    self.path_sync(peer, now);
                    self.timers
                        .schedule(now + self.config.seek_timeout, Timer::BridgeCheck { peer });
                }
                Timer::BridgeCheck { peer } => self.auto_bridge(peer, now),
                Timer::Maintenance => self.maintain(now),
            }
        }
    }

    fn reap(&mut self, peer: Hashname, channel: ChannelId) {
        let Some(p) = self.peers.get_mut(&peer) else {
            return;
        };
        if let Some(ChannelSlot::Reliable(c)) = p.channels.remove(&channel) {
            for id in [c.timers.ack, c.timers.resend].into_iter().flatten() {
                self.timers.cancel(id);
            }
            trace!(peer = %peer.short(), channel, "channel reaped");
        }
    }

    fn raw_idle(&mut self, peer: Hashname, channel: ChannelId, now: Instant) {
        let Some(p) = self.peers.get_mut(&peer) else {
            return;
        };
        let Some(ChannelSlot::Raw(c)) = p.channels.remove(&channel) else {
            return;
        };
        trace!(peer = %peer.short(), channel, channel_type = %c.channel_type, "raw channel idle");
        match c.purpose {
            RawPurpose::App => self.events.push_back(Event::ChannelError {
                peer,
                channel,
                error: ChannelError::Timeout,
            }),
            purpose => self.internal_failure(peer, purpose, now),
        }
    }

    pub(crate) fn after_path_in(&mut self, hashname: Hashname, path: &Path, outcome: PathIn, now: Instant) {
        match outcome {
            PathIn::Relayed { new: true } => {
                let at = now + self.config.path_sync_delay;
                let Some(peer) = self.peers.get_mut(&hashname) else {
                    return;
                };
                if let Some(id) = peer.path_sync.take() {
                    self.timers.cancel(id);
                }
                debug!(peer = %hashname.short(), path = %path, "reached through relay, will sync paths");
                peer.path_sync = Some(self.timers.schedule(at, Timer::PathSync { peer: hashname }));
            }
            PathIn::Added { second_kind } => {
                self.flag_bridged_path(hashname, path);
                if second_kind {
                    self.path_sync(hashname, now);
                }
            }
            PathIn::Relayed { new: false } | PathIn::Refreshed => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::Outbox;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn addr(port: u16) -> Path {
        Path::Ipv4 { ip: Ipv4Addr::LOCALHOST, port }
    }

    fn switch() -> Switch<Outbox> {
        Switch::new(Keypair::generate(), SwitchConfig::default(), Outbox::new())
    }

    /// Move datagrams between two switches until both are quiet.
    fn pump(a: &mut Switch<Outbox>, a_addr: &Path, b: &mut Switch<Outbox>, b_addr: &Path, now: Instant) {
        loop {
            let from_a = a.transport_mut().drain();
            let from_b = b.transport_mut().drain();
            if from_a.is_empty() && from_b.is_empty() {
                break;
            }
            for (path, bytes) in from_a {
                if &path == b_addr {
                    b.receive(&bytes, a_addr.clone(), now);
                }
            }
            for (path, bytes) in from_b {
                if &path == a_addr {
                    a.receive(&bytes, b_addr.clone(), now);
                }
            }
        }
    }

    fn events(switch: &mut Switch<Outbox>) -> Vec<Event> {
        std::iter::from_fn(|| switch.poll_event()).collect()
    }

    /// Drain events, marking each reliable message handled, and return the
    /// bodies in delivery order.
    fn consume(switch: &mut Switch<Outbox>, now: Instant) -> Vec<Vec<u8>> {
        let mut bodies = Vec::new();
        while let Some(event) = switch.poll_event() {
            if let Event::Message { peer, channel, kind: ChannelKind::Reliable, payload, .. } = event {
                bodies.push(payload.body);
                switch.delivered(peer, channel, now).expect("delivered");
            }
        }
        bodies
    }

    fn bodies(items: &[&str]) -> Vec<Vec<u8>> {
        items.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    fn channel_failed(events: &[Event], c: ChannelId) -> bool {
        events
            .iter()
            .any(|e| matches!(e, Event::ChannelError { channel, .. } if *channel == c))
    }

    #[test]
    fn first_send_opens_the_line_and_delivers() {
        let (mut a, mut b) = (switch(), switch());
        let (a_addr, b_addr) = (addr(1001), addr(1002));
        let now = Instant::now();
        b.listen("chat", ChannelKind::Reliable).expect("listen");
        let bn = a.add_peer(&b.public_key(), [b_addr.clone()]).expect("peer");

        let c = a.open_channel(bn, "chat", ChannelKind::Reliable, now).expect("open");
        a.send(bn, c, Payload::new("hello"), false, now).expect("send");
        pump(&mut a, &a_addr, &mut b, &b_addr, now);

        assert!(a.peer(&bn).is_some_and(Peer::has_line));
        assert!(events(&mut a).contains(&Event::LineUp { peer: bn }));
        let got = events(&mut b);
        assert!(got.contains(&Event::LineUp { peer: a.hashname() }));
        assert!(got.iter().any(|e| matches!(
            e,
            Event::Message { channel_type, payload, kind: ChannelKind::Reliable, .. }
                if channel_type == "chat" && payload.body == b"hello"
        )));
    }

    #[test]
    fn replayed_open_is_ignored() {
        let (mut a, mut b) = (switch(), switch());
        let a_addr = addr(1001);
        let now = Instant::now();
        let bn = a.add_peer(&b.public_key(), [addr(1002)]).expect("peer");
        assert!(a.send_open(bn, Vec::new(), now));
        let (_, open) = a.transport_mut().drain().pop().expect("open sent");

        b.receive(&open, a_addr.clone(), now);
        assert_eq!(b.transport_mut().drain().len(), 1, "reply open");
        b.receive(&open, a_addr, now);
        assert!(b.transport_mut().is_empty(), "stale open must not be answered");
    }

    #[test]
    fn unregistered_type_is_refused() {
        let (mut a, mut b) = (switch(), switch());
        let (a_addr, b_addr) = (addr(1001), addr(1002));
        let now = Instant::now();
        let bn = a.add_peer(&b.public_key(), [b_addr.clone()]).expect("peer");
        let c = a.open_channel(bn, "nope", ChannelKind::Raw, now).expect("open");
        a.send(bn, c, Payload::new("?"), false, now).expect("send");
        pump(&mut a, &a_addr, &mut b, &b_addr, now);

        assert!(events(&mut a).contains(&Event::ChannelError {
            peer: bn,
            channel: c,
            error: ChannelError::Remote(ERR_UNKNOWN_TYPE.into()),
        }));
        assert!(!events(&mut b).iter().any(|e| matches!(e, Event::Message { .. })));
    }

    #[test]
    fn reliable_channel_retransmits_until_timeout() {
        let mut a = switch();
        let b = switch();
        let (a_addr, b_addr) = (addr(1001), addr(1002));
        let t0 = Instant::now();
        let mut b = b;
        b.listen("chat", ChannelKind::Reliable).expect("listen");
        let bn = a.add_peer(&b.public_key(), [b_addr.clone()]).expect("peer");

        // bring the line up with a first exchange
        let c = a.open_channel(bn, "chat", ChannelKind::Reliable, t0).expect("open");
        a.send(bn, c, Payload::new("0"), false, t0).expect("send");
        pump(&mut a, &a_addr, &mut b, &b_addr, t0);
        events(&mut a);

        // the peer goes silent
        a.send(bn, c, Payload::new("1"), false, t0).expect("send");
        a.transport_mut().drain();
        let mut now = t0;
        let mut resent = 0;
        while now < t0 + Duration::from_secs(12) {
            now += Duration::from_millis(500);
            a.handle_timeout(now);
            resent += a.transport_mut().drain().len();
        }
        assert!(resent > 0);
        assert!(events(&mut a).iter().any(|e| matches!(
            e,
            Event::ChannelError { error: ChannelError::Timeout, channel, .. } if *channel == c
        )));
    }

    #[test]
    fn raw_channel_goes_idle() {
        let mut a = switch();
        let bn = Hashname::from_bytes([9; 32]);
        let t0 = Instant::now();
        let c = a.open_channel(bn, "ping", ChannelKind::Raw, t0).expect("open");
        a.handle_timeout(t0 + a.config().raw_timeout);
        assert_eq!(
            events(&mut a),
            vec![Event::ChannelError { peer: bn, channel: c, error: ChannelError::Timeout }]
        );
        assert!(a.send(bn, c, Payload::new("late"), false, t0).is_err());
    }

    #[test]
    fn builtin_types_are_reserved() {
        let mut a = switch();
        assert!(matches!(a.listen("seek", ChannelKind::Raw), Err(Error::ReservedType(_))));
        let me = a.hashname();
        assert!(matches!(
            a.open_channel(me, "chat", ChannelKind::Raw, Instant::now()),
            Err(Error::SelfChannel)
        ));
    }

    #[test]
    fn garbage_is_counted_and_dropped() {
        let mut a = switch();
        a.receive(&[0, 9, 1], addr(1), Instant::now());
        a.receive(&[0, 1, 0x7f, 1, 2], addr(1), Instant::now());
        assert_eq!(a.stats().dropped, 2);
        assert!(a.poll_event().is_none());
    }

    #[test]
    fn sends_before_the_line_is_up_all_arrive_in_order() {
        let (mut a, mut b) = (switch(), switch());
        let (a_addr, b_addr) = (addr(1001), addr(1002));
        let now = Instant::now();
        b.listen("chat", ChannelKind::Reliable).expect("listen");
        let bn = a.add_peer(&b.public_key(), [b_addr.clone()]).expect("peer");

        let c = a.open_channel(bn, "chat", ChannelKind::Reliable, now).expect("open");
        for body in ["zero", "one", "two"] {
            a.send(bn, c, Payload::new(body), false, now).expect("send");
        }
        pump(&mut a, &a_addr, &mut b, &b_addr, now);

        assert_eq!(consume(&mut b, now), bodies(&["zero", "one", "two"]));
        assert!(!channel_failed(&events(&mut a), c));
    }

    #[test]
    fn lost_first_packet_of_a_channel_is_recovered() {
        let (mut a, mut b) = (switch(), switch());
        let (a_addr, b_addr) = (addr(1001), addr(1002));
        let t0 = Instant::now();
        b.listen("chat", ChannelKind::Reliable).expect("listen");
        let bn = a.add_peer(&b.public_key(), [b_addr.clone()]).expect("peer");

        let warmup = a.open_channel(bn, "chat", ChannelKind::Reliable, t0).expect("open");
        a.send(bn, warmup, Payload::new("hi"), false, t0).expect("send");
        pump(&mut a, &a_addr, &mut b, &b_addr, t0);
        assert_eq!(consume(&mut b, t0), bodies(&["hi"]));
        events(&mut a);

        let c = a.open_channel(bn, "chat", ChannelKind::Reliable, t0).expect("open");
        a.send(bn, c, Payload::new("zero"), false, t0).expect("send");
        a.send(bn, c, Payload::new("one"), false, t0).expect("send");
        let mut sent = a.transport_mut().drain();
        assert_eq!(sent.len(), 2);
        let (_, second) = sent.pop().expect("second packet");
        b.receive(&second, a_addr.clone(), t0);
        assert!(consume(&mut b, t0).is_empty(), "held until the first packet arrives");
        assert!(!events(&mut b).iter().any(|e| matches!(e, Event::ChannelError { .. })));

        let mut got = Vec::new();
        let mut now = t0;
        while now < t0 + Duration::from_secs(5) {
            now += Duration::from_millis(250);
            a.handle_timeout(now);
            b.handle_timeout(now);
            pump(&mut a, &a_addr, &mut b, &b_addr, now);
            got.extend(consume(&mut b, now));
        }
        assert_eq!(got, bodies(&["zero", "one"]));
        assert!(!channel_failed(&events(&mut a), c));
    }

    #[test]
    fn older_open_with_a_new_line_does_not_rebind() {
        let (mut a, mut b) = (switch(), switch());
        let (a_addr, b_addr) = (addr(1001), addr(1002));
        let now = Instant::now();
        b.listen("chat", ChannelKind::Reliable).expect("listen");
        let bn = a.add_peer(&b.public_key(), [b_addr.clone()]).expect("peer");
        assert!(a.send_open(bn, Vec::new(), now));
        pump(&mut a, &a_addr, &mut b, &b_addr, now);
        events(&mut b);

        let an = a.hashname();
        let peer = b.peer(&an).expect("peer");
        let (line_in, line_out, open_at) = (peer.line_in, peer.line_out, peer.open_at);
        let lines = b.lines.clone();
        let older = open_at.expect("open seen") - 1;
        let stale = seal_open(
            &a.keypair,
            &bn,
            LineId::from_bytes([7; 16]),
            older,
            None,
            &LineSecret::generate(),
        )
        .expect("seal");
        b.receive(&stale, a_addr.clone(), now);

        let peer = b.peer(&an).expect("peer");
        assert_eq!(peer.line_in, line_in);
        assert_eq!(peer.line_out, line_out);
        assert_eq!(peer.open_at, open_at);
        assert_eq!(b.lines, lines);
        assert!(b.transport_mut().is_empty(), "older open must not be answered");
        assert!(events(&mut b).is_empty());

        // the existing line keys still decrypt
        let c = a.open_channel(bn, "chat", ChannelKind::Reliable, now).expect("open");
        a.send(bn, c, Payload::new("still here"), false, now).expect("send");
        pump(&mut a, &a_addr, &mut b, &b_addr, now);
        assert_eq!(consume(&mut b, now), bodies(&["still here"]));
    }

    #[test]
    fn handshake_takes_one_open_each_way() {
        let (mut a, mut b) = (switch(), switch());
        let (a_addr, b_addr) = (addr(1001), addr(1002));
        let now = Instant::now();
        let bn = a.add_peer(&b.public_key(), [b_addr.clone()]).expect("peer");
        let is_open = |bytes: &[u8]| matches!(classify(bytes), Ok(Datagram::Open(_)));

        assert!(a.send_open(bn, Vec::new(), now));
        let (_, open) = a.transport_mut().drain().pop().expect("open sent");
        b.receive(&open, a_addr.clone(), now);
        let replies = b.transport_mut().drain();
        assert_eq!(replies.len(), 1);
        assert!(is_open(&replies[0].1));

        a.receive(&replies[0].1, b_addr.clone(), now);
        assert!(a.peer(&bn).is_some_and(Peer::has_line));
        assert!(b.peer(&a.hashname()).is_some_and(Peer::has_line));
        assert!(
            !a.transport_mut().drain().iter().any(|(_, bytes)| is_open(bytes)),
            "a reply must not be answered"
        );

        // re-opening a live line is not answered either
        assert!(a.send_open(bn, Vec::new(), now));
        let (_, reopen) = a.transport_mut().drain().pop().expect("open sent");
        b.receive(&reopen, a_addr, now);
        assert!(!b.transport_mut().drain().iter().any(|(_, bytes)| is_open(bytes)));
    }

    #[test]
    fn oversized_send_is_refused_and_nothing_is_queued() {
        let (mut a, mut b) = (switch(), switch());
        let (a_addr, b_addr) = (addr(1001), addr(1002));
        let now = Instant::now();
        b.listen("chat", ChannelKind::Reliable).expect("listen");
        let bn = a.add_peer(&b.public_key(), [b_addr.clone()]).expect("peer");
        let c = a.open_channel(bn, "chat", ChannelKind::Reliable, now).expect("open");

        let result = a.send(bn, c, Payload::new(vec![0u8; 70_000]), false, now);
        assert!(matches!(result, Err(Error::Packet(crate::messages::PacketError::Oversized))));
        assert!(a.transport_mut().is_empty());

        a.send(bn, c, Payload::new("fits"), false, now).expect("send");
        pump(&mut a, &a_addr, &mut b, &b_addr, now);
        assert_eq!(consume(&mut b, now), bodies(&["fits"]));
    }

    #[test]
    fn relay_refuses_chains_and_self_addressed_frames() {
        let (mut r, mut b) = (switch(), switch());
        let (r_addr, b_addr) = (addr(1001), addr(1002));
        let now = Instant::now();
        let bn = r.add_peer(&b.public_key(), [b_addr.clone()]).expect("peer");
        assert!(r.send_open(bn, Vec::new(), now));
        pump(&mut r, &r_addr, &mut b, &b_addr, now);
        assert!(r.peer(&bn).is_some_and(Peer::has_line));

        let frame = |to: Hashname| {
            let header = Header {
                to: Some(to.to_hex()),
                ..Default::default()
            };
            Packet::with_body(header, vec![1, 2, 3])
        };
        let sender = Hashname::from_bytes([5; 32]);

        // a frame that already came over a relay
        let via = Path::Relay { id: Hashname::from_bytes([6; 32]) };
        r.handle_relay(sender, frame(bn), &via, now);
        assert_eq!(r.stats().relay_dropped, 1);

        // a frame addressed back to whoever sent it
        r.handle_relay(bn, frame(bn), &b_addr, now);
        assert_eq!(r.stats().relay_dropped, 2);

        assert_eq!(r.stats().relayed, 0);
        assert!(r.transport_mut().is_empty(), "nothing forwarded");
    }
}
