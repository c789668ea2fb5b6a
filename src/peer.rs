//! Per-peer state.
//!
//! A [`Peer`] is created the first time a hashname is referenced (seed, open,
//! `see` answer, introduction) and lives as long as the switch. It owns the
//! peer's channels, line keys and known paths; channels refer back to it by
//! hashname only.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::channel::{ChannelKind, ReliableChannel};
use crate::crypto::{LineCipher, LineSecret};
use crate::identity::{Hashname, LineId};
use crate::messages::{ChannelId, Packet};
use crate::path::{sort_for_send, KnownPath, Path, PathKind};
use crate::raw::RawChannel;
use crate::scheduler::TimerId;

#[derive(Debug)]
pub enum ChannelSlot {
    Reliable(ReliableChannel),
    Raw(RawChannel),
}

impl ChannelSlot {
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelSlot::Reliable(_) => ChannelKind::Reliable,
            ChannelSlot::Raw(_) => ChannelKind::Raw,
        }
    }

    pub fn channel_type(&self) -> &str {
        match self {
            ChannelSlot::Reliable(c) => &c.channel_type,
            ChannelSlot::Raw(c) => &c.channel_type,
        }
    }

    fn is_app(&self) -> bool {
        match self {
            ChannelSlot::Reliable(_) => true,
            ChannelSlot::Raw(c) => !c.is_internal(),
        }
    }
}

/// How a packet should leave the switch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    /// Try this path before the others.
    pub target: Option<Path>,
    /// Send on this path and nothing else.
    pub only: Option<Path>,
    /// The packet is being forwarded for a relay; never fall back to relaying it again.
    pub from_relay: bool,
}

/// Paths chosen for one outbound packet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub paths: Vec<Path>,
    /// A trusted path (or the relay, or a forced path) was reached.
    pub settled: bool,
}

/// A path offered by an introducer that cannot be used before a line exists.
#[derive(Debug, Clone, PartialEq)]
pub struct Possible {
    pub path: Path,
    pub via: Hashname,
}

/// Outcome of recording an inbound path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathIn {
    /// Heard through a relay; the peer is not proven reachable. `new` is
    /// set the first time this relay is seen.
    Relayed { new: bool },
    /// Path already known; freshness updated.
    Refreshed,
    /// New path. `second_kind` is set when this is the first path of a
    /// new type next to existing ones.
    Added { second_kind: bool },
}

#[derive(Debug)]
pub struct Peer {
    pub hashname: Hashname,
    pub key: Option<[u8; 32]>,
    pub paths: Vec<KnownPath>,
    /// Bridge and webrtc paths offered by introducers, not yet usable.
    pub possible: Vec<Possible>,

    /// Line id we chose; inbound frames carry it.
    pub line_out: Option<LineId>,
    /// Line id the peer chose; stamped on our outbound frames.
    pub line_in: Option<LineId>,
    pub(crate) secret: Option<LineSecret>,
    pub(crate) cipher: Option<LineCipher>,
    pub open_at: Option<u64>,

    pub alive: bool,
    pub elected: bool,
    pub bucket: Option<usize>,
    pub seed: bool,
    /// May ask us to bridge, and may be asked to bridge for us.
    pub bridging: bool,
    /// Peer currently bridging our line to this one.
    pub bridge_via: Option<Hashname>,

    pub channels: HashMap<ChannelId, ChannelSlot>,
    next_channel: ChannelId,

    /// Who told us about this peer, and the address they reported.
    pub vias: HashMap<Hashname, Option<Path>>,

    pub(crate) last_packet: Option<(Packet, SendOptions)>,
    pub last_in: Option<Instant>,
    pub last_out: Option<Instant>,
    pub last_open: Option<Instant>,
    pub last_intro: Option<Instant>,
    pub path_sync: Option<TimerId>,
}

impl Peer {
    pub fn new(hashname: Hashname, local: &Hashname) -> Self {
        // the two ends allocate from disjoint parities
        let next_channel = if local < &hashname { 1 } else { 2 };
        Self {
            hashname,
            key: None,
            paths: Vec::new(),
            possible: Vec::new(),
            line_out: None,
            line_in: None,
            secret: None,
            cipher: None,
            open_at: None,
            alive: false,
            elected: false,
            bucket: None,
            seed: false,
            bridging: false,
            bridge_via: None,
            channels: HashMap::new(),
            next_channel,
            vias: HashMap::new(),
            last_packet: None,
            last_in: None,
            last_out: None,
            last_open: None,
            last_intro: None,
            path_sync: None,
        }
    }

    pub fn has_line(&self) -> bool {
        self.cipher.is_some() && self.line_in.is_some()
    }

    pub fn allocate_channel(&mut self) -> ChannelId {
        loop {
            let id = self.next_channel;
            self.next_channel = self.next_channel.wrapping_add(2).max(1);
            if !self.channels.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn has_app_channels(&self) -> bool {
        self.channels.values().any(ChannelSlot::is_app)
    }

    /// Record a validated inbound packet arriving on `path`.
    pub fn path_in(&mut self, path: &Path, now: Instant) -> PathIn {
        self.last_in = Some(now);
        if path.kind() == PathKind::Relay {
            if let Some(known) = self.paths.iter_mut().find(|k| k.path.matches(path)) {
                known.last_in = Some(now);
                return PathIn::Relayed { new: false };
            }
            // a new relay means direct paths stopped working
            self.paths.retain(|k| k.path.kind() != PathKind::Relay);
            let mut known = KnownPath::new(path.clone());
            known.last_in = Some(now);
            self.paths.push(known);
            self.alive = false;
            return PathIn::Relayed { new: true };
        }

        self.alive = true;
        if let Some(known) = self.paths.iter_mut().find(|k| k.path.matches(path)) {
            known.last_in = Some(now);
            return PathIn::Refreshed;
        }

        let direct: Vec<PathKind> = self
            .paths
            .iter()
            .map(|k| k.path.kind())
            .filter(|k| *k != PathKind::Relay)
            .collect();
        let second_kind = !direct.is_empty() && !direct.contains(&path.kind());
        let mut known = KnownPath::new(path.clone());
        known.last_in = Some(now);
        self.paths.push(known);
        self.possible.retain(|p| !p.path.matches(path));
        trace!(peer = %self.hashname.short(), path = %path, "new path");
        PathIn::Added { second_kind }
    }

    /// Remember a path without evidence of reachability (seed entries).
    pub fn add_candidate_path(&mut self, path: Path) {
        if !self.paths.iter().any(|k| k.path.matches(&path)) {
            self.paths.push(KnownPath::new(path));
        }
    }

    pub fn relay_path(&self) -> Option<&Path> {
        self.paths
            .iter()
            .map(|k| &k.path)
            .find(|p| p.kind() == PathKind::Relay)
    }

    /// Addresses worth advertising for this peer to a third party.
    pub fn reachable_paths(&self) -> Vec<Path> {
        self.paths
            .iter()
            .filter(|k| k.path.is_direct())
            .map(|k| k.path.clone())
            .collect()
    }

    pub fn only_relayed(&self) -> bool {
        !self.paths.is_empty() && self.paths.iter().all(|k| k.path.kind() == PathKind::Relay)
    }

    /// Choose the paths a line packet goes out on, marking them as sent.
    pub fn select_paths(&mut self, options: &SendOptions, now: Instant, window: Duration) -> Selection {
        let selection = match &options.only {
            Some(only) => Selection {
                paths: vec![only.clone()],
                settled: true,
            },
            None => self.ordered_candidates(options, now, window),
        };
        for path in &selection.paths {
            if let Some(known) = self.paths.iter_mut().find(|k| k.path.matches(path)) {
                known.last_out = Some(now);
            }
        }
        if !selection.paths.is_empty() {
            self.last_out = Some(now);
        }
        selection
    }

    fn ordered_candidates(&self, options: &SendOptions, now: Instant, window: Duration) -> Selection {
        let mut candidates: Vec<KnownPath> = self
            .paths
            .iter()
            .filter(|k| k.path.kind() != PathKind::Relay)
            .cloned()
            .collect();
        sort_for_send(&mut candidates, options.target.as_ref());

        let mut paths = Vec::new();
        for known in candidates {
            paths.push(known.path.clone());
            if known.is_valid(now, window) {
                return Selection { paths, settled: true };
            }
        }
        let mut settled = false;
        if !options.from_relay
            && let Some(relay) = self.relay_path()
        {
            paths.push(relay.clone());
            settled = true;
        }
        Selection { paths, settled }
    }

    /// Highest-priority direct path.
    pub fn best_direct_path(&self) -> Option<&Path> {
        self.paths
            .iter()
            .filter(|k| k.path.is_direct())
            .max_by_key(|k| (k.priority, k.last_in))
            .map(|k| &k.path)
    }

    pub fn add_possible(&mut self, path: Path, via: Hashname) {
        self.possible.retain(|p| !p.path.matches(&path));
        self.possible.push(Possible { path, via });
    }

    pub fn knows_path(&self, path: &Path) -> bool {
        self.paths.iter().any(|k| k.path.matches(path))
    }

    pub fn has_local_path(&self) -> bool {
        self.paths.iter().any(|k| k.path.is_local())
    }

    pub fn set_priority(&mut self, path: &Path, priority: i32) {
        if let Some(known) = self.paths.iter_mut().find(|k| k.path.matches(path)) {
            known.priority = priority;
        }
    }

    pub fn priority_of(&self, path: &Path) -> i32 {
        self.paths
            .iter()
            .find(|k| k.path.matches(path))
            .map_or_else(|| path.default_priority(), |k| k.priority)
    }

    pub fn demote(&mut self, path: &Path) {
        if let Some(known) = self.paths.iter_mut().find(|k| k.path.matches(path)) {
            known.priority -= 1;
        }
    }

    pub fn add_via(&mut self, via: Hashname, address: Option<Path>) {
        let slot = self.vias.entry(via).or_insert(None);
        if address.is_some() {
            *slot = address;
        }
    }

    /// Forget the current line so the next send re-opens.
    pub fn reset_line(&mut self) {
        self.cipher = None;
        self.line_in = None;
        self.alive = false;
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        self.last_in
            .is_none_or(|last| now.saturating_duration_since(last) >= timeout)
    }
}
