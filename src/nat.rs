//! # NAT Traversal
//!
//! How two peers that cannot simply address each other end up with a line.
//!
//! ```text
//!   A                         C (knows B)                       B
//!   |-- keepalive to B's addr (hole punch) ------------------------>|
//!   |-- peer{peer: B, paths} -->|                                   |
//!   |                           |-- connect{paths, body: A key} -->|
//!   |<-------------------------------- open on each direct path ----|
//!   |<========== relay frames via C when nothing direct works =====>|
//! ```
//!
//! | Mechanism | Used when |
//! |-----------|-----------|
//! | introduction (`peer` / `connect`) | a via exists for the target |
//! | relay | no viable direct path pair; frames go through C |
//! | path sync (`path`) | a peer shows up over a relay or a new path type |
//! | bridge | still only relayed after path sync; C forwards raw line packets |
//!
//! Relayed frames are never relayed again, and a relay forwards at most
//! `relay_rate` frames per `relay_window` from any one source.

use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::crypto::parse_public_key;
use crate::error::{Error, Result, ERR_INVALID_PATH, ERR_NOT_ALLOWED};
use crate::identity::{Hashname, LineId};
use crate::messages::{ChannelId, Header, Packet};
use crate::path::{viable_between, Path, PathKind, PRIORITY_RELAY};
use crate::peer::{Peer, SendOptions};
use crate::protocols::Transport;
use crate::raw::RawPurpose;
use crate::switch::{peer_entry, Builtin, Switch};

/// Priority a failed path probe leaves behind.
const PRIORITY_FAILED: i32 = -10;

impl<T: Transport> Switch<T> {
    // ========================================================================
    // Introductions
    // ========================================================================

    /// Ask every via of `to` for an introduction. Vias are used once.
    pub(crate) fn introduce(&mut self, to: Hashname, now: Instant) {
        let Some(peer) = self.peers.get_mut(&to) else {
            return;
        };
        let vias = std::mem::take(&mut peer.vias);
        if vias.is_empty() {
            return;
        }
        debug!(peer = %to.short(), vias = vias.len(), "asking for introductions");
        for (via, address) in vias {
            if via == to || via == self.hashname {
                continue;
            }
            if let Some(address) = &address
                && address.is_direct()
            {
                self.transport.send(address, Vec::new());
            }
            self.request_peer(via, to, address.is_none(), now);
        }
    }

    fn request_peer(&mut self, via: Hashname, target: Hashname, relay: bool, now: Instant) {
        let via_is_local = self.peers.get(&via).is_some_and(Peer::has_local_path);
        let mut paths = self.public_paths.clone();
        if via_is_local {
            paths.extend(self.local_paths.iter().cloned());
        }
        if relay || paths.is_empty() {
            paths.push(Path::Relay { id: via });
        }
        let mut header = Header {
            peer: Some(target),
            ..Default::default()
        };
        header.set_paths(&paths);
        self.notify(via, Builtin::Peer, header, Vec::new(), SendOptions::default(), now);
    }

    /// `from` wants to reach `peer`; pass its key and paths along.
    pub(crate) fn handle_peer(&mut self, from: Hashname, packet: Packet, sender: &Path, now: Instant) {
        let Some(target) = packet.header.peer else {
            warn!(peer = %from.short(), "peer request without target");
            return;
        };
        if target == self.hashname || target == from {
            return;
        }
        let Some(target_peer) = self.peers.get(&target).filter(|p| p.has_line()) else {
            debug!(from = %from.short(), target = %target.short(), "introduction to a peer we have no line to");
            return;
        };
        let Some(key) = self.peers.get(&from).and_then(|p| p.key) else {
            return;
        };
        let target_local = target_peer.has_local_path();
        let target_paths = target_peer.reachable_paths();
        let from_relay = sender.kind() == PathKind::Relay;

        let mut paths: Vec<Path> = packet
            .header
            .parsed_paths()
            .into_iter()
            .filter(|p| !(from_relay && p.kind() == PathKind::Relay))
            .filter(|p| target_local || !p.is_local())
            .collect();
        if sender.is_direct() && (target_local || !sender.is_local()) && !paths.iter().any(|p| p.matches(sender)) {
            paths.push(sender.clone());
        }

        if !viable_between(&paths, &target_paths) {
            for hashname in [from, target] {
                if let Some(peer) = self.peers.get_mut(&hashname) {
                    peer.bridging = true;
                }
            }
            paths.push(Path::Bridge { id: from });
            if !from_relay && !paths.iter().any(|p| p.kind() == PathKind::Relay) {
                paths.push(Path::Relay { id: self.hashname });
            }
        }

        debug!(from = %from.short(), to = %target.short(), paths = paths.len(), "introducing");
        let mut header = Header::default();
        header.set_paths(&paths);
        self.notify(target, Builtin::Connect, header, key.to_vec(), SendOptions::default(), now);
    }

    /// Someone wants to talk to us: open on every direct path offered, or
    /// through the introducer when there are none.
    pub(crate) fn handle_connect(&mut self, from: Hashname, packet: Packet, now: Instant) {
        let key = match parse_public_key(&packet.body) {
            Ok(key) => key,
            Err(e) => {
                warn!(peer = %from.short(), error = %e, "connect with invalid key");
                return;
            }
        };
        let hashname = Hashname::from_public_key(&key);
        if hashname == self.hashname || hashname == from {
            return;
        }
        let peer = peer_entry(&mut self.peers, self.hashname, hashname);
        peer.key = Some(key);

        let mut targets = Vec::new();
        for path in packet.header.parsed_paths() {
            match path.kind() {
                PathKind::Bridge | PathKind::Webrtc => peer.add_possible(path, from),
                _ => targets.push(path),
            }
        }
        if targets.is_empty() {
            targets.push(Path::Relay { id: from });
        }
        debug!(peer = %hashname.short(), via = %from.short(), paths = targets.len(), "connect");
        self.send_open(hashname, targets, now);
    }

    // ========================================================================
    // Relay
    // ========================================================================

    /// Frame a datagram for `to` and hand it to `via`.
    pub(crate) fn send_relayed(&mut self, via: Hashname, to: Hashname, bytes: Vec<u8>, now: Instant) {
        if via == self.hashname || via == to {
            trace!(via = %via.short(), to = %to.short(), "unusable relay");
            return;
        }
        let header = Header {
            to: Some(to.to_hex()),
            ..Default::default()
        };
        let options = SendOptions {
            from_relay: true,
            ..SendOptions::default()
        };
        self.notify(via, Builtin::Relay, header, bytes, options, now);
    }

    pub(crate) fn handle_relay(&mut self, from: Hashname, packet: Packet, sender: &Path, now: Instant) {
        let Some(to) = packet
            .header
            .to
            .as_deref()
            .and_then(|s| Hashname::from_hex(s).ok())
        else {
            warn!(peer = %from.short(), "relay frame without valid target");
            return;
        };
        if to == self.hashname {
            trace!(via = %from.short(), bytes = packet.body.len(), "relayed datagram");
            self.receive(&packet.body, Path::Relay { id: from }, now);
            return;
        }
        if sender.kind() == PathKind::Relay {
            self.counters.relay_dropped += 1;
            debug!(peer = %from.short(), "refusing to relay a relayed frame");
            return;
        }
        if to == from {
            self.counters.relay_dropped += 1;
            warn!(peer = %from.short(), "relay frame addressed to its sender");
            return;
        }
        if !self.config.relay {
            self.counters.relay_dropped += 1;
            trace!(peer = %from.short(), "relaying disabled");
            return;
        }
        if !self.peers.get(&to).is_some_and(|p| p.alive && p.has_line()) {
            self.counters.relay_dropped += 1;
            debug!(from = %from.short(), to = %to.short(), "relay target not reachable");
            return;
        }
        if !self.throttle.allow(&from, now) {
            self.counters.relay_dropped += 1;
            debug!(from = %from.short(), "relay rate exceeded");
            return;
        }
        self.counters.relayed += 1;
        trace!(from = %from.short(), to = %to.short(), "relaying");
        let header = Header {
            to: Some(to.to_hex()),
            ..Default::default()
        };
        let options = SendOptions {
            from_relay: true,
            ..SendOptions::default()
        };
        self.notify(to, Builtin::Relay, header, packet.body, options, now);
    }

    // ========================================================================
    // Path Sync
    // ========================================================================

    /// Probe every path of `peer` (the relay too while it is not alive) and
    /// tell it about our other addresses.
    pub fn path_sync(&mut self, peer: Hashname, now: Instant) {
        let Some(p) = self.peers.get(&peer) else {
            return;
        };
        if !p.has_line() {
            return;
        }
        let targets: Vec<Path> = p
            .paths
            .iter()
            .map(|k| k.path.clone())
            .filter(|path| path.kind() != PathKind::Relay || !p.alive)
            .collect();
        let mut alternates = self.public_paths.clone();
        if p.has_local_path() {
            alternates.extend(self.local_paths.iter().cloned());
        }
        debug!(peer = %peer.short(), probes = targets.len(), alternates = alternates.len(), "path sync");

        for path in targets {
            let priority = if path.kind() == PathKind::Relay { 0 } else { 1 };
            let mut header = Header {
                priority: Some(priority),
                ..Default::default()
            };
            if !alternates.is_empty() {
                header.set_paths(&alternates);
            }
            self.send_path_probe(peer, path, header, now);
        }
    }

    fn send_path_probe(&mut self, peer: Hashname, path: Path, header: Header, now: Instant) {
        let options = SendOptions {
            only: Some(path.clone()),
            ..SendOptions::default()
        };
        self.request(peer, Builtin::Path, RawPurpose::PathProbe { path }, header, options, now);
    }

    /// Probe addresses `peer` says it also has.
    fn probe_alternates(&mut self, peer: Hashname, paths: Vec<Path>, now: Instant) {
        for path in paths {
            let Some(p) = self.peers.get_mut(&peer) else {
                return;
            };
            if p.knows_path(&path) {
                continue;
            }
            match path.kind() {
                PathKind::Webrtc | PathKind::Bridge => p.add_possible(path, peer),
                PathKind::Relay => {}
                _ => {
                    if path.is_local() && !p.has_local_path() {
                        continue;
                    }
                    trace!(peer = %peer.short(), path = %path, "probing alternate path");
                    let header = Header {
                        priority: Some(1),
                        ..Default::default()
                    };
                    self.send_path_probe(peer, path, header, now);
                }
            }
        }
    }

    pub(crate) fn handle_path(&mut self, from: Hashname, c: ChannelId, packet: Packet, sender: &Path, now: Instant) {
        self.probe_alternates(from, packet.header.parsed_paths(), now);
        let bridge_via = self.peers.get(&from).and_then(|p| p.bridge_via);
        let bridged = bridge_via
            .and_then(|b| self.peers.get(&b))
            .is_some_and(|b| b.knows_path(sender));
        if let Some(priority) = packet.header.priority
            && let Some(peer) = self.peers.get_mut(&from)
        {
            peer.set_priority(sender, priority);
        }

        let priority = if sender.kind() == PathKind::Relay {
            0
        } else if bridged {
            1
        } else {
            2
        };
        let header = Header {
            priority: Some(priority),
            path: Some(sender.to_value()),
            ..Default::default()
        };
        let options = SendOptions {
            only: Some(sender.clone()),
            ..SendOptions::default()
        };
        self.respond(from, c, header, options, now);
    }

    pub(crate) fn on_path_reply(&mut self, from: Hashname, probed: Path, packet: Packet, sender: &Path, now: Instant) {
        if let Some(reason) = &packet.header.err {
            debug!(peer = %from.short(), path = %probed, reason = %reason, "path probe refused");
            self.on_path_failure(from, &probed);
            return;
        }
        if let Some(priority) = packet.header.priority
            && let Some(peer) = self.peers.get_mut(&from)
        {
            peer.set_priority(sender, priority);
        }
        // through a bridge the peer sees the bridge, not us
        let bridged = self
            .peers
            .get(&from)
            .and_then(|p| p.bridge_via)
            .and_then(|b| self.peers.get(&b))
            .is_some_and(|b| b.knows_path(sender));
        if !bridged && let Some(observed) = packet.header.parsed_path() {
            self.learn_public_path(observed);
        }
        self.probe_alternates(from, packet.header.parsed_paths(), now);
    }

    pub(crate) fn on_path_failure(&mut self, from: Hashname, probed: &Path) {
        if let Some(peer) = self.peers.get_mut(&from) {
            trace!(peer = %from.short(), path = %probed, "path probe failed");
            peer.set_priority(probed, PRIORITY_FAILED);
        }
    }

    fn learn_public_path(&mut self, path: Path) {
        if !path.is_direct() || path.is_local() || self.public_paths.contains(&path) {
            return;
        }
        info!(path = %path, "learned public path");
        self.public_paths.push(path);
    }

    /// A path that belongs to the peer bridging us ranks below everything
    /// direct.
    pub(crate) fn flag_bridged_path(&mut self, hashname: Hashname, path: &Path) {
        let Some(via) = self.peers.get(&hashname).and_then(|p| p.bridge_via) else {
            return;
        };
        if !self.peers.get(&via).is_some_and(|b| b.knows_path(path)) {
            return;
        }
        if let Some(peer) = self.peers.get_mut(&hashname) {
            peer.set_priority(path, PRIORITY_RELAY);
        }
    }

    // ========================================================================
    // Bridge
    // ========================================================================

    /// Ask `via` to forward raw line packets between us and `target`.
    pub fn bridge(&mut self, target: Hashname, via: Hashname, now: Instant) -> Result<()> {
        let peer = self.peers.get(&target).ok_or(Error::UnknownPeer(target))?;
        let (Some(line_in), Some(line_out)) = (peer.line_in, peer.line_out) else {
            return Err(Error::NoLine(target));
        };
        if !self.peers.get(&via).is_some_and(Peer::has_line) {
            return Err(Error::NoLine(via));
        }
        let path = peer
            .possible
            .iter()
            .find(|p| p.via == via && p.path.kind() == PathKind::Bridge)
            .map_or(Path::Bridge { id: target }, |p| p.path.clone());

        info!(target = %target.short(), via = %via.short(), "requesting bridge");
        let header = Header {
            to: Some(line_in.to_hex()),
            from: Some(line_out.to_hex()),
            path: Some(path.to_value()),
            ..Default::default()
        };
        self.request(via, Builtin::Bridge, RawPurpose::Bridge { target }, header, SendOptions::default(), now);
        Ok(())
    }

    /// Still only reachable through a relay after path sync: find a bridge.
    pub(crate) fn auto_bridge(&mut self, target: Hashname, now: Instant) {
        let Some(peer) = self.peers.get(&target) else {
            return;
        };
        if peer.alive || !peer.has_line() {
            return;
        }
        let offered = peer
            .possible
            .iter()
            .find(|p| p.path.kind() == PathKind::Bridge)
            .map(|p| p.via);
        let seed = || {
            self.seeds.iter().copied().find(|s| {
                *s != target
                    && self
                        .peers
                        .get(s)
                        .is_some_and(|p| p.alive && p.bridging && p.has_line())
            })
        };
        let relay = || match peer.relay_path() {
            Some(Path::Relay { id }) => Some(*id),
            _ => None,
        };
        let Some(via) = offered.or_else(seed).or_else(relay) else {
            debug!(peer = %target.short(), "no bridge candidate");
            return;
        };
        if let Err(e) = self.bridge(target, via, now) {
            debug!(peer = %target.short(), via = %via.short(), error = %e, "bridge not possible");
        }
    }

    pub(crate) fn on_bridge_reply(&mut self, via: Hashname, target: Hashname, packet: Packet, sender: &Path, now: Instant) {
        if let Some(reason) = &packet.header.err {
            debug!(via = %via.short(), target = %target.short(), reason = %reason, "bridge refused");
            return;
        }
        let Some(peer) = self.peers.get_mut(&target) else {
            return;
        };
        peer.bridge_via = Some(via);
        info!(via = %via.short(), target = %target.short(), path = %sender, "bridged");
        let header = Header {
            priority: Some(0),
            ..Default::default()
        };
        self.send_path_probe(target, sender.clone(), header, now);
    }

    pub(crate) fn handle_bridge(&mut self, from: Hashname, c: ChannelId, packet: Packet, sender: &Path, now: Instant) {
        let to = packet.header.to.as_deref().and_then(LineId::from_hex);
        let line_from = packet.header.from.as_deref().and_then(LineId::from_hex);
        let (Some(to), Some(line_from), Some(path)) = (to, line_from, packet.header.parsed_path()) else {
            warn!(peer = %from.short(), "invalid bridge request");
            return;
        };

        let permitted = self.config.bridging || self.peers.get(&from).is_some_and(|p| p.bridging);
        if !permitted {
            debug!(peer = %from.short(), "bridge not allowed");
            let header = Header {
                err: Some(ERR_NOT_ALLOWED.to_string()),
                ..Default::default()
            };
            self.respond(from, c, header, SendOptions::default(), now);
            return;
        }

        let target_path = match path {
            Path::Bridge { id } => self
                .peers
                .get(&id)
                .and_then(Peer::best_direct_path)
                .cloned(),
            other if other.is_direct() => Some(other),
            _ => None,
        };
        let Some(target_path) = target_path.filter(|_| sender.is_direct()) else {
            debug!(peer = %from.short(), "bridge path unresolvable");
            let header = Header {
                err: Some(ERR_INVALID_PATH.to_string()),
                ..Default::default()
            };
            self.respond(from, c, header, SendOptions::default(), now);
            return;
        };

        self.bridges
            .install(from, (to, target_path), (line_from, sender.clone()), now);
        self.respond(from, c, Header::default(), SendOptions::default(), now);
    }
}
