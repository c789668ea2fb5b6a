//! # Lookups and Mesh Maintenance
//!
//! The DHT half of the switch.
//!
//! ## Seek
//!
//! A `seek` request names a hashname; the answer lists our nearest alive
//! peers as `"hashname,ip,port"` (address omitted when we have none). Every
//! entry received is remembered as a *via*: the answering peer can introduce
//! us to it.
//!
//! Concurrent [`Switch::seek`] calls for the same target share one
//! [`Lookup`]; a single [`Event::SeekComplete`] reports the result.
//!
//! ## Maintenance
//!
//! Every `mesh_interval`:
//!
//! 1. expire bridge entries, mark peers silent for `line_timeout` as dead
//! 2. rebuild the bucket table from peers with lines and elect up to
//!    `mesh_max` alive peers spread across buckets
//! 3. ping (seek ourselves at) elected peers and peers with application
//!    channels whose line would otherwise time out before the next cycle
//! 4. re-contact seeds we still have no line to
//!
//! Ping answers feed back into the mesh: each hashname we are told about in
//! a bucket with spare capacity gets pinged too.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::dht::{elect, Lookup, LookupEvent};
use crate::error::SeekError;
use crate::identity::Hashname;
use crate::messages::{ChannelId, Header, Packet};
use crate::path::{Path, PathKind};
use crate::peer::{Peer, SendOptions};
use crate::protocols::Transport;
use crate::raw::RawPurpose;
use crate::switch::{peer_entry, Builtin, Event, Switch, Timer};

/// Parse one `see` entry: `hashname` or `hashname,ip,port`.
pub(crate) fn parse_see(entry: &str) -> Option<(Hashname, Option<Path>)> {
    let mut parts = entry.split(',');
    let hashname = Hashname::from_hex(parts.next()?).ok()?;
    let address = match (parts.next(), parts.next()) {
        (Some(ip), Some(port)) => match (ip.parse::<IpAddr>(), port.parse::<u16>()) {
            (Ok(ip), Ok(port)) => Some(Path::from_socket_addr(SocketAddr::new(ip, port))),
            _ => None,
        },
        _ => None,
    };
    Some((hashname, address))
}

/// How we describe `peer` in a `see` answer.
pub(crate) fn see_entry(peer: &Peer) -> String {
    let address = peer
        .paths
        .iter()
        .filter(|k| matches!(k.path.kind(), PathKind::Ipv4 | PathKind::Ipv6))
        .max_by_key(|k| (k.priority, k.last_in))
        .and_then(|k| k.path.socket_addr());
    match address {
        Some(addr) => format!("{},{},{}", peer.hashname.to_hex(), addr.ip(), addr.port()),
        None => peer.hashname.to_hex(),
    }
}

impl<T: Transport> Switch<T> {
    /// Alive peers nearest to `target`, nearest first.
    pub fn nearby(&self, target: &Hashname) -> Vec<Hashname> {
        self.table
            .closest(target, self.table.len())
            .into_iter()
            .filter(|h| self.peers.get(h).is_some_and(|p| p.alive))
            .take(self.config.seek_answer)
            .collect()
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Start an iterative lookup for `target`. Returns `false` when one is
    /// already running; its completion is reported once for every caller.
    pub fn seek(&mut self, target: Hashname, now: Instant) -> bool {
        if self.lookups.contains_key(&target) {
            return false;
        }
        let nearby = self.nearby(&target);
        let locals: Vec<Hashname> = self
            .locals
            .iter()
            .filter(|h| self.peers.get(*h).is_some_and(|p| p.alive && p.has_line()))
            .copied()
            .collect();
        let seeds: Vec<Hashname> = self.seeds.iter().copied().collect();
        debug!(
            target = %target.short(),
            nearby = nearby.len(),
            locals = locals.len(),
            "lookup started"
        );
        let mut lookup = Lookup::new(target, nearby, locals, seeds, self.config.seek_concurrency);
        let events = lookup.start();
        self.lookups.insert(target, lookup);
        self.lookup_events(target, events, now);
        true
    }

    fn lookup_events(&mut self, target: Hashname, events: Vec<LookupEvent>, now: Instant) {
        for event in events {
            match event {
                LookupEvent::Query(peer) => {
                    trace!(target = %target.short(), peer = %peer.short(), "lookup query");
                    let header = Header {
                        seek: Some(target),
                        ..Default::default()
                    };
                    let sent = self.request(
                        peer,
                        Builtin::Seek,
                        RawPurpose::Lookup { target },
                        header,
                        SendOptions::default(),
                        now,
                    );
                    if sent.is_none() {
                        self.on_lookup_failure(peer, target, now);
                    }
                }
                LookupEvent::Found(candidates) => self.finish_lookup(target, Ok(candidates), now),
                LookupEvent::Exhausted => self.finish_lookup(target, Err(SeekError::Exhausted(target)), now),
            }
        }
    }

    fn finish_lookup(&mut self, target: Hashname, result: Result<Vec<Hashname>, SeekError>, now: Instant) {
        if self.lookups.remove(&target).is_none() {
            return;
        }
        match &result {
            Ok(candidates) => debug!(target = %target.short(), candidates = candidates.len(), "lookup found target"),
            Err(e) => debug!(target = %target.short(), error = %e, "lookup failed"),
        }
        self.events.push_back(Event::SeekComplete { target, result });

        // a send was waiting on this lookup
        let waiting = self
            .peers
            .get(&target)
            .is_some_and(|p| p.last_packet.is_some() && !p.has_line() && !p.vias.is_empty());
        if waiting {
            self.introduce(target, now);
        }
    }

    pub(crate) fn on_lookup_reply(&mut self, from: Hashname, target: Hashname, packet: Packet, now: Instant) {
        if packet.header.err.is_some() {
            self.on_lookup_failure(from, target, now);
            return;
        }
        let see = self.learn_see(from, &packet);
        let Some(lookup) = self.lookups.get_mut(&target) else {
            return;
        };
        let events = lookup.on_reply(&from, see.into_iter().map(|(h, _)| h));
        self.lookup_events(target, events, now);
    }

    pub(crate) fn on_lookup_failure(&mut self, from: Hashname, target: Hashname, now: Instant) {
        let Some(lookup) = self.lookups.get_mut(&target) else {
            return;
        };
        trace!(target = %target.short(), peer = %from.short(), "lookup query failed");
        let events = lookup.on_failure(&from);
        self.lookup_events(target, events, now);
    }

    /// Record every hashname in a `see` answer with `from` as its via.
    fn learn_see(&mut self, from: Hashname, packet: &Packet) -> Vec<(Hashname, Option<Path>)> {
        let mut learned = Vec::new();
        for entry in packet.header.see.iter().flatten() {
            let Some((hashname, address)) = parse_see(entry) else {
                debug!(peer = %from.short(), entry = %entry, "invalid see entry");
                continue;
            };
            if hashname == self.hashname {
                continue;
            }
            if hashname != from {
                peer_entry(&mut self.peers, self.hashname, hashname).add_via(from, address.clone());
            }
            learned.push((hashname, address));
        }
        learned
    }

    pub(crate) fn handle_seek(&mut self, from: Hashname, c: ChannelId, packet: Packet, now: Instant) {
        let Some(target) = packet.header.seek else {
            warn!(peer = %from.short(), "seek without target");
            return;
        };
        let see: Vec<String> = self
            .nearby(&target)
            .iter()
            .filter_map(|h| self.peers.get(h))
            .map(see_entry)
            .collect();
        trace!(peer = %from.short(), target = %target.short(), answers = see.len(), "answering seek");
        let header = Header {
            see: Some(see),
            ..Default::default()
        };
        self.respond(from, c, header, SendOptions::default(), now);
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Liveness ping: a seek for our own hashname.
    pub(crate) fn probe(&mut self, to: Hashname, now: Instant) {
        let header = Header {
            seek: Some(self.hashname),
            ..Default::default()
        };
        self.request(to, Builtin::Seek, RawPurpose::Probe, header, SendOptions::default(), now);
    }

    pub(crate) fn on_probe_reply(&mut self, from: Hashname, packet: Packet, now: Instant) {
        let fresh = self.config.new_bucket_probes;
        for (hashname, _) in self.learn_see(from, &packet) {
            if hashname == from {
                continue;
            }
            let Some(peer) = self.peers.get_mut(&hashname) else {
                continue;
            };
            if peer.bucket.is_some() {
                continue;
            }
            let Some(bucket) = self.hashname.bucket_to(&hashname) else {
                continue;
            };
            peer.bucket = Some(bucket);
            if self.election.take_capacity(bucket, fresh) {
                trace!(peer = %hashname.short(), bucket, "probing suggested peer");
                self.probe(hashname, now);
            }
        }
    }

    pub(crate) fn maintain(&mut self, now: Instant) {
        self.maintenance = Some(
            self.timers
                .schedule(now + self.config.mesh_interval, Timer::Maintenance),
        );
        self.bridges.expire(now);

        let line_timeout = self.config.line_timeout;
        for peer in self.peers.values_mut() {
            if peer.alive && peer.is_idle(now, line_timeout) {
                debug!(peer = %peer.hashname.short(), "peer went silent");
                peer.alive = false;
            }
        }

        let lined: Vec<Hashname> = self
            .peers
            .values()
            .filter(|p| p.has_line())
            .map(|p| p.hashname)
            .collect();
        self.table.rebuild(lined);
        let peers = &self.peers;
        self.election = elect(&self.table, self.config.mesh_max, |h| {
            peers.get(h).is_some_and(|p| p.alive)
        });
        for peer in self.peers.values_mut() {
            peer.elected = self.election.elected.contains(&peer.hashname);
            if self.table.contains(&peer.hashname) {
                peer.bucket = self.table.bucket_of(&peer.hashname);
            }
        }

        let interval = self.config.mesh_interval;
        let due: Vec<Hashname> = self
            .peers
            .values()
            .filter(|p| p.has_line() && (p.elected || p.has_app_channels()))
            .filter(|p| {
                p.last_out
                    .is_none_or(|out| now.saturating_duration_since(out) + interval >= line_timeout)
            })
            .map(|p| p.hashname)
            .collect();
        let unreached: Vec<Hashname> = self
            .seeds
            .iter()
            .filter(|s| self.peers.get(*s).is_none_or(|p| !p.has_line()))
            .copied()
            .collect();

        debug!(
            lines = self.table.len(),
            buckets = self.table.occupied_count(),
            elected = self.election.elected.len(),
            spread = self.election.spread,
            pings = due.len(),
            bridges = self.bridges.len(),
            "mesh maintenance"
        );
        for hashname in due.into_iter().chain(unreached) {
            self.probe(hashname, now);
        }
    }
}
