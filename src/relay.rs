//! Relay throttling and the bridge table.
//!
//! # Relay
//!
//! A relay frame is a `relay` channel packet whose body is a complete wire
//! datagram for the peer named in `to`. The relaying switch keeps no session
//! state; it only limits how fast any single source may push frames through
//! it ([`RelayThrottle`]).
//!
//! # Bridge
//!
//! A bridge maps line ids to raw paths. Line packets arriving with an id we
//! never issued are looked up in the [`BridgeTable`] and retransmitted
//! verbatim, with duplicate frames (same `iv`) suppressed.
//!
//! | Entry key | Forward to |
//! |-----------|------------|
//! | line id chosen by the target | target's path |
//! | line id chosen by the requester | requester's path |

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::{debug, info, trace};

use crate::identity::{Hashname, LineId};
use crate::messages::IV_LEN;
use crate::path::Path;

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

// ============================================================================
// Relay Throttle
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct RelayWindow {
    started: Instant,
    count: u32,
}

/// Fixed-window frame counter per source peer.
#[derive(Debug)]
pub struct RelayThrottle {
    windows: LruCache<Hashname, RelayWindow>,
    rate: u32,
    window: Duration,
}

impl RelayThrottle {
    pub fn new(rate: u32, window: Duration, tracked_peers: usize) -> Self {
        Self {
            windows: LruCache::new(capacity(tracked_peers)),
            rate,
            window,
        }
    }

    /// Count a frame from `source`; `false` means drop it.
    pub fn allow(&mut self, source: &Hashname, now: Instant) -> bool {
        let entry = self
            .windows
            .get_or_insert_mut(*source, || RelayWindow { started: now, count: 0 });
        if now.saturating_duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }
        entry.count += 1;
        if entry.count > self.rate {
            trace!(source = %source.short(), count = entry.count, "relay too fast");
            return false;
        }
        true
    }
}

// ============================================================================
// Bridge Table
// ============================================================================

#[derive(Debug, Clone)]
pub struct BridgeEntry {
    pub path: Path,
    /// Peer that asked for the bridge; its re-key tears the entry down.
    pub requester: Hashname,
    pub created: Instant,
    pub last_used: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeRoute {
    Forward(Path),
    Duplicate,
    Unknown,
}

#[derive(Debug)]
pub struct BridgeTable {
    entries: HashMap<LineId, BridgeEntry>,
    seen: LruCache<[u8; IV_LEN], ()>,
    timeout: Duration,
    forwarded: u64,
}

impl BridgeTable {
    pub fn new(timeout: Duration, dedup: usize) -> Self {
        Self {
            entries: HashMap::new(),
            seen: LruCache::new(capacity(dedup)),
            timeout,
            forwarded: 0,
        }
    }

    /// Bridge both directions of one line.
    pub fn install(
        &mut self,
        requester: Hashname,
        (to, to_path): (LineId, Path),
        (from, from_path): (LineId, Path),
        now: Instant,
    ) {
        info!(
            requester = %requester.short(),
            to = %to_path,
            from = %from_path,
            "bridge up"
        );
        for (line, path) in [(to, to_path), (from, from_path)] {
            self.entries.insert(
                line,
                BridgeEntry {
                    path,
                    requester,
                    created: now,
                    last_used: now,
                },
            );
        }
    }

    pub fn route(&mut self, line: &LineId, iv: &[u8; IV_LEN], now: Instant) -> BridgeRoute {
        let Some(entry) = self.entries.get_mut(line) else {
            return BridgeRoute::Unknown;
        };
        if self.seen.put(*iv, ()).is_some() {
            return BridgeRoute::Duplicate;
        }
        entry.last_used = now;
        self.forwarded += 1;
        BridgeRoute::Forward(entry.path.clone())
    }

    /// Drop every entry installed on behalf of `requester`.
    pub fn remove_requester(&mut self, requester: &Hashname) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.requester != *requester);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(requester = %requester.short(), removed, "bridge entries dropped");
        }
        removed
    }

    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let timeout = self.timeout;
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.last_used) < timeout);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "expired bridge entries");
        }
        removed
    }

    pub fn contains(&self, line: &LineId) -> bool {
        self.entries.contains_key(line)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn path(a: u8) -> Path {
        Path::Ipv4 { ip: Ipv4Addr::new(a, 0, 0, 1), port: 42424 }
    }

    #[test]
    fn sixth_relay_in_a_second_is_dropped() {
        let mut throttle = RelayThrottle::new(5, Duration::from_secs(1), 16);
        let source = Hashname::from_bytes([1; 32]);
        let t0 = Instant::now();
        for i in 0..5 {
            assert!(throttle.allow(&source, t0 + Duration::from_millis(i * 100)));
        }
        assert!(!throttle.allow(&source, t0 + Duration::from_millis(600)));

        // other sources are unaffected
        assert!(throttle.allow(&Hashname::from_bytes([2; 32]), t0));

        // new window
        assert!(throttle.allow(&source, t0 + Duration::from_millis(1100)));
    }

    #[test]
    fn bridge_forwards_both_directions_and_dedups() {
        let mut table = BridgeTable::new(Duration::from_secs(120), 64);
        let requester = Hashname::from_bytes([7; 32]);
        let (to, from) = (LineId::from_bytes([1; 16]), LineId::from_bytes([2; 16]));
        let now = Instant::now();
        table.install(requester, (to, path(10)), (from, path(20)), now);
        assert_eq!(table.len(), 2);

        assert_eq!(table.route(&to, &[1; IV_LEN], now), BridgeRoute::Forward(path(10)));
        assert_eq!(table.route(&to, &[1; IV_LEN], now), BridgeRoute::Duplicate);
        assert_eq!(table.route(&from, &[2; IV_LEN], now), BridgeRoute::Forward(path(20)));
        assert_eq!(
            table.route(&LineId::from_bytes([3; 16]), &[3; IV_LEN], now),
            BridgeRoute::Unknown
        );
        assert_eq!(table.forwarded(), 2);
    }

    #[test]
    fn bridge_entries_expire_and_follow_requester() {
        let mut table = BridgeTable::new(Duration::from_secs(120), 64);
        let requester = Hashname::from_bytes([7; 32]);
        let other = Hashname::from_bytes([8; 32]);
        let t0 = Instant::now();
        table.install(requester, (LineId::from_bytes([1; 16]), path(1)), (LineId::from_bytes([2; 16]), path(2)), t0);
        table.install(other, (LineId::from_bytes([3; 16]), path(3)), (LineId::from_bytes([4; 16]), path(4)), t0);

        assert_eq!(table.remove_requester(&requester), 2);
        assert!(table.contains(&LineId::from_bytes([3; 16])));
        assert_eq!(table.expire(t0 + Duration::from_secs(60)), 0);
        assert_eq!(table.expire(t0 + Duration::from_secs(121)), 2);
        assert!(table.is_empty());
    }
}
