//! # Buckets, Election and Lookup
//!
//! The mesh keeps a bounded working set of lines spread across distance
//! buckets, and resolves unknown hashnames by walking toward them.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`RoutingTable`] | 256 buckets keyed by bucket distance from our hashname |
//! | [`elect`] | per-cycle choice of which alive peers to keep lines with |
//! | [`Lookup`] | iterative seek toward a target, as an explicit state machine |
//!
//! ## Election
//!
//! `spread = max(1, mesh_max / occupied_buckets)`. Each bucket elects at most
//! `spread` alive peers; what remains is the bucket's probe capacity for the
//! rest of the cycle.
//!
//! ## Lookup
//!
//! Candidates are kept sorted by full XOR distance to the target. A fixed
//! number of tracks pull from the queue; each query's answer feeds the queue
//! and frees its track. Candidates whose bucket distance to the target is
//! worse than the best already queried are discarded, so the walk never
//! backs away from the target. The lookup is found when the target itself
//! reaches the front of the queue, and exhausted when nothing is queued or
//! in flight.

use std::collections::{BinaryHeap, HashMap, HashSet};

use tracing::trace;

use crate::identity::{distance_cmp, Hashname, BUCKET_COUNT};

/// Bucket distance collapsed to a rank: identical hashnames rank 0.
fn rank(a: &Hashname, b: &Hashname) -> usize {
    a.bucket_to(b).map_or(0, |bucket| bucket + 1)
}

fn sort_by_distance(list: &mut [Hashname], target: &Hashname) {
    list.sort_by(|a, b| distance_cmp(&a.xor_distance(target), &b.xor_distance(target)));
}

// ============================================================================
// Routing Table
// ============================================================================

#[derive(Debug)]
pub struct RoutingTable {
    self_id: Hashname,
    buckets: Vec<Vec<Hashname>>,
}

impl RoutingTable {
    pub fn new(self_id: Hashname) -> Self {
        Self {
            self_id,
            buckets: vec![Vec::new(); BUCKET_COUNT],
        }
    }

    pub fn bucket_of(&self, hashname: &Hashname) -> Option<usize> {
        self.self_id.bucket_to(hashname)
    }

    /// Returns the bucket index, or `None` for our own hashname.
    pub fn insert(&mut self, hashname: Hashname) -> Option<usize> {
        let idx = self.bucket_of(&hashname)?;
        let bucket = &mut self.buckets[idx];
        if !bucket.contains(&hashname) {
            bucket.push(hashname);
        }
        Some(idx)
    }

    pub fn remove(&mut self, hashname: &Hashname) {
        if let Some(idx) = self.bucket_of(hashname) {
            self.buckets[idx].retain(|h| h != hashname);
        }
    }

    /// Re-derive every bucket from scratch.
    pub fn rebuild(&mut self, peers: impl IntoIterator<Item = Hashname>) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        for peer in peers {
            self.insert(peer);
        }
    }

    pub fn bucket(&self, idx: usize) -> &[Hashname] {
        self.buckets.get(idx).map_or(&[], Vec::as_slice)
    }

    pub fn contains(&self, hashname: &Hashname) -> bool {
        self.bucket_of(hashname)
            .is_some_and(|idx| self.buckets[idx].contains(hashname))
    }

    pub fn occupied(&self) -> impl Iterator<Item = (usize, &[Hashname])> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty())
            .map(|(idx, b)| (idx, b.as_slice()))
    }

    pub fn occupied_count(&self) -> usize {
        self.buckets.iter().filter(|b| !b.is_empty()).count()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }

    /// Up to `k` entries closest to `target` by XOR distance, nearest first.
    pub fn closest(&self, target: &Hashname, k: usize) -> Vec<Hashname> {
        if k == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct Candidate {
            dist: [u8; 32],
            hashname: Hashname,
        }

        impl Ord for Candidate {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for Candidate {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        for hashname in self.buckets.iter().flatten() {
            let dist = hashname.xor_distance(target);
            if heap.len() < k {
                heap.push(Candidate { dist, hashname: *hashname });
            } else if let Some(farthest) = heap.peek()
                && distance_cmp(&dist, &farthest.dist) == std::cmp::Ordering::Less
            {
                heap.push(Candidate { dist, hashname: *hashname });
                heap.pop();
            }
        }

        let mut result: Vec<Hashname> = heap.into_iter().map(|c| c.hashname).collect();
        sort_by_distance(&mut result, target);
        result
    }
}

// ============================================================================
// Election
// ============================================================================

#[derive(Debug, Default)]
pub struct Election {
    pub spread: usize,
    pub elected: Vec<Hashname>,
    /// Probe slots left per bucket this cycle.
    pub capacity: HashMap<usize, usize>,
}

impl Election {
    /// Claim a probe slot in `bucket`. Buckets unseen at election time start
    /// with `fresh` slots.
    pub fn take_capacity(&mut self, bucket: usize, fresh: usize) -> bool {
        let slots = self.capacity.entry(bucket).or_insert(fresh);
        if *slots == 0 {
            return false;
        }
        *slots -= 1;
        true
    }
}

/// Choose which alive peers each bucket keeps.
pub fn elect(table: &RoutingTable, mesh_max: usize, mut alive: impl FnMut(&Hashname) -> bool) -> Election {
    let occupied = table.occupied_count();
    let spread = if occupied == 0 {
        mesh_max.max(1)
    } else {
        (mesh_max / occupied).max(1)
    };

    let mut election = Election {
        spread,
        ..Election::default()
    };
    for (idx, bucket) in table.occupied() {
        let mut count = 0;
        for hashname in bucket {
            if count >= spread {
                break;
            }
            if alive(hashname) {
                election.elected.push(*hashname);
                count += 1;
            }
        }
        election.capacity.insert(idx, spread - count);
    }
    election
}

// ============================================================================
// Lookup
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupEvent {
    /// Ask this peer for its nearest peers to the target.
    Query(Hashname),
    /// The target was reached. Carries every candidate seen, nearest first.
    Found(Vec<Hashname>),
    Exhausted,
}

#[derive(Debug)]
pub struct Lookup {
    target: Hashname,
    queue: Vec<Hashname>,
    tried: HashSet<Hashname>,
    /// In-flight queries; `true` for queries that occupy a track.
    inflight: HashMap<Hashname, bool>,
    closest: usize,
    concurrency: usize,
    /// Peers whose answers never narrow the frontier.
    seeds: HashSet<Hashname>,
    forced: Vec<Hashname>,
    finished: bool,
}

impl Lookup {
    /// `nearby` seeds the queue; `local` peers get one forced query each.
    pub fn new(
        target: Hashname,
        nearby: impl IntoIterator<Item = Hashname>,
        local: impl IntoIterator<Item = Hashname>,
        seeds: impl IntoIterator<Item = Hashname>,
        concurrency: usize,
    ) -> Self {
        let mut queue: Vec<Hashname> = Vec::new();
        for hashname in nearby {
            if hashname != target && !queue.contains(&hashname) {
                queue.push(hashname);
            }
        }
        sort_by_distance(&mut queue, &target);
        Self {
            target,
            queue,
            tried: HashSet::new(),
            inflight: HashMap::new(),
            closest: BUCKET_COUNT,
            concurrency: concurrency.max(1),
            seeds: seeds.into_iter().collect(),
            forced: local.into_iter().filter(|h| *h != target).collect(),
            finished: false,
        }
    }

    pub fn target(&self) -> &Hashname {
        &self.target
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_waiting_on(&self, peer: &Hashname) -> bool {
        self.inflight.contains_key(peer)
    }

    pub fn start(&mut self) -> Vec<LookupEvent> {
        let mut events = self.pump();
        for local in std::mem::take(&mut self.forced) {
            if self.finished {
                break;
            }
            if let Some(query) = self.admit(local, false) {
                events.push(query);
            }
        }
        if events.is_empty() {
            events.extend(self.check_exhausted());
        }
        events
    }

    /// Merge the answer from `from` and continue.
    pub fn on_reply(&mut self, from: &Hashname, see: impl IntoIterator<Item = Hashname>) -> Vec<LookupEvent> {
        if self.finished || self.inflight.remove(from).is_none() {
            return Vec::new();
        }
        self.tried.insert(*from);
        for hashname in see {
            if !self.queue.contains(&hashname) && !self.tried.contains(&hashname) {
                self.queue.push(hashname);
            }
        }
        sort_by_distance(&mut self.queue, &self.target);
        self.pump()
    }

    /// The query to `from` failed or timed out.
    pub fn on_failure(&mut self, from: &Hashname) -> Vec<LookupEvent> {
        self.on_reply(from, std::iter::empty())
    }

    /// Everything seen so far, nearest first.
    pub fn candidates(&self) -> Vec<Hashname> {
        let mut all: Vec<Hashname> = self
            .tried
            .iter()
            .chain(self.inflight.keys())
            .chain(self.queue.iter())
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        sort_by_distance(&mut all, &self.target);
        all
    }

    fn active_tracks(&self) -> usize {
        self.inflight.values().filter(|track| **track).count()
    }

    fn pump(&mut self) -> Vec<LookupEvent> {
        let mut events = Vec::new();
        while !self.finished && self.active_tracks() < self.concurrency {
            if self.queue.is_empty() {
                break;
            }
            let next = self.queue.remove(0);
            if next == self.target {
                self.finished = true;
                events.push(LookupEvent::Found(self.candidates_with(next)));
                return events;
            }
            if let Some(query) = self.admit(next, true) {
                events.push(query);
            }
        }
        events.extend(self.check_exhausted());
        events
    }

    fn admit(&mut self, candidate: Hashname, track: bool) -> Option<LookupEvent> {
        if self.tried.contains(&candidate) || self.inflight.contains_key(&candidate) {
            return None;
        }
        // forced queries bypass the frontier and never move it
        if track {
            let distance = rank(&self.target, &candidate);
            if distance > self.closest {
                trace!(candidate = %candidate.short(), distance, closest = self.closest, "not backing away");
                return None;
            }
            if !self.seeds.contains(&candidate) {
                self.closest = distance;
            }
        }
        self.inflight.insert(candidate, track);
        Some(LookupEvent::Query(candidate))
    }

    fn check_exhausted(&mut self) -> Option<LookupEvent> {
        if !self.finished && self.inflight.is_empty() && self.queue.is_empty() {
            self.finished = true;
            return Some(LookupEvent::Exhausted);
        }
        None
    }

    fn candidates_with(&self, found: Hashname) -> Vec<Hashname> {
        let mut all = self.candidates();
        if !all.contains(&found) {
            all.push(found);
            sort_by_distance(&mut all, &self.target);
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hn(i: u32) -> Hashname {
        Hashname::from_public_key(&i.to_be_bytes())
    }

    #[test]
    fn routing_table_buckets_by_distance() {
        let me = hn(0);
        let mut table = RoutingTable::new(me);
        assert_eq!(table.insert(me), None);
        let other = hn(1);
        let idx = table.insert(other).expect("bucket");
        assert_eq!(Some(idx), me.bucket_to(&other));
        table.insert(other);
        assert_eq!(table.len(), 1);
        assert!(table.contains(&other));
        table.remove(&other);
        assert!(table.is_empty());
    }

    #[test]
    fn closest_returns_nearest_first() {
        let me = hn(0);
        let mut table = RoutingTable::new(me);
        for i in 1..50 {
            table.insert(hn(i));
        }
        let target = hn(77);
        let closest = table.closest(&target, 5);
        assert_eq!(closest.len(), 5);
        for pair in closest.windows(2) {
            assert_ne!(
                distance_cmp(&pair[0].xor_distance(&target), &pair[1].xor_distance(&target)),
                std::cmp::Ordering::Greater
            );
        }
        let mut all: Vec<Hashname> = (1..50).map(hn).collect();
        sort_by_distance(&mut all, &target);
        assert_eq!(closest, all[..5].to_vec());
    }

    #[test]
    fn election_never_exceeds_spread() {
        let me = hn(0);
        let mut table = RoutingTable::new(me);
        for i in 1..400 {
            table.insert(hn(i));
        }
        let election = elect(&table, 16, |_| true);
        assert_eq!(election.spread, (16 / table.occupied_count()).max(1));
        for (idx, bucket) in table.occupied() {
            let elected = bucket.iter().filter(|h| election.elected.contains(h)).count();
            assert!(elected <= election.spread, "bucket {idx} elected {elected}");
            assert_eq!(election.capacity[&idx], election.spread - elected);
        }
    }

    #[test]
    fn election_skips_dead_peers() {
        let me = hn(0);
        let mut table = RoutingTable::new(me);
        let peers: Vec<_> = (1..10).map(hn).collect();
        table.rebuild(peers.iter().copied());
        let alive = peers[0];
        let election = elect(&table, 250, |h| *h == alive);
        assert_eq!(election.elected, vec![alive]);
    }

    #[test]
    fn capacity_is_consumed() {
        let mut election = Election::default();
        election.capacity.insert(3, 1);
        assert!(election.take_capacity(3, 3));
        assert!(!election.take_capacity(3, 3));
        assert!(election.take_capacity(9, 2));
        assert!(election.take_capacity(9, 2));
        assert!(!election.take_capacity(9, 2));
    }

    #[test]
    fn lookup_finds_target_announced_by_a_peer() {
        let target = hn(100);
        let a = hn(1);
        let mut lookup = Lookup::new(target, [a], [], [], 3);
        assert_eq!(lookup.start(), vec![LookupEvent::Query(a)]);
        let events = lookup.on_reply(&a, [target]);
        assert!(matches!(&events[..], [LookupEvent::Found(list)] if list.contains(&target)));
        assert!(lookup.is_finished());
        assert!(lookup.on_reply(&a, []).is_empty());
    }

    #[test]
    fn lookup_exhausts_when_nobody_knows() {
        let target = hn(100);
        let mut lookup = Lookup::new(target, (1..6).map(hn), [], [], 3);
        let mut pending: Vec<Hashname> = lookup
            .start()
            .into_iter()
            .filter_map(|e| match e {
                LookupEvent::Query(h) => Some(h),
                _ => None,
            })
            .collect();
        assert!(!pending.is_empty());
        let mut last = Vec::new();
        while let Some(peer) = pending.pop() {
            last = lookup.on_failure(&peer);
            for event in &last {
                if let LookupEvent::Query(h) = event {
                    pending.push(*h);
                }
            }
        }
        assert_eq!(last, vec![LookupEvent::Exhausted]);
        assert!(lookup.is_finished());
    }

    #[test]
    fn lookup_with_no_candidates_is_exhausted_immediately() {
        let target = hn(100);
        let mut lookup = Lookup::new(target, [target], [], [], 3);
        assert_eq!(lookup.start(), vec![LookupEvent::Exhausted]);
    }

    #[test]
    fn lookup_respects_concurrency_and_forces_locals() {
        let target = hn(100);
        let nearby: Vec<_> = (1..10).map(hn).collect();
        let local = hn(500);
        let mut lookup = Lookup::new(target, nearby, [local], [], 2);
        let events = lookup.start();
        let queries: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                LookupEvent::Query(h) => Some(*h),
                _ => None,
            })
            .collect();
        assert!(queries.contains(&local));
        assert!(queries.len() <= 3);
    }

    /// A synthetic mesh where each peer knows up to `k` peers per bucket and
    /// answers with its true nearest known peers.
    struct Mesh {
        ids: Vec<Hashname>,
        tables: HashMap<Hashname, RoutingTable>,
    }

    impl Mesh {
        fn new(n: u32, k: usize) -> Self {
            let ids: Vec<Hashname> = (0..n).map(hn).collect();
            let mut tables = HashMap::new();
            for me in &ids {
                let mut table = RoutingTable::new(*me);
                for other in &ids {
                    if let Some(idx) = table.bucket_of(other)
                        && table.bucket(idx).len() < k
                    {
                        table.insert(*other);
                    }
                }
                tables.insert(*me, table);
            }
            Self { ids, tables }
        }

        fn answer(&self, peer: &Hashname, target: &Hashname) -> Vec<Hashname> {
            self.tables[peer].closest(target, 8)
        }
    }

    #[test]
    fn lookup_converges_in_logarithmic_rounds() {
        let n = 256u32;
        let mesh = Mesh::new(n, 4);
        let bound = 2 * (n as f64).log2() as usize + 2;

        for t in [17usize, 99, 200, 255] {
            let origin = mesh.ids[0];
            let target = mesh.ids[t];
            let nearby = mesh.tables[&origin].closest(&target, 8);
            let mut lookup = Lookup::new(target, nearby, [], [], 3);
            let mut pending: Vec<Hashname> = Vec::new();
            let mut outcome = None;
            for event in lookup.start() {
                match event {
                    LookupEvent::Query(h) => pending.push(h),
                    other => outcome = Some(other),
                }
            }

            let mut rounds = 0;
            while outcome.is_none() {
                rounds += 1;
                assert!(rounds <= bound, "target {t} not found within {bound} rounds");
                for peer in std::mem::take(&mut pending) {
                    for event in lookup.on_reply(&peer, mesh.answer(&peer, &target)) {
                        match event {
                            LookupEvent::Query(h) => pending.push(h),
                            other => outcome = Some(other),
                        }
                    }
                }
            }
            assert!(matches!(outcome, Some(LookupEvent::Found(_))), "target {t}: {outcome:?}");
        }
    }
}
