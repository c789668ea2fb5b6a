//! Shared test utilities: an in-memory network of switches with simulated
//! time and simple NAT behaviour.

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Once;
use std::time::{Duration, Instant};

use hashmesh::{Event, Hashname, Keypair, Outbox, Path, Seed, Switch, SwitchConfig};

/// One-time tracing initialization
static INIT: Once = Once::new();

/// Initialize tracing for tests.
/// Use RUST_LOG=debug or RUST_LOG=trace for verbose output.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("warn")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub const PORT: u16 = 42424;

/// How a simulated host accepts inbound datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reach {
    /// Accepts from anyone.
    Open,
    /// Accepts only from addresses it has sent to first.
    Nat,
}

pub struct SimNode {
    pub switch: Switch<Outbox>,
    pub addr: Path,
    pub reach: Reach,
    punched: HashSet<Path>,
}

pub struct TestNetwork {
    pub nodes: Vec<SimNode>,
    pub now: Instant,
    blocked: Vec<(Path, Path)>,
    /// Datagrams dropped by NAT rules or blocks.
    pub filtered: usize,
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            now: Instant::now(),
            blocked: Vec::new(),
            filtered: 0,
        }
    }

    /// Add a host at `ip`. Returns its index.
    pub fn add(&mut self, ip: [u8; 4], config: SwitchConfig, reach: Reach) -> usize {
        let addr = Path::Ipv4 {
            ip: Ipv4Addr::from(ip),
            port: PORT,
        };
        let mut switch = Switch::new(Keypair::generate(), config, Outbox::new());
        switch.set_local_paths(vec![addr.clone()]);
        self.nodes.push(SimNode {
            switch,
            addr,
            reach,
            punched: HashSet::new(),
        });
        self.nodes.len() - 1
    }

    pub fn hashname(&self, node: usize) -> Hashname {
        self.nodes[node].switch.hashname()
    }

    pub fn switch(&mut self, node: usize) -> &mut Switch<Outbox> {
        &mut self.nodes[node].switch
    }

    /// Seed entry describing `node`.
    pub fn seed_entry(&self, node: usize, bridge: bool) -> Seed {
        let Path::Ipv4 { ip, port } = self.nodes[node].addr else {
            unreachable!("simulated hosts are ipv4");
        };
        Seed {
            public_key: hex::encode(self.nodes[node].switch.public_key()),
            ip: Some(ip),
            port: Some(port),
            ip6: None,
            port6: None,
            http: None,
            bridge,
        }
    }

    /// Register `seed` with every other node and take them all online.
    pub fn bootstrap(&mut self, seed: usize) {
        let entry = self.seed_entry(seed, false);
        let now = self.now;
        for (i, node) in self.nodes.iter_mut().enumerate() {
            if i != seed {
                node.switch.add_seed(&entry).expect("valid seed");
            }
        }
        for node in &mut self.nodes {
            node.switch.online(now);
        }
        self.pump();
    }

    /// Drop every datagram between `a` and `b`, both ways.
    pub fn block(&mut self, a: usize, b: usize) {
        let (a, b) = (self.nodes[a].addr.clone(), self.nodes[b].addr.clone());
        self.blocked.push((a, b));
    }

    fn is_blocked(&self, a: &Path, b: &Path) -> bool {
        self.blocked
            .iter()
            .any(|(x, y)| (x == a && y == b) || (x == b && y == a))
    }

    /// Deliver datagrams until every outbox is empty.
    pub fn pump(&mut self) {
        let now = self.now;
        for _ in 0..10_000 {
            let mut in_flight = Vec::new();
            for i in 0..self.nodes.len() {
                let sent = self.nodes[i].switch.transport_mut().drain();
                for (path, bytes) in sent {
                    self.nodes[i].punched.insert(path.clone());
                    in_flight.push((i, path, bytes));
                }
            }
            if in_flight.is_empty() {
                return;
            }
            for (from, to_addr, bytes) in in_flight {
                let from_addr = self.nodes[from].addr.clone();
                let Some(to) = self.nodes.iter().position(|n| n.addr == to_addr) else {
                    self.filtered += 1;
                    continue;
                };
                let nat_closed = self.nodes[to].reach == Reach::Nat
                    && !self.nodes[to].punched.contains(&from_addr);
                if nat_closed || self.is_blocked(&from_addr, &to_addr) {
                    self.filtered += 1;
                    continue;
                }
                self.nodes[to].switch.receive(&bytes, from_addr, now);
            }
        }
        panic!("network did not settle");
    }

    /// Move simulated time forward in small steps, firing timers.
    pub fn advance(&mut self, by: Duration) {
        let step = Duration::from_millis(100);
        let end = self.now + by;
        while self.now < end {
            self.now += step;
            let now = self.now;
            for node in &mut self.nodes {
                node.switch.handle_timeout(now);
            }
            self.pump();
        }
    }

    /// Drain every pending event of `node`.
    pub fn events(&mut self, node: usize) -> Vec<Event> {
        let switch = &mut self.nodes[node].switch;
        std::iter::from_fn(|| switch.poll_event()).collect()
    }
}

/// Public test address `203.0.113.n`.
pub fn public(n: u8) -> [u8; 4] {
    [203, 0, 113, n]
}

/// Private test address `10.0.0.n`.
pub fn private(n: u8) -> [u8; 4] {
    [10, 0, 0, n]
}
