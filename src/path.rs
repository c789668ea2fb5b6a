//! # Network Paths
//!
//! A [`Path`] describes one way of reaching a peer. Paths are carried on the
//! wire as small JSON objects tagged by `type`:
//!
//! | Type | Fields | Reachability |
//! |------|--------|--------------|
//! | `ipv4` / `ipv6` | `ip`, `port` | direct datagram, local or public |
//! | `http` | `http` (URL) | direct, via the transport collaborator |
//! | `relay` | `id` (relaying hashname) | logical, framed through a third peer |
//! | `bridge` | `id` (bridging hashname) | raw bytes to the bridging peer |
//! | `webrtc` | `id` | negotiated outside the switch |
//!
//! Each peer keeps [`KnownPath`] entries carrying priority and recency. The
//! send loop orders them with [`sort_for_send`] and checks
//! [`KnownPath::is_valid`] to decide where to stop.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::identity::Hashname;

/// Base priority of an ip path on a private or loopback network.
pub const PRIORITY_LOCAL: i32 = 3;
/// Base priority of a public ipv6 path.
pub const PRIORITY_IPV6: i32 = 2;
/// Base priority of a public ipv4 or webrtc path.
pub const PRIORITY_PUBLIC: i32 = 1;
/// Base priority of http and bridge paths.
pub const PRIORITY_INDIRECT: i32 = 0;
/// Relay is only ever a last resort.
pub const PRIORITY_RELAY: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathKind {
    Ipv4,
    Ipv6,
    Http,
    Relay,
    Bridge,
    Webrtc,
}

impl PathKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PathKind::Ipv4 => "ipv4",
            PathKind::Ipv6 => "ipv6",
            PathKind::Http => "http",
            PathKind::Relay => "relay",
            PathKind::Bridge => "bridge",
            PathKind::Webrtc => "webrtc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Path {
    Ipv4 { ip: Ipv4Addr, port: u16 },
    Ipv6 { ip: Ipv6Addr, port: u16 },
    Http { http: String },
    Relay { id: Hashname },
    Bridge { id: Hashname },
    Webrtc { id: String },
}

impl Path {
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Path::Ipv4 { ip, port: addr.port() },
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(v4) => Path::Ipv4 { ip: v4, port: addr.port() },
                None => Path::Ipv6 { ip, port: addr.port() },
            },
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Path::Ipv4 { ip, port } => Some(SocketAddr::new(IpAddr::V4(*ip), *port)),
            Path::Ipv6 { ip, port } => Some(SocketAddr::new(IpAddr::V6(*ip), *port)),
            _ => None,
        }
    }

    /// Parse a path object received from a peer. Unknown types yield `None`.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn kind(&self) -> PathKind {
        match self {
            Path::Ipv4 { .. } => PathKind::Ipv4,
            Path::Ipv6 { .. } => PathKind::Ipv6,
            Path::Http { .. } => PathKind::Http,
            Path::Relay { .. } => PathKind::Relay,
            Path::Bridge { .. } => PathKind::Bridge,
            Path::Webrtc { .. } => PathKind::Webrtc,
        }
    }

    /// Private, loopback or link-local ip address.
    pub fn is_local(&self) -> bool {
        match self {
            Path::Ipv4 { ip, .. } => ip.is_private() || ip.is_loopback() || ip.is_link_local(),
            Path::Ipv6 { ip, .. } => {
                ip.is_loopback()
                    || (ip.segments()[0] & 0xfe00) == 0xfc00
                    || (ip.segments()[0] & 0xffc0) == 0xfe80
            }
            _ => false,
        }
    }

    /// Paths an open handshake can be sent on without a third party.
    pub fn is_direct(&self) -> bool {
        matches!(self.kind(), PathKind::Ipv4 | PathKind::Ipv6 | PathKind::Http)
    }

    /// Identity match for deduplication: same type and same address identity.
    pub fn matches(&self, other: &Path) -> bool {
        match (self, other) {
            (Path::Ipv4 { ip: a, port: pa }, Path::Ipv4 { ip: b, port: pb }) => a == b && pa == pb,
            (Path::Ipv6 { ip: a, port: pa }, Path::Ipv6 { ip: b, port: pb }) => a == b && pa == pb,
            (Path::Http { http: a }, Path::Http { http: b }) => a == b,
            (Path::Relay { id: a }, Path::Relay { id: b }) => a == b,
            (Path::Bridge { id: a }, Path::Bridge { id: b }) => a == b,
            (Path::Webrtc { id: a }, Path::Webrtc { id: b }) => a == b,
            _ => false,
        }
    }

    pub fn default_priority(&self) -> i32 {
        match self {
            Path::Ipv4 { .. } | Path::Ipv6 { .. } if self.is_local() => PRIORITY_LOCAL,
            Path::Ipv6 { .. } => PRIORITY_IPV6,
            Path::Ipv4 { .. } | Path::Webrtc { .. } => PRIORITY_PUBLIC,
            Path::Http { .. } | Path::Bridge { .. } => PRIORITY_INDIRECT,
            Path::Relay { .. } => PRIORITY_RELAY,
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Path::Ipv4 { ip, port } => write!(f, "ipv4:{ip}:{port}"),
            Path::Ipv6 { ip, port } => write!(f, "ipv6:[{ip}]:{port}"),
            Path::Http { http } => write!(f, "http:{http}"),
            Path::Relay { id } => write!(f, "relay:{}", id.short()),
            Path::Bridge { id } => write!(f, "bridge:{}", id.short()),
            Path::Webrtc { id } => write!(f, "webrtc:{id}"),
        }
    }
}

/// Whether two peers could plausibly reach each other directly: some pair of
/// their paths shares a type and is either both local or both public.
pub fn viable_between(a: &[Path], b: &[Path]) -> bool {
    a.iter().filter(|p| p.is_direct()).any(|pa| {
        b.iter()
            .filter(|p| p.is_direct())
            .any(|pb| pa.kind() == pb.kind() && pa.is_local() == pb.is_local())
    })
}

// ============================================================================
// Known Paths
// ============================================================================

#[derive(Debug, Clone)]
pub struct KnownPath {
    pub path: Path,
    pub priority: i32,
    pub last_in: Option<Instant>,
    pub last_out: Option<Instant>,
}

impl KnownPath {
    pub fn new(path: Path) -> Self {
        let priority = path.default_priority();
        Self {
            path,
            priority,
            last_in: None,
            last_out: None,
        }
    }

    /// A path is trusted enough to stop the send loop when it has recent
    /// inbound traffic, has never been sent on, answered after our last send,
    /// or last_in and last_out are within `window` of each other.
    pub fn is_valid(&self, now: Instant, window: Duration) -> bool {
        if let Some(last_in) = self.last_in
            && now.saturating_duration_since(last_in) < window
        {
            return true;
        }
        let Some(last_out) = self.last_out else {
            return true;
        };
        match self.last_in {
            Some(last_in) if last_in > last_out => true,
            Some(last_in) => last_out.saturating_duration_since(last_in) < window,
            None => false,
        }
    }
}

/// Order candidates for sending: explicit target first, then priority
/// (highest first), then most recently heard from.
pub fn sort_for_send(paths: &mut [KnownPath], target: Option<&Path>) {
    paths.sort_by(|a, b| {
        if let Some(target) = target {
            match (a.path.matches(target), b.path.matches(target)) {
                (true, false) => return Ordering::Less,
                (false, true) => return Ordering::Greater,
                _ => {}
            }
        }
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.last_in.cmp(&a.last_in))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, port: u16) -> Path {
        Path::Ipv4 { ip: Ipv4Addr::new(a, 0, 0, 1), port }
    }

    #[test]
    fn wire_format_is_type_tagged() {
        let path = Path::Ipv4 { ip: Ipv4Addr::new(1, 2, 3, 4), port: 42424 };
        let json = serde_json::to_string(&path).expect("serialize");
        assert_eq!(json, r#"{"type":"ipv4","ip":"1.2.3.4","port":42424}"#);
        assert_eq!(Path::from_value(&path.to_value()), Some(path));
    }

    #[test]
    fn unknown_types_are_rejected() {
        let value = serde_json::json!({"type": "carrier-pigeon", "id": "x"});
        assert_eq!(Path::from_value(&value), None);
    }

    #[test]
    fn matching_is_type_specific() {
        assert!(v4(1, 10).matches(&v4(1, 10)));
        assert!(!v4(1, 10).matches(&v4(1, 11)));
        let relay = Path::Relay { id: Hashname::from_bytes([1; 32]) };
        let bridge = Path::Bridge { id: Hashname::from_bytes([1; 32]) };
        assert!(!relay.matches(&bridge));
        let a = Path::Http { http: "http://a".into() };
        assert!(a.matches(&Path::Http { http: "http://a".into() }));
    }

    #[test]
    fn locality_classification() {
        assert!(v4(10, 1).is_local());
        assert!(v4(127, 1).is_local());
        assert!(!v4(8, 1).is_local());
        assert!(Path::Ipv6 { ip: "fe80::1".parse().expect("ip"), port: 1 }.is_local());
        assert!(!Path::Ipv6 { ip: "2001:db8::1".parse().expect("ip"), port: 1 }.is_local());
    }

    #[test]
    fn viability_needs_same_type_and_same_locality() {
        let local = vec![v4(10, 1)];
        let public = vec![v4(8, 1)];
        assert!(viable_between(&local, &[v4(127, 2)]));
        assert!(viable_between(&public, &[v4(9, 2)]));
        assert!(!viable_between(&local, &public));
        let relay_only = vec![Path::Relay { id: Hashname::from_bytes([2; 32]) }];
        assert!(!viable_between(&relay_only, &relay_only));
    }

    #[test]
    fn validity_window() {
        let window = Duration::from_secs(5);
        let t0 = Instant::now();
        let mut known = KnownPath::new(v4(8, 1));
        assert!(known.is_valid(t0, window), "never sent on");

        known.last_out = Some(t0);
        assert!(!known.is_valid(t0, window), "sent, never heard back");

        known.last_in = Some(t0 + Duration::from_secs(1));
        assert!(known.is_valid(t0 + Duration::from_secs(30), window), "answered after send");

        known.last_out = Some(t0 + Duration::from_secs(20));
        assert!(!known.is_valid(t0 + Duration::from_secs(30), window));
        known.last_out = Some(t0 + Duration::from_secs(4));
        assert!(known.is_valid(t0 + Duration::from_secs(30), window), "close together");
    }

    #[test]
    fn send_order_prefers_target_then_priority_then_recency() {
        let t0 = Instant::now();
        let mut public_old = KnownPath::new(v4(8, 1));
        public_old.last_in = Some(t0);
        let mut public_new = KnownPath::new(v4(9, 1));
        public_new.last_in = Some(t0 + Duration::from_secs(1));
        let local = KnownPath::new(v4(10, 1));

        let mut paths = vec![public_old.clone(), public_new.clone(), local.clone()];
        sort_for_send(&mut paths, None);
        let order: Vec<_> = paths.iter().map(|p| p.path.clone()).collect();
        assert_eq!(order, vec![local.path.clone(), public_new.path.clone(), public_old.path.clone()]);

        sort_for_send(&mut paths, Some(&public_old.path));
        assert_eq!(paths[0].path, public_old.path);
    }
}
