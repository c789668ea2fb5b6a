//! Switch configuration and seed loading.
//!
//! All protocol thresholds live in [`SwitchConfig`]. Defaults come from the
//! `DEFAULT_*` constants below; override individual fields with struct update
//! syntax:
//!
//! ```ignore
//! let config = SwitchConfig {
//!     bridging: true,
//!     ..SwitchConfig::default()
//! };
//! ```

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path as FsPath;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::crypto::parse_public_key;
use crate::identity::Hashname;
use crate::path::Path;

/// Reliable channel gives up when the oldest unacknowledged packet is this old.
pub const DEFAULT_CHANNEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between re-sends of the newest unacknowledged packet.
pub const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_secs(2);

/// Delay before an ack is sent when nothing else carries it.
pub const DEFAULT_AUTO_ACK: Duration = Duration::from_secs(1);

/// A packet named in a miss list is retransmitted at most this often.
pub const DEFAULT_MISS_RESEND_THROTTLE: Duration = Duration::from_secs(1);

/// Inbound reorder window. Sequences further ahead are dropped.
pub const DEFAULT_INBOUND_BUFFER: u32 = 100;

/// Unacknowledged packets allowed before sends are refused.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 100;

/// Longest miss list honored from a peer.
pub const DEFAULT_MISS_CAP: usize = 100;

/// Idle timeout of raw channels.
pub const DEFAULT_RAW_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout of a single seek query during a lookup.
pub const DEFAULT_SEEK_TIMEOUT: Duration = Duration::from_secs(3);

/// Inbound traffic newer than this keeps a path trusted.
pub const DEFAULT_PATH_WINDOW: Duration = Duration::from_secs(5);

/// Mesh maintenance period.
pub const DEFAULT_MESH_INTERVAL: Duration = Duration::from_secs(25);

/// Upper bound on elected peers across all buckets.
pub const DEFAULT_MESH_MAX: usize = 250;

/// Probes allowed into a bucket first discovered during maintenance.
pub const DEFAULT_NEW_BUCKET_PROBES: usize = 3;

/// Lines without inbound traffic for this long are considered dead.
pub const DEFAULT_LINE_TIMEOUT: Duration = Duration::from_secs(60);

/// Parallel tracks per lookup.
pub const DEFAULT_SEEK_CONCURRENCY: usize = 3;

/// Peers returned in a `see` answer.
pub const DEFAULT_SEEK_ANSWER: usize = 8;

/// Relayed packets allowed per source peer per window.
pub const DEFAULT_RELAY_RATE: u32 = 5;

pub const DEFAULT_RELAY_WINDOW: Duration = Duration::from_secs(1);

/// Delay before path sync after a peer is first heard through a relay.
pub const DEFAULT_PATH_SYNC_DELAY: Duration = Duration::from_secs(2);

/// Minimum spacing between lookups started to reach one peer.
pub const DEFAULT_RESEEK_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum spacing between open attempts to one peer.
pub const DEFAULT_OPEN_RETRY: Duration = Duration::from_secs(1);

/// Bridge entries unused for this long are dropped.
pub const DEFAULT_BRIDGE_TIMEOUT: Duration = Duration::from_secs(120);

/// Nonces remembered for bridged-packet deduplication.
pub const DEFAULT_BRIDGE_DEDUP: usize = 1024;

/// Source peers tracked by the relay throttle.
pub const DEFAULT_RELAY_TRACKED_PEERS: usize = 4096;

#[derive(Clone, Debug)]
pub struct SwitchConfig {
    // ========================================================================
    // Reliable Channels
    // ========================================================================
    pub channel_timeout: Duration,
    pub resend_interval: Duration,
    pub auto_ack: Duration,
    pub miss_resend_throttle: Duration,
    pub inbound_buffer: u32,
    pub outbound_buffer: usize,
    pub miss_cap: usize,

    // ========================================================================
    // Raw Channels and Lookups
    // ========================================================================
    pub raw_timeout: Duration,
    pub seek_timeout: Duration,
    pub seek_concurrency: usize,
    pub seek_answer: usize,

    // ========================================================================
    // Paths and Lines
    // ========================================================================
    pub path_window: Duration,
    pub path_sync_delay: Duration,
    pub open_retry: Duration,
    pub reseek_interval: Duration,
    pub line_timeout: Duration,

    // ========================================================================
    // Mesh
    // ========================================================================
    pub mesh_interval: Duration,
    pub mesh_max: usize,
    pub new_bucket_probes: usize,

    // ========================================================================
    // Relay and Bridge
    // ========================================================================
    /// Forward relay frames for other peers.
    pub relay: bool,
    pub relay_rate: u32,
    pub relay_window: Duration,
    pub relay_tracked_peers: usize,
    /// Accept bridge requests from any peer, not only permitted ones.
    pub bridging: bool,
    pub bridge_timeout: Duration,
    pub bridge_dedup: usize,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            channel_timeout: DEFAULT_CHANNEL_TIMEOUT,
            resend_interval: DEFAULT_RESEND_INTERVAL,
            auto_ack: DEFAULT_AUTO_ACK,
            miss_resend_throttle: DEFAULT_MISS_RESEND_THROTTLE,
            inbound_buffer: DEFAULT_INBOUND_BUFFER,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            miss_cap: DEFAULT_MISS_CAP,
            raw_timeout: DEFAULT_RAW_TIMEOUT,
            seek_timeout: DEFAULT_SEEK_TIMEOUT,
            seek_concurrency: DEFAULT_SEEK_CONCURRENCY,
            seek_answer: DEFAULT_SEEK_ANSWER,
            path_window: DEFAULT_PATH_WINDOW,
            path_sync_delay: DEFAULT_PATH_SYNC_DELAY,
            open_retry: DEFAULT_OPEN_RETRY,
            reseek_interval: DEFAULT_RESEEK_INTERVAL,
            line_timeout: DEFAULT_LINE_TIMEOUT,
            mesh_interval: DEFAULT_MESH_INTERVAL,
            mesh_max: DEFAULT_MESH_MAX,
            new_bucket_probes: DEFAULT_NEW_BUCKET_PROBES,
            relay: true,
            relay_rate: DEFAULT_RELAY_RATE,
            relay_window: DEFAULT_RELAY_WINDOW,
            relay_tracked_peers: DEFAULT_RELAY_TRACKED_PEERS,
            bridging: false,
            bridge_timeout: DEFAULT_BRIDGE_TIMEOUT,
            bridge_dedup: DEFAULT_BRIDGE_DEDUP,
        }
    }
}

// ============================================================================
// Seeds
// ============================================================================

/// Bootstrap entry, as found in a seeds JSON file.
#[derive(Clone, Debug, Deserialize)]
pub struct Seed {
    /// Hex-encoded Ed25519 public key.
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub ip6: Option<Ipv6Addr>,
    #[serde(default)]
    pub port6: Option<u16>,
    #[serde(default)]
    pub http: Option<String>,
    /// The seed may ask us to bridge, and may be asked to bridge for us.
    #[serde(default)]
    pub bridge: bool,
}

impl Seed {
    pub fn key(&self) -> Result<[u8; 32]> {
        let bytes = hex::decode(&self.public_key).context("seed publicKey is not hex")?;
        Ok(parse_public_key(&bytes)?)
    }

    pub fn hashname(&self) -> Result<Hashname> {
        Ok(Hashname::from_public_key(&self.key()?))
    }

    pub fn paths(&self) -> Vec<Path> {
        let mut paths = Vec::new();
        if let (Some(ip), Some(port)) = (self.ip, self.port) {
            paths.push(Path::Ipv4 { ip, port });
        }
        if let (Some(ip), Some(port)) = (self.ip6, self.port6) {
            paths.push(Path::Ipv6 { ip, port });
        }
        if let Some(http) = &self.http {
            paths.push(Path::Http { http: http.clone() });
        }
        paths
    }
}

pub fn parse_seeds(json: &str) -> Result<Vec<Seed>> {
    let seeds: Vec<Seed> = serde_json::from_str(json).context("invalid seeds json")?;
    for seed in &seeds {
        seed.key()
            .with_context(|| format!("seed {} has an unusable key", seed.public_key))?;
    }
    Ok(seeds)
}

pub fn load_seeds(path: impl AsRef<FsPath>) -> Result<Vec<Seed>> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read seeds from {}", path.display()))?;
    parse_seeds(&json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn defaults_match_constants() {
        let config = SwitchConfig::default();
        assert_eq!(config.inbound_buffer, DEFAULT_INBOUND_BUFFER);
        assert_eq!(config.relay_rate, 5);
        assert!(!config.bridging);
        assert!(config.relay);
    }

    #[test]
    fn seeds_parse_with_all_path_kinds() {
        let keypair = Keypair::generate();
        let json = format!(
            r#"[{{"publicKey":"{}","ip":"10.0.0.1","port":42424,"ip6":"fe80::1","port6":42425,"http":"http://seed.example:80","bridge":true}}]"#,
            hex::encode(keypair.public_key_bytes())
        );
        let seeds = parse_seeds(&json).expect("parse");
        assert_eq!(seeds.len(), 1);
        assert!(seeds[0].bridge);
        assert_eq!(seeds[0].paths().len(), 3);
        assert_eq!(seeds[0].hashname().expect("hashname"), keypair.hashname());
    }

    #[test]
    fn seeds_with_bad_keys_are_rejected() {
        let json = r#"[{"publicKey":"abcd","ip":"10.0.0.1","port":1}]"#;
        assert!(parse_seeds(json).is_err());
    }
}
