//! # Hashmesh - Hashname-Addressed Overlay Switch
//!
//! Hashmesh connects peers that know each other only by a hashname, the
//! BLAKE3 digest of an Ed25519 public key:
//!
//! - **Lines**: signed, ephemeral-key handshakes producing an encrypted session per peer
//! - **Channels**: reliable (ordered, acked, retransmitted) and raw (fire-and-forget) streams over a line
//! - **Paths**: every address a peer was seen on, ranked and re-validated
//! - **DHT**: XOR-metric buckets, recursive `seek`, and an elected mesh of kept-alive peers
//! - **NAT Traversal**: introductions, hole punching, one-hop relay and line bridging
//!
//! ## Architecture
//!
//! The protocol engine is a synchronous [`Switch`] that never owns a socket
//! or reads a clock. A [`Node`] runs a switch inside a tokio actor on a UDP
//! socket:
//! - The [`Node`] handle is cheap to clone and talks to its actor over a channel
//! - The actor owns the switch and serialises datagrams, commands and timers
//! - Tests drive a [`Switch`] directly with an in-memory [`Outbox`] and hand-made `Instant`s
//!
//! ## Security Model
//!
//! - Hashname = BLAKE3(public key); opens are signed by that key
//! - Each line uses fresh X25519 keys and ChaCha20-Poly1305 with the line id as AAD
//! - Relays forward one hop only and are rate limited per sender
//! - Bridges are installed only for seeds and peers explicitly allowed to ask
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | tokio actor running a switch on a UDP socket |
//! | `switch` | protocol engine: lines, channel dispatch, timers, events |
//! | `mesh` | seek, bucket probing and mesh maintenance |
//! | `nat` | peer/connect introductions, relay, path sync and bridging |
//! | `identity` | keypairs, hashnames, line ids, XOR distance |
//! | `crypto` | open sealing/verification and line encryption |
//! | `messages` | datagram envelope, channel packet headers |
//! | `channel` | reliable channel state machine |
//! | `raw` | raw channel state |
//! | `peer` | per-peer paths, line state and channels |
//! | `path` | network paths and their ranking |
//! | `dht` | routing table, mesh election, iterative lookup |
//! | `relay` | relay throttle and bridge forwarding table |
//! | `scheduler` | deadline queue for switch timers |
//! | `config` | tunables and seed files |
//! | `transport` | UDP transport |
//! | `protocols` | transport trait and in-memory outbox |

mod channel;
mod config;
mod crypto;
mod dht;
mod error;
mod identity;
mod mesh;
mod messages;
mod nat;
mod node;
mod path;
mod peer;
mod protocols;
mod raw;
mod relay;
mod scheduler;
mod switch;
mod transport;

pub use channel::ChannelKind;
pub use config::{load_seeds, parse_seeds, Seed, SwitchConfig};
pub use crypto::CryptoError;
pub use error::{ChannelError, Error, Result, SeekError};
pub use identity::{dhash, Distance, Hashname, HashnameError, Keypair, LineId};
pub use messages::{ChannelId, PacketError, Payload};
pub use node::{Channel, Node};
pub use path::{Path, PathKind};
pub use peer::Peer;
pub use protocols::{Outbox, Transport};
pub use switch::{Event, Switch, SwitchStats};
pub use transport::UdpTransport;
