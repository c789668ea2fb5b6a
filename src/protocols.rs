//! Collaborator traits at the edges of the switch.
//!
//! The switch core never owns a socket. Everything it puts on the network
//! goes through a [`Transport`], and everything it receives is handed in by
//! whoever owns the socket (see `node`).
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Transport | [`Transport`] | deliver wire bytes to a direct path |
//! | Test harness | [`Outbox`] | record outbound datagrams in memory |
//!
//! Only direct paths (`ipv4`, `ipv6`, `http`, `webrtc`) ever reach the
//! transport. Relay and bridge paths are resolved by the switch into sends on
//! some other peer's direct path first.

use crate::path::Path;

/// Fire-and-forget datagram sink.
///
/// Implementations must not block. A datagram that cannot be sent right now
/// is dropped; the channel layer retransmits.
pub trait Transport {
    fn send(&mut self, path: &Path, bytes: Vec<u8>);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, path: &Path, bytes: Vec<u8>) {
        (**self).send(path, bytes);
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, path: &Path, bytes: Vec<u8>) {
        (**self).send(path, bytes);
    }
}

/// In-memory transport that queues every datagram.
#[derive(Debug, Default)]
pub struct Outbox {
    sent: Vec<(Path, Vec<u8>)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything queued since the last drain, oldest first.
    pub fn drain(&mut self) -> Vec<(Path, Vec<u8>)> {
        std::mem::take(&mut self.sent)
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }
}

impl Transport for Outbox {
    fn send(&mut self, path: &Path, bytes: Vec<u8>) {
        self.sent.push((path.clone(), bytes));
    }
}
