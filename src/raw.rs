//! Unreliable channels.
//!
//! No sequencing, no retransmission. A raw channel exists only while packets
//! keep flowing: every send or receive pushes its idle deadline out, and an
//! `end` or `err` in either direction removes it at once.
//!
//! The switch also uses raw channels for its own request/response exchanges
//! (lookups, path probes, bridge setup); [`RawPurpose`] records which one so
//! the answer can be routed back without a closure.

use std::time::Duration;

use crate::identity::Hashname;
use crate::messages::{ChannelId, Packet, PacketError};
use crate::path::Path;
use crate::scheduler::TimerId;

/// Who consumes packets arriving on a raw channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPurpose {
    /// Registered application handler.
    App,
    /// One query of an iterative lookup for `target`.
    Lookup { target: Hashname },
    /// Maintenance "seek self" liveness probe.
    Probe,
    /// Path sync probe sent on exactly `path`.
    PathProbe { path: Path },
    /// Bridge setup toward `target`.
    Bridge { target: Hashname },
}

#[derive(Debug)]
pub struct RawChannel {
    pub id: ChannelId,
    pub peer: Hashname,
    pub channel_type: String,
    pub purpose: RawPurpose,
    pub timeout: Duration,
    pub idle: Option<TimerId>,
    initiated: bool,
    type_sent: bool,
    ended: bool,
}

impl RawChannel {
    pub fn new(
        id: ChannelId,
        peer: Hashname,
        channel_type: impl Into<String>,
        purpose: RawPurpose,
        initiated: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            peer,
            channel_type: channel_type.into(),
            purpose,
            timeout,
            idle: None,
            initiated,
            type_sent: false,
            ended: false,
        }
    }

    /// Stamp channel id (and type, on the first packet we originate). A
    /// packet too large for a line frame leaves the channel untouched.
    pub fn send(&mut self, mut packet: Packet) -> Result<Packet, PacketError> {
        let names_type = self.initiated && !self.type_sent;
        packet.header.c = Some(self.id);
        packet.header.seq = None;
        packet.header.ack = None;
        packet.header.miss = None;
        if names_type {
            packet.header.channel_type = Some(self.channel_type.clone());
        }
        packet.encode()?;
        self.type_sent |= names_type;
        if packet.header.is_terminal() {
            self.ended = true;
        }
        Ok(packet)
    }

    pub fn receive(&mut self, packet: &Packet) {
        if packet.header.is_terminal() {
            self.ended = true;
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn is_internal(&self) -> bool {
        self.purpose != RawPurpose::App
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Header;

    fn raw(initiated: bool) -> RawChannel {
        RawChannel::new(
            7,
            Hashname::from_bytes([3; 32]),
            "ping",
            RawPurpose::App,
            initiated,
            Duration::from_secs(10),
        )
    }

    #[test]
    fn type_only_on_first_originated_packet() {
        let mut channel = raw(true);
        let first = channel.send(Packet::default()).expect("send");
        let second = channel.send(Packet::default()).expect("send");
        assert_eq!(first.header.channel_type.as_deref(), Some("ping"));
        assert_eq!(first.header.c, Some(7));
        assert_eq!(second.header.channel_type, None);

        let mut answering = raw(false);
        assert_eq!(answering.send(Packet::default()).expect("send").header.channel_type, None);
    }

    #[test]
    fn oversized_send_keeps_the_type_for_the_next_packet() {
        let mut channel = raw(true);
        let huge = Packet::with_body(Header::default(), vec![0; crate::messages::MAX_PACKET_SIZE]);
        assert!(matches!(channel.send(huge), Err(PacketError::Oversized)));
        let next = channel.send(Packet::default()).expect("send");
        assert_eq!(next.header.channel_type.as_deref(), Some("ping"));
    }

    #[test]
    fn end_or_error_terminates_immediately() {
        let mut channel = raw(false);
        channel.receive(&Packet::default());
        assert!(!channel.is_ended());
        let header = Header {
            err: Some("nope".into()),
            ..Default::default()
        };
        channel.receive(&Packet::new(header));
        assert!(channel.is_ended());

        let mut sender = raw(true);
        sender
            .send(Packet::new(Header {
                end: true,
                ..Default::default()
            }))
            .expect("send");
        assert!(sender.is_ended());
    }
}
