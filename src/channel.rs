//! # Reliable Channels
//!
//! Ordered, acknowledged message streams multiplexed over a line.
//!
//! ## State
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `out_seq` | next outgoing sequence (starts at 0) |
//! | `outq` | sent packets awaiting ack, oldest first |
//! | `inq` | reorder buffer; slot `i` holds sequence `in_done + 1 + i` |
//! | `in_done` | highest contiguous sequence handed to the application |
//! | `last_ack` | highest ack received from the peer |
//! | `out_confirmed` | highest ack we have told the peer about |
//!
//! The channel never touches sockets or clocks. Every operation returns
//! [`Effect`]s for the switch to carry out: packets to transmit, payloads to
//! deliver, failures to report. Timers (ack delay, resend, reap) are owned by
//! the switch and recorded in [`ChannelTimers`].
//!
//! ## Delivery
//!
//! At most one packet is with the application at a time. The next buffered
//! packet is released only after [`ReliableChannel::delivered`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::config::SwitchConfig;
use crate::error::{ChannelError, Error};
use crate::identity::Hashname;
use crate::messages::{ChannelId, Header, Packet};
use crate::scheduler::TimerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Reliable,
    Raw,
}

/// Work the switch must perform on behalf of a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(Packet),
    Deliver(Packet),
    Fail(ChannelError),
    /// A sent packet that asked for notification was acknowledged.
    Acked(u32),
    /// A sequenced packet arrived; make sure an ack goes out eventually.
    ArmAck,
}

#[derive(Debug, Default)]
pub struct ChannelTimers {
    pub ack: Option<TimerId>,
    pub resend: Option<TimerId>,
    pub reap: Option<TimerId>,
}

/// Per-channel copy of the relevant thresholds.
#[derive(Debug, Clone, Copy)]
pub struct ChannelLimits {
    pub timeout: Duration,
    pub inbound_buffer: u32,
    pub outbound_buffer: usize,
    pub miss_cap: usize,
    pub miss_resend_throttle: Duration,
}

impl From<&SwitchConfig> for ChannelLimits {
    fn from(config: &SwitchConfig) -> Self {
        Self {
            timeout: config.channel_timeout,
            inbound_buffer: config.inbound_buffer,
            outbound_buffer: config.outbound_buffer,
            miss_cap: config.miss_cap,
            miss_resend_throttle: config.miss_resend_throttle,
        }
    }
}

#[derive(Debug)]
struct Outgoing {
    packet: Packet,
    sent_at: Instant,
    resent_at: Option<Instant>,
    notify: bool,
}

impl Outgoing {
    fn seq(&self) -> u32 {
        self.packet.header.seq.unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct ReliableChannel {
    pub id: ChannelId,
    pub peer: Hashname,
    pub channel_type: String,
    initiated: bool,

    out_seq: u32,
    outq: VecDeque<Outgoing>,
    inq: VecDeque<Option<Packet>>,
    in_done: Option<u32>,
    last_ack: Option<u32>,
    out_confirmed: Option<u32>,
    force_ack: bool,
    handling: bool,

    end_in: bool,
    end_out: bool,
    end_seq: Option<u32>,
    errored: Option<ChannelError>,

    pub timers: ChannelTimers,
    limits: ChannelLimits,
}

impl ReliableChannel {
    pub fn new(
        id: ChannelId,
        peer: Hashname,
        channel_type: impl Into<String>,
        initiated: bool,
        limits: ChannelLimits,
    ) -> Self {
        Self {
            id,
            peer,
            channel_type: channel_type.into(),
            initiated,
            out_seq: 0,
            outq: VecDeque::new(),
            inq: VecDeque::new(),
            in_done: None,
            last_ack: None,
            out_confirmed: None,
            force_ack: false,
            handling: false,
            end_in: false,
            end_out: false,
            end_seq: None,
            errored: None,
            timers: ChannelTimers::default(),
            limits,
        }
    }

    fn next_in(&self) -> u32 {
        self.in_done.map_or(0, |done| done + 1)
    }

    fn highest_sent(&self) -> Option<u32> {
        self.out_seq.checked_sub(1)
    }

    pub fn in_done(&self) -> Option<u32> {
        self.in_done
    }

    pub fn last_ack(&self) -> Option<u32> {
        self.last_ack
    }

    pub fn unacked(&self) -> usize {
        self.outq.len()
    }

    pub fn is_failed(&self) -> bool {
        self.errored.is_some()
    }

    /// End seen or sent, or failed: the table entry should be reaped after
    /// the grace period.
    pub fn is_ending(&self) -> bool {
        self.end_in || self.end_out || self.errored.is_some()
    }

    /// Delivered the remote end and had our own end acknowledged.
    pub fn is_closed(&self) -> bool {
        (self.end_in && self.end_out && self.outq.is_empty()) || self.errored.is_some()
    }

    pub fn needs_resend(&self) -> bool {
        self.errored.is_none() && !self.outq.is_empty()
    }

    /// Sequence numbers between `in_done` and the highest buffered packet
    /// that have not arrived.
    pub fn missing(&self) -> Vec<u32> {
        let base = self.next_in();
        self.inq
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(offset, _)| base + offset as u32)
            .collect()
    }

    /// Fill in the fields that describe our current state. Until the peer
    /// acks something, every sequenced packet we originate names the channel
    /// type, so whichever one arrives first can create the channel.
    fn fill(&self, header: &mut Header) {
        header.c = Some(self.id);
        header.ack = self.in_done;
        header.miss = if self.inq.is_empty() {
            None
        } else {
            Some(self.missing())
        };
        header.channel_type = (self.initiated && self.last_ack.is_none() && header.seq.is_some())
            .then(|| self.channel_type.clone());
    }

    fn stamp(&mut self, header: &mut Header) {
        self.fill(header);
        self.force_ack = false;
        if self.in_done.is_some() {
            self.out_confirmed = self.in_done;
        }
    }

    fn stamped(&mut self, mut packet: Packet) -> Packet {
        self.stamp(&mut packet.header);
        packet
    }

    /// Queue an outgoing packet and return it ready to transmit.
    pub fn send(&mut self, mut packet: Packet, notify: bool, now: Instant) -> Result<Packet, Error> {
        if self.errored.is_some() || self.end_out {
            return Err(Error::ChannelEnded(self.id));
        }
        if self.outq.len() >= self.limits.outbound_buffer {
            return Err(Error::WindowFull);
        }
        let header = &mut packet.header;
        header.seq = Some(self.out_seq);
        header.c = Some(self.id);
        header.err = None;
        header.channel_type = None;

        let mut wire = packet.clone();
        self.fill(&mut wire.header);
        wire.encode()?;

        if packet.header.end {
            self.end_out = true;
        }
        self.out_seq += 1;
        self.outq.push_back(Outgoing {
            packet: packet.clone(),
            sent_at: now,
            resent_at: None,
            notify,
        });
        trace!(peer = %self.peer.short(), channel = self.id, seq = self.out_seq - 1, "channel send");
        Ok(self.stamped(packet))
    }

    /// Build a bare ack, unless there is nothing new to report.
    pub fn ack(&mut self) -> Option<Packet> {
        if !self.force_ack && self.out_confirmed == self.in_done {
            return None;
        }
        let mut header = Header::default();
        self.stamp(&mut header);
        Some(Packet::new(header))
    }

    pub fn receive(&mut self, packet: Packet, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        let header = &packet.header;

        if let Some(reason) = &header.err {
            if self.errored.is_none() {
                debug!(peer = %self.peer.short(), channel = self.id, reason = %reason, "channel failed by remote");
                effects.extend(self.fail(ChannelError::Remote(reason.clone()), false));
            }
            return effects;
        }
        if let Some(err) = &self.errored {
            let mut header = Header::default();
            header.c = Some(self.id);
            header.err = Some(err.wire_text());
            effects.push(Effect::Send(Packet::new(header)));
            return effects;
        }

        if let Some(ack) = header.ack
            && self.highest_sent().is_none_or(|highest| ack > highest)
        {
            warn!(
                peer = %self.peer.short(),
                channel = self.id,
                ack,
                out_seq = self.out_seq,
                "ack beyond anything sent, dropping packet"
            );
            return effects;
        }

        let mut miss = header.miss.clone().unwrap_or_default();
        if miss.len() > self.limits.miss_cap {
            warn!(peer = %self.peer.short(), channel = self.id, len = miss.len(), "miss list too long, truncating");
            miss.truncate(self.limits.miss_cap);
        }
        let advanced = match (header.ack, self.last_ack) {
            (Some(ack), Some(last)) => ack > last,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if advanced || !miss.is_empty() {
            if advanced {
                self.last_ack = header.ack;
            }
            self.process_ack(&miss, now, &mut effects);
        }

        let Some(seq) = header.seq else {
            return effects;
        };
        effects.push(Effect::ArmAck);

        let next_in = self.next_in();
        let duplicate = seq < next_in
            || self
                .inq
                .get((seq - next_in) as usize)
                .is_some_and(|slot| slot.is_some());
        if duplicate {
            trace!(peer = %self.peer.short(), channel = self.id, seq, "duplicate, forcing ack");
            self.force_ack = true;
            effects.extend(self.ack().map(Effect::Send));
            return effects;
        }
        if seq - next_in >= self.limits.inbound_buffer {
            debug!(peer = %self.peer.short(), channel = self.id, seq, next_in, "too far ahead, dropping");
            self.force_ack = true;
            effects.extend(self.ack().map(Effect::Send));
            return effects;
        }
        if let Some(end_seq) = self.end_seq
            && seq > end_seq
        {
            debug!(peer = %self.peer.short(), channel = self.id, seq, end_seq, "packet after end, dropping");
            return effects;
        }
        if packet.header.end {
            self.end_seq = Some(seq);
        }

        let offset = (seq - next_in) as usize;
        if offset >= self.inq.len() {
            self.inq.resize(offset + 1, None);
        }
        self.inq[offset] = Some(packet);
        self.inbox(&mut effects);
        effects
    }

    fn process_ack(&mut self, miss: &[u32], now: Instant, effects: &mut Vec<Effect>) {
        if let Some(acked) = self.last_ack {
            while self.outq.front().is_some_and(|o| o.seq() <= acked) {
                if let Some(done) = self.outq.pop_front()
                    && done.notify
                {
                    effects.push(Effect::Acked(done.seq()));
                }
            }
        }
        if miss.is_empty() {
            return;
        }
        let throttle = self.limits.miss_resend_throttle;
        let mut resend = Vec::new();
        for out in self.outq.iter_mut() {
            if !miss.contains(&out.seq()) {
                continue;
            }
            if out
                .resent_at
                .is_some_and(|at| now.saturating_duration_since(at) < throttle)
            {
                continue;
            }
            out.resent_at = Some(now);
            resend.push(out.packet.clone());
        }
        for packet in resend {
            trace!(peer = %self.peer.short(), channel = self.id, seq = ?packet.header.seq, "resending missed");
            let packet = self.stamped(packet);
            effects.push(Effect::Send(packet));
        }
    }

    fn inbox(&mut self, effects: &mut Vec<Effect>) {
        if self.handling || self.errored.is_some() {
            return;
        }
        match self.inq.front() {
            Some(Some(packet)) => {
                self.handling = true;
                effects.push(Effect::Deliver(packet.clone()));
            }
            Some(None) => self.force_ack = true,
            None => {}
        }
    }

    /// The application finished with the packet last delivered.
    pub fn delivered(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !self.handling {
            return effects;
        }
        self.handling = false;
        if let Some(Some(packet)) = self.inq.pop_front() {
            if packet.header.end {
                self.end_in = true;
            }
            self.in_done = Some(self.next_in());
        }
        self.inbox(&mut effects);
        effects
    }

    /// Every unacknowledged packet, oldest first. Used when a line comes up
    /// after packets were queued behind the handshake.
    pub fn flush(&mut self) -> Vec<Effect> {
        if self.errored.is_some() {
            return Vec::new();
        }
        let pending: Vec<Packet> = self.outq.iter().map(|o| o.packet.clone()).collect();
        pending
            .into_iter()
            .map(|packet| Effect::Send(self.stamped(packet)))
            .collect()
    }

    /// Re-emit the newest unacknowledged packet, or time the channel out.
    pub fn resend(&mut self, now: Instant) -> Vec<Effect> {
        if self.errored.is_some() {
            return Vec::new();
        }
        let Some(oldest) = self.outq.front() else {
            return Vec::new();
        };
        if now.saturating_duration_since(oldest.sent_at) >= self.limits.timeout {
            debug!(peer = %self.peer.short(), channel = self.id, "unacknowledged past timeout");
            return self.fail(ChannelError::Timeout, true);
        }
        let Some(last) = self.outq.back() else {
            return Vec::new();
        };
        let packet = last.packet.clone();
        vec![Effect::Send(self.stamped(packet))]
    }

    /// Enter the terminal error state. Subsequent packets are answered with
    /// the error.
    pub fn fail(&mut self, error: ChannelError, notify_remote: bool) -> Vec<Effect> {
        if self.errored.is_some() {
            return Vec::new();
        }
        self.errored = Some(error.clone());
        self.outq.clear();
        self.inq.clear();
        self.handling = false;

        let mut effects = Vec::new();
        if notify_remote {
            let mut header = Header::default();
            header.c = Some(self.id);
            header.err = Some(error.wire_text());
            effects.push(Effect::Send(Packet::new(header)));
        }
        effects.push(Effect::Fail(error));
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Payload;

    fn limits() -> ChannelLimits {
        ChannelLimits::from(&SwitchConfig::default())
    }

    fn pair() -> (ReliableChannel, ReliableChannel) {
        let a = Hashname::from_bytes([0xaa; 32]);
        let b = Hashname::from_bytes([0xbb; 32]);
        (
            ReliableChannel::new(1, b, "chat", true, limits()),
            ReliableChannel::new(1, a, "chat", false, limits()),
        )
    }

    fn delivered_bodies(effects: &[Effect]) -> Vec<Vec<u8>> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Deliver(p) => Some(p.body.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn type_rides_on_every_packet_until_the_first_ack() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let first = a.send(Payload::new("x").into_packet(), false, now).expect("send");
        let second = a.send(Payload::new("y").into_packet(), false, now).expect("send");
        assert_eq!(first.header.seq, Some(0));
        assert_eq!(second.header.seq, Some(1));
        assert_eq!(first.header.channel_type.as_deref(), Some("chat"));
        assert_eq!(second.header.channel_type.as_deref(), Some("chat"));

        // a resend before any ack still names the type
        let effects = a.resend(now + Duration::from_secs(2));
        assert!(matches!(&effects[..], [Effect::Send(p)] if p.header.channel_type.as_deref() == Some("chat")));

        b.receive(first, now);
        b.delivered();
        let reply = b.send(Payload::new("z").into_packet(), false, now).expect("send");
        assert_eq!(reply.header.channel_type, None, "responder never names the type");
        a.receive(reply, now);

        let third = a.send(Payload::new("w").into_packet(), false, now).expect("send");
        assert_eq!(third.header.channel_type, None);
    }

    #[test]
    fn second_packet_alone_is_buffered_and_named_missing() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let _lost = a.send(Payload::new("0").into_packet(), false, now).expect("send");
        let p1 = a.send(Payload::new("1").into_packet(), false, now).expect("send");

        let effects = b.receive(p1, now);
        assert!(delivered_bodies(&effects).is_empty());
        let ack = b.ack().expect("gap forces an ack");
        assert_eq!(ack.header.ack, None);
        assert_eq!(ack.header.miss, Some(vec![0]));

        let effects = a.receive(ack, now);
        assert!(effects.iter().any(|e| matches!(e, Effect::Send(p) if p.header.seq == Some(0))));
    }

    #[test]
    fn flush_emits_every_unacked_packet_in_order() {
        let (mut a, _) = pair();
        let now = Instant::now();
        for i in 0..3u8 {
            a.send(Payload::new(vec![i]).into_packet(), false, now).expect("send");
        }
        let seqs: Vec<Option<u32>> = a
            .flush()
            .iter()
            .filter_map(|e| match e {
                Effect::Send(p) => Some(p.header.seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn oversized_packet_is_refused_without_queueing() {
        let (mut a, _) = pair();
        let now = Instant::now();
        let huge = Payload::new(vec![0u8; crate::messages::MAX_PACKET_SIZE]);
        assert!(matches!(
            a.send(huge.into_packet(), false, now),
            Err(Error::Packet(crate::messages::PacketError::Oversized))
        ));
        assert_eq!(a.unacked(), 0);
        let next = a.send(Payload::new("ok").into_packet(), false, now).expect("send");
        assert_eq!(next.header.seq, Some(0));
    }

    #[test]
    fn out_of_order_delivery_is_reordered() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let p: Vec<Packet> = (0..3u8)
            .map(|i| a.send(Payload::new(vec![i]).into_packet(), false, now).expect("send"))
            .collect();

        let effects = b.receive(p[0].clone(), now);
        assert_eq!(delivered_bodies(&effects), vec![vec![0]]);
        assert!(b.delivered().is_empty());

        let effects = b.receive(p[2].clone(), now);
        assert!(delivered_bodies(&effects).is_empty());

        // an ack now must name the gap
        let ack = b.ack().expect("ack due");
        assert_eq!(ack.header.ack, Some(0));
        assert_eq!(ack.header.miss, Some(vec![1]));

        let effects = b.receive(p[1].clone(), now);
        assert_eq!(delivered_bodies(&effects), vec![vec![1]]);
        let effects = b.delivered();
        assert_eq!(delivered_bodies(&effects), vec![vec![2]]);
        assert!(b.delivered().is_empty());
        assert_eq!(b.in_done(), Some(2));

        let ack = b.ack().expect("ack due");
        assert_eq!(ack.header.ack, Some(2));
        assert_eq!(ack.header.miss, None);
    }

    #[test]
    fn delivery_waits_for_continuation() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let p0 = a.send(Payload::new("0").into_packet(), false, now).expect("send");
        let p1 = a.send(Payload::new("1").into_packet(), false, now).expect("send");

        assert_eq!(delivered_bodies(&b.receive(p0, now)).len(), 1);
        assert!(delivered_bodies(&b.receive(p1, now)).is_empty(), "first still in flight");
        let effects = b.delivered();
        assert_eq!(delivered_bodies(&effects), vec![b"1".to_vec()]);
    }

    #[test]
    fn duplicates_force_an_ack() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let p0 = a.send(Payload::new("0").into_packet(), false, now).expect("send");
        b.receive(p0.clone(), now);
        b.delivered();
        assert!(b.ack().is_some());
        assert!(b.ack().is_none(), "nothing new to report");

        let effects = b.receive(p0, now);
        assert!(delivered_bodies(&effects).is_empty());
        assert!(effects.iter().any(|e| matches!(e, Effect::Send(p) if p.header.ack == Some(0))));
    }

    #[test]
    fn ack_beyond_highest_sent_is_rejected_without_state_change() {
        let (mut a, _) = pair();
        let now = Instant::now();
        a.send(Payload::new("0").into_packet(), false, now).expect("send");

        let mut bogus = Header::default();
        bogus.c = Some(1);
        bogus.ack = Some(5);
        bogus.seq = Some(0);
        let effects = a.receive(Packet::new(bogus), now);
        assert!(effects.is_empty());
        assert_eq!(a.last_ack(), None);
        assert_eq!(a.unacked(), 1);
        assert_eq!(a.in_done(), None);
    }

    #[test]
    fn ack_releases_outq_and_notifies() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let p0 = a.send(Payload::new("0").into_packet(), true, now).expect("send");
        let p1 = a.send(Payload::new("1").into_packet(), false, now).expect("send");
        b.receive(p0, now);
        b.delivered();
        b.receive(p1, now);
        b.delivered();
        let ack = b.ack().expect("ack");

        let effects = a.receive(ack, now);
        assert_eq!(effects, vec![Effect::Acked(0)]);
        assert_eq!(a.unacked(), 0);
        assert!(!a.needs_resend());
    }

    #[test]
    fn missed_packets_are_resent_at_most_once_per_throttle() {
        let (mut a, mut b) = pair();
        let t0 = Instant::now();
        let sent: Vec<Packet> = (0..3u8)
            .map(|i| a.send(Payload::new(vec![i]).into_packet(), false, t0).expect("send"))
            .collect();
        b.receive(sent[0].clone(), t0);
        b.delivered();
        b.receive(sent[2].clone(), t0);
        let ack = b.ack().expect("ack");

        let resent = |effects: &[Effect]| {
            effects
                .iter()
                .filter(|e| matches!(e, Effect::Send(p) if p.header.seq == Some(1)))
                .count()
        };
        assert_eq!(resent(&a.receive(ack.clone(), t0)), 1);
        assert_eq!(resent(&a.receive(ack.clone(), t0 + Duration::from_millis(200))), 0);
        assert_eq!(resent(&a.receive(ack, t0 + Duration::from_millis(1200))), 1);
    }

    #[test]
    fn too_far_ahead_is_dropped() {
        let config = SwitchConfig {
            inbound_buffer: 4,
            ..SwitchConfig::default()
        };
        let mut b = ReliableChannel::new(1, Hashname::from_bytes([1; 32]), "chat", false, (&config).into());
        let mut header = Header::default();
        header.c = Some(1);
        header.seq = Some(10);
        let effects = b.receive(Packet::new(header), Instant::now());
        assert!(delivered_bodies(&effects).is_empty());
        assert!(b.missing().is_empty(), "nothing buffered");
    }

    #[test]
    fn resend_times_out_the_channel() {
        let (mut a, _) = pair();
        let t0 = Instant::now();
        a.send(Payload::new("0").into_packet(), false, t0).expect("send");
        let effects = a.resend(t0 + Duration::from_secs(2));
        assert!(matches!(&effects[..], [Effect::Send(p)] if p.header.seq == Some(0)));

        let effects = a.resend(t0 + Duration::from_secs(11));
        assert!(effects.contains(&Effect::Fail(ChannelError::Timeout)));
        assert!(a.is_failed());
        assert!(a.resend(t0 + Duration::from_secs(12)).is_empty());
        assert!(a.send(Payload::new("late").into_packet(), false, t0).is_err());
    }

    #[test]
    fn remote_error_is_terminal_and_echoed() {
        let (_, mut b) = pair();
        let now = Instant::now();
        let mut header = Header::default();
        header.c = Some(1);
        header.err = Some("boom".into());
        let effects = b.receive(Packet::new(header), now);
        assert_eq!(effects, vec![Effect::Fail(ChannelError::Remote("boom".into()))]);

        let mut data = Header::default();
        data.c = Some(1);
        data.seq = Some(0);
        let effects = b.receive(Packet::new(data), now);
        assert!(matches!(&effects[..], [Effect::Send(p)] if p.header.err.as_deref() == Some("boom")));
    }

    #[test]
    fn end_both_ways_closes() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let end = a.send(Payload::end("bye").into_packet(), false, now).expect("send");
        assert!(a.is_ending());
        let effects = b.receive(end, now);
        assert_eq!(delivered_bodies(&effects), vec![b"bye".to_vec()]);
        b.delivered();
        let reply = b.send(Payload::end(Vec::new()).into_packet(), false, now).expect("send");
        assert_eq!(reply.header.ack, Some(0));
        a.receive(reply, now);
        a.delivered();
        assert!(a.is_closed());
    }
}
