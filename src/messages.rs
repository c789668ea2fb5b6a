//! # Wire Protocol Messages
//!
//! Every datagram is an envelope: a 2-byte big-endian header length, the
//! header bytes, then the body.
//!
//! | Header length | Class | Body |
//! |---------------|-------|------|
//! | 0 | line packet | line id (16) ‖ iv (12) ‖ ciphertext |
//! | 1 | open packet | signed handshake (see `crypto`) |
//! | ≥ 2 | channel packet (inside a line) | application bytes |
//!
//! Channel packets carry a JSON [`Header`] with the logical fields shared by
//! all channel types (`type`, `c`, `seq`, `ack`, `miss`, `end`, `err`) plus
//! type-specific ones. Fields the switch does not know are preserved in
//! [`Header::extra`] for the application.
//!
//! ## Security Limits
//!
//! - `MAX_PACKET_SIZE`: upper bound on any envelope accepted from the network
//! - Binary handshake records go through `deserialize_bounded()`

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::{Hashname, LineId};
use crate::path::Path;

/// Maximum envelope accepted from the transport.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Length of the line-packet nonce (`iv`).
pub const IV_LEN: usize = 12;

/// Bytes a line frame adds around an encrypted channel packet: envelope
/// length, line id, iv and the AEAD tag.
pub const LINE_OVERHEAD: usize = 2 + LineId::LEN + IV_LEN + 16;

/// Largest encoded channel packet that still fits in one line frame.
pub const MAX_CHANNEL_PACKET: usize = MAX_PACKET_SIZE - LINE_OVERHEAD;

/// Cipher set identifier carried as the single header byte of an open.
pub const CSID: u8 = 0x1a;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_PACKET_SIZE as u64)
        .with_fixint_encoding()
}

pub fn serialize_bounded<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("packet too short ({0} bytes)")]
    Truncated(usize),
    #[error("packet exceeds {MAX_PACKET_SIZE} bytes")]
    Oversized,
    #[error("header length {head} overruns packet of {len} bytes")]
    BadHeaderLength { head: usize, len: usize },
    #[error("unknown cipher set {0:#04x}")]
    UnknownCipherSet(u8),
    #[error("invalid header json: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Envelope
// ============================================================================

/// Frame `head` and `body`. The length prefix is 16 bits; variable headers go
/// through [`Packet::encode`], which checks it.
pub fn encode_envelope(head: &[u8], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + head.len() + body.len());
    out.extend_from_slice(&(head.len() as u16).to_be_bytes());
    out.extend_from_slice(head);
    out.extend_from_slice(body);
    out
}

pub fn decode_envelope(bytes: &[u8]) -> Result<(&[u8], &[u8]), PacketError> {
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(PacketError::Oversized);
    }
    if bytes.len() < 2 {
        return Err(PacketError::Truncated(bytes.len()));
    }
    let head = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    if 2 + head > bytes.len() {
        return Err(PacketError::BadHeaderLength { head, len: bytes.len() });
    }
    Ok((&bytes[2..2 + head], &bytes[2 + head..]))
}

/// Outer classification of a datagram received from the transport.
#[derive(Debug)]
pub enum Datagram<'a> {
    Keepalive,
    Open(&'a [u8]),
    Line(LineFrame<'a>),
}

#[derive(Debug, Clone, Copy)]
pub struct LineFrame<'a> {
    pub line: LineId,
    pub iv: [u8; IV_LEN],
    pub ciphertext: &'a [u8],
}

pub fn classify(bytes: &[u8]) -> Result<Datagram<'_>, PacketError> {
    if bytes.is_empty() {
        return Ok(Datagram::Keepalive);
    }
    let (head, body) = decode_envelope(bytes)?;
    match head.len() {
        0 if body.is_empty() => Ok(Datagram::Keepalive),
        0 => {
            if body.len() < LineId::LEN + IV_LEN {
                return Err(PacketError::Truncated(bytes.len()));
            }
            let line = LineId::from_slice(&body[..LineId::LEN])
                .ok_or(PacketError::Truncated(bytes.len()))?;
            let mut iv = [0u8; IV_LEN];
            iv.copy_from_slice(&body[LineId::LEN..LineId::LEN + IV_LEN]);
            Ok(Datagram::Line(LineFrame {
                line,
                iv,
                ciphertext: &body[LineId::LEN + IV_LEN..],
            }))
        }
        1 if head[0] == CSID => Ok(Datagram::Open(body)),
        1 => Err(PacketError::UnknownCipherSet(head[0])),
        _ => Err(PacketError::BadHeaderLength { head: head.len(), len: bytes.len() }),
    }
}

pub fn encode_line(line: LineId, iv: &[u8; IV_LEN], ciphertext: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(LineId::LEN + IV_LEN + ciphertext.len());
    body.extend_from_slice(line.as_bytes());
    body.extend_from_slice(iv);
    body.extend_from_slice(ciphertext);
    encode_envelope(&[], &body)
}

// ============================================================================
// Channel Packets
// ============================================================================

pub type ChannelId = u32;

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub channel_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub miss: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seek: Option<Hashname>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub see: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<Hashname>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Header {
    /// Known-type entries of `paths`; unknown path types are skipped.
    pub fn parsed_paths(&self) -> Vec<Path> {
        self.paths
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(Path::from_value)
            .collect()
    }

    pub fn parsed_path(&self) -> Option<Path> {
        self.path.as_ref().and_then(Path::from_value)
    }

    pub fn set_paths(&mut self, paths: &[Path]) {
        self.paths = Some(paths.iter().map(Path::to_value).collect());
    }

    pub fn is_terminal(&self) -> bool {
        self.end || self.err.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packet {
    pub header: Header,
    pub body: Vec<u8>,
}

impl Packet {
    pub fn new(header: Header) -> Self {
        Self { header, body: Vec::new() }
    }

    pub fn with_body(header: Header, body: Vec<u8>) -> Self {
        Self { header, body }
    }

    /// Encode for sealing into a line. Fails when the result could not
    /// travel in a single line frame.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let head = serde_json::to_vec(&self.header)?;
        if head.len() > u16::MAX as usize || 2 + head.len() + self.body.len() > MAX_CHANNEL_PACKET {
            return Err(PacketError::Oversized);
        }
        Ok(encode_envelope(&head, &self.body))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let (head, body) = decode_envelope(bytes)?;
        if head.len() < 2 {
            return Err(PacketError::BadHeaderLength { head: head.len(), len: bytes.len() });
        }
        let header: Header = serde_json::from_slice(head)?;
        Ok(Self { header, body: body.to_vec() })
    }
}

/// Application-facing view of a channel packet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    pub fields: Map<String, Value>,
    pub body: Vec<u8>,
    pub end: bool,
}

impl Payload {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn end(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            end: true,
            ..Default::default()
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub(crate) fn into_packet(self) -> Packet {
        let header = Header {
            end: self.end,
            extra: self.fields,
            ..Default::default()
        };
        Packet::with_body(header, self.body)
    }

    pub(crate) fn from_packet(packet: Packet) -> Self {
        Self {
            fields: packet.header.extra,
            body: packet.body,
            end: packet.header.end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_channel_packets_are_refused() {
        let body = Packet::with_body(Header::default(), vec![0; MAX_CHANNEL_PACKET]);
        assert!(matches!(body.encode(), Err(PacketError::Oversized)));

        let mut header = Header::default();
        header.extra.insert("blob".into(), Value::String("x".repeat(70_000)));
        assert!(matches!(Packet::new(header).encode(), Err(PacketError::Oversized)));

        let fits = Packet::with_body(Header::default(), vec![0; 1024]);
        let bytes = fits.encode().expect("encode");
        assert!(bytes.len() + LINE_OVERHEAD <= MAX_PACKET_SIZE);
    }

    #[test]
    fn empty_datagrams_are_keepalives() {
        assert!(matches!(classify(&[]), Ok(Datagram::Keepalive)));
        assert!(matches!(classify(&encode_envelope(&[], &[])), Ok(Datagram::Keepalive)));
    }

    #[test]
    fn classification_by_header_length() {
        let open = encode_envelope(&[CSID], b"handshake");
        assert!(matches!(classify(&open), Ok(Datagram::Open(b"handshake"))));

        let line = LineId::from_bytes([9; 16]);
        let wire = encode_line(line, &[7; IV_LEN], b"secret");
        match classify(&wire) {
            Ok(Datagram::Line(frame)) => {
                assert_eq!(frame.line, line);
                assert_eq!(frame.iv, [7; IV_LEN]);
                assert_eq!(frame.ciphertext, b"secret");
            }
            other => panic!("expected line frame, got {other:?}"),
        }

        assert!(matches!(
            classify(&encode_envelope(&[0x99], b"x")),
            Err(PacketError::UnknownCipherSet(0x99))
        ));
    }

    #[test]
    fn malformed_envelopes_are_errors() {
        assert!(matches!(decode_envelope(&[0]), Err(PacketError::Truncated(1))));
        assert!(matches!(
            decode_envelope(&[0, 10, 1, 2]),
            Err(PacketError::BadHeaderLength { head: 10, len: 4 })
        ));
        let short_line = encode_envelope(&[], &[1, 2, 3]);
        assert!(classify(&short_line).is_err());
    }

    #[test]
    fn header_omits_absent_fields_and_keeps_extras() {
        let mut header = Header {
            channel_type: Some("chat".into()),
            c: Some(3),
            seq: Some(0),
            ..Default::default()
        };
        header.extra.insert("nick".into(), Value::from("ann"));
        let packet = Packet::with_body(header, b"hi".to_vec());
        let bytes = packet.encode().expect("encode");

        let (head, _) = decode_envelope(&bytes).expect("envelope");
        let json: Value = serde_json::from_slice(head).expect("json");
        assert_eq!(json, serde_json::json!({"type": "chat", "c": 3, "seq": 0, "nick": "ann"}));

        let decoded = Packet::decode(&bytes).expect("decode");
        assert_eq!(decoded, packet);
    }

    #[test]
    fn unknown_path_entries_are_skipped() {
        let mut header = Header::default();
        header.paths = Some(vec![
            serde_json::json!({"type": "ipv4", "ip": "1.2.3.4", "port": 5}),
            serde_json::json!({"type": "smoke-signal"}),
        ]);
        assert_eq!(header.parsed_paths().len(), 1);
    }
}
