//! # Handshake and Line Encryption
//!
//! Default cryptographic collaborator for the switch. The rest of the crate
//! only sees four operations: seal an open, verify an open, derive a line
//! cipher, and seal/open line frames.
//!
//! ## Open Handshake
//!
//! An open carries a signed record:
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `key` | sender's Ed25519 public key (hashname = BLAKE3 of it) |
//! | `ephemeral` | sender's X25519 public key for this line |
//! | `to` | recipient hashname |
//! | `line` | line id chosen by the sender |
//! | `at` | sender timestamp (ms), strictly increasing per sender |
//! | `known` | recipient's line id the sender already holds, if any |
//!
//! An open whose `known` matches the recipient's current line needs no
//! answering open.
//!
//! The record is bincode-encoded and signed over
//! `OPEN_SIGNATURE_DOMAIN || record`.
//!
//! ## Line Keys
//!
//! Both sides compute `X25519(own ephemeral, peer ephemeral)` and feed it with
//! the two line ids (sorted) into `blake3::derive_key`. Frames are sealed with
//! ChaCha20-Poly1305 under a random 12-byte `iv`, with the destination line id
//! as associated data.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::identity::{Hashname, Keypair, LineId};
use crate::messages::{
    deserialize_bounded, encode_envelope, encode_line, serialize_bounded, LineFrame, CSID, IV_LEN,
};

/// Domain separation prefix for open signatures.
pub const OPEN_SIGNATURE_DOMAIN: &[u8] = b"hashmesh-open-v1:";

const LINE_KEY_CONTEXT: &str = "hashmesh line key v1";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("handshake encoding: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("invalid public key")]
    InvalidKey,
    #[error("signature verification failed")]
    BadSignature,
    #[error("line encryption failed")]
    Encrypt,
    #[error("line decryption failed")]
    Decrypt,
    #[error("random source unavailable: {0}")]
    Rng(#[from] getrandom::Error),
}

#[derive(Serialize, Deserialize)]
struct OpenRecord {
    key: [u8; 32],
    ephemeral: [u8; 32],
    to: [u8; 32],
    line: [u8; 16],
    at: u64,
    known: Option<[u8; 16]>,
}

#[derive(Serialize, Deserialize)]
struct SignedOpen {
    record: Vec<u8>,
    signature: Vec<u8>,
}

/// A verified open handshake.
#[derive(Debug, Clone)]
pub struct VerifiedOpen {
    pub from: Hashname,
    pub key: [u8; 32],
    pub to: Hashname,
    pub line: LineId,
    pub at: u64,
    pub known: Option<LineId>,
    ephemeral: [u8; 32],
}

/// Our ephemeral half of a line.
#[derive(Clone)]
pub struct LineSecret(StaticSecret);

impl LineSecret {
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    pub fn public(&self) -> [u8; 32] {
        PublicKey::from(&self.0).to_bytes()
    }
}

impl std::fmt::Debug for LineSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LineSecret(..)")
    }
}

/// Build the wire bytes of an open addressed to `to`.
pub fn seal_open(
    keypair: &Keypair,
    to: &Hashname,
    line: LineId,
    at: u64,
    known: Option<LineId>,
    secret: &LineSecret,
) -> Result<Vec<u8>, CryptoError> {
    let record = OpenRecord {
        key: keypair.public_key_bytes(),
        ephemeral: secret.public(),
        to: *to.as_bytes(),
        line: *line.as_bytes(),
        at,
        known: known.map(|l| *l.as_bytes()),
    };
    let record = serialize_bounded(&record)?;
    let mut signed = Vec::with_capacity(OPEN_SIGNATURE_DOMAIN.len() + record.len());
    signed.extend_from_slice(OPEN_SIGNATURE_DOMAIN);
    signed.extend_from_slice(&record);
    let signature = keypair.sign(&signed).to_bytes().to_vec();

    let body = serialize_bounded(&SignedOpen { record, signature })?;
    Ok(encode_envelope(&[CSID], &body))
}

/// Decode and verify the body of an open packet.
pub fn verify_open(body: &[u8]) -> Result<VerifiedOpen, CryptoError> {
    let signed: SignedOpen = deserialize_bounded(body)?;
    let record: OpenRecord = deserialize_bounded(&signed.record)?;

    let verifying_key = VerifyingKey::from_bytes(&record.key).map_err(|_| CryptoError::InvalidKey)?;
    let signature = Signature::from_slice(&signed.signature).map_err(|_| CryptoError::BadSignature)?;
    let mut message = Vec::with_capacity(OPEN_SIGNATURE_DOMAIN.len() + signed.record.len());
    message.extend_from_slice(OPEN_SIGNATURE_DOMAIN);
    message.extend_from_slice(&signed.record);
    verifying_key
        .verify(&message, &signature)
        .map_err(|_| CryptoError::BadSignature)?;

    Ok(VerifiedOpen {
        from: Hashname::from_public_key(&record.key),
        key: record.key,
        to: Hashname::from_bytes(record.to),
        line: LineId::from_bytes(record.line),
        at: record.at,
        known: record.known.map(LineId::from_bytes),
        ephemeral: record.ephemeral,
    })
}

/// Check that raw key bytes form a usable Ed25519 public key.
pub fn parse_public_key(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    let key: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
    VerifyingKey::from_bytes(&key).map_err(|_| CryptoError::InvalidKey)?;
    Ok(key)
}

// ============================================================================
// Line Cipher
// ============================================================================

pub struct LineCipher {
    cipher: ChaCha20Poly1305,
}

impl LineCipher {
    pub fn derive(secret: &LineSecret, ours: LineId, theirs: &VerifiedOpen) -> Self {
        let shared = secret.0.diffie_hellman(&PublicKey::from(theirs.ephemeral));
        let (low, high) = if ours.as_bytes() <= theirs.line.as_bytes() {
            (ours, theirs.line)
        } else {
            (theirs.line, ours)
        };
        let mut material = Vec::with_capacity(32 + 2 * LineId::LEN);
        material.extend_from_slice(shared.as_bytes());
        material.extend_from_slice(low.as_bytes());
        material.extend_from_slice(high.as_bytes());
        let key = blake3::derive_key(LINE_KEY_CONTEXT, &material);
        Self {
            cipher: ChaCha20Poly1305::new(&key.into()),
        }
    }

    /// Encrypt an inner packet for the line the peer knows as `line`.
    pub fn seal(&self, line: LineId, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: plaintext,
                    aad: line.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::Encrypt)?;
        Ok(encode_line(line, &iv, &ciphertext))
    }

    pub fn open(&self, frame: &LineFrame<'_>) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .decrypt(
                Nonce::from_slice(&frame.iv),
                Payload {
                    msg: frame.ciphertext,
                    aad: frame.line.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::Decrypt)
    }
}

impl std::fmt::Debug for LineCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LineCipher(..)")
    }
}
