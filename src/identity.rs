//! # Identity and Distance
//!
//! Core identity types used throughout the switch:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`Hashname`]: 32-byte BLAKE3 fingerprint of a public key, rendered as 64 hex chars
//! - [`LineId`]: 16-byte random identifier chosen by each side of a line
//!
//! ## Identity Model
//!
//! A hashname is content-derived: `BLAKE3(public_key)`. It is never assigned,
//! so possession of the matching secret key is the only proof of identity.
//!
//! ## Distance
//!
//! Two metrics are used over hashnames:
//!
//! | Metric | Function | Used by |
//! |--------|----------|---------|
//! | Bucket distance | [`Hashname::bucket_to`] | bucket derivation, election |
//! | Bucket distance over text | [`dhash`] | digests that arrive as hex strings |
//! | Full XOR ordering | [`distance_cmp`] over [`Hashname::xor_distance`] | seek candidate ordering |
//!
//! Bucket distance counts from the most significant differing bit: a
//! difference in the very first bit is bucket 255, a difference only in the
//! last bit is bucket 0. Smaller buckets are closer.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length of a hashname in hex characters.
pub const HASHNAME_HEX_LEN: usize = 64;

/// Bucket count derived from a 256-bit hashname.
pub const BUCKET_COUNT: usize = 256;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Keypair
// ============================================================================

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS random source.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn hashname(&self) -> Hashname {
        Hashname::from_public_key(&self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("hashname", &self.hashname())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Hashname
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashnameError {
    #[error("hashname must be {HASHNAME_HEX_LEN} hex characters, got {0}")]
    Length(usize),
    #[error("hashname is not valid hex")]
    Hex,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hashname([u8; 32]);

impl Hashname {
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &Hashname) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Bucket of `other` as seen from this hashname, `None` when identical.
    pub fn bucket_to(&self, other: &Hashname) -> Option<usize> {
        let xor = self.xor_distance(other);
        xor.iter().enumerate().find(|(_, byte)| **byte != 0).map(|(byte_idx, byte)| {
            let bit_index = byte_idx * 8 + byte.leading_zeros() as usize;
            BUCKET_COUNT - 1 - bit_index
        })
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, HashnameError> {
        if s.len() != HASHNAME_HEX_LEN {
            return Err(HashnameError::Length(s.len()));
        }
        let bytes = hex::decode(s).map_err(|_| HashnameError::Hex)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    /// First 8 hex characters, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for Hashname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hashname({})", self.short())
    }
}

impl fmt::Display for Hashname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Hashname {
    type Err = HashnameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Hashname {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hashname {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Line Identifiers
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineId([u8; 16]);

impl LineId {
    pub const LEN: usize = 16;

    pub fn random() -> Result<Self, getrandom::Error> {
        let mut id = [0u8; 16];
        getrandom::getrandom(&mut id)?;
        Ok(Self(id))
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LineId({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ============================================================================
// Distance Metric
// ============================================================================

/// Result of comparing two hex digests with [`dhash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Distance {
    /// Identical digests.
    Same,
    /// Index of the most significant differing bit, counted from the low end.
    Bucket(usize),
    /// Inputs of different length, empty, or not hex.
    Invalid,
}

impl Distance {
    pub fn bucket(self) -> Option<usize> {
        match self {
            Distance::Bucket(b) => Some(b),
            _ => None,
        }
    }
}

/// Bucket distance between two hex digests of equal length.
///
/// Text inputs can be malformed, so unlike [`Hashname::bucket_to`] this has
/// an [`Distance::Invalid`] outcome.
pub fn dhash(a: &str, b: &str) -> Distance {
    if a.is_empty() || a.len() != b.len() {
        return Distance::Invalid;
    }
    let mut remaining = a.len() * 4;
    for (ca, cb) in a.chars().zip(b.chars()) {
        let (Some(na), Some(nb)) = (ca.to_digit(16), cb.to_digit(16)) else {
            return Distance::Invalid;
        };
        remaining -= 4;
        let diff = na ^ nb;
        if diff != 0 {
            // highest set bit of the nibble sits above `remaining` lower bits
            let high = 31 - diff.leading_zeros() as usize;
            return Distance::Bucket(remaining + high);
        }
    }
    Distance::Same
}

pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    for i in 0..32 {
        if a[i] < b[i] {
            return std::cmp::Ordering::Less;
        } else if a[i] > b[i] {
            return std::cmp::Ordering::Greater;
        }
    }
    std::cmp::Ordering::Equal
}
