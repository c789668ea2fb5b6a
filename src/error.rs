//! Error types.
//!
//! Failures are scoped to a peer, a channel, or a single lookup. Nothing
//! coming off the network is allowed to take down the switch:
//!
//! | Class | Surface |
//! |-------|---------|
//! | malformed input | logged and dropped |
//! | protocol violation | dropped, sometimes answered with an `err` packet |
//! | remote `err` / timeout | [`ChannelError`] delivered once to the handler |
//! | bridge without permission | `err` reply to the requester |
//! | lookup exhausted | [`SeekError`] to every waiting caller |
//!
//! [`Error`] is what the application-facing API returns.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::identity::Hashname;
use crate::messages::{ChannelId, PacketError};

/// Wire text of the synthetic timeout error.
pub const ERR_TIMEOUT: &str = "timeout";
/// Wire text sent for channels of an unregistered type.
pub const ERR_UNKNOWN_TYPE: &str = "unknown type";
/// Wire text sent when a bridge target cannot be resolved.
pub const ERR_INVALID_PATH: &str = "invalid path";
/// Wire text sent when a bridge is refused.
pub const ERR_NOT_ALLOWED: &str = "not allowed";

/// Terminal condition of a single channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The remote side sent `err`.
    #[error("remote error: {0}")]
    Remote(String),
    /// No ack within the channel timeout, or a raw channel went idle.
    #[error("timeout")]
    Timeout,
    /// Locally failed by the application.
    #[error("failed locally: {0}")]
    Local(String),
}

impl ChannelError {
    /// Text carried in the `err` field on the wire.
    pub fn wire_text(&self) -> String {
        match self {
            ChannelError::Remote(reason) | ChannelError::Local(reason) => reason.clone(),
            ChannelError::Timeout => ERR_TIMEOUT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeekError {
    #[error("lookup for {0} exhausted all candidates")]
    Exhausted(Hashname),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown peer {0}")]
    UnknownPeer(Hashname),

    #[error("no channel {channel} with peer {peer}")]
    UnknownChannel { peer: Hashname, channel: ChannelId },

    #[error("channel {0} has already ended")]
    ChannelEnded(ChannelId),

    #[error("channel send window is full")]
    WindowFull,

    #[error("cannot open a channel to ourselves")]
    SelfChannel,

    #[error("channel type {0:?} is reserved by the switch")]
    ReservedType(String),

    #[error("no line to {0}")]
    NoLine(Hashname),

    #[error("invalid seed: {0}")]
    InvalidSeed(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Seek(#[from] SeekError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("switch has shut down")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
