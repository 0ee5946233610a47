use std::fmt;
use std::time::Duration;

use anyhow::Result;
use bytes::{Buf, BytesMut};

use crate::kafka::api::ApiKey;
use crate::kafka::record::Compression;
use crate::kafka::{Deserialize, Serialize};

/// Malformed input detected while decoding a wire structure.
///
/// Any of these inside a response means the bytes no longer line up with what the peer declared,
/// so the connection that produced them cannot be trusted for subsequent frames either.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("not enough bytes left: needed {needed}, remaining {remaining}")]
    Truncated { needed: usize, remaining: usize },

    #[error("varint does not terminate within {max_bytes} bytes")]
    VarIntOverflow { max_bytes: usize },

    #[error("invalid length: {0}")]
    InvalidLength(i64),

    #[error("null value in a non-nullable field")]
    UnexpectedNull,

    #[error("{0} leftover bytes after the declared end")]
    Leftover(usize),

    #[error("tagged field {tag} follows tag {previous}")]
    TagOrder { previous: u32, tag: u32 },

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },
}

/// Payload-level failure of a single record batch.
///
/// The batch was fully delimited by its length field, so the surrounding stream is still in sync.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },

    #[error("unsupported record batch magic: {0}")]
    UnsupportedMagic(i8),

    #[error("invalid record batch attributes: {0:#06x}")]
    InvalidAttributes(i16),

    #[error("compressed record batches are not supported ({0:?})")]
    UnsupportedCompression(Compression),
}

/// Failure of a request sent through a [`Connection`](crate::Connection).
///
/// Connection-fatal variants ([`is_fatal`](Self::is_fatal)) are delivered to every outstanding
/// request and to every later `send` on the same connection.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection closed")]
    Closed,

    #[error("request {correlation_id} timed out after {timeout:?}")]
    Timeout {
        correlation_id: i32,
        timeout: Duration,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol framing error: {0}")]
    Framing(String),

    #[error("corrupt payload: {0}")]
    Integrity(String),

    #[error("failed to encode request: {0}")]
    Encode(String),

    #[error("expected a {expected:?} response, got {actual:?}")]
    UnexpectedResponse { expected: ApiKey, actual: ApiKey },
}

impl ClientError {
    /// Sort a codec or IO failure into the client error taxonomy by inspecting its cause chain.
    pub(crate) fn classify(err: &anyhow::Error) -> Self {
        let message = format!("{err:#}");

        if err.chain().any(|cause| cause.is::<std::io::Error>()) {
            Self::Transport(message)
        } else if err.chain().any(|cause| cause.is::<BatchError>()) {
            Self::Integrity(message)
        } else {
            Self::Framing(message)
        }
    }

    /// Whether this error takes the whole connection down.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed | Self::Transport(_) | Self::Framing(_))
    }
}

/// Error code carried in Kafka response payloads.
///
/// See the [protocol docs](https://kafka.apache.org/protocol#protocol_error_codes) for the full
/// list. Only the codes a client commonly branches on are named here; any other value is kept
/// as-is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ErrorCode(pub i16);

impl ErrorCode {
    pub const UNKNOWN_SERVER_ERROR: Self = Self(-1);
    pub const NONE: Self = Self(0);
    pub const OFFSET_OUT_OF_RANGE: Self = Self(1);
    pub const CORRUPT_MESSAGE: Self = Self(2);
    pub const UNKNOWN_TOPIC_OR_PARTITION: Self = Self(3);
    pub const LEADER_NOT_AVAILABLE: Self = Self(5);
    pub const NOT_LEADER_OR_FOLLOWER: Self = Self(6);
    pub const REQUEST_TIMED_OUT: Self = Self(7);
    pub const MESSAGE_TOO_LARGE: Self = Self(10);
    pub const NETWORK_EXCEPTION: Self = Self(13);
    pub const COORDINATOR_LOAD_IN_PROGRESS: Self = Self(14);
    pub const COORDINATOR_NOT_AVAILABLE: Self = Self(15);
    pub const NOT_COORDINATOR: Self = Self(16);
    pub const NOT_ENOUGH_REPLICAS: Self = Self(19);
    pub const ILLEGAL_GENERATION: Self = Self(22);
    pub const UNKNOWN_MEMBER_ID: Self = Self(25);
    pub const REBALANCE_IN_PROGRESS: Self = Self(27);
    pub const UNSUPPORTED_VERSION: Self = Self(35);
    pub const INVALID_REQUEST: Self = Self(42);
    pub const FENCED_INSTANCE_ID: Self = Self(82);

    #[inline]
    pub fn is_ok(self) -> bool {
        self == Self::NONE
    }

    /// Whether the broker considers the failed operation safe to retry.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::CORRUPT_MESSAGE
                | Self::UNKNOWN_TOPIC_OR_PARTITION
                | Self::LEADER_NOT_AVAILABLE
                | Self::NOT_LEADER_OR_FOLLOWER
                | Self::REQUEST_TIMED_OUT
                | Self::NETWORK_EXCEPTION
                | Self::COORDINATOR_LOAD_IN_PROGRESS
                | Self::COORDINATOR_NOT_AVAILABLE
                | Self::NOT_COORDINATOR
                | Self::NOT_ENOUGH_REPLICAS
        )
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::UNKNOWN_SERVER_ERROR => "UNKNOWN_SERVER_ERROR",
            Self::NONE => "NONE",
            Self::OFFSET_OUT_OF_RANGE => "OFFSET_OUT_OF_RANGE",
            Self::CORRUPT_MESSAGE => "CORRUPT_MESSAGE",
            Self::UNKNOWN_TOPIC_OR_PARTITION => "UNKNOWN_TOPIC_OR_PARTITION",
            Self::LEADER_NOT_AVAILABLE => "LEADER_NOT_AVAILABLE",
            Self::NOT_LEADER_OR_FOLLOWER => "NOT_LEADER_OR_FOLLOWER",
            Self::REQUEST_TIMED_OUT => "REQUEST_TIMED_OUT",
            Self::MESSAGE_TOO_LARGE => "MESSAGE_TOO_LARGE",
            Self::NETWORK_EXCEPTION => "NETWORK_EXCEPTION",
            Self::COORDINATOR_LOAD_IN_PROGRESS => "COORDINATOR_LOAD_IN_PROGRESS",
            Self::COORDINATOR_NOT_AVAILABLE => "COORDINATOR_NOT_AVAILABLE",
            Self::NOT_COORDINATOR => "NOT_COORDINATOR",
            Self::NOT_ENOUGH_REPLICAS => "NOT_ENOUGH_REPLICAS",
            Self::ILLEGAL_GENERATION => "ILLEGAL_GENERATION",
            Self::UNKNOWN_MEMBER_ID => "UNKNOWN_MEMBER_ID",
            Self::REBALANCE_IN_PROGRESS => "REBALANCE_IN_PROGRESS",
            Self::UNSUPPORTED_VERSION => "UNSUPPORTED_VERSION",
            Self::INVALID_REQUEST => "INVALID_REQUEST",
            Self::FENCED_INSTANCE_ID => "FENCED_INSTANCE_ID",
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "error code {}", self.0),
        }
    }
}

impl Serialize for ErrorCode {
    const SIZE: usize = 2;

    #[inline]
    fn encode_size(&self, _version: i16) -> usize {
        Self::SIZE
    }

    #[inline]
    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        self.0.encode(buf, version)
    }
}

impl Deserialize for ErrorCode {
    #[inline]
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        i16::decode(buf, version).map(|(code, n)| (Self(code), n))
    }
}
