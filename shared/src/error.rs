//! Error types shared by the codec, the transports and the session.

use std::net::SocketAddr;
use thiserror::Error;

/// Failure while parsing a packet received from the wire.
///
/// Decode errors never tear down a connection: the offending packet is
/// logged and dropped, the next packet is parsed from a clean state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of packet")]
    UnexpectedEnd,

    #[error("variable-length integer does not fit in {0} bits")]
    VarintOverflow(u32),

    #[error("length {len} outside of allowed range [{min}, {max}]")]
    LengthOutOfRange { len: usize, min: usize, max: usize },

    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: u64 },

    #[error("snapshot decompression failed")]
    Decompress,
}

/// Top level error of the replication layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("no usable endpoint in {0:?}")]
    NoEndpoints(String),

    #[error("malformed packet: {0}")]
    Decode(#[from] DecodeError),

    #[error("tile map serialization failed: {0}")]
    TileMap(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
