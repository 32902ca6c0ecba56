//! Error taxonomy shared by the connector and the pub/sub roles.
//!
//! Connection-scoped failures (`Protocol`, `Framing`, `QueueFull`,
//! `Disconnected`) never abort the owning Publisher or Subscriber; they are
//! reported through callbacks or recorded for the next `publish`. Only
//! `Config` errors and lifecycle errors are returned synchronously from
//! constructors.

use std::{io, net::SocketAddr};

use thiserror::Error;

use crate::core::ConnectionId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    QueueFull(#[from] QueueFullError),

    #[error("connection {connection} ({peer}) dropped: {source}")]
    Disconnected {
        connection: ConnectionId,
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("message handler failed: {0}")]
    Handler(String),

    #[error("connector is already open")]
    AlreadyOpen,

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Handshake failures on connection open.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("protocol version mismatch: expected v{expected}, peer sent v{found}")]
    VersionMismatch { expected: u8, found: u8 },

    #[error("malformed greeting {0:?}")]
    MalformedGreeting([u8; 4]),

    #[error("connection closed during handshake")]
    ClosedDuringHandshake,

    #[error("handshake i/o failed: {0}")]
    Io(#[source] io::Error),
}

/// Decoding or encoding failures of a single message frame.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("{field} length {len} exceeds the limit of {max} bytes")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("connection closed mid-frame ({read} of {expected} bytes of {field})")]
    Truncated {
        field: &'static str,
        read: usize,
        expected: usize,
    },

    #[error("topic is not valid utf-8")]
    InvalidTopic,

    #[error("frame i/o failed: {0}")]
    Io(#[source] io::Error),
}

/// Invalid construction-time input.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown severity topic '{0}'")]
    UnknownSeverity(String),

    #[error("severity taxonomy is invalid: {0}")]
    InvalidTaxonomy(String),

    #[error("invalid address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("queue size must be greater than zero")]
    InvalidQueueSize,
}

/// A queue rejected a message because its buffer was saturated.
#[derive(Debug, Error)]
#[error("queue for connection {connection} ({peer}) is full ({capacity} messages), message dropped")]
pub struct QueueFullError {
    pub connection: ConnectionId,
    pub peer: SocketAddr,
    pub capacity: usize,
}
