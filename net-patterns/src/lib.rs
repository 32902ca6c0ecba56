//! Small TCP publish/subscribe transport.
//!
//! The crate is split in two layers:
//!
//! - [`core`] turns raw TCP connections into bounded per-connection
//!   [`Queue`](core::Queue)s behind a [`Connector`](core::Connector), which
//!   either listens or dials and runs a pluggable
//!   [`Protocol`](core::Protocol) handshake on every connection.
//! - [`pubsub`] builds a [`Publisher`](pubsub::Publisher) and a
//!   [`Subscriber`](pubsub::Subscriber) on top, speaking a length-prefixed
//!   wire format and filtering by a severity-ordered topic taxonomy.
//!
//! [`config`] holds connector settings and address parsing, [`error`] the
//! error taxonomy shared by both layers, and [`message`] the value that
//! travels between them.
//!
//! Which side listens is independent of the role: a publisher can accept
//! subscribers, and a subscriber can accept publishers, as the log
//! collector does.

pub mod config;
pub mod core;
pub mod error;
pub mod message;
pub mod pubsub;

pub use config::ConnectorConfig;
pub use error::{Error, Result};
pub use message::Message;
