//! Connection plumbing shared by every messaging pattern.
//!
//! - [`connector`] accepts or establishes TCP connections and owns one
//!   [`Queue`] per live connection.
//! - [`queue`] is the bounded outbound buffer behind each connection.
//! - [`protocol`] is the seam a pattern plugs its wire format into.

pub mod connector;
pub mod protocol;
pub mod queue;

pub use connector::{ConnectHook, Connector, Direction, ErrorHook};
pub use protocol::Protocol;
pub use queue::{ConnectionId, Queue};
