//! Central log collector built on the `net-patterns` pub/sub transport.
//!
//! - [`cli`] parses the `collect` and `emit` subcommands.
//! - [`collector`] listens for producers, filters by severity and logs
//!   every accepted message as `topic: body`.
//! - [`emitter`] dials a collector and publishes stdin lines under one
//!   severity topic.
//!
//! The collector is the listening side and the producers dial in, the
//! reverse of a typical publisher-as-server layout.

pub mod cli;
pub mod collector;
pub mod emitter;
