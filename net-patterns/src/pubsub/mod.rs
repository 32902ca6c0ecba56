//! Topic-tagged publish/subscribe over a [`Connector`](crate::core::Connector).

pub mod publisher;
pub mod severity;
pub mod subscriber;
pub mod wire;

pub use crate::message::Message;
pub use publisher::{Publisher, QueueErrorHook};
pub use severity::{SeverityFilter, Taxonomy, DEBUG, ERROR, FATAL, INFO, STANDARD_LEVELS, WARN};
pub use subscriber::{ErrorHandler, MessageHandler, Subscriber};
pub use wire::PubProtoV1;
