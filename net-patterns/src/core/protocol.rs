use std::fmt;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::{io::AsyncRead, net::TcpStream};

use crate::{
    error::{FramingError, ProtocolError},
    message::Message,
};

/// Byte-level contract a [`Connector`](super::Connector) speaks: how a
/// connection is opened and how one message is framed.
#[async_trait]
pub trait Protocol: fmt::Debug + Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Runs the open handshake on a freshly accepted or established stream.
    async fn handshake(&self, stream: &mut TcpStream) -> Result<(), ProtocolError>;

    /// Appends the frame for `message` to `dst`.
    fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<(), FramingError>;

    /// Reads the next frame. `Ok(None)` means the peer closed cleanly on a
    /// frame boundary.
    async fn read_message(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<Option<Message>, FramingError>;
}
