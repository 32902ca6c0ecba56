//! Version 1 of the pub/sub wire protocol.
//!
//! # Handshake
//!
//! Both sides write a five byte greeting, `NPPS` followed by the protocol
//! version, then read the peer's. Unknown versions are rejected rather than
//! negotiated down.
//!
//! # Frames
//!
//! ```text
//! [u32 topic length][topic bytes][u32 body length][body bytes]
//! ```
//!
//! Lengths are big-endian. Each frame is encoded into one buffer before it
//! reaches a connection's queue, so frames never interleave on the wire.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

use crate::{
    core::Protocol,
    error::{FramingError, ProtocolError},
    message::Message,
};

pub const MAGIC: [u8; 4] = *b"NPPS";
pub const VERSION: u8 = 1;
pub const MAX_TOPIC_LEN: usize = 1024;
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

const GREETING_LEN: usize = MAGIC.len() + 1;
const LEN_PREFIX: usize = 4;
const INITIAL_READ_CAPACITY: usize = 8 * 1024;

/// The pub/sub protocol, version 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct PubProtoV1;

#[async_trait]
impl Protocol for PubProtoV1 {
    fn name(&self) -> &'static str {
        "pubsub/v1"
    }

    async fn handshake(&self, stream: &mut TcpStream) -> Result<(), ProtocolError> {
        exchange_greetings(stream).await
    }

    fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<(), FramingError> {
        encode_frame(message, dst)
    }

    async fn read_message(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<Option<Message>, FramingError> {
        read_frame(reader).await
    }
}

pub fn greeting() -> [u8; GREETING_LEN] {
    let mut greeting = [0u8; GREETING_LEN];
    greeting[..MAGIC.len()].copy_from_slice(&MAGIC);
    greeting[MAGIC.len()] = VERSION;
    greeting
}

/// Writes our greeting, then reads and validates the peer's.
pub async fn exchange_greetings<S>(stream: &mut S) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    stream
        .write_all(&greeting())
        .await
        .map_err(ProtocolError::Io)?;

    let mut peer = [0u8; GREETING_LEN];
    stream.read_exact(&mut peer).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::ClosedDuringHandshake
        } else {
            ProtocolError::Io(err)
        }
    })?;
    check_greeting(&peer)
}

fn check_greeting(peer: &[u8; GREETING_LEN]) -> Result<(), ProtocolError> {
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&peer[..MAGIC.len()]);
    if magic != MAGIC {
        return Err(ProtocolError::MalformedGreeting(magic));
    }
    let found = peer[MAGIC.len()];
    if found != VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: VERSION,
            found,
        });
    }
    Ok(())
}

/// Rejects messages that could never be decoded by a peer.
pub fn check_limits(message: &Message) -> Result<(), FramingError> {
    check_len("topic", message.topic().len(), MAX_TOPIC_LEN)?;
    check_len("body", message.body().len(), MAX_BODY_LEN)
}

fn check_len(field: &'static str, len: usize, max: usize) -> Result<(), FramingError> {
    if len > max {
        return Err(FramingError::TooLong { field, len, max });
    }
    Ok(())
}

pub fn encode_frame(message: &Message, dst: &mut BytesMut) -> Result<(), FramingError> {
    check_limits(message)?;
    let topic = message.topic().as_bytes();
    let body = message.body();

    dst.reserve(2 * LEN_PREFIX + topic.len() + body.len());
    dst.put_u32(topic.len() as u32);
    dst.put_slice(topic);
    dst.put_u32(body.len() as u32);
    dst.put_slice(body);
    Ok(())
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the stream ends exactly on a frame boundary. A
/// stream ending anywhere else is [`FramingError::Truncated`], and no
/// partial message is ever returned.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Message>, FramingError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let Some(topic_len) = read_len(reader, "topic length").await? else {
        return Ok(None);
    };
    check_len("topic", topic_len, MAX_TOPIC_LEN)?;
    let topic = read_exactly(reader, "topic", topic_len).await?;
    let topic = String::from_utf8(topic).map_err(|_| FramingError::InvalidTopic)?;

    let body_len = read_len(reader, "body length")
        .await?
        .ok_or(FramingError::Truncated {
            field: "body length",
            read: 0,
            expected: LEN_PREFIX,
        })?;
    check_len("body", body_len, MAX_BODY_LEN)?;
    let body = read_exactly(reader, "body", body_len).await?;

    Ok(Some(Message::new(topic, Bytes::from(body))))
}

/// Reads a length prefix, or `None` on EOF before its first byte.
async fn read_len<R>(reader: &mut R, field: &'static str) -> Result<Option<usize>, FramingError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LEN_PREFIX];
    let mut filled = 0;
    while filled < LEN_PREFIX {
        let n = reader
            .read(&mut prefix[filled..])
            .await
            .map_err(FramingError::Io)?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FramingError::Truncated {
                field,
                read: filled,
                expected: LEN_PREFIX,
            });
        }
        filled += n;
    }
    Ok(Some(u32::from_be_bytes(prefix) as usize))
}

/// Reads exactly `len` bytes. The buffer grows as bytes arrive, so a
/// declared length costs nothing until the peer actually sends it.
async fn read_exactly<R>(
    reader: &mut R,
    field: &'static str,
    len: usize,
) -> Result<Vec<u8>, FramingError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(len.min(INITIAL_READ_CAPACITY));
    (&mut *reader)
        .take(len as u64)
        .read_to_end(&mut buf)
        .await
        .map_err(FramingError::Io)?;
    if buf.len() < len {
        return Err(FramingError::Truncated {
            field,
            read: buf.len(),
            expected: len,
        });
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    async fn roundtrip(message: &Message) -> Message {
        let (mut writer, mut reader) = duplex(64 * 1024);
        let mut frame = BytesMut::new();
        encode_frame(message, &mut frame).expect("encode");
        writer.write_all(&frame).await.expect("write frame");
        drop(writer);

        let decoded = read_frame(&mut reader)
            .await
            .expect("read frame")
            .expect("a message");
        assert!(read_frame(&mut reader).await.expect("clean eof").is_none());
        decoded
    }

    #[tokio::test]
    async fn frame_roundtrip_preserves_topic_and_body() {
        let message = Message::new("error", "disk full");
        assert_eq!(roundtrip(&message).await, message);
    }

    #[tokio::test]
    async fn empty_body_roundtrips() {
        let message = Message::new("debug", Bytes::new());
        assert_eq!(roundtrip(&message).await, message);
    }

    #[test]
    fn frame_layout_is_length_prefixed() {
        let mut frame = BytesMut::new();
        encode_frame(&Message::new("warn", "hi"), &mut frame).unwrap();
        assert_eq!(&frame[..], b"\0\0\0\x04warn\0\0\0\x02hi");
    }

    #[tokio::test]
    async fn truncated_body_is_a_framing_error() {
        let (mut writer, mut reader) = duplex(1024);
        writer.write_all(b"\0\0\0\x04warn\0\0\0\x0ahalf").await.unwrap();
        drop(writer);

        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(
            err,
            FramingError::Truncated {
                field: "body",
                read: 4,
                expected: 10
            }
        ));
    }

    #[tokio::test]
    async fn maximum_declared_body_with_few_bytes_is_truncated() {
        let (mut writer, mut reader) = duplex(1024);
        writer.write_all(b"\0\0\0\x04warn").await.unwrap();
        writer
            .write_all(&(MAX_BODY_LEN as u32).to_be_bytes())
            .await
            .unwrap();
        writer.write_all(b"abc").await.unwrap();
        drop(writer);

        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(
            err,
            FramingError::Truncated {
                field: "body",
                read: 3,
                expected: MAX_BODY_LEN
            }
        ));
    }

    #[tokio::test]
    async fn truncated_prefix_is_a_framing_error() {
        let (mut writer, mut reader) = duplex(1024);
        writer.write_all(b"\0\0").await.unwrap();
        drop(writer);

        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FramingError::Truncated {
                field: "topic length",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn oversized_topic_is_rejected_before_reading() {
        let (mut writer, mut reader) = duplex(1024);
        writer.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FramingError::TooLong { field: "topic", .. })
        ));
    }

    #[test]
    fn oversized_topic_cannot_be_encoded() {
        let topic = "x".repeat(MAX_TOPIC_LEN + 1);
        let mut frame = BytesMut::new();
        assert!(matches!(
            encode_frame(&Message::new(topic, "body"), &mut frame),
            Err(FramingError::TooLong { field: "topic", .. })
        ));
        assert!(frame.is_empty());
    }

    #[tokio::test]
    async fn invalid_utf8_topic_is_rejected() {
        let (mut writer, mut reader) = duplex(1024);
        writer.write_all(b"\0\0\0\x02\xff\xfe\0\0\0\0").await.unwrap();

        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FramingError::InvalidTopic)
        ));
    }

    #[tokio::test]
    async fn matching_greetings_complete_the_handshake() {
        let (mut left, mut right) = duplex(64);
        let (a, b) = tokio::join!(exchange_greetings(&mut left), exchange_greetings(&mut right));
        a.expect("left handshake");
        b.expect("right handshake");
    }

    #[tokio::test]
    async fn unknown_version_is_rejected() {
        let (mut ours, mut theirs) = duplex(64);
        theirs.write_all(b"NPPS\x07").await.unwrap();

        assert!(matches!(
            exchange_greetings(&mut ours).await,
            Err(ProtocolError::VersionMismatch {
                expected: 1,
                found: 7
            })
        ));
    }

    #[tokio::test]
    async fn closing_mid_handshake_is_reported() {
        let (mut ours, mut theirs) = duplex(64);
        theirs.write_all(b"NP").await.unwrap();
        theirs.shutdown().await.unwrap();

        assert!(matches!(
            exchange_greetings(&mut ours).await,
            Err(ProtocolError::ClosedDuringHandshake)
        ));
    }
}
