use std::{io, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    io::AsyncWriteExt,
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    sync::mpsc::{self, error::TrySendError},
};
use tracing::debug;

use crate::error::{Error, QueueFullError, Result};

pub type ConnectionId = u64;

const IN_FLIGHT_SLOT: usize = 1;

/// Bounded outbound buffer for one live connection.
///
/// The owning connector is the only writer; the connection's writer task is
/// the only reader. Frames are encoded once before they enter the queue, so
/// a frame is always written to the socket in a single `write_all`.
///
/// `capacity` counts frames waiting behind the one the writer is about to
/// take. That frame has its own slot, so whether two back-to-back sends fit
/// does not depend on how soon the writer task gets scheduled.
#[derive(Debug)]
pub struct Queue {
    id: ConnectionId,
    peer: SocketAddr,
    capacity: usize,
    sender: Mutex<Option<mpsc::Sender<Bytes>>>,
    reader: Mutex<Option<OwnedReadHalf>>,
}

impl Queue {
    pub(crate) fn new(
        id: ConnectionId,
        peer: SocketAddr,
        capacity: usize,
        reader: Option<OwnedReadHalf>,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(capacity + IN_FLIGHT_SLOT);
        let queue = Arc::new(Self {
            id,
            peer,
            capacity,
            sender: Mutex::new(Some(sender)),
            reader: Mutex::new(reader),
        });
        (queue, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().as_ref().map_or(true, |sender| sender.is_closed())
    }

    /// Enqueues an encoded frame without waiting.
    ///
    /// A saturated queue rejects the frame with [`QueueFullError`]; the
    /// caller decides whether that is worth reporting.
    pub fn send(&self, frame: Bytes) -> Result<()> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(Error::Closed("queue"));
        };

        match sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(QueueFullError {
                connection: self.id,
                peer: self.peer,
                capacity: self.capacity,
            }
            .into()),
            Err(TrySendError::Closed(_)) => Err(Error::Closed("queue")),
        }
    }

    /// Stops accepting frames. Frames already queued are still written.
    ///
    /// Returns false if the queue was already closed.
    pub fn close(&self) -> bool {
        self.sender.lock().take().is_some()
    }

    /// Hands out the read side of the connection, at most once.
    pub fn take_reader(&self) -> Option<OwnedReadHalf> {
        self.reader.lock().take()
    }
}

/// Drains queued frames onto the socket until the queue is closed, then
/// shuts down the write side. Only write failures are returned.
pub(crate) async fn write_frames(
    mut frames: mpsc::Receiver<Bytes>,
    writer: &mut OwnedWriteHalf,
) -> io::Result<()> {
    while let Some(frame) = frames.recv().await {
        writer.write_all(&frame).await?;
    }
    if let Err(err) = writer.shutdown().await {
        debug!(error = %err, "write shutdown failed");
    }
    Ok(())
}
