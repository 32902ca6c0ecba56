use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::{
    select,
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::wire::{self, PubProtoV1};
use crate::{
    core::Connector,
    error::{Error, Result},
    message::Message,
};

/// Receives per-connection delivery failures, such as a full queue.
pub type QueueErrorHook = Arc<dyn Fn(&Error) + Send + Sync>;

/// Broadcasts topic-tagged messages to every connection behind a
/// [`Connector`].
///
/// All messages pass through one dispatch task, so every subscriber sees
/// them in the order `publish` accepted them. `close` flushes every
/// accepted message to the connector before tearing it down.
pub struct Publisher {
    connector: Arc<Connector>,
    work: mpsc::Sender<Message>,
    errors: Mutex<mpsc::Receiver<Error>>,
    queue_errors: Arc<RwLock<Option<QueueErrorHook>>>,
    running: Mutex<Option<Running>>,
}

struct Running {
    quit: oneshot::Sender<()>,
    finished: JoinHandle<()>,
}

impl Publisher {
    /// Opens the wire protocol over `connector` and starts dispatching.
    ///
    /// A handshake failure here is fatal: the connector is closed and the
    /// error returned.
    pub async fn new(connector: Connector) -> Result<Self> {
        let connector = Arc::new(connector);
        let queue_size = connector.queue_size();

        let (errors_tx, errors_rx) = mpsc::channel(queue_size);
        connector.on_error(move |err| record_error(&errors_tx, err));
        connector.on_connect(|queue| {
            debug!(connection = queue.id(), peer = %queue.peer(), "subscriber connected");
            Ok(())
        });

        if let Err(err) = connector.open(Arc::new(PubProtoV1)).await {
            connector.close_all().await;
            return Err(err);
        }

        let (work_tx, work_rx) = mpsc::channel(queue_size);
        let (quit_tx, quit_rx) = oneshot::channel();
        let queue_errors = Arc::new(RwLock::new(None));
        let finished = tokio::spawn(dispatch(
            Arc::clone(&connector),
            work_rx,
            quit_rx,
            Arc::clone(&queue_errors),
        ));

        Ok(Self {
            connector,
            work: work_tx,
            errors: Mutex::new(errors_rx),
            queue_errors,
            running: Mutex::new(Some(Running {
                quit: quit_tx,
                finished,
            })),
        })
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// Registers a callback for messages dropped on individual connections,
    /// replacing any previous one.
    pub fn on_queue_error<F>(&self, callback: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        *self.queue_errors.write() = Some(Arc::new(callback));
    }

    /// Hands a message to the dispatch task.
    ///
    /// A connection error recorded since the last call is returned instead,
    /// once, and the message is not sent. Waits while the dispatch backlog
    /// is full.
    pub async fn publish(&self, topic: impl Into<String>, body: impl Into<Bytes>) -> Result<()> {
        let pending = self.errors.lock().try_recv();
        if let Ok(err) = pending {
            return Err(err);
        }

        let message = Message::new(topic, body);
        wire::check_limits(&message)?;
        self.work
            .send(message)
            .await
            .map_err(|_| Error::Closed("publisher"))
    }

    /// Flushes accepted messages, stops dispatching and closes the
    /// connector. A second call returns [`Error::Closed`] without waiting.
    pub async fn close(&self) -> Result<()> {
        let running = self.running.lock().take();
        let Some(Running { quit, finished }) = running else {
            return Err(Error::Closed("publisher"));
        };

        let _ = quit.send(());
        if let Err(err) = finished.await {
            warn!(error = %err, "publisher dispatch task failed");
        }
        Ok(())
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.quit.send(());
        }
    }
}

fn record_error(errors: &mpsc::Sender<Error>, err: Error) {
    match errors.try_send(err) {
        Ok(()) => {}
        Err(TrySendError::Full(err)) => {
            warn!(error = %err, "publisher error backlog full, dropping error");
        }
        Err(TrySendError::Closed(err)) => debug!(error = %err, "publisher gone"),
    }
}

/// The dispatch loop.
///
/// Pending work always wins over the quit signal, and once quit is seen the
/// work channel is closed and drained. A `publish` that returned `Ok` has
/// therefore always reached `send_to_all` before the connector is closed.
async fn dispatch(
    connector: Arc<Connector>,
    mut work: mpsc::Receiver<Message>,
    mut quit: oneshot::Receiver<()>,
    queue_errors: Arc<RwLock<Option<QueueErrorHook>>>,
) {
    loop {
        select! {
            biased;
            Some(message) = work.recv() => broadcast(&connector, &message, &queue_errors),
            _ = &mut quit => break,
            else => break,
        }
    }

    work.close();
    let mut drained = 0usize;
    while let Some(message) = work.recv().await {
        broadcast(&connector, &message, &queue_errors);
        drained += 1;
    }
    debug!(drained, "dispatch queue drained");

    connector.close_all().await;
    info!("publisher finished");
}

fn broadcast(
    connector: &Connector,
    message: &Message,
    queue_errors: &RwLock<Option<QueueErrorHook>>,
) {
    let failures = connector.send_to_all(message);
    if failures.is_empty() {
        return;
    }

    let hook = queue_errors.read().clone();
    for failure in &failures {
        if let Some(hook) = &hook {
            hook(failure);
        }
    }
}
