//! Connection lifecycle and the per-connection queue set.
//!
//! A [`Connector`] either listens for inbound connections or dials a fixed
//! set of peers. Both directions share the same contract: `open` runs the
//! protocol handshake on every connection before its [`Queue`] is created,
//! `send_to_all` fans a message out to every live queue, and `close_all`
//! tears everything down. Which side listens is independent of whether the
//! owner publishes or subscribes.
//!
//! Background work is one accept loop (listening only), one short-lived
//! handshake task per pending connection, and one writer task per queue.
//! The queue set is the only state shared behind a lock.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
};

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::watch,
    task::JoinSet,
};
use tracing::{debug, info, warn};

use super::{
    protocol::Protocol,
    queue::{write_frames, ConnectionId, Queue},
};
use crate::{
    config::{resolve_addr, ConnectorConfig},
    error::{ConfigError, Error, Result},
    message::Message,
};

/// Invoked synchronously for every new queue.
pub type ConnectHook = Arc<dyn Fn(Arc<Queue>) -> Result<()> + Send + Sync>;

/// Receives connection-scoped errors raised by the connector itself.
pub type ErrorHook = Arc<dyn Fn(Error) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Listening,
    Dialing,
}

enum Endpoint {
    Listen {
        listener: Mutex<Option<TcpListener>>,
        local_addr: SocketAddr,
    },
    Dial {
        peers: Vec<SocketAddr>,
    },
}

pub struct Connector {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: Endpoint,
    config: ConnectorConfig,
    protocol: OnceLock<Arc<dyn Protocol>>,
    queues: RwLock<QueueSet>,
    on_connect: RwLock<Option<ConnectHook>>,
    on_error: RwLock<Option<ErrorHook>>,
    next_id: AtomicU64,
    tasks: Mutex<JoinSet<()>>,
    shutdown: watch::Sender<bool>,
}

#[derive(Default)]
struct QueueSet {
    queues: HashMap<ConnectionId, Arc<Queue>>,
    closed: bool,
}

impl Connector {
    /// Binds a listening connector. Connections are accepted once
    /// [`open`](Self::open) is called.
    pub async fn listen(addr: &str, config: ConnectorConfig) -> Result<Self> {
        config.validate()?;
        let addr = resolve_addr(addr).await?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, "connector bound");

        Ok(Self::with_endpoint(
            Endpoint::Listen {
                listener: Mutex::new(Some(listener)),
                local_addr,
            },
            config,
        ))
    }

    /// Builds a dialing connector. Peers are connected to during
    /// [`open`](Self::open).
    pub async fn dial<I, S>(peers: I, config: ConnectorConfig) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        config.validate()?;
        let mut resolved = Vec::new();
        for peer in peers {
            resolved.push(resolve_addr(peer.as_ref()).await?);
        }
        if resolved.is_empty() {
            return Err(ConfigError::InvalidAddress {
                addr: String::new(),
                reason: "no peers to dial".to_string(),
            }
            .into());
        }

        Ok(Self::with_endpoint(Endpoint::Dial { peers: resolved }, config))
    }

    fn with_endpoint(endpoint: Endpoint, config: ConnectorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                endpoint,
                config,
                protocol: OnceLock::new(),
                queues: RwLock::new(QueueSet::default()),
                on_connect: RwLock::new(None),
                on_error: RwLock::new(None),
                next_id: AtomicU64::new(1),
                tasks: Mutex::new(JoinSet::new()),
                shutdown,
            }),
        }
    }

    pub fn direction(&self) -> Direction {
        match self.inner.endpoint {
            Endpoint::Listen { .. } => Direction::Listening,
            Endpoint::Dial { .. } => Direction::Dialing,
        }
    }

    /// Bound address of a listening connector.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.inner.endpoint {
            Endpoint::Listen { local_addr, .. } => Some(local_addr),
            Endpoint::Dial { .. } => None,
        }
    }

    /// Capacity of every queue this connector creates.
    pub fn queue_size(&self) -> usize {
        self.inner.config.queue_size
    }

    pub fn connection_count(&self) -> usize {
        self.inner.queues.read().queues.len()
    }

    /// Snapshot of the live queues.
    pub fn queues(&self) -> Vec<Arc<Queue>> {
        self.inner.queues.read().queues.values().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Registers the new-queue callback, replacing any previous one.
    ///
    /// A failing callback is reported through the error hook; the queue
    /// stays in the set regardless.
    pub fn on_connect<F>(&self, callback: F)
    where
        F: Fn(Arc<Queue>) -> Result<()> + Send + Sync + 'static,
    {
        *self.inner.on_connect.write() = Some(Arc::new(callback));
    }

    /// Registers the connection error callback, replacing any previous one.
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(Error) + Send + Sync + 'static,
    {
        *self.inner.on_error.write() = Some(Arc::new(callback));
    }

    /// Starts speaking `protocol` on every managed connection.
    ///
    /// A listening connector starts accepting; each accepted connection is
    /// handshaken in its own task and failures go to the error hook. A
    /// dialing connector connects to every peer now and returns the first
    /// failure, after reporting any further ones.
    pub async fn open(&self, protocol: Arc<dyn Protocol>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed("connector"));
        }
        let name = protocol.name();
        self.inner
            .protocol
            .set(protocol)
            .map_err(|_| Error::AlreadyOpen)?;

        match &self.inner.endpoint {
            Endpoint::Listen {
                listener,
                local_addr,
            } => {
                let listener = listener.lock().take().ok_or(Error::Closed("connector"))?;
                info!(%local_addr, protocol = name, "accepting connections");
                let inner = Arc::clone(&self.inner);
                self.inner.spawn(accept_loop(inner, listener));
                Ok(())
            }
            Endpoint::Dial { peers } => {
                let mut first_failure = None;
                for &peer in peers {
                    match self.inner.establish(peer).await {
                        Ok(()) => info!(%peer, protocol = name, "connection established"),
                        Err(err) => {
                            warn!(%peer, error = %err, "failed to establish connection");
                            if first_failure.is_none() {
                                first_failure = Some(err);
                            } else {
                                self.inner.report(err);
                            }
                        }
                    }
                }
                first_failure.map_or(Ok(()), Err)
            }
        }
    }

    /// Enqueues `message` on every live queue.
    ///
    /// The frame is encoded once. A saturated queue drops the message for
    /// its connection only; each drop comes back as a per-connection
    /// [`QueueFullError`](crate::error::QueueFullError). Queues closing
    /// concurrently are skipped.
    pub fn send_to_all(&self, message: &Message) -> Vec<Error> {
        let queues = self.queues();
        if queues.is_empty() {
            return Vec::new();
        }
        let Some(protocol) = self.inner.protocol.get() else {
            return vec![Error::Closed("connector")];
        };

        let mut frame = BytesMut::new();
        if let Err(err) = protocol.encode(message, &mut frame) {
            return vec![err.into()];
        }
        let frame = frame.freeze();

        let mut failures = Vec::new();
        for queue in queues {
            match queue.send(frame.clone()) {
                Ok(()) => {}
                Err(Error::Closed(_)) => {
                    debug!(connection = queue.id(), "skipping closed queue");
                }
                Err(err) => {
                    warn!(
                        connection = queue.id(),
                        peer = %queue.peer(),
                        topic = message.topic(),
                        "message dropped for connection"
                    );
                    failures.push(err);
                }
            }
        }
        failures
    }

    /// Closes every queue and the endpoint, then waits for the background
    /// tasks to finish flushing. Later calls return immediately.
    pub async fn close_all(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        self.inner.close_queues();
        if let Endpoint::Listen { listener, .. } = &self.inner.endpoint {
            listener.lock().take();
        }

        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                if err.is_panic() {
                    warn!(error = %err, "connector task panicked");
                }
            }
        }
        debug!("connector closed");
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        if !self.inner.shutdown.send_replace(true) {
            self.inner.close_queues();
        }
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("direction", &self.direction())
            .field("local_addr", &self.local_addr())
            .field("queue_size", &self.queue_size())
            .field("connections", &self.connection_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Inner {
    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Resolves once the connector starts closing.
    fn closing(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut shutdown = self.shutdown.subscribe();
        async move {
            let _ = shutdown.wait_for(|closed| *closed).await;
        }
    }

    fn report(&self, err: Error) {
        let hook = self.on_error.read().clone();
        match hook {
            Some(hook) => hook(err),
            None => warn!(error = %err, "connection error"),
        }
    }

    async fn establish(self: &Arc<Self>, peer: SocketAddr) -> Result<()> {
        let stream = TcpStream::connect(peer).await?;
        self.register(stream, peer).await
    }

    async fn admit(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        select! {
            _ = self.closing() => debug!(%peer, "connector closed before handshake finished"),
            result = self.register(stream, peer) => {
                if let Err(err) = result {
                    if !matches!(err, Error::Closed(_)) {
                        warn!(%peer, error = %err, "failed to admit connection");
                        self.report(err);
                    }
                }
            }
        }
    }

    /// Handshakes `stream`, adds its queue to the set and starts its writer.
    async fn register(self: &Arc<Self>, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let protocol = self
            .protocol
            .get()
            .cloned()
            .ok_or(Error::Closed("connector"))?;
        protocol.handshake(&mut stream).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reader, mut writer) = stream.into_split();
        let (queue, frames) = Queue::new(id, peer, self.config.queue_size, Some(reader));
        {
            let mut set = self.queues.write();
            if set.closed {
                return Err(Error::Closed("connector"));
            }
            set.queues.insert(id, Arc::clone(&queue));
        }
        debug!(connection = id, %peer, protocol = protocol.name(), "queue created");

        let inner = Arc::clone(self);
        let written = Arc::clone(&queue);
        self.spawn(async move {
            let result = write_frames(frames, &mut writer).await;
            inner.remove(written.id());
            if let Err(source) = result {
                inner.report(Error::Disconnected {
                    connection: written.id(),
                    peer: written.peer(),
                    source,
                });
            }
        });

        self.notify_connect(queue);
        Ok(())
    }

    fn notify_connect(&self, queue: Arc<Queue>) {
        let hook = self.on_connect.read().clone();
        let Some(hook) = hook else {
            return;
        };
        let (id, peer) = (queue.id(), queue.peer());
        if let Err(err) = hook(queue) {
            warn!(connection = id, %peer, error = %err, "connect callback failed");
            self.report(err);
        }
    }

    fn remove(&self, id: ConnectionId) {
        let removed = self.queues.write().queues.remove(&id);
        if let Some(queue) = removed {
            queue.close();
            debug!(connection = id, "queue removed");
        }
    }

    fn close_queues(&self) {
        let queues: Vec<Arc<Queue>> = {
            let mut set = self.queues.write();
            set.closed = true;
            set.queues.drain().map(|(_, queue)| queue).collect()
        };
        for queue in queues {
            queue.close();
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    let closing = inner.closing();
    tokio::pin!(closing);

    loop {
        select! {
            _ = &mut closing => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    let admitting = Arc::clone(&inner);
                    inner.spawn(admitting.admit(stream, peer));
                }
                Err(err) => warn!(error = %err, "failed to accept connection"),
            },
        }
    }

    debug!("accept loop stopped");
}
