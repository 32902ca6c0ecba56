use std::{net::SocketAddr, sync::Arc};

use parking_lot::{Mutex, RwLock};
use tokio::{io::BufReader, select, sync::watch, task::JoinSet};
use tracing::{debug, info, warn};

use super::{
    severity::{SeverityFilter, Taxonomy},
    wire::PubProtoV1,
};
use crate::{
    core::{Connector, Protocol, Queue},
    error::{Error, FramingError, Result},
    message::Message,
};

/// Called once per accepted message. An `Err` is treated like a
/// connection error for the connection the message arrived on.
pub type MessageHandler = Arc<dyn Fn(&Message) -> Result<()> + Send + Sync>;

/// Called for connection-level failures. Returning `None` marks the error
/// handled; returning an error leaves it unhandled, which is logged.
pub type ErrorHandler = Arc<dyn Fn(Error) -> Option<Error> + Send + Sync>;

/// Receives severity-filtered messages from every connection behind a
/// [`Connector`].
///
/// Each connection gets its own read loop. A failing connection is closed
/// and reported; the rest keep running.
pub struct Subscriber {
    connector: Connector,
    shared: Arc<Shared>,
}

struct Shared {
    filter: SeverityFilter,
    protocol: Arc<dyn Protocol>,
    on_message: RwLock<Option<MessageHandler>>,
    on_error: RwLock<Option<ErrorHandler>>,
    readers: Mutex<JoinSet<()>>,
    shutdown: watch::Sender<bool>,
}

impl Subscriber {
    /// Subscribes with the standard severity taxonomy.
    pub async fn new(connector: Connector, min_severity: &str) -> Result<Self> {
        Self::with_taxonomy(connector, Taxonomy::standard(), min_severity).await
    }

    /// Opens the wire protocol over `connector` and starts a read loop for
    /// every connection it produces. `min_severity` must belong to
    /// `taxonomy`.
    pub async fn with_taxonomy(
        connector: Connector,
        taxonomy: Arc<Taxonomy>,
        min_severity: &str,
    ) -> Result<Self> {
        let filter = SeverityFilter::new(taxonomy, min_severity)?;
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            filter,
            protocol: Arc::new(PubProtoV1),
            on_message: RwLock::new(None),
            on_error: RwLock::new(None),
            readers: Mutex::new(JoinSet::new()),
            shutdown,
        });

        let reading = Arc::clone(&shared);
        connector.on_connect(move |queue| reading.start_reader(queue));
        let reporting = Arc::clone(&shared);
        connector.on_error(move |err| {
            reporting.report(err);
        });

        if let Err(err) = connector.open(Arc::clone(&shared.protocol)).await {
            shared.shutdown.send_replace(true);
            connector.close_all().await;
            return Err(err);
        }
        info!(
            min_severity = shared.filter.minimum(),
            "subscriber started"
        );

        Ok(Self { connector, shared })
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.connector.local_addr()
    }

    pub fn min_severity(&self) -> &str {
        self.shared.filter.minimum()
    }

    /// Registers the message handler, replacing any previous one.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&Message) -> Result<()> + Send + Sync + 'static,
    {
        *self.shared.on_message.write() = Some(Arc::new(handler));
    }

    /// Registers the connection error handler, replacing any previous one.
    pub fn error<F>(&self, handler: F)
    where
        F: Fn(Error) -> Option<Error> + Send + Sync + 'static,
    {
        *self.shared.on_error.write() = Some(Arc::new(handler));
    }

    /// Stops every read loop and closes the connector, waiting for both.
    /// A second call returns [`Error::Closed`].
    pub async fn close(&self) -> Result<()> {
        if self.shared.shutdown.send_replace(true) {
            return Err(Error::Closed("subscriber"));
        }
        self.connector.close_all().await;

        let mut readers = std::mem::take(&mut *self.shared.readers.lock());
        while let Some(result) = readers.join_next().await {
            if let Err(err) = result {
                if err.is_panic() {
                    warn!(error = %err, "read loop panicked");
                }
            }
        }
        info!("subscriber closed");
        Ok(())
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

impl Shared {
    fn start_reader(self: &Arc<Self>, queue: Arc<Queue>) -> Result<()> {
        if *self.shutdown.borrow() {
            queue.close();
            return Err(Error::Closed("subscriber"));
        }
        let Some(reader) = queue.take_reader() else {
            return Err(Error::Handler(format!(
                "connection {} has no read side",
                queue.id()
            )));
        };

        let shared = Arc::clone(self);
        let mut readers = self.readers.lock();
        while readers.try_join_next().is_some() {}
        readers.spawn(async move {
            shared.read_loop(&queue, BufReader::new(reader)).await;
            queue.close();
        });
        Ok(())
    }

    async fn read_loop<R>(&self, queue: &Queue, mut reader: R)
    where
        R: tokio::io::AsyncRead + Send + Unpin,
    {
        let mut shutdown = self.shutdown.subscribe();
        let closing = async move {
            let _ = shutdown.wait_for(|closed| *closed).await;
        };
        tokio::pin!(closing);
        let (connection, peer) = (queue.id(), queue.peer());

        loop {
            let read = select! {
                biased;
                _ = &mut closing => break,
                read = self.protocol.read_message(&mut reader) => read,
            };

            match read {
                Ok(Some(message)) => {
                    if !self.filter.accepts(message.topic()) {
                        continue;
                    }
                    if let Err(err) = self.deliver(&message) {
                        if self.report(err).is_some() {
                            break;
                        }
                    }
                }
                Ok(None) => {
                    debug!(connection, %peer, "peer closed connection");
                    break;
                }
                Err(FramingError::Io(source)) => {
                    self.report(Error::Disconnected {
                        connection,
                        peer,
                        source,
                    });
                    break;
                }
                Err(err) => {
                    warn!(connection, %peer, error = %err, "dropping connection");
                    self.report(err.into());
                    break;
                }
            }
        }
    }

    fn deliver(&self, message: &Message) -> Result<()> {
        let handler = self.on_message.read().clone();
        match handler {
            Some(handler) => handler(message),
            None => {
                debug!(topic = message.topic(), "no handler registered, dropping message");
                Ok(())
            }
        }
    }

    /// Hands `err` to the error handler and returns it if left unhandled.
    fn report(&self, err: Error) -> Option<Error> {
        let handler = self.on_error.read().clone();
        let unhandled = match handler {
            Some(handler) => handler(err),
            None => Some(err),
        };
        if let Some(err) = &unhandled {
            warn!(error = %err, "unhandled connection error");
        }
        unhandled
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::{config::ConnectorConfig, error::ConfigError};

    async fn listening_connector() -> Connector {
        Connector::listen("127.0.0.1:0", ConnectorConfig::default())
            .await
            .expect("listen")
    }

    #[tokio::test]
    async fn unknown_minimum_severity_is_rejected() {
        let err = Subscriber::new(listening_connector().await, "loud")
            .await
            .err()
            .expect("unknown severity");
        assert!(matches!(
            err,
            Error::Config(ConfigError::UnknownSeverity(level)) if level == "loud"
        ));
    }

    #[tokio::test]
    async fn custom_taxonomy_drives_the_filter() {
        let taxonomy = Arc::new(Taxonomy::new(["low", "high"]).unwrap());
        let subscriber = Subscriber::with_taxonomy(listening_connector().await, taxonomy, "high")
            .await
            .unwrap();
        assert_eq!(subscriber.min_severity(), "high");
        assert!(subscriber.shared.filter.accepts("high"));
        assert!(!subscriber.shared.filter.accepts("low"));
        subscriber.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_twice_reports_closed() {
        let subscriber = Subscriber::new(listening_connector().await, "debug")
            .await
            .unwrap();
        assert!(subscriber.local_addr().is_some());
        subscriber.close().await.unwrap();

        let second = timeout(Duration::from_secs(1), subscriber.close())
            .await
            .expect("second close must not hang");
        assert!(matches!(second, Err(Error::Closed("subscriber"))));
        assert!(subscriber.connector().is_closed());
    }

    #[test]
    fn handled_errors_are_swallowed() {
        let (shutdown, _) = watch::channel(false);
        let shared = Shared {
            filter: SeverityFilter::new(Taxonomy::standard(), "debug").unwrap(),
            protocol: Arc::new(PubProtoV1),
            on_message: RwLock::new(None),
            on_error: RwLock::new(None),
            readers: Mutex::new(JoinSet::new()),
            shutdown,
        };

        assert!(shared.report(Error::Closed("peer")).is_some());

        *shared.on_error.write() = Some(Arc::new(|_: Error| None));
        assert!(shared.report(Error::Closed("peer")).is_none());

        *shared.on_error.write() = Some(Arc::new(|err: Error| {
            Some(Error::Handler(err.to_string()))
        }));
        assert!(matches!(
            shared.report(Error::Closed("peer")),
            Some(Error::Handler(_))
        ));
    }
}
