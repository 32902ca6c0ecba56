use std::{future::Future, net::SocketAddr};

use anyhow::{Context, Result};
use net_patterns::{
    config::ConnectorConfig,
    core::Connector,
    message::Message,
    pubsub::Subscriber,
};
use tracing::{info, warn};

use crate::cli::CollectArgs;

/// A listening subscriber that reports every accepted message.
pub struct Collector {
    subscriber: Subscriber,
    local_addr: SocketAddr,
}

impl Collector {
    /// Starts a collector that logs each message as `topic: body`.
    pub async fn start(args: &CollectArgs) -> Result<Self> {
        Self::start_with_sink(args, |message| {
            info!("{}: {}", message.topic(), message.body_lossy());
        })
        .await
    }

    /// Starts a collector that hands accepted messages to `sink`.
    pub async fn start_with_sink<F>(args: &CollectArgs, sink: F) -> Result<Self>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let addr = args.listen_addr();
        let connector = Connector::listen(&addr, ConnectorConfig::with_queue_size(args.queue_size))
            .await
            .with_context(|| format!("failed to listen on {addr}"))?;
        let subscriber = Subscriber::new(connector, &args.severity)
            .await
            .context("failed to start subscriber")?;

        subscriber.error(|err| {
            warn!(error = %err, "connection error");
            None
        });
        subscriber.subscribe(move |message| {
            sink(message);
            Ok(())
        });

        let local_addr = subscriber
            .local_addr()
            .context("collector connector is not listening")?;
        Ok(Self {
            subscriber,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Collects until `shutdown` resolves, then closes every connection.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        shutdown.await;
        info!("collector shutting down");
        self.subscriber.close().await?;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}
