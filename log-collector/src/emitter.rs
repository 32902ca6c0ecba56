use anyhow::{Context, Result};
use net_patterns::{
    config::ConnectorConfig,
    core::Connector,
    pubsub::{Publisher, SeverityFilter, Taxonomy},
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::cli::EmitArgs;

/// Sends every stdin line to the collector at `args.server`, then flushes
/// and disconnects.
pub async fn run(args: EmitArgs) -> Result<()> {
    // reject typos before dialing; the collector would silently drop them
    SeverityFilter::new(Taxonomy::standard(), &args.severity)?;

    let connector = Connector::dial(
        [args.server.as_str()],
        ConnectorConfig::with_queue_size(args.queue_size),
    )
    .await?;
    let publisher = Publisher::new(connector)
        .await
        .with_context(|| format!("failed to connect to collector at {}", args.server))?;
    publisher.on_queue_error(|err| warn!(error = %err, "line dropped"));

    let sent = emit_lines(&publisher, &args.severity, BufReader::new(tokio::io::stdin())).await;
    publisher.close().await?;
    info!(sent = sent?, "emitter finished");
    Ok(())
}

/// Publishes each non-empty line from `reader` under `severity` and
/// returns how many were sent.
pub async fn emit_lines<R>(publisher: &Publisher, severity: &str, reader: R) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut sent = 0;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        publisher.publish(severity, line).await?;
        sent += 1;
    }
    debug!(sent, "reached end of input");
    Ok(sent)
}
