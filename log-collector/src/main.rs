use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use log_collector::{
    cli::{Cli, Command},
    collector::Collector,
    emitter,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Collect(args) => {
            let collector = Collector::start(&args).await?;
            info!("collector listening on {}", collector.local_addr());
            if let Err(err) = collector.run_until_ctrl_c().await {
                warn!("collector exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Emit(args) => emitter::run(args).await?,
    }

    Ok(())
}
