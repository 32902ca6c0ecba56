use std::net::Ipv6Addr;

use clap::{Args, Parser, Subcommand};
use net_patterns::{config::DEFAULT_QUEUE_SIZE, pubsub::DEBUG};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Listen for log producers and print every message at or above a severity.
    Collect(CollectArgs),
    /// Read lines from stdin and send each one to a collector.
    Emit(EmitArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CollectArgs {
    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 5959)]
    pub port: u16,

    /// Interface to bind. Binds every interface when omitted.
    #[arg(long)]
    pub host: Option<String>,

    /// Minimum severity to print: debug, info, warn, error or fatal.
    #[arg(long, default_value = DEBUG)]
    pub severity: String,

    /// Outbound queue capacity per connection.
    #[arg(long, default_value_t = DEFAULT_QUEUE_SIZE)]
    pub queue_size: usize,
}

impl CollectArgs {
    /// Address string in the form the connector accepts; `:port` when no
    /// host is given. IPv6 literals are bracketed.
    pub fn listen_addr(&self) -> String {
        match self.host.as_deref() {
            None => format!(":{}", self.port),
            Some(host) if host.parse::<Ipv6Addr>().is_ok() => format!("[{host}]:{}", self.port),
            Some(host) => format!("{host}:{}", self.port),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct EmitArgs {
    /// Address of the collector to send to.
    #[arg(long, default_value = "127.0.0.1:5959")]
    pub server: String,

    /// Severity topic attached to every line.
    #[arg(long, default_value = "info")]
    pub severity: String,

    /// Outbound queue capacity for the collector connection.
    #[arg(long, default_value_t = DEFAULT_QUEUE_SIZE)]
    pub queue_size: usize,
}
