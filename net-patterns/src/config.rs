use std::net::SocketAddr;

use tokio::net::lookup_host;

use crate::error::ConfigError;

/// Per-queue capacity used when a connector does not override it.
pub const DEFAULT_QUEUE_SIZE: usize = 64;

/// Settings applied to every queue a connector creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorConfig {
    pub queue_size: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

impl ConnectorConfig {
    pub fn with_queue_size(queue_size: usize) -> Self {
        Self { queue_size }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_size == 0 {
            return Err(ConfigError::InvalidQueueSize);
        }
        Ok(())
    }
}

/// Resolves `host:port` to a socket address.
///
/// A bare `:<port>` binds every interface, so `":5959"` becomes
/// `0.0.0.0:5959`.
pub async fn resolve_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    let trimmed = addr.trim();
    let target = if trimmed.starts_with(':') {
        format!("0.0.0.0{trimmed}")
    } else {
        trimmed.to_string()
    };

    let invalid = |reason: String| ConfigError::InvalidAddress {
        addr: addr.to_string(),
        reason,
    };

    if let Ok(parsed) = target.parse::<SocketAddr>() {
        return Ok(parsed);
    }
    if !target.contains(':') {
        return Err(invalid("missing port".to_string()));
    }

    let mut resolved = lookup_host(target.as_str())
        .await
        .map_err(|err| invalid(err.to_string()))?;
    resolved
        .next()
        .ok_or_else(|| invalid("host resolved to no addresses".to_string()))
}
