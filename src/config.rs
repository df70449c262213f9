use anyhow::Context;
use std::fmt::Display;
use std::str::FromStr;

/// Service configuration, loaded from environment variables (with
/// `.env` support via dotenvy in `main`).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    /// Hard cap on snapshot depth requests.
    pub max_snapshot_depth: usize,
    /// Depth of the orderbook_update frames pushed to subscribers.
    pub broadcast_depth: usize,
    /// Per-subscriber outbound queue length; overflowing it evicts the
    /// subscriber.
    pub ws_queue_capacity: usize,
    pub ws_send_timeout_ms: u64,
    pub registry_ttl_secs: u64,
    /// Grants starter holdings on first portfolio lookup. Demo affordance;
    /// never consulted by the matching path.
    pub demo_holdings_enabled: bool,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .context("DATABASE_URL must be set")?,
            port: env_or("PORT", 8000)?,
            max_snapshot_depth: env_or("MAX_SNAPSHOT_DEPTH", 50)?,
            broadcast_depth: env_or("BROADCAST_DEPTH", 10)?,
            ws_queue_capacity: env_or("WS_QUEUE_CAPACITY", 256)?,
            ws_send_timeout_ms: env_or("WS_SEND_TIMEOUT_MS", 5000)?,
            registry_ttl_secs: env_or("REGISTRY_TTL_SECS", 5)?,
            demo_holdings_enabled: env_or("DEMO_HOLDINGS_ENABLED", false)?,
        })
    }
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}
