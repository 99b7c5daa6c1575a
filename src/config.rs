//! Runtime configuration, read once from the environment at startup.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WebSocket listen port.
    pub port: u16,
    /// Shared store URL. `None` selects single-instance in-memory mode:
    /// no cross-process relay, everything stays in this process.
    pub redis_url: Option<String>,
    /// TTL applied to session records in the shared store.
    pub session_ttl: Duration,
    /// Interval of the background sweep that repairs sessions without a TTL.
    pub sweep_interval: Duration,
    /// Upper bound on any single shared-store round-trip.
    pub store_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidEnv(&'static str, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Config {
            port: parse_var("PORT")?.unwrap_or(5000),
            redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            session_ttl: Duration::from_secs(parse_var("SESSION_TTL_SECS")?.unwrap_or(3600)),
            sweep_interval: Duration::from_secs(parse_var("SWEEP_INTERVAL_SECS")?.unwrap_or(600)),
            store_timeout: Duration::from_millis(parse_var("STORE_TIMEOUT_MS")?.unwrap_or(5000)),
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv(name, raw)),
        Err(_) => Ok(None),
    }
}
