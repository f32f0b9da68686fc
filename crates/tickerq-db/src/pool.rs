//! Connection pool for the queue's PostgreSQL backend.
//!
//! Claims, progress writes and phase updates each hold a connection for a
//! single statement or one short transaction. A pool with no idle connection
//! stalls every worker at once, which is why [`PoolHealth`] exists.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use tickerq_core::{defaults, Error, Result};

/// Pool sizing and connection lifetimes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long a claim or enqueue waits for a free connection.
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    /// `None` keeps connections open indefinitely.
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: defaults::DB_MAX_CONNECTIONS,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(defaults::DB_CONNECT_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(defaults::DB_IDLE_TIMEOUT_SECS),
            max_lifetime: Some(Duration::from_secs(defaults::DB_MAX_LIFETIME_SECS)),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

impl PoolConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DB_MAX_CONNECTIONS` | `10` | Pool size, at least 1 |
    /// | `DB_CONNECT_TIMEOUT_SECS` | `30` | Wait for a free connection |
    /// | `DB_IDLE_TIMEOUT_SECS` | `600` | Close connections idle this long |
    /// | `DB_MAX_LIFETIME_SECS` | `1800` | Recycle connections; `0` disables |
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_u64("DB_MAX_CONNECTIONS") {
            config.max_connections = u32::try_from(n).unwrap_or(u32::MAX).max(1);
        }
        if let Some(secs) = env_u64("DB_CONNECT_TIMEOUT_SECS") {
            config.acquire_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("DB_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("DB_MAX_LIFETIME_SECS") {
            config.max_lifetime = (secs > 0).then(|| Duration::from_secs(secs));
        }
        config.min_connections = config.min_connections.min(config.max_connections);
        config
    }

    /// Set the pool size; `min_connections` is capped to match.
    pub fn with_max_connections(mut self, n: u32) -> Self {
        self.max_connections = n.max(1);
        self.min_connections = self.min_connections.min(self.max_connections);
        self
    }
}

/// Open a pool against `database_url`.
pub async fn open_pool(database_url: &str, config: &PoolConfig) -> Result<PgPool> {
    let start = Instant::now();

    info!(
        subsystem = "db",
        component = "pool",
        op = "open",
        max_connections = config.max_connections,
        acquire_timeout_secs = config.acquire_timeout.as_secs(),
        "Opening queue connection pool"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "open",
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Queue connection pool ready"
    );
    Ok(pool)
}

/// Point-in-time connection counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolHealth {
    /// Open connections, busy or idle.
    pub size: u32,
    pub idle: usize,
    pub max: u32,
}

impl PoolHealth {
    pub fn of(pool: &PgPool) -> Self {
        Self {
            size: pool.size(),
            idle: pool.num_idle(),
            max: pool.options().get_max_connections(),
        }
    }

    /// Every connection is open and busy; the next claim has to wait.
    pub fn is_exhausted(&self) -> bool {
        self.size >= self.max && self.idle == 0
    }

    /// Debug snapshot, escalated to a warning when exhausted.
    pub fn log(&self) {
        if self.is_exhausted() {
            warn!(
                subsystem = "db",
                component = "pool",
                pool_size = self.size,
                max_connections = self.max,
                "Connection pool exhausted, claims and phase updates are waiting"
            );
        } else {
            debug!(
                subsystem = "db",
                component = "pool",
                pool_size = self.size,
                pool_idle = self.idle,
                "Pool health"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_uses_shared_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, defaults::DB_MAX_CONNECTIONS);
        assert_eq!(
            config.max_lifetime,
            Some(Duration::from_secs(defaults::DB_MAX_LIFETIME_SECS))
        );
    }

    #[test]
    fn test_max_connections_caps_minimum() {
        let config = PoolConfig {
            min_connections: 4,
            ..PoolConfig::default()
        }
        .with_max_connections(2);
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.min_connections, 2);

        assert_eq!(PoolConfig::default().with_max_connections(0).max_connections, 1);
    }

    #[test]
    fn test_exhausted_only_when_full_and_busy() {
        let full_busy = PoolHealth {
            size: 10,
            idle: 0,
            max: 10,
        };
        assert!(full_busy.is_exhausted());

        // Busy but still able to open another connection.
        let growing = PoolHealth {
            size: 3,
            idle: 0,
            max: 10,
        };
        assert!(!growing.is_exhausted());

        let full_idle = PoolHealth {
            size: 10,
            idle: 2,
            max: 10,
        };
        assert!(!full_idle.is_exhausted());
    }
}
