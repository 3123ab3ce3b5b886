//! Gateway configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::presence::PresenceConfig;
use crate::retry::Backoff;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Connection lease lifetime without a heartbeat
    pub online_ttl: Duration,
    /// How long an offline presence record is kept
    pub offline_retention: Duration,
    /// Close connections with no inbound frame for this long
    pub idle_timeout: Duration,
    /// Interval of the maintenance sweep (heartbeats, idle detection, purge)
    pub sweep_interval: Duration,
    /// Upper bound on one fan-out publish
    pub publish_timeout: Duration,
    /// Frames buffered per connection before events are dropped
    pub outbound_buffer: usize,
    /// Messages a local bus subscriber may lag behind
    pub bus_capacity: usize,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub session_ttl: Duration,
    /// Retry policy for presence cleanup on disconnect
    pub cleanup_backoff: Backoff,
    /// Redis URL for presence and fan-out (None = in-process backends)
    pub redis_url: Option<String>,
    /// Key prefix for Redis keys and channels
    pub redis_prefix: String,
    /// RocksDB directory (None = in-memory message store)
    pub data_dir: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            online_ttl: Duration::from_secs(300),
            offline_retention: Duration::from_secs(24 * 60 * 60),
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(2),
            outbound_buffer: 256,
            bus_capacity: 1024,
            cache_capacity: 10_000,
            cache_ttl: Duration::from_secs(60),
            session_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            cleanup_backoff: Backoff::default(),
            redis_url: None,
            redis_prefix: "parley".to_string(),
            data_dir: None,
        }
    }
}

impl GatewayConfig {
    /// Ephemeral port and short timers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            online_ttl: Duration::from_secs(30),
            offline_retention: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            publish_timeout: Duration::from_millis(500),
            outbound_buffer: 64,
            bus_capacity: 256,
            cache_capacity: 1_000,
            cache_ttl: Duration::from_secs(5),
            session_ttl: Duration::from_secs(60 * 60),
            cleanup_backoff: Backoff {
                attempts: 3,
                initial: Duration::from_millis(10),
                max: Duration::from_millis(50),
            },
            ..Self::default()
        }
    }

    /// Defaults overlaid with `PARLEY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let env = Env { lookup: &lookup };

        if let Some(addr) = lookup("PARLEY_BIND_ADDR") {
            config.bind_addr = addr;
        }
        env.secs("PARLEY_ONLINE_TTL_SECS", &mut config.online_ttl)?;
        env.secs("PARLEY_OFFLINE_RETENTION_SECS", &mut config.offline_retention)?;
        env.secs("PARLEY_IDLE_TIMEOUT_SECS", &mut config.idle_timeout)?;
        env.secs("PARLEY_SWEEP_INTERVAL_SECS", &mut config.sweep_interval)?;
        if let Some(ms) = env.parse::<u64>("PARLEY_PUBLISH_TIMEOUT_MS")? {
            config.publish_timeout = Duration::from_millis(ms);
        }
        env.positive("PARLEY_OUTBOUND_BUFFER", &mut config.outbound_buffer)?;
        env.positive("PARLEY_BUS_CAPACITY", &mut config.bus_capacity)?;
        env.positive("PARLEY_CACHE_CAPACITY", &mut config.cache_capacity)?;
        env.secs("PARLEY_CACHE_TTL_SECS", &mut config.cache_ttl)?;
        env.secs("PARLEY_SESSION_TTL_SECS", &mut config.session_ttl)?;

        config.redis_url = lookup("PARLEY_REDIS_URL").filter(|s| !s.is_empty());
        if let Some(prefix) = lookup("PARLEY_REDIS_PREFIX").filter(|s| !s.is_empty()) {
            config.redis_prefix = prefix;
        }
        config.data_dir = lookup("PARLEY_DATA_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        Ok(config)
    }

    pub fn presence(&self) -> PresenceConfig {
        PresenceConfig {
            online_ttl: self.online_ttl,
            offline_retention: self.offline_retention,
        }
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn parse<T>(&self, name: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(name) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    name,
                    value,
                    reason: e.to_string(),
                }),
        }
    }

    fn secs(&self, name: &'static str, target: &mut Duration) -> Result<(), ConfigError> {
        if let Some(secs) = self.parse::<u64>(name)? {
            *target = Duration::from_secs(secs);
        }
        Ok(())
    }

    fn positive(&self, name: &'static str, target: &mut usize) -> Result<(), ConfigError> {
        match self.parse::<usize>(name)? {
            Some(0) => Err(ConfigError::InvalidValue {
                name,
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            }),
            Some(n) => {
                *target = n;
                Ok(())
            }
            None => Ok(()),
        }
    }
}
