use config::{Config as ConfigSource, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

/// Messenger configuration.
///
/// Loaded from an optional TOML file plus `REDIS_MESSENGER_*` environment
/// overrides, or built in code from the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessengerConfig {
    pub redis: RedisSettings,
    pub reconnect: ReconnectSettings,
    pub health: HealthSettings,
    pub publish: PublishSettings,
    /// Identity of this messenger on the wire; envelopes addressed to other
    /// instances are ignored by the dispatcher.
    pub instance_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    /// Delay before the first reconnect attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound for the exponential backoff, in milliseconds.
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    /// Ping cadence, in milliseconds. Two consecutive missed pings force a
    /// reconnect.
    pub interval_ms: u64,
    /// How long a single ping may take before it counts as missed.
    pub ping_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSettings {
    /// Messages queued while the connection is down. 0 means fail fast with
    /// `NotConnected` instead of queueing.
    pub buffer_size: usize,
    /// Bound on the full publish round trip, in milliseconds.
    pub timeout_ms: u64,
}

impl MessengerConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("MESSENGER_CONFIG_PATH").unwrap_or_else(|_| "messenger.toml".to_string());

        info!("Loading messenger configuration from: {}", config_path);

        let config = ConfigSource::builder()
            .add_source(File::from(Path::new(&config_path)).required(false))
            .add_source(
                Environment::default()
                    .prefix("REDIS_MESSENGER")
                    .separator("_")
                    .ignore_empty(true),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.redis.host.is_empty() {
            return Err("Redis host cannot be empty".to_string());
        }

        if self.instance_id.is_empty() {
            return Err("Instance id cannot be empty".to_string());
        }

        if self.health.interval_ms == 0 {
            return Err("Health check interval must be greater than 0".to_string());
        }

        if self.reconnect.initial_delay_ms == 0 {
            return Err("Initial reconnect delay must be greater than 0".to_string());
        }

        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err("Max reconnect delay must not be below the initial delay".to_string());
        }

        Ok(())
    }
}

impl RedisSettings {
    /// Compose the connection URI, `redis://[password@]host:port/database`.
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => format!(
                "redis://{}:{}@{}:{}/{}",
                username, password, self.host, self.port, self.database
            ),
            (None, Some(password)) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.database
            ),
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            redis: RedisSettings::default(),
            reconnect: ReconnectSettings::default(),
            health: HealthSettings::default(),
            publish: PublishSettings::default(),
            instance_id: format!("messenger-{}", Uuid::new_v4()),
        }
    }
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            username: None,
            password: None,
            database: 0,
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 250,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            ping_timeout_ms: 2_000,
        }
    }
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            buffer_size: 0,
            timeout_ms: 5_000,
        }
    }
}
