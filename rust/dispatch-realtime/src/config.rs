use crate::error::RealtimeError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Durations are written as integer milliseconds in config files.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Duplicate-event suppression settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    /// Window within which a repeated event token is dropped.
    #[serde(rename = "interval_ms", with = "millis")]
    pub interval: Duration,
    /// Upper bound on remembered tokens before the oldest half is evicted.
    pub max_events: usize,
    /// Period of the background purge of expired tokens.
    #[serde(rename = "cleanup_interval_ms", with = "millis")]
    pub cleanup_interval: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(300),
            max_events: 1000,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl DebounceConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

/// Per-subscription retry and reconnect staggering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    pub growth_factor: f64,
    /// Spacing between channels during a mass reconnect.
    #[serde(rename = "stagger_interval_ms", with = "millis")]
    pub stagger_interval: Duration,
    /// Cap for both retry backoff and stagger offsets.
    #[serde(rename = "stagger_max_delay_ms", with = "millis")]
    pub stagger_max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            growth_factor: 2.0,
            stagger_interval: Duration::from_millis(250),
            stagger_max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_growth_factor(mut self, factor: f64) -> Self {
        self.growth_factor = factor;
        self
    }

    pub fn with_stagger(mut self, interval: Duration, max_delay: Duration) -> Self {
        self.stagger_interval = interval;
        self.stagger_max_delay = max_delay;
        self
    }
}

/// Shared circuit breaker guarding connect and change-feed enablement attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    #[serde(rename = "reset_timeout_ms", with = "millis")]
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Configuration for the idle-channel health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(rename = "heartbeat_interval_ms", with = "millis")]
    pub heartbeat_interval: Duration,
    /// Silence longer than this starts the idle reconnect loop.
    #[serde(rename = "event_timeout_ms", with = "millis")]
    pub event_timeout: Duration,
    #[serde(rename = "idle_reconnect_interval_ms", with = "millis")]
    pub idle_reconnect_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            event_timeout: Duration::from_secs(120),
            idle_reconnect_interval: Duration::from_secs(300),
        }
    }
}

impl HealthConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout = timeout;
        self
    }

    pub fn with_idle_reconnect_interval(mut self, interval: Duration) -> Self {
        self.idle_reconnect_interval = interval;
        self
    }
}

/// Top-level configuration for [`RealtimeService`](crate::RealtimeService).
///
/// Every field has a default, so a config file only needs the values it
/// overrides:
///
/// ```toml
/// connection_timeout_ms = 10000
///
/// [retry]
/// max_retries = 8
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Database schema every table binding is scoped to.
    pub schema: String,
    /// Table holding interpreter profiles (and their availability status).
    pub profiles_table: String,
    /// A subscribe attempt that is not acknowledged within this window fails.
    #[serde(rename = "connection_timeout_ms", with = "millis")]
    pub connection_timeout: Duration,
    /// Settle time before a connection status change is broadcast.
    #[serde(rename = "status_debounce_ms", with = "millis")]
    pub status_debounce: Duration,
    /// Callback failures tolerated per subscription before it is flagged.
    pub callback_error_budget: u32,
    pub debounce: DebounceConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub health: HealthConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            profiles_table: "interpreter_profiles".to_string(),
            connection_timeout: Duration::from_secs(15),
            status_debounce: Duration::from_millis(500),
            callback_error_budget: 10,
            debounce: DebounceConfig::default(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl RealtimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to load config file: {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: RealtimeConfig = toml::from_str(contents).context("Invalid TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RealtimeError> {
        let invalid = |msg: &str| Err(RealtimeError::Config(msg.to_string()));

        if self.schema.is_empty() {
            return invalid("schema cannot be empty");
        }
        if self.profiles_table.is_empty() {
            return invalid("profiles_table cannot be empty");
        }
        if self.debounce.interval.is_zero() || self.debounce.cleanup_interval.is_zero() {
            return invalid("debounce intervals must be non-zero");
        }
        if self.debounce.max_events < 2 {
            return invalid("debounce.max_events must be at least 2");
        }
        if self.retry.base_delay.is_zero() {
            return invalid("retry.base_delay must be non-zero");
        }
        if !(self.retry.growth_factor >= 1.0) {
            return invalid("retry.growth_factor must be >= 1.0");
        }
        if self.breaker.failure_threshold == 0 {
            return invalid("breaker.failure_threshold must be at least 1");
        }
        if self.health.heartbeat_interval.is_zero() || self.health.idle_reconnect_interval.is_zero()
        {
            return invalid("health intervals must be non-zero");
        }
        if self.connection_timeout.is_zero() {
            return invalid("connection_timeout must be non-zero");
        }

        Ok(())
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_profiles_table(mut self, table: impl Into<String>) -> Self {
        self.profiles_table = table.into();
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_status_debounce(mut self, debounce: Duration) -> Self {
        self.status_debounce = debounce;
        self
    }

    pub fn with_callback_error_budget(mut self, budget: u32) -> Self {
        self.callback_error_budget = budget;
        self
    }

    pub fn with_debounce(mut self, config: DebounceConfig) -> Self {
        self.debounce = config;
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    pub fn with_breaker(mut self, config: BreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    pub fn with_health(mut self, config: HealthConfig) -> Self {
        self.health = config;
        self
    }
}
