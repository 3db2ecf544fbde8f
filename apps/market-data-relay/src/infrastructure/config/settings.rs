//! Relay Configuration Settings
//!
//! Configuration types for the market data relay, loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::domain::session::ReconnectConfig;
use crate::domain::streaming::Credentials;
use crate::infrastructure::heartbeat;

/// Market data feed type for Alpaca streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataFeed {
    /// SIP (Securities Information Processor) - Full market data.
    #[default]
    Sip,
    /// IEX (Investors Exchange) - Free tier with limited data.
    Iex,
}

impl DataFeed {
    /// Parse feed type from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "iex" => Self::Iex,
            _ => Self::Sip,
        }
    }

    /// Get the feed name for WebSocket URLs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sip => "sip",
            Self::Iex => "iex",
        }
    }

    /// Stock stream URL for this feed.
    #[must_use]
    pub fn stream_url(&self) -> String {
        format!("wss://stream.data.alpaca.markets/v2/{}", self.as_str())
    }
}

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Subscriber WebSocket port.
    pub port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 8080,
            health_port: 8082,
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Market data feed type.
    pub feed: DataFeed,
    /// Upstream URL override.
    pub upstream_url: Option<String>,
    /// API credentials. `None` when either variable is missing or empty.
    pub credentials: Option<Credentials>,
    /// Server port settings.
    pub server: ServerSettings,
    /// Upstream reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// Liveness probe interval.
    pub heartbeat_interval: Duration,
    /// Subscriber `Origin` allow-list. Empty allows every origin.
    pub allowed_origins: Vec<String>,
    /// Per-subscriber outbound queue capacity.
    pub client_queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            feed: DataFeed::default(),
            upstream_url: None,
            credentials: None,
            server: ServerSettings::default(),
            reconnect: ReconnectConfig::default(),
            heartbeat_interval: Duration::from_secs(30),
            allowed_origins: Vec::new(),
            client_queue_capacity: 1024,
        }
    }
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or fails validation.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let credentials = match (
            non_empty(&lookup, "ALPACA_KEY"),
            non_empty(&lookup, "ALPACA_SECRET"),
        ) {
            (Some(key), Some(secret)) => Some(Credentials::new(key, secret)),
            _ => None,
        };

        let feed = lookup("ALPACA_FEED")
            .map(|s| DataFeed::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let server = ServerSettings {
            port: parse_or(&lookup, "STREAM_RELAY_PORT", defaults.server.port)?,
            health_port: parse_or(
                &lookup,
                "STREAM_RELAY_HEALTH_PORT",
                defaults.server.health_port,
            )?,
        };

        let reconnect = ReconnectConfig::new(
            parse_millis_or(
                &lookup,
                "STREAM_RELAY_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect.initial_delay,
            )?,
            parse_millis_or(
                &lookup,
                "STREAM_RELAY_RECONNECT_DELAY_MAX_MS",
                defaults.reconnect.max_delay,
            )?,
            parse_or(
                &lookup,
                "STREAM_RELAY_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect.multiplier,
            )?,
        );

        let heartbeat_interval = parse_or(
            &lookup,
            "STREAM_RELAY_HEARTBEAT_INTERVAL_SECS",
            defaults.heartbeat_interval.as_secs(),
        )
        .map(Duration::from_secs)?;

        let allowed_origins = lookup("STREAM_RELAY_ALLOWED_ORIGINS")
            .map(|raw| parse_origins(&raw))
            .unwrap_or_default();

        let config = Self {
            feed,
            upstream_url: non_empty(&lookup, "STREAM_RELAY_UPSTREAM_URL"),
            credentials,
            server,
            reconnect,
            heartbeat_interval,
            allowed_origins,
            client_queue_capacity: parse_or(
                &lookup,
                "STREAM_RELAY_CLIENT_QUEUE_CAPACITY",
                defaults.client_queue_capacity,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the first offending variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let reconnect = &self.reconnect;

        if !(reconnect.multiplier >= 1.0 && reconnect.multiplier.is_finite()) {
            return Err(ConfigError::invalid(
                "STREAM_RELAY_RECONNECT_DELAY_MULTIPLIER",
                "must be a finite number >= 1.0",
            ));
        }
        if reconnect.initial_delay.is_zero() {
            return Err(ConfigError::invalid(
                "STREAM_RELAY_RECONNECT_DELAY_INITIAL_MS",
                "must be greater than zero",
            ));
        }
        if reconnect.initial_delay > reconnect.max_delay {
            return Err(ConfigError::invalid(
                "STREAM_RELAY_RECONNECT_DELAY_MAX_MS",
                "must not be less than the initial delay",
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::invalid(
                "STREAM_RELAY_HEARTBEAT_INTERVAL_SECS",
                "must be greater than zero",
            ));
        }
        if self.heartbeat_interval > heartbeat::MAX_INTERVAL {
            return Err(ConfigError::invalid(
                "STREAM_RELAY_HEARTBEAT_INTERVAL_SECS",
                "must not exceed one day",
            ));
        }
        if self.client_queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "STREAM_RELAY_CLIENT_QUEUE_CAPACITY",
                "must be greater than zero",
            ));
        }

        Ok(())
    }

    /// Upstream stream URL: the override if set, otherwise the feed URL.
    #[must_use]
    pub fn upstream_url(&self) -> String {
        self.upstream_url
            .clone()
            .unwrap_or_else(|| self.feed.stream_url())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has an unusable value.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match non_empty(lookup, key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::invalid(key, format!("cannot parse {raw:?}"))),
    }
}

fn parse_millis_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup, key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::invalid(key, format!("cannot parse {raw:?}"))),
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(ToString::to_string)
        .collect()
}
