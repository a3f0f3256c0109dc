//! Service configuration from environment variables.
//!
//! Every knob has a default; a value that is present but malformed is a
//! startup error (the process exits nonzero rather than running with a
//! half-applied configuration).

use std::env;
use std::time::Duration;

/// Resolved service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WS listen address, e.g. `0.0.0.0:8080`.
    pub bind_addr: String,
    /// Store used for pub/sub fan-out between instances.
    pub channel_redis_url: String,
    /// Store used for session and message persistence.  Defaults to the
    /// channel store; the two may be the same server.
    pub message_redis_url: String,
    /// Default TTL applied to sessions and message lists.
    pub session_ttl: Duration,
    /// Period of the heartbeat publisher.
    pub heartbeat_interval: Duration,
    /// Hard deadline for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Upper bound on stored messages per session (list is trimmed on append).
    pub max_message_history: usize,
}

impl Default for Config {
    fn default() -> Self {
        let channel_url = "redis://localhost:6379/0".to_owned();
        Config {
            bind_addr: "0.0.0.0:8080".to_owned(),
            message_redis_url: channel_url.clone(),
            channel_redis_url: channel_url,
            session_ttl: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            max_message_history: 1000,
        }
    }
}

/// A present-but-malformed environment value.
#[derive(Debug)]
pub struct ConfigError {
    pub name: &'static str,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {}: {}", self.name, self.message)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary lookup function.  Tests pass a
    /// closure over a map instead of mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let channel_redis_url =
            lookup("CHANNEL_REDIS_URL").unwrap_or(defaults.channel_redis_url);
        let message_redis_url =
            lookup("MESSAGE_REDIS_URL").unwrap_or_else(|| channel_redis_url.clone());

        Ok(Config {
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            channel_redis_url,
            message_redis_url,
            session_ttl: Duration::from_secs(parse_positive(
                &lookup,
                "REDIS_SESSION_TTL",
                defaults.session_ttl.as_secs(),
            )?),
            heartbeat_interval: Duration::from_secs(parse_positive(
                &lookup,
                "HEARTBEAT_INTERVAL_SECONDS",
                defaults.heartbeat_interval.as_secs(),
            )?),
            shutdown_timeout: Duration::from_secs(parse_positive(
                &lookup,
                "SHUTDOWN_TIMEOUT_SECONDS",
                defaults.shutdown_timeout.as_secs(),
            )?),
            max_message_history: usize::try_from(parse_positive(
                &lookup,
                "MAX_MESSAGE_HISTORY",
                defaults.max_message_history as u64,
            )?)
            .unwrap_or(usize::MAX),
        })
    }
}

fn parse_positive(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(0) => Err(ConfigError {
                name,
                message: "must be a positive integer".to_owned(),
            }),
            Ok(value) => Ok(value),
            Err(e) => Err(ConfigError {
                name,
                message: format!("'{raw}' is not an integer: {e}"),
            }),
        },
    }
}
