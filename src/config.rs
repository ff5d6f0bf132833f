//! Client and discovery configuration.
//!
//! Both structs implement [`Default`] with the values the protocol was
//! tuned for in production, and `serde::Deserialize` so they can be loaded
//! from a config file. There is no CLI surface.

use std::time::Duration;

use serde::Deserialize;

/// Default response-arena capacity (1 MiB).
pub const DEFAULT_ARENA_CAPACITY: usize = 1024 * 1024;

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);

/// Default reconnect attempts before a connection is evicted.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Default per-call timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default socket read buffer size (64 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default maximum accepted response body length.
pub const DEFAULT_MAX_BODY_SIZE: u32 = 8 * 1024 * 1024;

/// Tunables for the transport and invocation engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Capacity of the shared response-assembly arena, in bytes.
    pub arena_capacity: usize,
    /// Delay before each reconnect attempt after a connection error.
    #[serde(with = "duration_ms")]
    pub reconnect_delay: Duration,
    /// Reconnect attempts before the connection is abandoned and evicted.
    pub max_reconnect_attempts: u32,
    /// How long a call waits for its response before failing with `Timeout`.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Socket read buffer size.
    pub read_buffer_size: usize,
    /// Responses declaring a longer body are rejected as protocol errors.
    pub max_body_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            arena_capacity: DEFAULT_ARENA_CAPACITY,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

/// Settings for the coordination-service session.
///
/// The registry client itself is an external collaborator; these values are
/// carried here so one config file covers the whole client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Registry ensemble, e.g. `"127.0.0.1:2181"`.
    pub hosts: String,
    /// Session timeout.
    #[serde(with = "duration_ms")]
    pub session_timeout: Duration,
    /// Delay between registry reconnect attempts.
    #[serde(with = "duration_ms")]
    pub spin_delay: Duration,
    /// Registry reconnect attempts.
    pub retries: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            hosts: "127.0.0.1:2181".to_string(),
            session_timeout: Duration::from_millis(30_000),
            spin_delay: Duration::from_millis(1000),
            retries: 5,
        }
    }
}

/// Durations are written as integer milliseconds in config files.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
