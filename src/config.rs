//! Environment-driven configuration.
//!
//! Every knob has a compiled-in default; unset or unparseable variables fall
//! back to it silently.

use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_CLIENT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_TOMBSTONE_RETENTION_MS: u64 = 30_000;

pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Server process settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Postgres URL. `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub port: u16,
    /// Outbound queue depth per subscribed connection.
    pub client_channel_capacity: usize,
    /// How long removed ids refuse upserts.
    pub tombstone_retention: Duration,
}

impl ServerConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            port: env_parse("PORT", DEFAULT_PORT),
            client_channel_capacity: env_parse("CLIENT_CHANNEL_CAPACITY", DEFAULT_CLIENT_CHANNEL_CAPACITY),
            tombstone_retention: Duration::from_millis(env_parse(
                "TOMBSTONE_RETENTION_MS",
                DEFAULT_TOMBSTONE_RETENTION_MS,
            )),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            port: DEFAULT_PORT,
            client_channel_capacity: DEFAULT_CLIENT_CHANNEL_CAPACITY,
            tombstone_retention: Duration::from_millis(DEFAULT_TOMBSTONE_RETENTION_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_missing_returns_default() {
        let val: usize = env_parse("__BOARDSYNC_TEST_MISSING__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn env_parse_present_valid() {
        unsafe { std::env::set_var("__BOARDSYNC_TEST_VALID__", "99") };
        let val: usize = env_parse("__BOARDSYNC_TEST_VALID__", 0);
        assert_eq!(val, 99);
        unsafe { std::env::remove_var("__BOARDSYNC_TEST_VALID__") };
    }

    #[test]
    fn env_parse_present_invalid_returns_default() {
        unsafe { std::env::set_var("__BOARDSYNC_TEST_INVALID__", "soon") };
        let val: u64 = env_parse("__BOARDSYNC_TEST_INVALID__", 7);
        assert_eq!(val, 7);
        unsafe { std::env::remove_var("__BOARDSYNC_TEST_INVALID__") };
    }

    #[test]
    fn server_config_default_matches_constants() {
        let config = ServerConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.client_channel_capacity, DEFAULT_CLIENT_CHANNEL_CAPACITY);
        assert_eq!(config.tombstone_retention, Duration::from_millis(DEFAULT_TOMBSTONE_RETENTION_MS));
        assert!(config.database_url.is_none());
    }
}
