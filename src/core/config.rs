//! Application configuration from environment variables.
//!
//! Load configuration using `Config::from_env()` after calling `dotenvy::dotenv()`.

use std::str::FromStr;
use std::time::Duration;

use crate::core::data_types::DatabaseType;
use crate::core::events::EVENT_CAPACITY;

/// Default quiet window before regenerating schema text (1s)
pub const DEFAULT_QUIET_WINDOW_MS: u64 = 1000;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Dialect of newly created diagrams
    /// Example: SCHEMAX_DATABASE_TYPE=postgresql
    pub database_type: DatabaseType,

    /// Time without text edits before the model is written back to the editor
    pub quiet_window: Duration,

    /// Capacity of the diagram event channel
    pub event_capacity: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Call `dotenvy::dotenv()` before this to load from `.env` file.
    /// Values that fail to parse fall back to their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::defaults();
        Self {
            database_type: parse_or("SCHEMAX_DATABASE_TYPE", &lookup, defaults.database_type),
            quiet_window: Duration::from_millis(parse_or(
                "SCHEMAX_QUIET_WINDOW_MS",
                &lookup,
                DEFAULT_QUIET_WINDOW_MS,
            )),
            event_capacity: parse_or("SCHEMAX_EVENT_CAPACITY", &lookup, defaults.event_capacity)
                .max(1),
        }
    }

    /// Built-in defaults, ignoring the environment
    pub fn defaults() -> Self {
        Self {
            database_type: DatabaseType::Generic,
            quiet_window: Duration::from_millis(DEFAULT_QUIET_WINDOW_MS),
            event_capacity: EVENT_CAPACITY,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn parse_or<T>(key: &str, lookup: &impl Fn(&str) -> Option<String>, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
            tracing::warn!("Ignoring invalid {}={:?}: {}", key, raw, e);
            default
        }),
    }
}
