//! # Consumer Configuration
//!
//! Tunables for the queue workers. Every value can be set explicitly on the
//! builder, through a `PGQUEUE_*` environment variable, or left at its
//! default, in that order of precedence.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `PGQUEUE_QUEUE_NAMES` | (required, comma separated) |
//! | `PGQUEUE_MAX_TRIES` | `3` |
//! | `PGQUEUE_EMPTY_QUEUE_SLEEP_MS` | `10000` |
//! | `PGQUEUE_MAX_QUERY_TIME_MS` | `50` |
//! | `PGQUEUE_RESCAN_EVERY` | `100` |
//! | `PGQUEUE_IDLE_RESCAN_EVERY` | `10` |
//! | `PGQUEUE_DATABASE_CONNECT_THROTTLE` | `""` |
//! | `PGQUEUE_FAILURE_THROTTLE` | `""` |
//! | `PGQUEUE_DEDUPLICATE_DISABLE` | `""` |
//! | `PGQUEUE_INCLUDE_POSTPONED_DUPLICATES` | `false` |

use crate::error::{ConsumerError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const ENV_PREFIX: &str = "PGQUEUE";

pub const DEFAULT_MAX_TRIES: u32 = 3;
pub const DEFAULT_EMPTY_QUEUE_SLEEP_MS: u64 = 10_000;
pub const DEFAULT_MAX_QUERY_TIME_MS: u64 = 50;
pub const DEFAULT_RESCAN_EVERY: u32 = 100;
pub const DEFAULT_IDLE_RESCAN_EVERY: u32 = 10;

/// Partially specified configuration
///
/// One layer of the merge: the builder's explicit values, or what was found
/// in the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConfigOverrides {
    #[serde(default, deserialize_with = "deserialize_queue_names")]
    pub queue_names: Option<Vec<String>>,
    pub max_tries: Option<u32>,
    pub empty_queue_sleep_ms: Option<u64>,
    pub max_query_time_ms: Option<u64>,
    pub rescan_every: Option<u32>,
    pub idle_rescan_every: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_text")]
    pub database_connect_throttle: Option<String>,
    #[serde(default, deserialize_with = "deserialize_text")]
    pub failure_throttle: Option<String>,
    #[serde(default, deserialize_with = "deserialize_text")]
    pub deduplicate_disable: Option<String>,
    pub include_postponed_duplicates: Option<bool>,
}

/// Comma separated queue names; blanks are dropped
fn deserialize_queue_names<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.map(|names| split_queue_names(&names)))
}

/// Plain string even when the environment value looks like a number
fn deserialize_text<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)
}

pub fn split_queue_names(names: &str) -> Vec<String> {
    names
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

impl ConfigOverrides {
    /// Read `PGQUEUE_*` variables from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_source(None)
    }

    /// Read overrides from an explicit variable map instead of the process
    /// environment
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        Self::from_source(Some(vars))
    }

    fn from_source(vars: Option<HashMap<String, String>>) -> Result<Self> {
        let environment = config::Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .source(vars);
        let overrides = config::Config::builder()
            .add_source(environment)
            .build()?
            .try_deserialize::<ConfigOverrides>()?;
        Ok(overrides)
    }
}

/// Fully resolved configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerConfig {
    pub queue_names: Vec<String>,
    pub max_tries: u32,
    pub empty_queue_sleep: Duration,
    pub max_query_time: Duration,
    pub rescan_every: u32,
    pub idle_rescan_every: u32,
    pub database_connect_throttle: String,
    pub failure_throttle: String,
    pub deduplicate_disable: String,
    pub include_postponed_duplicates: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue_names: Vec::new(),
            max_tries: DEFAULT_MAX_TRIES,
            empty_queue_sleep: Duration::from_millis(DEFAULT_EMPTY_QUEUE_SLEEP_MS),
            max_query_time: Duration::from_millis(DEFAULT_MAX_QUERY_TIME_MS),
            rescan_every: DEFAULT_RESCAN_EVERY,
            idle_rescan_every: DEFAULT_IDLE_RESCAN_EVERY,
            database_connect_throttle: String::new(),
            failure_throttle: String::new(),
            deduplicate_disable: String::new(),
            include_postponed_duplicates: false,
        }
    }
}

impl ConsumerConfig {
    /// Defaults overridden by the process environment
    pub fn from_env() -> Result<Self> {
        Self::merge(ConfigOverrides::default(), ConfigOverrides::from_env()?).validated()
    }

    /// Resolve each setting as explicit value, then environment, then default
    pub fn merge(explicit: ConfigOverrides, environment: ConfigOverrides) -> Self {
        let defaults = Self::default();
        Self {
            queue_names: explicit
                .queue_names
                .or(environment.queue_names)
                .unwrap_or(defaults.queue_names),
            max_tries: explicit
                .max_tries
                .or(environment.max_tries)
                .unwrap_or(defaults.max_tries),
            empty_queue_sleep: explicit
                .empty_queue_sleep_ms
                .or(environment.empty_queue_sleep_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.empty_queue_sleep),
            max_query_time: explicit
                .max_query_time_ms
                .or(environment.max_query_time_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_query_time),
            rescan_every: explicit
                .rescan_every
                .or(environment.rescan_every)
                .unwrap_or(defaults.rescan_every),
            idle_rescan_every: explicit
                .idle_rescan_every
                .or(environment.idle_rescan_every)
                .unwrap_or(defaults.idle_rescan_every),
            database_connect_throttle: explicit
                .database_connect_throttle
                .or(environment.database_connect_throttle)
                .unwrap_or(defaults.database_connect_throttle),
            failure_throttle: explicit
                .failure_throttle
                .or(environment.failure_throttle)
                .unwrap_or(defaults.failure_throttle),
            deduplicate_disable: explicit
                .deduplicate_disable
                .or(environment.deduplicate_disable)
                .unwrap_or(defaults.deduplicate_disable),
            include_postponed_duplicates: explicit
                .include_postponed_duplicates
                .or(environment.include_postponed_duplicates)
                .unwrap_or(defaults.include_postponed_duplicates),
        }
    }

    /// Check the values that have no sensible fallback
    pub fn validated(self) -> Result<Self> {
        if self.queue_names.is_empty() {
            return Err(ConsumerError::MissingSetting {
                setting: "queue names".to_string(),
            });
        }
        if self.max_tries < 1 {
            return Err(ConsumerError::configuration("max tries must be at least 1"));
        }
        if self.rescan_every < 1 || self.idle_rescan_every < 1 {
            return Err(ConsumerError::configuration(
                "rescan intervals must be at least 1",
            ));
        }
        Ok(self)
    }
}
