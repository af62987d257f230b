//! # Structured Logging Module
//!
//! Environment-aware structured logging for the queue workers. Console output
//! by default, JSON lines when `PGQUEUE_LOG_FORMAT=json`.

use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));
        let json = use_json_format();

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // Use try_init to avoid panic if global subscriber already set
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json = json,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    environment_from(|key| std::env::var(key).ok())
}

fn environment_from(lookup: impl Fn(&str) -> Option<String>) -> String {
    lookup("PGQUEUE_ENV")
        .or_else(|| lookup("APP_ENV"))
        .unwrap_or_else(|| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "test" => "debug".to_string(),
        "development" => "debug".to_string(),
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

fn use_json_format() -> bool {
    json_format_from(|key| std::env::var(key).ok())
}

fn json_format_from(lookup: impl Fn(&str) -> Option<String>) -> bool {
    lookup("PGQUEUE_LOG_FORMAT").is_some_and(|format| format.eq_ignore_ascii_case("json"))
}

/// Log structured data for a job outcome
pub fn log_job_operation(
    operation: &str,
    worker: &str,
    consumer: &str,
    tries: i32,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        worker = %worker,
        consumer = %consumer,
        tries = tries,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 JOB_OPERATION"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn test_environment_detection() {
        let lookup = |vars: HashMap<String, String>| move |key: &str| vars.get(key).cloned();

        assert_eq!(environment_from(lookup(vars(&[]))), "development");
        assert_eq!(environment_from(lookup(vars(&[("APP_ENV", "staging")]))), "staging");
        assert_eq!(
            environment_from(lookup(vars(&[("APP_ENV", "staging"), ("PGQUEUE_ENV", "test_override")]))),
            "test_override"
        );
    }

    #[test]
    fn test_json_format_detection() {
        let format = |value: &str| {
            let vars = vars(&[("PGQUEUE_LOG_FORMAT", value)]);
            json_format_from(move |key| vars.get(key).cloned())
        };
        assert!(format("json"));
        assert!(format("JSON"));
        assert!(!format("pretty"));
        assert!(!json_format_from(|_| None));
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("unknown"), "debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_structured_logging();
        init_structured_logging();
        log_job_operation("accept", "worker-0", "foo", 1, "ok", None);
    }
}
