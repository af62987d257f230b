//! # Error Types
//!
//! Two families of errors live here:
//!
//! - [`QueueError`] is what a [`JobConsumer`](crate::consumer::JobConsumer) returns to
//!   signal how a job went. It never escapes the worker loop; it is turned into a
//!   retry, a postponement or an archive row.
//! - [`ConsumerError`] covers infrastructure and configuration faults. Database
//!   errors tear down the worker's connection; configuration errors are reported
//!   by the builder.

use std::time::Duration;
use thiserror::Error;

/// Maximum number of distinct messages taken from a cause chain for a diag
const MAX_DIAG_CAUSES: usize = 3;

/// Outcome of a failed job, as signalled by the job-processing code
#[derive(Error, Debug)]
pub enum QueueError {
    /// The job can never succeed; archive it without retrying
    #[error("fatal queue error: {}", describe(.source.as_ref()))]
    Fatal {
        source: Option<anyhow::Error>,
        /// Whether the failure should feed the failure throttle
        throttle: bool,
    },

    /// The job should be retried immediately
    #[error("non-fatal queue error: {}", describe(.source.as_ref()))]
    NonFatal { source: Option<anyhow::Error> },

    /// The job should be retried once `delay` has passed
    #[error("postponed queue error ({delay:?}): {}", describe(.source.as_ref()))]
    Postponed {
        source: Option<anyhow::Error>,
        delay: Duration,
    },
}

fn describe(source: Option<&anyhow::Error>) -> String {
    source.map_or_else(|| "<anonymous>".to_string(), |e| e.to_string())
}

impl QueueError {
    /// Create a fatal error with a message
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            source: Some(anyhow::Error::msg(message.into())),
            throttle: true,
        }
    }

    /// Create a fatal error from an underlying cause
    pub fn fatal_from(source: impl Into<anyhow::Error>) -> Self {
        Self::Fatal {
            source: Some(source.into()),
            throttle: true,
        }
    }

    /// Create a fatal error that does not count towards the failure throttle
    pub fn fatal_unthrottled(message: impl Into<String>) -> Self {
        Self::Fatal {
            source: Some(anyhow::Error::msg(message.into())),
            throttle: false,
        }
    }

    /// Create a non-fatal error with a message
    pub fn non_fatal(message: impl Into<String>) -> Self {
        Self::NonFatal {
            source: Some(anyhow::Error::msg(message.into())),
        }
    }

    /// Create a non-fatal error from an underlying cause
    pub fn non_fatal_from(source: impl Into<anyhow::Error>) -> Self {
        Self::NonFatal {
            source: Some(source.into()),
        }
    }

    /// Create a postponed error with a message
    pub fn postponed(message: impl Into<String>, delay: Duration) -> Self {
        Self::Postponed {
            source: Some(anyhow::Error::msg(message.into())),
            delay,
        }
    }

    /// Create a postponed error from an underlying cause
    pub fn postponed_from(source: impl Into<anyhow::Error>, delay: Duration) -> Self {
        Self::Postponed {
            source: Some(source.into()),
            delay,
        }
    }

    /// Name of the failure kind, as used in anonymous diags
    pub fn kind(&self) -> &'static str {
        match self {
            QueueError::Fatal { .. } => "Fatal",
            QueueError::NonFatal { .. } => "NonFatal",
            QueueError::Postponed { .. } => "PostponedNonFatal",
        }
    }

    /// Whether this failure should be registered with the failure throttle
    pub fn throttles(&self) -> bool {
        match self {
            QueueError::Fatal { throttle, .. } => *throttle,
            QueueError::NonFatal { .. } | QueueError::Postponed { .. } => true,
        }
    }

    fn source_error(&self) -> Option<&anyhow::Error> {
        match self {
            QueueError::Fatal { source, .. }
            | QueueError::NonFatal { source }
            | QueueError::Postponed { source, .. } => source.as_ref(),
        }
    }

    /// Text stored in the archive's `diag` column
    ///
    /// Up to three distinct, non-empty messages from the cause chain, joined by
    /// `" / "`. Falls back to `"Anonymous <kind>"`.
    pub fn diag(&self) -> String {
        let mut messages: Vec<String> = Vec::with_capacity(MAX_DIAG_CAUSES);
        if let Some(source) = self.source_error() {
            for cause in source.chain() {
                let message = cause.to_string();
                let message = message.trim();
                if message.is_empty() || messages.iter().any(|m| m == message) {
                    continue;
                }
                messages.push(message.to_string());
                if messages.len() == MAX_DIAG_CAUSES {
                    break;
                }
            }
        }
        if messages.is_empty() {
            format!("Anonymous {}", self.kind())
        } else {
            messages.join(" / ")
        }
    }
}

/// Infrastructure and configuration errors
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Database error: {operation}: {source}")]
    Database {
        operation: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid throttle rule: {rule:?}: {reason}")]
    InvalidThrottleRule { rule: String, reason: String },

    #[error("Invalid deduplicate-disable spec: {spec:?}")]
    InvalidDeduplicateDisable { spec: String },

    #[error("{setting} has already been set")]
    DuplicateSetting { setting: String },

    #[error("{setting} must be set")]
    MissingSetting { setting: String },

    #[error("No consumer is supplied")]
    NoConsumers,

    #[error("No tokio runtime available to run the queue workers")]
    NoRuntime,

    #[error("Consumer has already been started")]
    AlreadyRunning,

    #[error("Consumer is not running")]
    NotRunning,

    #[error("Consumer is not stopped")]
    NotStopped,
}

impl ConsumerError {
    /// Create a database error tagged with the operation that failed
    pub fn database(operation: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Database {
            operation: operation.into(),
            source,
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create an invalid throttle rule error
    pub fn invalid_throttle_rule(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidThrottleRule {
            rule: rule.into(),
            reason: reason.into(),
        }
    }
}

impl From<config::ConfigError> for ConsumerError {
    fn from(error: config::ConfigError) -> Self {
        ConsumerError::Configuration(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConsumerError>;
