//! # Queue Metrics
//!
//! Counters and timers reported by the queue workers. The workers only talk
//! to the [`QueueMetrics`] trait; [`OpenTelemetryMetrics`] forwards to the
//! `opentelemetry` global meter and [`NoopMetrics`] discards everything.
//!
//! ## Usage
//!
//! ```rust
//! use pgqueue_consumer::metrics::{MetricTimer, NoopMetrics, QueueMetrics};
//!
//! let metrics = NoopMetrics;
//! {
//!     let _timer = metrics.time(MetricTimer::Dequeue);
//!     // ... run the claim query ...
//! }
//! ```

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;
use std::fmt;
use std::time::{Duration, Instant};

/// Timed operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricTimer {
    DatabaseConnect,
    Dequeue,
    Timestamp,
    DeleteDuplicate,
    Retry,
    Postpone,
    Failure,
}

impl MetricTimer {
    pub const ALL: [MetricTimer; 7] = [
        MetricTimer::DatabaseConnect,
        MetricTimer::Dequeue,
        MetricTimer::Timestamp,
        MetricTimer::DeleteDuplicate,
        MetricTimer::Retry,
        MetricTimer::Postpone,
        MetricTimer::Failure,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MetricTimer::DatabaseConnect => "database_connect",
            MetricTimer::Dequeue => "dequeue",
            MetricTimer::Timestamp => "timestamp",
            MetricTimer::DeleteDuplicate => "delete_duplicate",
            MetricTimer::Retry => "retry",
            MetricTimer::Postpone => "postpone",
            MetricTimer::Failure => "failure",
        }
    }
}

/// Counted events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricCounter {
    /// Cached queue timestamps were cleared
    Rescan,
    /// Prepared statements were dropped after a slow timestamp probe
    RecalcPreparedStatement,
}

impl MetricCounter {
    pub fn name(self) -> &'static str {
        match self {
            MetricCounter::Rescan => "rescan",
            MetricCounter::RecalcPreparedStatement => "recalc_prepared_statement",
        }
    }
}

/// Sink for the queue's counters and timers
pub trait QueueMetrics: Send + Sync + fmt::Debug {
    fn increment(&self, counter: MetricCounter);

    fn record(&self, timer: MetricTimer, elapsed: Duration);

    /// Start a timer that is recorded when the guard is dropped
    fn time(&self, timer: MetricTimer) -> MetricTimerGuard<'_>
    where
        Self: Sized,
    {
        MetricTimerGuard::new(self, timer)
    }
}

/// Records the elapsed time of a scope on drop
#[must_use = "the timer records when the guard is dropped"]
pub struct MetricTimerGuard<'a> {
    metrics: &'a dyn QueueMetrics,
    timer: MetricTimer,
    started: Instant,
}

impl<'a> MetricTimerGuard<'a> {
    pub fn new(metrics: &'a dyn QueueMetrics, timer: MetricTimer) -> Self {
        Self {
            metrics,
            timer,
            started: Instant::now(),
        }
    }
}

impl Drop for MetricTimerGuard<'_> {
    fn drop(&mut self) {
        self.metrics.record(self.timer, self.started.elapsed());
    }
}

/// Discards all metrics
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl QueueMetrics for NoopMetrics {
    fn increment(&self, _counter: MetricCounter) {}

    fn record(&self, _timer: MetricTimer, _elapsed: Duration) {}
}

/// OpenTelemetry metrics on the global meter provider
///
/// Timers are one millisecond histogram (`pgqueue.operation.duration`) with
/// an `operation` label; counters are `pgqueue.<name>.total`.
pub struct OpenTelemetryMetrics {
    durations: Histogram<f64>,
    rescans: Counter<u64>,
    recalc_prepared_statements: Counter<u64>,
    labels: Vec<KeyValue>,
}

impl fmt::Debug for OpenTelemetryMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenTelemetryMetrics")
            .field("labels", &self.labels)
            .finish()
    }
}

impl OpenTelemetryMetrics {
    /// Metrics on the global `pgqueue-consumer` meter
    pub fn new() -> Self {
        Self::with_meter(&opentelemetry::global::meter("pgqueue-consumer"))
    }

    pub fn with_meter(meter: &Meter) -> Self {
        Self {
            durations: meter
                .f64_histogram("pgqueue.operation.duration")
                .with_description("Queue database operation duration in milliseconds")
                .with_unit("ms")
                .build(),
            rescans: meter
                .u64_counter("pgqueue.rescan.total")
                .with_description("Times the cached queue timestamps were cleared")
                .build(),
            recalc_prepared_statements: meter
                .u64_counter("pgqueue.recalc_prepared_statement.total")
                .with_description("Times prepared statements were dropped after a slow probe")
                .build(),
            labels: Vec::new(),
        }
    }

    /// Attach a label to everything recorded, e.g. the application name
    pub fn with_label(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.labels.push(KeyValue::new(key, value.into()));
        self
    }
}

impl Default for OpenTelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueMetrics for OpenTelemetryMetrics {
    fn increment(&self, counter: MetricCounter) {
        match counter {
            MetricCounter::Rescan => self.rescans.add(1, &self.labels),
            MetricCounter::RecalcPreparedStatement => {
                self.recalc_prepared_statements.add(1, &self.labels)
            }
        }
    }

    fn record(&self, timer: MetricTimer, elapsed: Duration) {
        let mut labels = self.labels.clone();
        labels.push(KeyValue::new("operation", timer.name()));
        self.durations
            .record(elapsed.as_secs_f64() * 1000.0, &labels);
    }
}
