//! # Deduplicate Disable
//!
//! Circuit breaker for the duplicate-delete query. Removing duplicates relies
//! on an index the integrator provides; when that lookup turns slow it costs
//! more than it saves, so it is switched off for a cool-down period.

use crate::error::{ConsumerError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Millisecond wall clock, replaceable in tests
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_millis(&self) -> i64;
}

/// Wall clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Breaker that disables deduplication after a slow duplicate lookup
#[derive(Debug)]
pub struct DeduplicateDisable {
    /// Longest acceptable lookup, in ms
    limit: i64,
    /// How long deduplication stays off after a slow lookup, in ms
    disable_period: i64,
    disabled_until: Mutex<i64>,
    clock: Arc<dyn Clock>,
}

impl Default for DeduplicateDisable {
    fn default() -> Self {
        Self::always_enabled()
    }
}

impl DeduplicateDisable {
    /// A breaker that never trips
    pub fn always_enabled() -> Self {
        Self {
            limit: i64::MAX,
            disable_period: 0,
            disabled_until: Mutex::new(0),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn new(limit_ms: u64, disable_period_ms: u64) -> Self {
        Self::with_clock(limit_ms, disable_period_ms, Arc::new(SystemClock))
    }

    pub fn with_clock(limit_ms: u64, disable_period_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit: i64::try_from(limit_ms).unwrap_or(i64::MAX),
            disable_period: i64::try_from(disable_period_ms).unwrap_or(i64::MAX),
            disabled_until: Mutex::new(0),
            clock,
        }
    }

    /// Parse `"{limitMs}/{periodMs}"`; an empty spec never trips
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(Self::always_enabled());
        }
        let invalid = || ConsumerError::InvalidDeduplicateDisable {
            spec: spec.to_string(),
        };
        let (limit, period) = spec.split_once('/').ok_or_else(invalid)?;
        let limit = limit.trim().parse::<u64>().map_err(|_| invalid())?;
        let period = period.trim().parse::<u64>().map_err(|_| invalid())?;
        Ok(Self::new(limit, period))
    }

    /// Is deduplication currently allowed
    pub fn can_deduplicate(&self) -> bool {
        let disabled_until = self.disabled_until.lock();
        self.clock.now_millis() > *disabled_until
    }

    /// Start timing a duplicate lookup; the timing is recorded when the
    /// returned guard is dropped
    pub fn context(&self) -> DeduplicateTimer<'_> {
        DeduplicateTimer {
            breaker: self,
            started: self.clock.now_millis(),
        }
    }

    fn register_duration(&self, started: i64) {
        let mut disabled_until = self.disabled_until.lock();
        let now = self.clock.now_millis();
        let duration = now.saturating_sub(started);
        if duration > self.limit {
            *disabled_until = now.saturating_add(self.disable_period);
            warn!(
                duration_ms = duration,
                limit_ms = self.limit,
                disable_period_ms = self.disable_period,
                "🐢 Duplicate lookup too slow - deduplication disabled"
            );
        }
    }
}

/// Scoped timer returned by [`DeduplicateDisable::context`]
#[must_use = "the lookup is timed until the guard is dropped"]
pub struct DeduplicateTimer<'a> {
    breaker: &'a DeduplicateDisable,
    started: i64,
}

impl Drop for DeduplicateTimer<'_> {
    fn drop(&mut self) {
        self.breaker.register_duration(self.started);
    }
}
