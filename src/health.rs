//! # Queue Health
//!
//! Tracks database calls in flight per worker, so a supervisor can spot
//! workers stuck on a call that never returns.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default age after which an in-flight database call counts as hung
pub const DEFAULT_HUNG_THRESHOLD: Duration = Duration::from_secs(60);

/// Registry of in-flight database calls, keyed by worker name
#[derive(Debug, Clone)]
pub struct QueueHealth {
    threshold: Duration,
    calls: Arc<DashMap<String, Instant>>,
}

impl Default for QueueHealth {
    fn default() -> Self {
        Self::new(DEFAULT_HUNG_THRESHOLD)
    }
}

impl QueueHealth {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            calls: Arc::new(DashMap::new()),
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Workers whose current database call is older than the threshold
    pub fn hung_workers(&self) -> Vec<String> {
        self.hung_workers_since(self.threshold)
    }

    /// Workers whose current database call is older than `age`
    pub fn hung_workers_since(&self, age: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut hung: Vec<String> = self
            .calls
            .iter()
            .filter(|entry| now.saturating_duration_since(*entry.value()) > age)
            .map(|entry| entry.key().clone())
            .collect();
        hung.sort();
        hung
    }

    /// Mark `worker` as inside a database call until the guard is dropped
    pub fn database_call(&self, worker: &str) -> DatabaseCallGuard {
        self.calls.insert(worker.to_string(), Instant::now());
        DatabaseCallGuard {
            worker: worker.to_string(),
            calls: Arc::clone(&self.calls),
        }
    }
}

/// Clears a worker's in-flight marker on drop
#[must_use = "the call is tracked until the guard is dropped"]
pub struct DatabaseCallGuard {
    worker: String,
    calls: Arc<DashMap<String, Instant>>,
}

impl Drop for DatabaseCallGuard {
    fn drop(&mut self) {
        self.calls.remove(&self.worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_in_flight_is_reported_once_old() {
        let health = QueueHealth::default();
        let _guard = health.database_call("worker-0");
        std::thread::sleep(Duration::from_millis(20));

        assert!(health.hung_workers().is_empty());
        assert_eq!(
            health.hung_workers_since(Duration::from_millis(5)),
            vec!["worker-0".to_string()]
        );
    }

    #[test]
    fn test_guard_drop_clears_call() {
        let health = QueueHealth::new(Duration::ZERO);
        {
            let _guard = health.database_call("worker-1");
            std::thread::sleep(Duration::from_millis(2));
            assert_eq!(health.hung_workers(), vec!["worker-1".to_string()]);
        }
        assert!(health.hung_workers().is_empty());
    }
}
