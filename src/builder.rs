//! # Queue Worker Builder
//!
//! Collects the collaborators and tunables for a [`Harvester`]. Settings not
//! given explicitly are taken from the `PGQUEUE_*` environment, then from the
//! defaults in [`crate::config`]. Setting an option twice is a mistake and is
//! reported by [`QueueWorkerBuilder::build`].
//!
//! ```rust,no_run
//! use pgqueue_consumer::{QueueWorkerBuilder, JobCodec, JobConsumer};
//! # fn example<C: JobCodec<String>, W: JobConsumer<String> + 'static>(
//! #     codec: C, consumer: W, pool: sqlx::PgPool,
//! # ) -> pgqueue_consumer::Result<()> {
//! let harvester = QueueWorkerBuilder::new(codec)
//!     .consume(["high", "low"])
//!     .data_source(pool)
//!     .max_tries(5)
//!     .failure_throttle("3/500ms, 5/m!")
//!     .build_with(4, consumer)?;
//! harvester.start()?;
//! # Ok(())
//! # }
//! ```

use crate::config::{ConfigOverrides, ConsumerConfig};
use crate::consumer::JobConsumer;
use crate::data_source::DataSource;
use crate::error::{ConsumerError, Result};
use crate::harvester::sql::SqlStatements;
use crate::harvester::{Harvester, Settings};
use crate::health::QueueHealth;
use crate::metrics::{NoopMetrics, QueueMetrics};
use crate::resilience::{DeduplicateDisable, Throttle};
use crate::storage::{DeduplicateCodec, JobCodec};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Builder for a [`Harvester`]
pub struct QueueWorkerBuilder<T> {
    codec: Arc<dyn JobCodec<T>>,
    explicit: ConfigOverrides,
    environment: Option<HashMap<String, String>>,
    data_source: Option<Arc<dyn DataSource>>,
    deduplicate: Option<Arc<dyn DeduplicateCodec<T>>>,
    metrics: Option<Arc<dyn QueueMetrics>>,
    health: Option<QueueHealth>,
    runtime: Option<Handle>,
    /// Options set more than once
    duplicates: Vec<&'static str>,
}

/// Store `value` in `slot`, remembering the name if it was already set
fn set_once<V>(slot: &mut Option<V>, value: V, name: &'static str, duplicates: &mut Vec<&'static str>) {
    if slot.is_some() {
        duplicates.push(name);
    }
    *slot = Some(value);
}

impl<T: Send + Sync + 'static> QueueWorkerBuilder<T> {
    /// Start a builder for jobs stored through `codec`
    pub fn new(codec: impl JobCodec<T>) -> Self {
        Self {
            codec: Arc::new(codec),
            explicit: ConfigOverrides::default(),
            environment: None,
            data_source: None,
            deduplicate: None,
            metrics: None,
            health: None,
            runtime: None,
            duplicates: Vec::new(),
        }
    }

    /// Queue names to take jobs from, in order of preference
    pub fn consume<I, S>(mut self, queue_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = queue_names.into_iter().map(Into::into).collect();
        set_once(&mut self.explicit.queue_names, names, "queue names", &mut self.duplicates);
        self
    }

    pub fn data_source(mut self, data_source: impl DataSource) -> Self {
        set_once(&mut self.data_source, Arc::new(data_source), "data source", &mut self.duplicates);
        self
    }

    /// Attempts before a failing job is archived
    pub fn max_tries(mut self, max_tries: u32) -> Self {
        set_once(&mut self.explicit.max_tries, max_tries, "max tries", &mut self.duplicates);
        self
    }

    /// Idle time between polls when every queue is empty
    pub fn empty_queue_sleep(mut self, sleep: Duration) -> Self {
        set_once(
            &mut self.explicit.empty_queue_sleep_ms,
            duration_ms(sleep),
            "empty queue sleep",
            &mut self.duplicates,
        );
        self
    }

    /// Probe duration that makes a worker drop its prepared statements
    pub fn max_query_time(mut self, max_query_time: Duration) -> Self {
        set_once(
            &mut self.explicit.max_query_time_ms,
            duration_ms(max_query_time),
            "max query time",
            &mut self.duplicates,
        );
        self
    }

    /// Poll cycles between full rescans while jobs are flowing
    pub fn rescan_every(mut self, cycles: u32) -> Self {
        set_once(&mut self.explicit.rescan_every, cycles, "rescan every", &mut self.duplicates);
        self
    }

    /// Poll cycles between full rescans while idle
    pub fn idle_rescan_every(mut self, cycles: u32) -> Self {
        set_once(
            &mut self.explicit.idle_rescan_every,
            cycles,
            "idle rescan every",
            &mut self.duplicates,
        );
        self
    }

    /// Throttle rules for reconnecting, e.g. `"1/s, 5/m"`
    pub fn database_connect_throttle(mut self, rules: impl Into<String>) -> Self {
        set_once(
            &mut self.explicit.database_connect_throttle,
            rules.into(),
            "database connect throttle",
            &mut self.duplicates,
        );
        self
    }

    /// Throttle rules for failing jobs, e.g. `"3/500ms, 5/m!"`
    pub fn failure_throttle(mut self, rules: impl Into<String>) -> Self {
        set_once(
            &mut self.explicit.failure_throttle,
            rules.into(),
            "failure throttle",
            &mut self.duplicates,
        );
        self
    }

    /// Remove queued duplicates of a job before running it
    pub fn skip_duplicate_jobs(mut self, deduplicate: impl DeduplicateCodec<T>) -> Self {
        set_once(
            &mut self.deduplicate,
            Arc::new(deduplicate),
            "skip duplicate jobs",
            &mut self.duplicates,
        );
        self
    }

    /// `"{limitMs}/{periodMs}"`: turn deduplication off for `periodMs` after a
    /// lookup slower than `limitMs`
    pub fn deduplicate_disable(mut self, spec: impl Into<String>) -> Self {
        set_once(
            &mut self.explicit.deduplicate_disable,
            spec.into(),
            "deduplicate disable",
            &mut self.duplicates,
        );
        self
    }

    /// Also remove duplicates that are not yet eligible
    pub fn include_postponed_duplicates(mut self, include: bool) -> Self {
        set_once(
            &mut self.explicit.include_postponed_duplicates,
            include,
            "include postponed duplicates",
            &mut self.duplicates,
        );
        self
    }

    pub fn metrics(mut self, metrics: impl QueueMetrics + 'static) -> Self {
        set_once(&mut self.metrics, Arc::new(metrics), "metrics", &mut self.duplicates);
        self
    }

    pub fn health(mut self, health: QueueHealth) -> Self {
        set_once(&mut self.health, health, "health", &mut self.duplicates);
        self
    }

    /// Runtime the workers are spawned on; defaults to the current one
    pub fn runtime(mut self, runtime: Handle) -> Self {
        set_once(&mut self.runtime, runtime, "runtime", &mut self.duplicates);
        self
    }

    /// Read `PGQUEUE_*` settings from `vars` instead of the process environment
    pub fn environment(mut self, vars: HashMap<String, String>) -> Self {
        set_once(&mut self.environment, vars, "environment", &mut self.duplicates);
        self
    }

    /// Build a harvester with one worker per consumer
    pub fn build<C, I>(self, consumers: I) -> Result<Harvester<T>>
    where
        C: JobConsumer<T> + 'static,
        I: IntoIterator<Item = C>,
    {
        let consumers = consumers
            .into_iter()
            .map(|consumer| Arc::new(consumer) as Arc<dyn JobConsumer<T>>)
            .collect();
        self.build_harvester(consumers)
    }

    /// Build a harvester with `workers` workers sharing one consumer
    pub fn build_with<C>(self, workers: usize, consumer: C) -> Result<Harvester<T>>
    where
        C: JobConsumer<T> + 'static,
    {
        let consumer: Arc<dyn JobConsumer<T>> = Arc::new(consumer);
        self.build_harvester(vec![consumer; workers])
    }

    fn build_harvester(self, consumers: Vec<Arc<dyn JobConsumer<T>>>) -> Result<Harvester<T>> {
        if let Some(setting) = self.duplicates.first() {
            return Err(ConsumerError::DuplicateSetting {
                setting: setting.to_string(),
            });
        }

        let environment = match self.environment {
            Some(vars) => ConfigOverrides::from_vars(vars)?,
            None => ConfigOverrides::from_env()?,
        };
        let config = ConsumerConfig::merge(self.explicit, environment).validated()?;

        let data_source = self.data_source.ok_or_else(|| ConsumerError::MissingSetting {
            setting: "data source".to_string(),
        })?;
        if consumers.is_empty() {
            return Err(ConsumerError::NoConsumers);
        }

        let database_connect_throttle = Throttle::new(&config.database_connect_throttle)?;
        let failure_throttle = Throttle::new(&config.failure_throttle)?;
        let deduplicate_disable = DeduplicateDisable::parse(&config.deduplicate_disable)?;
        debug!(
            connect_throttle = %database_connect_throttle.spec(),
            failure_throttle = %failure_throttle.spec(),
            "Throttles configured"
        );

        let metrics = self.metrics.unwrap_or_else(|| {
            warn!("No metrics configured - queue metrics are discarded");
            Arc::new(NoopMetrics)
        });
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| ConsumerError::NoRuntime)?,
        };

        let sql = SqlStatements::new(
            self.codec.columns(),
            self.deduplicate.as_ref().map(|d| d.duplicate_columns()),
            config.include_postponed_duplicates,
        );
        debug!(claim = %sql.claim(), "Rendered queue SQL");

        let settings = Settings {
            config,
            sql,
            codec: self.codec,
            deduplicate: self.deduplicate,
            data_source,
            database_connect_throttle,
            failure_throttle,
            deduplicate_disable,
            metrics,
            health: self.health.unwrap_or_default(),
        };
        Ok(Harvester::new(settings, consumers, runtime))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::job::JobMetaData;
    use crate::storage::PgQuery;
    use async_trait::async_trait;
    use sqlx::postgres::{PgConnectOptions, PgRow};
    use sqlx::{PgConnection, Row};

    struct TextCodec;

    impl JobCodec<String> for TextCodec {
        fn columns(&self) -> &[&str] {
            &["job"]
        }

        fn create_job(&self, row: &PgRow, start: usize) -> std::result::Result<String, sqlx::Error> {
            row.try_get(start)
        }

        fn save_job<'q>(&self, job: &String, query: PgQuery<'q>) -> PgQuery<'q> {
            query.bind(job.clone())
        }
    }

    struct Noop;

    #[async_trait]
    impl JobConsumer<String> for Noop {
        async fn accept(
            &self,
            _connection: &mut PgConnection,
            _job: &String,
            _metadata: &JobMetaData,
        ) -> std::result::Result<(), QueueError> {
            Ok(())
        }
    }

    fn builder() -> QueueWorkerBuilder<String> {
        QueueWorkerBuilder::new(TextCodec)
            .environment(HashMap::new())
            .data_source(PgConnectOptions::new())
    }

    #[tokio::test]
    async fn test_build() {
        let harvester = builder()
            .consume(["foo", "bar"])
            .max_tries(2)
            .build_with(3, Noop)
            .unwrap();
        assert_eq!(harvester.worker_count(), 3);
        assert_eq!(harvester.config().max_tries, 2);
        assert_eq!(harvester.config().queue_names, vec!["foo", "bar"]);
        assert!(!harvester.is_running());
    }

    #[tokio::test]
    async fn test_duplicate_setting() {
        let result = builder()
            .consume(["foo"])
            .max_tries(2)
            .max_tries(3)
            .build([Noop]);
        match result {
            Err(ConsumerError::DuplicateSetting { setting }) => assert_eq!(setting, "max tries"),
            other => panic!("expected duplicate setting, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_environment_fills_unset_values() {
        let vars = HashMap::from([
            ("PGQUEUE_QUEUE_NAMES".to_string(), "env-queue".to_string()),
            ("PGQUEUE_MAX_TRIES".to_string(), "9".to_string()),
            ("PGQUEUE_RESCAN_EVERY".to_string(), "5".to_string()),
        ]);
        let harvester = QueueWorkerBuilder::new(TextCodec)
            .environment(vars)
            .data_source(PgConnectOptions::new())
            .max_tries(4)
            .build([Noop])
            .unwrap();
        assert_eq!(harvester.config().queue_names, vec!["env-queue"]);
        assert_eq!(harvester.config().max_tries, 4);
        assert_eq!(harvester.config().rescan_every, 5);
    }

    #[tokio::test]
    async fn test_missing_pieces() {
        assert!(matches!(
            builder().build([Noop]),
            Err(ConsumerError::MissingSetting { .. })
        ));
        assert!(matches!(
            QueueWorkerBuilder::new(TextCodec)
                .environment(HashMap::new())
                .consume(["foo"])
                .build([Noop]),
            Err(ConsumerError::MissingSetting { .. })
        ));
        assert!(matches!(
            builder().consume(["foo"]).build(Vec::<Noop>::new()),
            Err(ConsumerError::NoConsumers)
        ));
    }

    #[tokio::test]
    async fn test_invalid_rules() {
        assert!(matches!(
            builder().consume(["foo"]).failure_throttle("3/fortnight").build([Noop]),
            Err(ConsumerError::InvalidThrottleRule { .. })
        ));
        assert!(matches!(
            builder().consume(["foo"]).deduplicate_disable("fast").build([Noop]),
            Err(ConsumerError::InvalidDeduplicateDisable { .. })
        ));
    }

    #[test]
    fn test_no_runtime() {
        let result = builder().consume(["foo"]).build([Noop]);
        assert!(matches!(result, Err(ConsumerError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let harvester = builder()
            .consume(["foo"])
            .database_connect_throttle("1/10s")
            .build([Noop])
            .unwrap();

        assert!(matches!(harvester.stop(), Err(ConsumerError::NotRunning)));
        harvester.start().unwrap();
        assert!(matches!(harvester.start(), Err(ConsumerError::AlreadyRunning)));
        assert!(matches!(
            harvester.await_termination(Duration::from_secs(1)).await,
            Err(ConsumerError::NotStopped)
        ));
        harvester.stop().unwrap();
        harvester
            .await_termination(Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(harvester.worker_count(), 1);
    }

    #[tokio::test]
    async fn test_restart_without_await_termination() {
        let harvester = builder()
            .consume(["foo"])
            .database_connect_throttle("1/10s")
            .build([Noop])
            .unwrap();

        harvester.start().unwrap();
        harvester.stop().unwrap();
        // The worker task has not run yet, so it cannot have wound down
        assert!(matches!(harvester.start(), Err(ConsumerError::NotStopped)));
        assert!(!harvester.is_running());

        tokio::time::sleep(Duration::from_millis(100)).await;
        harvester.start().unwrap();
        assert!(harvester.is_running());
        assert_eq!(harvester.worker_count(), 1);

        harvester.stop().unwrap();
        harvester
            .await_termination(Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(harvester.worker_count(), 1);
    }
}
