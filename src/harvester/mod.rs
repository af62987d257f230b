//! # Harvester
//!
//! Owns the shared settings and the rendered SQL, and supervises one
//! [`JobWorker`] task per job consumer.
//!
//! ## Lifecycle
//!
//! ```rust,no_run
//! # use pgqueue_consumer::Harvester;
//! # use std::time::Duration;
//! # async fn example(harvester: Harvester<String>) -> pgqueue_consumer::Result<()> {
//! harvester.start()?;
//! // ... serve ...
//! harvester.stop()?;
//! harvester.await_termination(Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod sql;
pub mod worker;

use crate::config::ConsumerConfig;
use crate::data_source::DataSource;
use crate::error::{ConsumerError, Result};
use crate::health::QueueHealth;
use crate::metrics::QueueMetrics;
use crate::resilience::{DeduplicateDisable, Throttle};
use crate::storage::{DeduplicateCodec, JobCodec};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use sql::SqlStatements;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info};

pub use worker::JobWorker;

/// Read-only state shared by all workers of a harvester
pub(crate) struct Settings<T> {
    pub(crate) config: ConsumerConfig,
    pub(crate) sql: SqlStatements,
    pub(crate) codec: Arc<dyn JobCodec<T>>,
    pub(crate) deduplicate: Option<Arc<dyn DeduplicateCodec<T>>>,
    pub(crate) data_source: Arc<dyn DataSource>,
    pub(crate) database_connect_throttle: Throttle,
    pub(crate) failure_throttle: Throttle,
    pub(crate) deduplicate_disable: DeduplicateDisable,
    pub(crate) metrics: Arc<dyn QueueMetrics>,
    pub(crate) health: QueueHealth,
}

/// A pool of queue workers
pub struct Harvester<T> {
    settings: Arc<Settings<T>>,
    running: watch::Sender<bool>,
    /// Workers not currently running
    idle: Mutex<Vec<JobWorker<T>>>,
    tasks: Mutex<Vec<JoinHandle<JobWorker<T>>>>,
    runtime: Handle,
}

impl<T: Send + Sync + 'static> Harvester<T> {
    pub(crate) fn new(
        settings: Settings<T>,
        consumers: Vec<Arc<dyn crate::consumer::JobConsumer<T>>>,
        runtime: Handle,
    ) -> Self {
        let settings = Arc::new(settings);
        let (running, _) = watch::channel(false);
        let workers = consumers
            .into_iter()
            .enumerate()
            .map(|(i, consumer)| {
                JobWorker::new(
                    format!("pgqueue-worker-{i}"),
                    consumer,
                    Arc::clone(&settings),
                    running.subscribe(),
                )
            })
            .collect();
        Self {
            settings,
            running,
            idle: Mutex::new(workers),
            tasks: Mutex::new(Vec::new()),
            runtime,
        }
    }

    /// Spawn every worker on the runtime
    ///
    /// Workers that exited after a `stop()` are picked up again, so calling
    /// [`await_termination`](Self::await_termination) first is optional. A
    /// worker still winding down makes this fail with `NotStopped`.
    pub fn start(&self) -> Result<()> {
        if self.is_running() {
            return Err(ConsumerError::AlreadyRunning);
        }

        let mut tasks = self.tasks.lock();
        if tasks.iter().any(|task| !task.is_finished()) {
            return Err(ConsumerError::NotStopped);
        }
        let mut finished = Vec::with_capacity(tasks.len());
        for task in tasks.drain(..) {
            match tokio::task::unconstrained(task).now_or_never() {
                Some(joined) => finished.push(joined),
                None => error!("Finished queue worker did not hand back its state"),
            }
        }
        self.reclaim(finished);

        self.running.send_replace(true);
        let workers = std::mem::take(&mut *self.idle.lock());
        for worker in workers {
            tasks.push(self.runtime.spawn(worker.run()));
        }
        info!(
            workers = tasks.len(),
            queues = ?self.settings.config.queue_names,
            "🚀 Harvester started"
        );
        Ok(())
    }

    /// Ask every worker to stop
    ///
    /// Waits in progress are interrupted; a job being processed finishes its
    /// transaction first.
    pub fn stop(&self) -> Result<()> {
        if !self.is_running() {
            return Err(ConsumerError::NotRunning);
        }
        self.running.send_replace(false);
        info!("🛑 Harvester stopping");
        Ok(())
    }

    /// Wait up to `timeout` for stopped workers to finish
    ///
    /// A timeout is logged, not returned.
    pub async fn await_termination(&self, timeout: Duration) -> Result<()> {
        if self.is_running() {
            return Err(ConsumerError::NotStopped);
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        match tokio::time::timeout(timeout, join_all(tasks)).await {
            Ok(finished) => self.reclaim(finished),
            Err(_) => {
                error!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Error waiting for queue workers to finish: timed out"
                );
            }
        }
        Ok(())
    }

    /// Put finished workers back in the idle set
    fn reclaim(&self, finished: Vec<std::result::Result<JobWorker<T>, JoinError>>) {
        let mut idle = self.idle.lock();
        for worker in finished {
            match worker {
                Ok(worker) => idle.push(worker),
                Err(e) => error!(error = %e, "Queue worker ended abnormally"),
            }
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Number of workers, running or not
    pub fn worker_count(&self) -> usize {
        let idle = self.idle.lock().len();
        idle + self.tasks.lock().len()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.settings.config
    }

    /// Workers stuck in a database call for longer than the health threshold
    pub fn hung_workers(&self) -> Vec<String> {
        self.settings.health.hung_workers()
    }

    /// Workers stuck in a database call for longer than `age`
    pub fn hung_workers_since(&self, age: Duration) -> Vec<String> {
        self.settings.health.hung_workers_since(age)
    }
}
