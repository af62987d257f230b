//! # Queue Worker
//!
//! The per-connection processing loop: claims jobs in declared queue order,
//! runs them through the [`JobConsumer`], and turns the outcome into a
//! commit, a retry, a postponement or an archive row, all inside the
//! transaction that claimed the job.

use super::connection::WorkerConnection;
use super::sql::{StatementKind, CURRENT_TIMESTAMP_SQL, QUEUE_TIMESTAMP_SQL};
use super::Settings;
use crate::consumer::JobConsumer;
use crate::error::{ConsumerError, QueueError, Result};
use crate::job::{JobMetaData, JobWithMetaData, METADATA_COLUMN_COUNT};
use crate::logging::log_job_operation;
use crate::metrics::{MetricCounter, MetricTimer, MetricTimerGuard};
use crate::storage::DeduplicateCodec;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Run `future` unless the harvester is stopped first
async fn unless_stopped<F: Future>(
    running: &mut watch::Receiver<bool>,
    future: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = running.wait_for(|running| !*running) => None,
        output = future => Some(output),
    }
}

/// Longest postponement written to the queue
pub const MAX_POSTPONE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Postpone delay in whole milliseconds, capped at [`MAX_POSTPONE`]
fn postpone_delay_ms(delay: Duration) -> i64 {
    let capped = delay.min(MAX_POSTPONE);
    i64::try_from(capped.as_millis()).unwrap_or(i64::MAX)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic".to_string()
    }
}

/// One worker loop with its own connection
pub struct JobWorker<T> {
    name: String,
    consumer: Arc<dyn JobConsumer<T>>,
    settings: Arc<Settings<T>>,
    running: watch::Receiver<bool>,
    connection: Option<WorkerConnection>,
    /// Lower bound for the next claim, per queue name
    timestamps: HashMap<String, DateTime<Utc>>,
    full_scan_counter: i64,
}

impl<T: Send + Sync + 'static> JobWorker<T> {
    pub(crate) fn new(
        name: String,
        consumer: Arc<dyn JobConsumer<T>>,
        settings: Arc<Settings<T>>,
        running: watch::Receiver<bool>,
    ) -> Self {
        let full_scan_counter = i64::from(settings.config.rescan_every);
        Self {
            name,
            consumer,
            settings,
            running,
            connection: None,
            timestamps: HashMap::new(),
            full_scan_counter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_running(&self) -> bool {
        let running = *self.running.borrow();
        // A dropped sender means the harvester is gone
        running && self.running.has_changed().is_ok()
    }

    /// Process jobs until stopped, then release the connection
    ///
    /// The worker is handed back so the harvester can start it again.
    pub(crate) async fn run(mut self) -> Self {
        info!(worker = %self.name, "🚀 Queue worker started");
        while self.is_running() {
            let Some(job) = self.next_job().await else {
                continue;
            };
            if let Err(e) = self.process(job).await {
                error!(worker = %self.name, error = %e, "Error processing job");
                self.release_connection().await;
            }
        }
        self.release_connection().await;
        info!(worker = %self.name, "🛑 Queue worker stopped");
        self
    }

    /// Wait for the next job; `None` only when stopped
    async fn next_job(&mut self) -> Option<JobWithMetaData<T>> {
        while self.is_running() {
            let fetched = if self.connection.is_none() {
                match self.setup_connection().await {
                    Ok(true) => self.fetch_job(false).await,
                    Ok(false) => Ok(None),
                    Err(e) => Err(e),
                }
            } else {
                self.fetch_job(true).await
            };
            match fetched {
                Ok(Some(job)) => {
                    debug!(worker = %self.name, job = %job.meta(), "Claimed job");
                    return Some(job);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(worker = %self.name, error = %e, "Error fetching job from queue");
                    // The connect that preceded this cleared the throttle
                    self.settings.database_connect_throttle.register(false);
                    self.release_connection().await;
                }
            }
        }
        None
    }

    /// Connect through the connect throttle; false when stopped while waiting
    async fn setup_connection(&mut self) -> Result<bool> {
        let settings = Arc::clone(&self.settings);
        if unless_stopped(&mut self.running, settings.database_connect_throttle.throttle())
            .await
            .is_none()
        {
            return Ok(false);
        }

        let connected = {
            let _timer = MetricTimerGuard::new(&*settings.metrics, MetricTimer::DatabaseConnect);
            let _call = settings.health.database_call(&self.name);
            settings.data_source.connect().await
        };
        settings.database_connect_throttle.register(connected.is_ok());

        let connection = connected.map_err(|e| ConsumerError::database("connect", e))?;
        debug!(worker = %self.name, "Connected to database");
        self.connection = Some(WorkerConnection::new(connection));
        self.timestamps.clear();
        Ok(true)
    }

    async fn release_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            debug!(
                worker = %self.name,
                prepared = connection.prepared().len(),
                "Releasing connection"
            );
            connection.close().await;
        }
    }

    fn connection(&mut self) -> Result<&mut WorkerConnection> {
        self.connection
            .as_mut()
            .ok_or_else(|| ConsumerError::configuration("worker has no database connection"))
    }

    /// Claim the first available job, in declared queue order
    ///
    /// With `wait` the call idles until a job shows up or the worker is
    /// stopped, otherwise it gives up after one empty pass.
    async fn fetch_job(&mut self, wait: bool) -> Result<Option<JobWithMetaData<T>>> {
        let settings = Arc::clone(&self.settings);
        if unless_stopped(&mut self.running, settings.failure_throttle.throttle())
            .await
            .is_none()
        {
            return Ok(None);
        }

        let mut has_cleared_timestamps = false;
        let mut full_scan_every = settings.config.rescan_every;
        while self.is_running() {
            self.full_scan_counter -= 1;
            if self.full_scan_counter <= 0 {
                debug!(
                    worker = %self.name,
                    every = full_scan_every,
                    "Clearing remembered timestamps"
                );
                settings.metrics.increment(MetricCounter::Rescan);
                self.full_scan_counter = i64::from(full_scan_every);
                self.timestamps.clear();
                has_cleared_timestamps = true;
            }

            self.connection()?.begin().await?;
            for queue in &settings.config.queue_names {
                let timestamp = self.timestamp_for(queue).await?;
                debug!(worker = %self.name, queue = %queue, after = %timestamp, "Polling queue");
                if let Some(job) = self.claim(queue, timestamp).await? {
                    self.timestamps
                        .insert(queue.clone(), job.meta().dequeue_after());
                    return Ok(Some(job));
                }
            }
            self.connection()?.rollback().await?;

            if !wait {
                return Ok(None);
            }
            // Idle: rescan more often, and start with a rescan
            full_scan_every = settings.config.idle_rescan_every;
            if !has_cleared_timestamps {
                self.full_scan_counter = 0;
            } else {
                debug!(
                    worker = %self.name,
                    sleep_ms = settings.config.empty_queue_sleep.as_millis() as u64,
                    "Got no job - sleeping"
                );
                unless_stopped(
                    &mut self.running,
                    tokio::time::sleep(settings.config.empty_queue_sleep),
                )
                .await;
            }
        }
        Ok(None)
    }

    async fn timestamp_for(&mut self, queue: &str) -> Result<DateTime<Utc>> {
        if let Some(timestamp) = self.timestamps.get(queue) {
            return Ok(*timestamp);
        }

        let settings = Arc::clone(&self.settings);
        let started = Instant::now();
        let timestamp = {
            let _timer = MetricTimerGuard::new(&*settings.metrics, MetricTimer::Timestamp);
            let _call = settings.health.database_call(&self.name);
            self.queue_timestamp(queue).await?
        };

        let elapsed = started.elapsed();
        if elapsed >= settings.config.max_query_time {
            info!(
                worker = %self.name,
                elapsed_ms = elapsed.as_millis() as u64,
                "Query took too long, making new prepared statements"
            );
            settings
                .metrics
                .increment(MetricCounter::RecalcPreparedStatement);
            self.connection()?.invalidate_statements().await?;
        }

        self.timestamps.insert(queue.to_string(), timestamp);
        Ok(timestamp)
    }

    async fn queue_timestamp(&mut self, queue: &str) -> Result<DateTime<Utc>> {
        let connection = self.connection()?;
        let oldest: Option<DateTime<Utc>> = sqlx::query_scalar(QUEUE_TIMESTAMP_SQL)
            .bind(queue)
            .fetch_optional(connection.statement(StatementKind::QueueTimestamp))
            .await
            .map_err(|e| ConsumerError::database("queue timestamp", e))?;
        if let Some(oldest) = oldest {
            return Ok(oldest);
        }
        sqlx::query_scalar(CURRENT_TIMESTAMP_SQL)
            .fetch_one(connection.statement(StatementKind::CurrentTimestamp))
            .await
            .map_err(|e| ConsumerError::database("current timestamp", e))
    }

    async fn claim(
        &mut self,
        queue: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<JobWithMetaData<T>>> {
        let settings = Arc::clone(&self.settings);
        let row = {
            let _timer = MetricTimerGuard::new(&*settings.metrics, MetricTimer::Dequeue);
            let _call = settings.health.database_call(&self.name);
            let connection = self.connection()?;
            sqlx::query(settings.sql.claim())
                .bind(queue)
                .bind(timestamp)
                .fetch_optional(connection.statement(StatementKind::Claim))
                .await
                .map_err(|e| ConsumerError::database("claim job", e))?
        };
        let Some(row) = row else {
            return Ok(None);
        };
        let meta = JobMetaData::from_row(&row)
            .map_err(|e| ConsumerError::database("decode job metadata", e))?;
        let job = settings
            .codec
            .create_job(&row, METADATA_COLUMN_COUNT)
            .map_err(|e| ConsumerError::database("decode job", e))?;
        Ok(Some(JobWithMetaData::new(meta, job)))
    }

    /// Run one claimed job and persist its outcome
    ///
    /// The failure throttle is told about every job exactly once. An error
    /// return means the transaction was lost and the connection should go.
    async fn process(&mut self, job: JobWithMetaData<T>) -> Result<()> {
        let settings = Arc::clone(&self.settings);
        match self.run_job(job).await {
            Ok(success) => {
                settings.failure_throttle.register(success);
                Ok(())
            }
            Err(e) => {
                error!(worker = %self.name, error = %e, "Rolling back");
                if let Ok(connection) = self.connection() {
                    if let Err(rollback_error) = connection.rollback().await {
                        error!(worker = %self.name, error = %rollback_error, "Error rolling back");
                    }
                }
                settings.failure_throttle.register(false);
                Err(e)
            }
        }
    }

    /// Returns what to register with the failure throttle
    async fn run_job(&mut self, job: JobWithMetaData<T>) -> Result<bool> {
        let settings = Arc::clone(&self.settings);
        let (meta, mut payload) = job.into_parts();

        self.connection()?.savepoint().await?;

        if let Some(deduplicate) = settings.deduplicate.as_deref() {
            if settings.deduplicate_disable.can_deduplicate() {
                payload = self.skip_duplicates(deduplicate, &meta, payload).await?;
            }
        }

        let consumer = Arc::clone(&self.consumer);
        let accepted = {
            let connection = self.connection()?;
            AssertUnwindSafe(consumer.accept(connection.raw(), &payload, &meta))
                .catch_unwind()
                .await
        };
        let outcome = match accepted {
            Ok(outcome) => outcome,
            Err(panic) => Err(QueueError::non_fatal(panic_message(&*panic))),
        };

        let error = match outcome {
            Ok(()) => {
                let connection = self.connection()?;
                connection.release_savepoint().await?;
                connection.commit().await?;
                log_job_operation("accept", &self.name, meta.consumer(), meta.tries(), "success", None);
                return Ok(true);
            }
            Err(error) => error,
        };

        self.connection()?.rollback_to_savepoint().await?;
        let exhausted = i64::from(meta.tries()) >= i64::from(settings.config.max_tries);
        match &error {
            QueueError::Postponed { delay, .. } if !exhausted => {
                debug!(worker = %self.name, delay_ms = delay.as_millis() as u64, error = %error, "Postponing job");
                if *delay > MAX_POSTPONE {
                    warn!(worker = %self.name, delay_ms = delay.as_millis() as u64, "Postponement capped");
                }
                self.postpone_job(&meta, &payload, postpone_delay_ms(*delay)).await?;
                self.connection()?.commit().await?;
                log_job_operation("postpone", &self.name, meta.consumer(), meta.tries(), "postponed", Some(&error.diag()));
            }
            QueueError::NonFatal { .. } if !exhausted => {
                debug!(worker = %self.name, error = %error, "Retrying job");
                self.retry_job(&meta, &payload).await?;
                self.connection()?.commit().await?;
                log_job_operation("retry", &self.name, meta.consumer(), meta.tries(), "retried", Some(&error.diag()));
            }
            _ => {
                let diag = error.diag();
                debug!(worker = %self.name, diag = %diag, "Failing job");
                // Commit the claim first, a failing archive insert must not requeue the job
                self.connection()?.commit().await?;
                self.connection()?.begin().await?;
                self.fail_job(&meta, &payload, &diag).await?;
                self.connection()?.commit().await?;
                log_job_operation("fail", &self.name, meta.consumer(), meta.tries(), "failed", Some(&diag));
            }
        }
        Ok(!error.throttles())
    }

    /// Delete queued duplicates of the job and merge them into it
    async fn skip_duplicates(
        &mut self,
        deduplicate: &dyn DeduplicateCodec<T>,
        meta: &JobMetaData,
        payload: T,
    ) -> Result<T> {
        let settings = Arc::clone(&self.settings);
        let Some(sql) = settings.sql.delete_duplicate() else {
            return Ok(payload);
        };

        let rows = {
            let _breaker = settings.deduplicate_disable.context();
            let _timer = MetricTimerGuard::new(&*settings.metrics, MetricTimer::DeleteDuplicate);
            let _call = settings.health.database_call(&self.name);
            let query = deduplicate.bind_duplicate_values(&payload, sqlx::query(sql).bind(meta.consumer()));
            let connection = self.connection()?;
            query
                .fetch_all(connection.statement(StatementKind::DeleteDuplicate))
                .await
                .map_err(|e| ConsumerError::database("delete duplicates", e))?
        };

        let mut payload = payload;
        for row in &rows {
            let skipped_meta = JobMetaData::from_row(row)
                .map_err(|e| ConsumerError::database("decode duplicate metadata", e))?;
            let skipped = settings
                .codec
                .create_job(row, METADATA_COLUMN_COUNT)
                .map_err(|e| ConsumerError::database("decode duplicate", e))?;
            payload = deduplicate.merge_job(payload, skipped);
            info!(worker = %self.name, skipped = %skipped_meta, "Skipping duplicate job");
        }
        Ok(payload)
    }

    async fn retry_job(&mut self, meta: &JobMetaData, payload: &T) -> Result<()> {
        let settings = Arc::clone(&self.settings);
        let _timer = MetricTimerGuard::new(&*settings.metrics, MetricTimer::Retry);
        let _call = settings.health.database_call(&self.name);
        let query = sqlx::query(settings.sql.retry())
            .bind(meta.consumer())
            .bind(meta.queued())
            .bind(meta.dequeue_after())
            .bind(meta.tries());
        let query = settings.codec.save_job(payload, query);
        let connection = self.connection()?;
        let result = query
            .execute(connection.statement(StatementKind::Retry))
            .await
            .map_err(|e| ConsumerError::database("retry job", e))?;
        if result.rows_affected() != 1 {
            warn!(worker = %self.name, rows = result.rows_affected(), "Strange: retrying job, modified rows");
        }
        Ok(())
    }

    async fn postpone_job(&mut self, meta: &JobMetaData, payload: &T, delay_ms: i64) -> Result<()> {
        let settings = Arc::clone(&self.settings);
        let _timer = MetricTimerGuard::new(&*settings.metrics, MetricTimer::Postpone);
        let _call = settings.health.database_call(&self.name);
        let query = sqlx::query(settings.sql.postpone())
            .bind(meta.consumer())
            .bind(meta.queued())
            .bind(delay_ms)
            .bind(meta.tries());
        let query = settings.codec.save_job(payload, query);
        let connection = self.connection()?;
        let result = query
            .execute(connection.statement(StatementKind::Postpone))
            .await
            .map_err(|e| ConsumerError::database("postpone job", e))?;
        if result.rows_affected() != 1 {
            warn!(worker = %self.name, rows = result.rows_affected(), "Strange: postponing job, modified rows");
        }
        Ok(())
    }

    async fn fail_job(&mut self, meta: &JobMetaData, payload: &T, diag: &str) -> Result<()> {
        let settings = Arc::clone(&self.settings);
        let _timer = MetricTimerGuard::new(&*settings.metrics, MetricTimer::Failure);
        let _call = settings.health.database_call(&self.name);
        let query = sqlx::query(settings.sql.failed())
            .bind(meta.consumer())
            .bind(meta.queued())
            .bind(diag);
        let query = settings.codec.save_job(payload, query);
        let connection = self.connection()?;
        let result = query
            .execute(connection.statement(StatementKind::Failed))
            .await
            .map_err(|e| ConsumerError::database("archive job", e))?;
        if result.rows_affected() != 1 {
            warn!(worker = %self.name, rows = result.rows_affected(), "Strange: writing diag job, modified rows");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postpone_delay_is_capped() {
        assert_eq!(postpone_delay_ms(Duration::from_millis(100)), 100);
        assert_eq!(postpone_delay_ms(MAX_POSTPONE), 31_536_000_000);
        assert_eq!(postpone_delay_ms(Duration::MAX), 31_536_000_000);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "panic: boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "panic: bang");
        let payload: Box<dyn Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(&*payload), "panic");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unless_stopped_interrupts_wait() {
        let (tx, mut rx) = watch::channel(true);
        let waiter = tokio::spawn(async move {
            unless_stopped(&mut rx, tokio::time::sleep(Duration::from_secs(3600))).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send_replace(false);
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unless_stopped_passes_output() {
        let (_tx, mut rx) = watch::channel(true);
        assert_eq!(unless_stopped(&mut rx, async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn test_unless_stopped_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(true);
        drop(tx);
        assert_eq!(
            unless_stopped(&mut rx, std::future::pending::<()>()).await,
            None
        );
    }
}
