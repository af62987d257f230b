//! # Job Consumer Trait
//!
//! The processing hook a queue worker calls for every claimed job.

use crate::error::QueueError;
use crate::job::JobMetaData;
use async_trait::async_trait;
use sqlx::PgConnection;

/// Trait for the code that processes dequeued jobs
///
/// The job runs inside the transaction that claimed it. Database work done
/// through `connection` is committed together with the removal of the job,
/// and rolled back when an error is returned.
#[async_trait]
pub trait JobConsumer<T>: Send + Sync {
    /// Process one job
    ///
    /// # Returns
    ///
    /// * `Ok(())` - The job is done and removed from the queue
    /// * `Err(QueueError::NonFatal)` - Retry right away
    /// * `Err(QueueError::Postponed)` - Retry once the delay has passed
    /// * `Err(QueueError::Fatal)` - Move the job to the error table
    ///
    /// A panic is handled like a non-fatal error. Retries stop once
    /// `metadata.tries()` reaches the configured max tries, and the job is
    /// archived instead.
    async fn accept(
        &self,
        connection: &mut PgConnection,
        job: &T,
        metadata: &JobMetaData,
    ) -> Result<(), QueueError>;
}
