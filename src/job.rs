//! # Job Model
//!
//! The metadata envelope attached to every claimed job.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::fmt;

/// Queue-owned columns, in the order they are selected and inserted
pub const METADATA_COLUMNS: &str = "consumer, queued, dequeueAfter, tries";

/// Number of columns in [`METADATA_COLUMNS`]; job columns start at this offset
pub const METADATA_COLUMN_COUNT: usize = 4;

/// Where and when a job was queued and how often it has been tried
///
/// `tries` counts the current attempt, so the first delivery of a freshly
/// enqueued row reports `1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMetaData {
    consumer: String,
    queued: DateTime<Utc>,
    dequeue_after: DateTime<Utc>,
    tries: i32,
}

impl JobMetaData {
    pub fn new(
        consumer: impl Into<String>,
        queued: DateTime<Utc>,
        dequeue_after: DateTime<Utc>,
        tries: i32,
    ) -> Self {
        Self {
            consumer: consumer.into(),
            queued,
            dequeue_after,
            tries,
        }
    }

    /// Read the metadata columns from a claimed row
    pub fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let stored_tries: i32 = row.try_get(3)?;
        Ok(Self {
            consumer: row.try_get(0)?,
            queued: row.try_get(1)?,
            dequeue_after: row.try_get(2)?,
            tries: stored_tries.saturating_add(1),
        })
    }

    /// Queue name the job was enqueued on
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// When the job was originally enqueued
    pub fn queued(&self) -> DateTime<Utc> {
        self.queued
    }

    /// When the job became eligible for this attempt
    pub fn dequeue_after(&self) -> DateTime<Utc> {
        self.dequeue_after
    }

    /// The attempt number, starting at 1
    pub fn tries(&self) -> i32 {
        self.tries
    }
}

impl fmt::Display for JobMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Job{{consumer={}, queued={}, dequeueAfter={}, tries={}}}",
            self.consumer,
            self.queued.to_rfc3339(),
            self.dequeue_after.to_rfc3339(),
            self.tries
        )
    }
}

/// A decoded job together with its metadata
#[derive(Debug, Clone, PartialEq)]
pub struct JobWithMetaData<T> {
    meta: JobMetaData,
    job: T,
}

impl<T> JobWithMetaData<T> {
    pub fn new(meta: JobMetaData, job: T) -> Self {
        Self { meta, job }
    }

    pub fn meta(&self) -> &JobMetaData {
        &self.meta
    }

    pub fn into_parts(self) -> (JobMetaData, T) {
        (self.meta, self.job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_metadata_display() {
        let queued = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let meta = JobMetaData::new("foo", queued, queued, 2);
        assert_eq!(
            meta.to_string(),
            "Job{consumer=foo, queued=2024-03-01T12:00:00+00:00, dequeueAfter=2024-03-01T12:00:00+00:00, tries=2}"
        );
    }

    #[test]
    fn test_column_count_matches_columns() {
        assert_eq!(METADATA_COLUMNS.split(',').count(), METADATA_COLUMN_COUNT);
    }

    #[test]
    fn test_into_parts_keeps_metadata() {
        let now = Utc::now();
        let job = JobWithMetaData::new(JobMetaData::new("foo", now, now, 1), "a".to_string());
        assert_eq!(job.meta().consumer(), "foo");
        let (meta, job) = job.into_parts();
        assert_eq!(job, "a");
        assert_eq!(meta.tries(), 1);
    }
}
