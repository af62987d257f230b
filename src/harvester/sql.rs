//! SQL text for the queue operations, rendered once from the codec's columns.
//!
//! Metadata parameters carry explicit casts so a statement can be prepared
//! before any value is known.

use crate::job::METADATA_COLUMNS;
use std::fmt;

/// Oldest eligible row of one queue, answered from the `(consumer, dequeueAfter)` index
pub const QUEUE_TIMESTAMP_SQL: &str = "SELECT dequeueAfter FROM queue WHERE consumer=$1::TEXT \
     AND dequeueAfter<=clock_timestamp() \
     ORDER BY consumer, dequeueAfter LIMIT 1";

/// Lower bound used when a queue has no eligible row
///
/// Rows committed by a producer shortly before the probe may not have been
/// visible to it; the margin keeps them inside the claim window.
pub const CURRENT_TIMESTAMP_SQL: &str = "SELECT clock_timestamp() - INTERVAL '500 MILLISECONDS'";

/// Purpose of a prepared statement on a worker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    QueueTimestamp,
    CurrentTimestamp,
    Claim,
    DeleteDuplicate,
    Retry,
    Postpone,
    Failed,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatementKind::QueueTimestamp => "queue timestamp",
            StatementKind::CurrentTimestamp => "current timestamp",
            StatementKind::Claim => "claim",
            StatementKind::DeleteDuplicate => "delete duplicate",
            StatementKind::Retry => "retry",
            StatementKind::Postpone => "postpone",
            StatementKind::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Statements that depend on the job columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStatements {
    claim: String,
    retry: String,
    postpone: String,
    failed: String,
    delete_duplicate: Option<String>,
}

impl SqlStatements {
    /// Render the statements for `job_columns`, and the duplicate delete when
    /// `duplicate_columns` is given
    pub fn new(
        job_columns: &[&str],
        duplicate_columns: Option<&[&str]>,
        include_postponed_duplicates: bool,
    ) -> Self {
        let columns = job_columns.join(", ");
        let returning = if columns.is_empty() {
            METADATA_COLUMNS.to_string()
        } else {
            format!("{METADATA_COLUMNS}, {columns}")
        };

        let claim = format!(
            "DELETE FROM queue WHERE ctid=(SELECT ctid FROM queue WHERE consumer=$1::TEXT \
             AND dequeueAfter<=clock_timestamp() \
             AND dequeueAfter>=$2::TIMESTAMPTZ \
             ORDER BY consumer, dequeueAfter \
             FOR UPDATE SKIP LOCKED LIMIT 1) \
             RETURNING {returning}"
        );

        // Keeps the claimed eligibility time, which is in the past, so the
        // retry is due at once and keeps its place in the queue
        let retry = format!(
            "INSERT INTO queue({returning}) \
             VALUES($1::TEXT, $2::TIMESTAMPTZ, $3::TIMESTAMPTZ, $4::INTEGER{})",
            placeholders(5, job_columns.len())
        );

        let postpone = format!(
            "INSERT INTO queue({returning}) \
             VALUES($1::TEXT, $2::TIMESTAMPTZ, \
             clock_timestamp() + $3::BIGINT * INTERVAL '1 MILLISECOND', $4::INTEGER{})",
            placeholders(5, job_columns.len())
        );

        let error_columns = if columns.is_empty() {
            "consumer, queued, failedAt, diag".to_string()
        } else {
            format!("consumer, queued, failedAt, diag, {columns}")
        };
        let failed = format!(
            "INSERT INTO queue_error({error_columns}) \
             VALUES($1::TEXT, $2::TIMESTAMPTZ, clock_timestamp(), $3::TEXT{})",
            placeholders(4, job_columns.len())
        );

        let delete_duplicate = duplicate_columns
            .filter(|columns| !columns.is_empty())
            .map(|duplicate_columns| {
                // $1 is the consumer, duplicate values follow and are referenced twice
                let matches = duplicate_columns
                    .iter()
                    .enumerate()
                    .map(|(i, column)| format!("{column}=${}", i + 2))
                    .collect::<Vec<_>>()
                    .join(" AND ");
                let eligible = if include_postponed_duplicates {
                    ""
                } else {
                    " AND dequeueAfter<=clock_timestamp()"
                };
                format!(
                    "DELETE FROM queue WHERE consumer=$1::TEXT{eligible} \
                     AND ctid IN (SELECT ctid FROM queue WHERE consumer=$1::TEXT AND {matches} \
                     FOR UPDATE SKIP LOCKED) \
                     AND {matches} \
                     RETURNING {returning}"
                )
            });

        Self {
            claim,
            retry,
            postpone,
            failed,
            delete_duplicate,
        }
    }

    pub fn claim(&self) -> &str {
        &self.claim
    }

    pub fn retry(&self) -> &str {
        &self.retry
    }

    pub fn postpone(&self) -> &str {
        &self.postpone
    }

    pub fn failed(&self) -> &str {
        &self.failed
    }

    /// `None` when deduplication is not configured
    pub fn delete_duplicate(&self) -> Option<&str> {
        self.delete_duplicate.as_deref()
    }
}

/// `", $first, $first+1, ..."` for `count` job columns
fn placeholders(first: usize, count: usize) -> String {
    (first..first + count).map(|n| format!(", ${n}")).collect()
}
