//! # Job Storage Traits
//!
//! Column mapping between a job value and the queue tables. The engine owns
//! the queue metadata columns; a [`JobCodec`] owns the rest.

use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::Postgres;

/// A query whose placeholders are being filled in order
pub type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Maps a job to and from its columns
///
/// Values must be bound in the same order as [`JobCodec::columns`] lists the
/// columns.
pub trait JobCodec<T>: Send + Sync + 'static {
    /// Job column names, in bind order
    fn columns(&self) -> &[&str];

    /// Decode a job from a row, reading job columns from index `start`
    fn create_job(&self, row: &PgRow, start: usize) -> Result<T, sqlx::Error>;

    /// Bind the job's column values onto `query`
    fn save_job<'q>(&self, job: &T, query: PgQuery<'q>) -> PgQuery<'q>;
}

/// Finds and merges duplicate jobs
///
/// Duplicate columns must be indexed together with `consumer` and must not
/// hold NULL, since NULL never compares equal.
pub trait DeduplicateCodec<T>: Send + Sync + 'static {
    /// Columns that identify a duplicate, in bind order
    fn duplicate_columns(&self) -> &[&str];

    /// Bind the job's values for [`DeduplicateCodec::duplicate_columns`]
    fn bind_duplicate_values<'q>(&self, job: &T, query: PgQuery<'q>) -> PgQuery<'q>;

    /// Fold a skipped duplicate into the job that will run
    fn merge_job(&self, original: T, skipped: T) -> T;
}
