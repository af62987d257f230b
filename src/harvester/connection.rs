//! A worker's database connection and the statements prepared on it.

use super::sql::StatementKind;
use crate::error::{ConsumerError, Result};
use sqlx::{Connection, Executor, PgConnection};
use std::collections::HashSet;
use tracing::{debug, warn};

const JOB_SAVEPOINT: &str = "pgqueue_job";

/// Statement purposes prepared on the current connection
///
/// The statements themselves live in the connection's statement cache; this
/// only tracks which ones exist so they can be invalidated together.
#[derive(Debug, Default)]
pub struct PreparedStatements {
    prepared: HashSet<StatementKind>,
}

impl PreparedStatements {
    /// Record that `kind` is about to be used, returns true on first use
    pub fn mark(&mut self, kind: StatementKind) -> bool {
        let new = self.prepared.insert(kind);
        if new {
            debug!(statement = %kind, "Preparing statement");
        }
        new
    }

    pub fn len(&self) -> usize {
        self.prepared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prepared.is_empty()
    }

    fn clear(&mut self) {
        self.prepared.clear();
    }
}

/// One dedicated connection, driven one transaction per job
pub struct WorkerConnection {
    connection: PgConnection,
    prepared: PreparedStatements,
}

impl WorkerConnection {
    pub fn new(connection: PgConnection) -> Self {
        Self {
            connection,
            prepared: PreparedStatements::default(),
        }
    }

    /// The connection, for running the statement of purpose `kind`
    pub fn statement(&mut self, kind: StatementKind) -> &mut PgConnection {
        self.prepared.mark(kind);
        &mut self.connection
    }

    /// The connection, for the job consumer
    pub fn raw(&mut self) -> &mut PgConnection {
        &mut self.connection
    }

    pub fn prepared(&self) -> &PreparedStatements {
        &self.prepared
    }

    pub async fn begin(&mut self) -> Result<()> {
        self.command("BEGIN").await
    }

    pub async fn savepoint(&mut self) -> Result<()> {
        self.command(&format!("SAVEPOINT {JOB_SAVEPOINT}")).await
    }

    pub async fn rollback_to_savepoint(&mut self) -> Result<()> {
        self.command(&format!("ROLLBACK TO SAVEPOINT {JOB_SAVEPOINT}"))
            .await
    }

    pub async fn release_savepoint(&mut self) -> Result<()> {
        self.command(&format!("RELEASE SAVEPOINT {JOB_SAVEPOINT}"))
            .await
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.command("COMMIT").await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.command("ROLLBACK").await
    }

    async fn command(&mut self, sql: &str) -> Result<()> {
        // Simple query protocol, nothing is prepared
        self.connection
            .execute(sql)
            .await
            .map_err(|e| ConsumerError::database(sql, e))?;
        Ok(())
    }

    /// Drop every prepared statement, so the next use is planned again
    pub async fn invalidate_statements(&mut self) -> Result<()> {
        self.prepared.clear();
        self.connection
            .clear_cached_statements()
            .await
            .map_err(|e| ConsumerError::database("clear prepared statements", e))
    }

    /// Close the connection, logging rather than failing
    pub async fn close(self) {
        if let Err(e) = self.connection.close().await {
            warn!(error = %e, "Error closing connection");
        }
    }
}
