//! # Data Source
//!
//! Where queue workers get their connections from. Every worker holds one
//! dedicated connection for as long as it stays healthy.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, PgConnection, PgPool, Postgres};
use std::str::FromStr;

/// Connection factory for queue workers
#[async_trait]
pub trait DataSource: Send + Sync + 'static {
    async fn connect(&self) -> Result<PgConnection, sqlx::Error>;
}

#[async_trait]
impl DataSource for PgConnectOptions {
    async fn connect(&self) -> Result<PgConnection, sqlx::Error> {
        ConnectOptions::connect(self).await
    }
}

/// Connections are detached from the pool, a worker keeps its connection
/// across many transactions
#[async_trait]
impl DataSource for PgPool {
    async fn connect(&self) -> Result<PgConnection, sqlx::Error> {
        let connection: PoolConnection<Postgres> = self.acquire().await?;
        Ok(connection.detach())
    }
}

/// Build a data source from a `postgres://` URL
pub fn from_url(url: &str) -> Result<PgConnectOptions, sqlx::Error> {
    PgConnectOptions::from_str(url)
}

/// Build a data source from `DATABASE_URL`
pub fn from_env() -> Result<PgConnectOptions, sqlx::Error> {
    let url = std::env::var("DATABASE_URL")
        .map_err(|_| sqlx::Error::Configuration("DATABASE_URL is not set".into()))?;
    from_url(&url)
}
