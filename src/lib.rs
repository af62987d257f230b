#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # PgQueue Consumer
//!
//! Durable, ordered job queue on top of PostgreSQL tables. Rows are messages;
//! a pool of workers claims them with `FOR UPDATE SKIP LOCKED` and processes
//! each job inside the transaction that claimed it.
//!
//! ## Delivery
//!
//! - **At least once**: a job that fails is retried until `max_tries`, then
//!   archived in `queue_error` with a diagnostic.
//! - **Ordered per worker**: queue names are tried in declared order, and
//!   within a queue rows are claimed by eligibility time.
//! - **Backoff**: a connect throttle and a failure throttle keep a broken
//!   database or a poison job from turning into a hot loop.
//!
//! ## Module Organization
//!
//! - [`builder`] - Assembles a [`Harvester`] from settings and collaborators
//! - [`harvester`] - Worker pool, SQL rendering and the per-worker state machine
//! - [`storage`] - Job column mapping and duplicate merging traits
//! - [`consumer`] - The job processing trait
//! - [`resilience`] - Throttle and deduplication breaker
//! - [`config`] - Tunables, environment overrides and defaults
//! - [`metrics`] - Counter and timer sink
//! - [`health`] - Hung worker detection
//! - [`error`] - Job outcomes and infrastructure errors
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use pgqueue_consumer::{JobCodec, JobConsumer, JobMetaData, PgQuery, QueueError, QueueWorkerBuilder};
//! use sqlx::postgres::PgRow;
//! use sqlx::{PgConnection, PgPool, Row};
//! use std::time::Duration;
//!
//! struct TextCodec;
//!
//! impl JobCodec<String> for TextCodec {
//!     fn columns(&self) -> &[&str] {
//!         &["job"]
//!     }
//!
//!     fn create_job(&self, row: &PgRow, start: usize) -> Result<String, sqlx::Error> {
//!         row.try_get(start)
//!     }
//!
//!     fn save_job<'q>(&self, job: &String, query: PgQuery<'q>) -> PgQuery<'q> {
//!         query.bind(job.clone())
//!     }
//! }
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl JobConsumer<String> for Printer {
//!     async fn accept(
//!         &self,
//!         _connection: &mut PgConnection,
//!         job: &String,
//!         metadata: &JobMetaData,
//!     ) -> Result<(), QueueError> {
//!         println!("{job} (try {})", metadata.tries());
//!         Ok(())
//!     }
//! }
//!
//! # async fn example(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let harvester = QueueWorkerBuilder::new(TextCodec)
//!     .consume(["mail"])
//!     .data_source(pool)
//!     .build_with(2, Printer)?;
//! harvester.start()?;
//! tokio::time::sleep(Duration::from_secs(60)).await;
//! harvester.stop()?;
//! harvester.await_termination(Duration::from_secs(10)).await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod consumer;
pub mod data_source;
pub mod error;
pub mod harvester;
pub mod health;
pub mod job;
pub mod logging;
pub mod metrics;
pub mod resilience;
pub mod storage;

pub use builder::QueueWorkerBuilder;
pub use config::{ConfigOverrides, ConsumerConfig};
pub use consumer::JobConsumer;
pub use data_source::DataSource;
pub use error::{ConsumerError, QueueError, Result};
pub use harvester::Harvester;
pub use health::QueueHealth;
pub use job::{JobMetaData, JobWithMetaData};
pub use metrics::{MetricCounter, MetricTimer, NoopMetrics, OpenTelemetryMetrics, QueueMetrics};
pub use resilience::{DeduplicateDisable, Throttle};
pub use storage::{DeduplicateCodec, JobCodec, PgQuery};
