//! # Resilience Module
//!
//! Backoff and breaker primitives that protect the database from the queue
//! workers.
//!
//! - [`Throttle`]: multi-rule sliding-window limiter. One instance guards
//!   database connects, another slows workers down when jobs keep failing.
//! - [`DeduplicateDisable`]: switches the duplicate-delete lookup off for a
//!   while when it gets too slow.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pgqueue_consumer::resilience::Throttle;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // At most 3 failures per half second, and 5 per minute that a success does not clear
//! let throttle = Throttle::new("3/500ms, 5/m!")?;
//!
//! throttle.throttle().await;
//! let succeeded = true; // attempt something
//! throttle.register(succeeded);
//! # Ok(())
//! # }
//! ```

pub mod deduplicate;
pub mod throttle;

pub use deduplicate::{Clock, DeduplicateDisable, DeduplicateTimer, SystemClock};
pub use throttle::{Throttle, ThrottleRule};
