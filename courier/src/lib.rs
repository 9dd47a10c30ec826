//! courier library crate.
//!
//! Asynchronous alert notification delivery: priority lanes, a worker pool,
//! retries with backoff, per-destination circuit breakers and a persistent
//! dead-letter store.

pub mod config;
pub mod database;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{Error, Result};
