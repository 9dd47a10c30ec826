//! Metrics module.
//!
//! Collects delivery engine metrics and renders them in the Prometheus text
//! exposition format.
//!
//! # Features
//!
//! - Submission metrics (by priority and outcome, lane depth)
//! - Processing metrics (terminal states, retries, duration and queue-wait histograms)
//! - Circuit breaker trips and recoveries
//! - Dead-letter writes, replays and size
//!
//! # Example
//!
//! ```ignore
//! use courier::metrics::{MetricsCollector, PrometheusExporter};
//!
//! let collector = Arc::new(MetricsCollector::new());
//! collector.record_submission(Priority::High, true);
//!
//! let text = PrometheusExporter::new(collector).export();
//! ```

mod collector;
mod prometheus;

pub use collector::{DURATION_BUCKETS_MS, HistogramSnapshot, MetricsCollector, MetricsSnapshot};
pub use prometheus::PrometheusExporter;
