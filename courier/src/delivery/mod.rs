//! Alert delivery engine.
//!
//! Jobs enter through [`DeliveryService::submit`], wait in one of three
//! priority lanes, and are executed by a fixed worker pool. Each attempt is
//! guarded by the destination's circuit breaker; failures are classified and
//! either retried with exponential backoff or written to the dead-letter
//! store. A bounded tracking store answers status queries.

pub mod circuit_breaker;
pub mod classifier;
pub mod dead_letter;
pub mod destination;
pub mod dispatcher;
pub mod job;
pub mod maintenance;
pub mod query;
pub mod retry;
pub mod service;
pub mod tracking;
pub mod webhook;
pub mod worker_pool;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerInfo, CircuitBreakerManager, CircuitState,
    CircuitTransition,
};
pub use classifier::{DeliveryError, ErrorClass, classify, classify_status};
pub use dead_letter::{DeadLetterConfig, DeadLetterEntry, DeadLetterStore, ReplayMarker};
pub use destination::{
    Destination, DestinationKind, DestinationRegistry, Publisher, RegisteredDestination,
};
pub use dispatcher::{DispatcherConfig, LaneStats, PriorityDispatcher};
pub use job::{AlertPayload, AlertStatus, Job, JobId, JobState, Priority, Severity};
pub use maintenance::MaintenanceScheduler;
pub use query::{DeadLetterFilter, JobFilter, Page};
pub use retry::{RetryConfig, RetryEngine, RetryOutcome};
pub use service::{DeliveryService, QueueStats};
pub use tracking::{JobStatusSnapshot, JobTracker, TrackingConfig};
pub use webhook::WebhookPublisher;
pub use worker_pool::{ShutdownReport, WorkerPool, WorkerPoolConfig};
