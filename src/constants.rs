//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Annotation key written by the reconciler once a Pod has been stamped
pub const TIMESTAMP_ANNOTATION: &str = "timestamp";

/// Gate annotation: when gating is enabled, only Pods carrying this
/// annotation are stamped
pub const GATE_ANNOTATION: &str = "add-timestamp";

/// Leader election lock (Lease) name shared by all replicas
pub const LEASE_LOCK_NAME: &str = "pod-timestamp-annotation-reconciler";

/// Default number of concurrent reconcile workers
pub const DEFAULT_WORKERS: usize = 10;

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// How long to wait for the initial cache sync before aborting startup (seconds)
pub const CACHE_SYNC_TIMEOUT_SECS: u64 = 60;

/// Work queue exponential backoff starting value (milliseconds)
pub const QUEUE_BASE_DELAY_MS: u64 = 1000;

/// Work queue exponential backoff ceiling (seconds)
pub const QUEUE_MAX_DELAY_SECS: u64 = 300;

/// Leader election lease duration (seconds)
/// A replica whose lease has not been renewed for this long is considered dead
pub const LEASE_DURATION_SECS: i32 = 15;

/// Leader election renew deadline (seconds)
/// The holder gives up leadership if renewal fails for this long
pub const RENEW_DEADLINE_SECS: u64 = 10;

/// Leader election retry period (seconds)
pub const RETRY_PERIOD_SECS: u64 = 2;
