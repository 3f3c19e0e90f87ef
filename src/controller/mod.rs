//! # Controller
//!
//! Core controller modules for the Pod timestamp annotation controller.
//!
//! - `leader`: Lease-based leader election gating the run loop
//! - `queue`: deduplicating, rate-limited work queue
//! - `reconciler`: reconcile function and worker pool
//! - `watch`: Pod watch cache and event enqueuer

pub mod leader;
pub mod queue;
pub mod reconciler;
pub mod watch;
