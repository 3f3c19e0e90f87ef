//! # Observability
//!
//! Prometheus metrics for the controller. Served over HTTP by
//! [`crate::server`].

pub mod metrics;
