//! # Pod Timestamp Controller
//!
//! A Kubernetes controller that annotates Pods with the time they were first
//! seen.
//!
//! ## Overview
//!
//! The controller listens on Pod add and update events and adds a
//! `timestamp` annotation to Pods that don't already carry one. It can be
//! restricted to a single namespace, gated so that only Pods annotated with
//! `add-timestamp` are stamped, and coordinated across replicas with leader
//! election so exactly one instance reconciles at a time.
//!
//! ## Architecture
//!
//! 1. **Watch cache** - a reflector mirrors the watched Pods locally
//! 2. **Work queue** - add/update events enqueue deduplicated Pod keys
//! 3. **Worker pool** - a fixed set of workers drains the queue and runs the
//!    idempotent reconcile function; failures requeue with capped
//!    exponential backoff
//! 4. **Leader election** (optional) - a Lease lock admits one active
//!    replica
//!
//! Writes carry the cached `resourceVersion`, so concurrent modifications
//! surface as conflicts and retry instead of clobbering each other.
//!
//! ## Usage
//!
//! See the [README.md](../README.md) for deployment instructions.

pub mod constants;
pub mod controller;
pub mod observability;
pub mod server;
