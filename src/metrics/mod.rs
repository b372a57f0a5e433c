//! Prometheus metrics for the operator
//!
//! Reconciliation, updater and requeue metrics, plus the HTTP endpoint
//! that serves them alongside the health endpoints.

pub mod prometheus;

pub use prometheus::*;
