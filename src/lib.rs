//! Converge operator
//!
//! Keeps the resources owned by product custom resources converged with a
//! freshly computed desired state. The [`updater`] module holds the
//! reconciliation engine; [`controllers`] drive it from watch events.

pub mod builders;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconcilers;
pub mod updater;

pub use error::{Error, Result};
