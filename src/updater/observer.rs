//! Observer hooks for updater passes
//!
//! The updater reports what it plans and does through [`UpdateObserver`]; the
//! operator installs [`TracingObserver`] and [`MetricsObserver`], tests install
//! recorders.

use std::sync::Arc;

use tracing::{error, info};

use crate::metrics::prometheus::{UPDATER_ERRORS, UPDATER_OPERATIONS};
use crate::updater::desired::ResourceKind;
use crate::updater::plan::PlanSummary;
use crate::Error;

/// Receives plan and mutation events from the updater
pub trait UpdateObserver: Send + Sync {
    /// Called once per kind after the plan is built, also in dry-run
    fn on_plan(&self, _namespace: &str, _summary: &PlanSummary, _dry_run: bool) {}

    fn on_create(&self, _kind: ResourceKind, _namespace: &str, _name: &str) {}

    fn on_patch(&self, _kind: ResourceKind, _namespace: &str, _name: &str) {}

    fn on_delete(&self, _kind: ResourceKind, _namespace: &str, _name: &str) {}

    /// Called with the error that aborts the pass
    fn on_error(&self, _kind: ResourceKind, _namespace: &str, _error: &Error) {}
}

/// Structured log lines for every plan and mutation
#[derive(Clone, Debug, Default)]
pub struct TracingObserver;

impl UpdateObserver for TracingObserver {
    fn on_plan(&self, namespace: &str, summary: &PlanSummary, dry_run: bool) {
        if summary.is_empty() {
            return;
        }
        info!(
            kind = %summary.kind,
            namespace,
            dry_run,
            add = ?summary.add,
            patch = ?summary.patch,
            remove = ?summary.remove,
            "Planned changes"
        );
    }

    fn on_create(&self, kind: ResourceKind, namespace: &str, name: &str) {
        info!(%kind, namespace, name, "Created");
    }

    fn on_patch(&self, kind: ResourceKind, namespace: &str, name: &str) {
        info!(%kind, namespace, name, "Patched");
    }

    fn on_delete(&self, kind: ResourceKind, namespace: &str, name: &str) {
        info!(%kind, namespace, name, "Deleted");
    }

    fn on_error(&self, kind: ResourceKind, namespace: &str, err: &Error) {
        error!(%kind, namespace, error = %err, "Update pass aborted");
    }
}

/// Prometheus counters per kind and operation
#[derive(Clone, Debug, Default)]
pub struct MetricsObserver;

impl UpdateObserver for MetricsObserver {
    fn on_create(&self, kind: ResourceKind, _namespace: &str, _name: &str) {
        UPDATER_OPERATIONS
            .with_label_values(&[kind.as_str(), "create"])
            .inc();
    }

    fn on_patch(&self, kind: ResourceKind, _namespace: &str, _name: &str) {
        UPDATER_OPERATIONS
            .with_label_values(&[kind.as_str(), "patch"])
            .inc();
    }

    fn on_delete(&self, kind: ResourceKind, _namespace: &str, _name: &str) {
        UPDATER_OPERATIONS
            .with_label_values(&[kind.as_str(), "delete"])
            .inc();
    }

    fn on_error(&self, kind: ResourceKind, _namespace: &str, err: &Error) {
        UPDATER_ERRORS
            .with_label_values(&[kind.as_str(), err.metric_label()])
            .inc();
    }
}

/// Forwards every event to each inner observer in order
#[derive(Clone, Default)]
pub struct FanOut {
    observers: Vec<Arc<dyn UpdateObserver>>,
}

impl FanOut {
    pub fn new(observers: Vec<Arc<dyn UpdateObserver>>) -> Self {
        Self { observers }
    }

    /// Logging plus metrics, as installed by the operator
    pub fn standard() -> Self {
        Self::new(vec![Arc::new(TracingObserver), Arc::new(MetricsObserver)])
    }

    pub fn push(&mut self, observer: Arc<dyn UpdateObserver>) {
        self.observers.push(observer);
    }
}

impl UpdateObserver for FanOut {
    fn on_plan(&self, namespace: &str, summary: &PlanSummary, dry_run: bool) {
        for o in &self.observers {
            o.on_plan(namespace, summary, dry_run);
        }
    }

    fn on_create(&self, kind: ResourceKind, namespace: &str, name: &str) {
        for o in &self.observers {
            o.on_create(kind, namespace, name);
        }
    }

    fn on_patch(&self, kind: ResourceKind, namespace: &str, name: &str) {
        for o in &self.observers {
            o.on_patch(kind, namespace, name);
        }
    }

    fn on_delete(&self, kind: ResourceKind, namespace: &str, name: &str) {
        for o in &self.observers {
            o.on_delete(kind, namespace, name);
        }
    }

    fn on_error(&self, kind: ResourceKind, namespace: &str, err: &Error) {
        for o in &self.observers {
            o.on_error(kind, namespace, err);
        }
    }
}
