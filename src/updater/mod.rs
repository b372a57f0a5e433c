//! Reconciliation engine
//!
//! Converges the resources of one owner with a freshly built desired set. For
//! each kind in a fixed order the updater lists what exists under the owner's
//! label selector, plans adds, patches and removals, and applies them.

pub mod adapter;
pub mod desired;
pub mod drift;
pub mod kind;
pub mod observer;
pub mod patch;
pub mod plan;
pub mod quantity;
pub mod selector;

use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{
    ConfigMap, ReplicationController, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::Client;
use tracing::{debug, info, instrument};

pub use adapter::{KindAdapter, KindOutcome, KindUpdater, PassOptions, RolloutStrategy};
pub use desired::{ComponentList, DesiredResource, ResourceKind};
pub use kind::ManagedKind;
pub use observer::{FanOut, MetricsObserver, TracingObserver, UpdateObserver};
pub use plan::PlanSummary;
pub use selector::Selector;

use crate::Result;

/// Behaviour switches for a pass
#[derive(Clone, Copy, Debug, Default)]
pub struct UpdaterOptions {
    /// Plan and report only; make no mutating call
    pub dry_run: bool,
    /// Patch workloads even when no drift is detected
    pub force_patch: bool,
    pub rollout: RolloutStrategy,
    /// Reject malformed selector clauses instead of dropping them
    pub strict_selectors: bool,
}

/// Ordered list of kind adapters run as one pass
pub struct Updater {
    updaters: Vec<Box<dyn KindUpdater>>,
    options: UpdaterOptions,
    observer: Arc<dyn UpdateObserver>,
    /// Namespace reported to observers on error
    namespace: String,
}

impl Updater {
    pub fn new(options: UpdaterOptions) -> Self {
        Self {
            updaters: Vec::new(),
            options,
            observer: Arc::new(TracingObserver),
            namespace: String::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn UpdateObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Append an adapter; adapters run in registration order
    pub fn register(&mut self, updater: Box<dyn KindUpdater>) {
        self.updaters.push(updater);
    }

    /// Kinds in the order they will run
    pub fn kinds(&self) -> Vec<ResourceKind> {
        self.updaters.iter().map(|u| u.kind()).collect()
    }

    /// Build an updater for `components` with one adapter per managed kind.
    ///
    /// Every kind is registered, including kinds with no desired objects, so
    /// leftovers matching the selector are removed.
    pub fn for_components(
        client: Client,
        namespace: &str,
        selector: &str,
        components: &ComponentList,
        options: UpdaterOptions,
    ) -> Result<Self> {
        let selector = if options.strict_selectors {
            Selector::parse_strict(selector)?
        } else {
            Selector::parse(selector)
        };

        let mut updater = Updater::new(options);
        updater.namespace = namespace.to_string();
        for kind in ResourceKind::ORDERED {
            let desired = components.of_kind(kind);
            let client = client.clone();
            let selector = selector.clone();
            let rollout = options.rollout;
            let boxed: Box<dyn KindUpdater> = match kind {
                ResourceKind::ServiceAccount => Box::new(KindAdapter::<ServiceAccount>::new(
                    client, namespace, selector, desired, rollout,
                )),
                ResourceKind::ClusterRole => Box::new(KindAdapter::<ClusterRole>::new(
                    client, namespace, selector, desired, rollout,
                )),
                ResourceKind::ClusterRoleBinding => Box::new(
                    KindAdapter::<ClusterRoleBinding>::new(
                        client, namespace, selector, desired, rollout,
                    ),
                ),
                ResourceKind::ConfigMap => Box::new(KindAdapter::<ConfigMap>::new(
                    client, namespace, selector, desired, rollout,
                )),
                ResourceKind::Secret => Box::new(KindAdapter::<Secret>::new(
                    client, namespace, selector, desired, rollout,
                )),
                ResourceKind::Service => Box::new(KindAdapter::<Service>::new(
                    client, namespace, selector, desired, rollout,
                )),
                ResourceKind::ReplicationController => Box::new(
                    KindAdapter::<ReplicationController>::new(
                        client, namespace, selector, desired, rollout,
                    ),
                ),
                ResourceKind::Deployment => Box::new(KindAdapter::<Deployment>::new(
                    client, namespace, selector, desired, rollout,
                )),
                ResourceKind::StatefulSet => Box::new(KindAdapter::<StatefulSet>::new(
                    client, namespace, selector, desired, rollout,
                )),
            };
            updater.register(boxed);
        }
        Ok(updater)
    }

    /// Run every adapter in order.
    ///
    /// The first error aborts the pass; kinds already converged stay applied.
    /// Returns the per-kind plan summaries.
    #[instrument(skip(self), fields(dry_run = self.options.dry_run))]
    pub async fn update(&self) -> Result<Vec<PlanSummary>> {
        let mut summaries = Vec::with_capacity(self.updaters.len());
        let mut config_changed = false;

        for updater in &self.updaters {
            let kind = updater.kind();
            let options = PassOptions {
                dry_run: self.options.dry_run,
                force: self.options.force_patch || config_changed,
            };

            let outcome = match updater.update(options, self.observer.as_ref()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.observer.on_error(kind, &self.namespace, &e);
                    return Err(e);
                }
            };

            if kind.carries_config() && outcome.changed() {
                debug!(%kind, "Configuration changed; workloads will be rolled");
                config_changed = true;
            }
            summaries.push(outcome.summary);
        }

        let changes: usize = summaries
            .iter()
            .map(|s| s.add.len() + s.patch.len() + s.remove.len())
            .sum();
        info!(changes, "Update pass complete");
        Ok(summaries)
    }
}
