//! Generic kind adapter: list, convert, plan, create, patch and delete
//!
//! All cluster side effects of the updater happen here.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::{json, Map, Value};
use tracing::{debug, instrument, warn};

use crate::updater::desired::{DesiredResource, ResourceKind};
use crate::updater::kind::ManagedKind;
use crate::updater::observer::UpdateObserver;
use crate::updater::patch::merge_diff;
use crate::updater::plan::{build_plan, PlanSummary, ReconciliationPlan};
use crate::updater::selector::Selector;
use crate::{Error, Result};

/// Pod template annotation stamped by [`RolloutStrategy::RestartAnnotation`]
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// How a patched workload is made to restart its pods
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RolloutStrategy {
    /// Patch replicas to 0, then back to the desired count
    #[default]
    ScaleToZero,
    /// Stamp a restart timestamp on the pod template
    RestartAnnotation,
}

impl FromStr for RolloutStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "scaletozero" => Ok(RolloutStrategy::ScaleToZero),
            "restartannotation" | "restart" => Ok(RolloutStrategy::RestartAnnotation),
            other => Err(Error::ConfigError(format!(
                "unknown rollout strategy '{}'",
                other
            ))),
        }
    }
}

/// Flags for one kind within a pass
#[derive(Clone, Copy, Debug, Default)]
pub struct PassOptions {
    pub dry_run: bool,
    /// Patch workloads even when no drift is detected
    pub force: bool,
}

/// Result of converging one kind
#[derive(Clone, Debug)]
pub struct KindOutcome {
    pub summary: PlanSummary,
}

impl KindOutcome {
    /// Whether objects were (or in dry-run would be) created or patched
    pub fn changed(&self) -> bool {
        !self.summary.add.is_empty() || !self.summary.patch.is_empty()
    }
}

/// Object-safe face of a [`KindAdapter`], so adapters of different kinds can
/// be run in one ordered list.
pub trait KindUpdater: Send + Sync {
    fn kind(&self) -> ResourceKind;

    fn update<'a>(
        &'a self,
        options: PassOptions,
        observer: &'a dyn UpdateObserver,
    ) -> BoxFuture<'a, Result<KindOutcome>>;
}

/// Converges one kind within one namespace and label scope
pub struct KindAdapter<K: ManagedKind> {
    api: Api<K>,
    namespace: String,
    selector: Selector,
    desired: Vec<DesiredResource>,
    rollout: RolloutStrategy,
}

impl<K: ManagedKind> KindAdapter<K> {
    pub fn new(
        client: Client,
        namespace: &str,
        selector: Selector,
        desired: Vec<DesiredResource>,
        rollout: RolloutStrategy,
    ) -> Self {
        Self {
            api: K::api(client, namespace),
            namespace: namespace.to_string(),
            selector,
            desired,
            rollout,
        }
    }

    fn scope(&self) -> Option<&str> {
        K::KIND.is_namespaced().then_some(self.namespace.as_str())
    }

    fn scope_label(&self) -> &str {
        self.scope().unwrap_or_default()
    }

    /// Observed objects in scope. The server-side selector narrows the list;
    /// the client-side match is authoritative.
    pub async fn list(&self) -> Result<Vec<K>> {
        let mut lp = ListParams::default();
        if !self.selector.is_empty() {
            lp = lp.labels(&self.selector.to_string());
        }
        let list = self
            .api
            .list(&lp)
            .await
            .map_err(Error::api("list", K::KIND.as_str(), self.scope(), "*"))?;

        Ok(list
            .items
            .into_iter()
            .filter(|obj| self.selector.matches_meta(obj.meta()))
            .collect())
    }

    /// Convert the desired resources into typed objects keyed by name
    pub fn build_index(&self) -> Result<BTreeMap<String, K>> {
        let mut index = BTreeMap::new();
        for desired in &self.desired {
            let obj: K = desired.to_object(&self.namespace)?;
            if !self.selector.matches_meta(obj.meta()) {
                warn!(
                    kind = %K::KIND,
                    name = %desired.name,
                    selector = %self.selector,
                    "Desired object does not match the selector and would never be observed; skipping"
                );
                continue;
            }
            if index.insert(desired.name.clone(), obj).is_some() {
                return Err(Error::ConversionError(format!(
                    "duplicate desired {} named {}",
                    K::KIND,
                    desired.name
                )));
            }
        }
        Ok(index)
    }

    pub fn plan(
        &self,
        desired: BTreeMap<String, K>,
        observed: Vec<K>,
        force: bool,
    ) -> ReconciliationPlan<K> {
        let observed = observed
            .into_iter()
            .map(|obj| (obj.name_any(), obj))
            .collect();
        build_plan(desired, observed, force, K::has_drifted)
    }

    pub async fn create(&self, obj: &K) -> Result<()> {
        let name = obj.name_any();
        self.api
            .create(&PostParams::default(), obj)
            .await
            .map_err(Error::api("create", K::KIND.as_str(), self.scope(), &name))?;
        Ok(())
    }

    /// Create every object in order, stopping at the first failure
    pub async fn create_all(&self, objs: &[K], observer: &dyn UpdateObserver) -> Result<()> {
        for obj in objs {
            self.create(obj).await?;
            observer.on_create(K::KIND, self.scope_label(), &obj.name_any());
        }
        Ok(())
    }

    /// Delete by name; an object that is already gone counts as deleted
    pub async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                debug!(kind = %K::KIND, name, "Already deleted");
                Ok(())
            }
            Err(e) => Err(Error::api("delete", K::KIND.as_str(), self.scope(), name)(e)),
        }
    }

    /// Merge patch of the owned fields, guarded by the observed resourceVersion.
    /// Workloads are then rolled according to the rollout strategy.
    pub async fn patch(&self, observed: &K, desired: &K) -> Result<()> {
        let name = observed.name_any();
        let mut desired = desired.clone();
        desired.adopt_server_fields(observed);

        let mut body = merge_diff(&observed.owned_fields(), &desired.owned_fields())
            .unwrap_or_else(|| Value::Object(Map::new()));

        let mut metadata = Map::new();
        if let Some(rv) = &observed.meta().resource_version {
            metadata.insert("resourceVersion".into(), Value::String(rv.clone()));
        }
        if let Some(labels) = &desired.meta().labels {
            metadata.insert("labels".into(), serde_json::to_value(labels)?);
        }
        if let Value::Object(map) = &mut body {
            map.insert("metadata".into(), Value::Object(metadata));
        }

        let restart = K::KIND.is_workload() && self.rollout == RolloutStrategy::RestartAnnotation;
        if restart {
            stamp_restart(&mut body);
        }

        self.api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(Error::api("patch", K::KIND.as_str(), self.scope(), &name))?;

        if K::KIND.is_workload() && self.rollout == RolloutStrategy::ScaleToZero {
            self.scale_to_zero_and_back(&name, desired.replicas().unwrap_or(1))
                .await?;
        }
        Ok(())
    }

    async fn scale_to_zero_and_back(&self, name: &str, replicas: i32) -> Result<()> {
        for count in [0, replicas] {
            let body = json!({ "spec": { "replicas": count } });
            self.api
                .patch(name, &PatchParams::default(), &Patch::Merge(&body))
                .await
                .map_err(Error::api("scale", K::KIND.as_str(), self.scope(), name))?;
        }
        debug!(kind = %K::KIND, name, replicas, "Rolled workload through zero replicas");
        Ok(())
    }

    #[instrument(skip_all, fields(kind = %K::KIND, namespace = %self.namespace))]
    async fn run(&self, options: PassOptions, observer: &dyn UpdateObserver) -> Result<KindOutcome> {
        let desired = self.build_index()?;
        let observed = self.list().await?;
        let force = options.force && K::KIND.is_workload();
        let plan = self.plan(desired, observed, force);

        let summary = PlanSummary {
            kind: K::KIND,
            add: plan.to_add.iter().map(|o| o.name_any()).collect(),
            patch: plan.to_patch.iter().map(|p| p.observed.name_any()).collect(),
            remove: plan.to_remove.clone(),
            unchanged: plan.unchanged.clone(),
        };
        observer.on_plan(self.scope_label(), &summary, options.dry_run);

        if options.dry_run || plan.is_noop() {
            return Ok(KindOutcome { summary });
        }

        self.create_all(&plan.to_add, observer).await?;

        for pair in &plan.to_patch {
            self.patch(&pair.observed, &pair.desired).await?;
            observer.on_patch(K::KIND, self.scope_label(), &pair.observed.name_any());
        }

        for name in &plan.to_remove {
            self.delete(name).await?;
            observer.on_delete(K::KIND, self.scope_label(), name);
        }

        Ok(KindOutcome { summary })
    }
}

impl<K: ManagedKind> KindUpdater for KindAdapter<K> {
    fn kind(&self) -> ResourceKind {
        K::KIND
    }

    fn update<'a>(
        &'a self,
        options: PassOptions,
        observer: &'a dyn UpdateObserver,
    ) -> BoxFuture<'a, Result<KindOutcome>> {
        self.run(options, observer).boxed()
    }
}

fn stamp_restart(body: &mut Value) {
    let now = Utc::now().to_rfc3339();
    let stamp = json!({
        "spec": { "template": { "metadata": { "annotations": {
            RESTARTED_AT_ANNOTATION: now
        } } } }
    });
    merge_into(body, stamp);
}

/// Deep-merge `extra` into `body`; `extra` wins on conflicts
fn merge_into(body: &mut Value, extra: Value) {
    match (body, extra) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_into(existing, value)
                    }
                    _ => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, value) => *target = value,
    }
}
