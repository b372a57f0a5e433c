//! Reconciliation logic for Alert resources

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::builders::{alert_components, instance_selector};
use crate::controllers::Context;
use crate::crd::{Alert, AlertStatus, Condition};
use crate::metrics::prometheus::{RECONCILE_DURATION, RECONCILIATIONS, RECONCILIATION_ERRORS};
use crate::reconcilers::split_key;
use crate::updater::{ComponentList, FanOut, PlanSummary, Updater};
use crate::{Error, Result};

const KIND: &str = "Alert";

/// Converges the resources owned by one Alert per `namespace/name` key
pub struct AlertReconciler {
    ctx: Arc<Context>,
    store: Store<Alert>,
}

impl AlertReconciler {
    pub fn new(ctx: Arc<Context>, store: Store<Alert>) -> Self {
        Self { ctx, store }
    }

    /// Reconcile the Alert identified by a `namespace/name` key.
    ///
    /// An Alert missing from the cache, or marked for deletion, has an empty
    /// desired set, so every object matching its selector is removed.
    #[instrument(skip(self))]
    pub async fn reconcile_key(&self, key: &str) -> Result<Vec<PlanSummary>> {
        let (namespace, name) = split_key(key)?;
        let namespace = namespace.ok_or_else(|| {
            Error::ValidationError(format!("Alert key '{}' has no namespace", key))
        })?;

        let start = Instant::now();
        RECONCILIATIONS.with_label_values(&[KIND]).inc();

        let alert = self
            .store
            .get(&ObjectRef::<Alert>::new(name).within(namespace))
            .filter(|alert| alert.metadata.deletion_timestamp.is_none());
        let result = self.converge(namespace, name, alert.as_deref()).await;

        RECONCILE_DURATION
            .with_label_values(&[KIND])
            .observe(start.elapsed().as_secs_f64());

        if result.is_err() {
            RECONCILIATION_ERRORS.with_label_values(&[KIND]).inc();
        }

        if let Some(alert) = alert.as_deref() {
            if !self.ctx.config.dry_run {
                self.update_status(alert, &result).await;
            }
        }

        result
    }

    /// Single entry point used by the controller
    pub async fn reconcile_one(&self, key: &str) -> Result<()> {
        self.reconcile_key(key).await.map(|_| ())
    }

    async fn converge(
        &self,
        namespace: &str,
        name: &str,
        alert: Option<&Alert>,
    ) -> Result<Vec<PlanSummary>> {
        let components = match alert {
            Some(alert) => alert_components(alert, &self.ctx.catalog)?,
            None => {
                info!(namespace, name, "Alert is gone, removing its resources");
                ComponentList::new()
            }
        };

        let updater = Updater::for_components(
            self.ctx.client.clone(),
            namespace,
            &instance_selector(namespace, name),
            &components,
            self.ctx.config.updater_options(),
        )?
        .with_observer(Arc::new(FanOut::standard()));

        updater.update().await
    }

    /// Best-effort status write; failures are logged and never fail the pass
    async fn update_status(&self, alert: &Alert, result: &Result<Vec<PlanSummary>>) {
        let namespace = alert.namespace().unwrap_or_default();
        let name = alert.name_any();
        let status = build_status(alert, result);

        if alert
            .status
            .as_ref()
            .is_some_and(|current| same_status(current, &status))
        {
            debug!(%namespace, %name, "Status unchanged");
            return;
        }

        let alerts: Api<Alert> = Api::namespaced(self.ctx.client.clone(), &namespace);
        let patch = serde_json::json!({ "status": status });
        match alerts
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => debug!(%namespace, %name, state = ?status.state, "Updated Alert status"),
            Err(e) => warn!(%namespace, %name, "Failed to update Alert status: {}", e),
        }
    }
}


/// Status reflecting the outcome of a pass
pub fn build_status(alert: &Alert, result: &Result<Vec<PlanSummary>>) -> AlertStatus {
    let now = Utc::now();
    let previous = alert.status.as_ref();

    let (state, message, converged) = match result {
        Ok(summaries) => {
            let changes: usize = summaries
                .iter()
                .map(|s| s.add.len() + s.patch.len() + s.remove.len())
                .sum();
            let state = if alert.spec.is_stopped() {
                "Stopped"
            } else {
                "Converged"
            };
            (state, format!("{} change(s) applied", changes), true)
        }
        Err(e) => ("Error", e.to_string(), false),
    };
    let spec_valid = !matches!(result, Err(Error::ValidationError(_)));

    let conditions = vec![
        condition(
            previous,
            "SpecValid",
            spec_valid,
            if spec_valid { "Valid" } else { "InvalidSpec" },
            if spec_valid {
                "Spec is valid".to_string()
            } else {
                message.clone()
            },
            now,
        ),
        condition(
            previous,
            "Converged",
            converged,
            state,
            message.clone(),
            now,
        ),
    ];

    AlertStatus {
        state: Some(state.to_string()),
        message: Some(message),
        observed_generation: alert.metadata.generation,
        last_update_time: Some(now),
        conditions,
    }
}

/// Keeps the previous transition time when the condition status is unchanged
fn condition(
    previous: Option<&AlertStatus>,
    type_: &str,
    status: bool,
    reason: &str,
    message: String,
    now: chrono::DateTime<Utc>,
) -> Condition {
    let status = if status { "True" } else { "False" }.to_string();
    let last_transition_time = previous
        .and_then(|p| p.conditions.iter().find(|c| c.type_ == type_))
        .filter(|c| c.status == status)
        .map(|c| c.last_transition_time)
        .unwrap_or(now);

    Condition {
        type_: type_.to_string(),
        status,
        last_transition_time,
        reason: Some(reason.to_string()),
        message: Some(message),
    }
}

/// Status writes trigger a watch event, so an unchanged status is not rewritten
fn same_status(current: &AlertStatus, new: &AlertStatus) -> bool {
    current.state == new.state
        && current.message == new.message
        && current.observed_generation == new.observed_generation
        && current.conditions.len() == new.conditions.len()
        && current
            .conditions
            .iter()
            .zip(&new.conditions)
            .all(|(a, b)| a.type_ == b.type_ && a.status == b.status && a.reason == b.reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::AlertSpec;
    use crate::updater::ResourceKind;

    fn alert(desired_state: Option<&str>) -> Alert {
        let mut spec: AlertSpec =
            serde_json::from_value(serde_json::json!({"version": "5.3.0"})).unwrap();
        spec.desired_state = desired_state.map(str::to_string);
        let mut alert = Alert::new("demo", spec);
        alert.metadata.namespace = Some("ops".to_string());
        alert.metadata.generation = Some(3);
        alert
    }

    fn summary(adds: &[&str]) -> PlanSummary {
        let mut s = PlanSummary::empty(ResourceKind::ConfigMap);
        s.add = adds.iter().map(|a| a.to_string()).collect();
        s
    }

    #[test]
    fn test_status_after_success() {
        let status = build_status(&alert(None), &Ok(vec![summary(&["a", "b"])]));
        assert_eq!(status.state.as_deref(), Some("Converged"));
        assert_eq!(status.message.as_deref(), Some("2 change(s) applied"));
        assert_eq!(status.observed_generation, Some(3));
        assert!(status.conditions.iter().all(|c| c.status == "True"));
    }

    #[test]
    fn test_status_when_stopped() {
        let status = build_status(&alert(Some("STOP")), &Ok(vec![]));
        assert_eq!(status.state.as_deref(), Some("Stopped"));
    }

    #[test]
    fn test_status_after_validation_error() {
        let status = build_status(
            &alert(None),
            &Err(Error::ValidationError("port out of range".to_string())),
        );
        assert_eq!(status.state.as_deref(), Some("Error"));
        let spec_valid = status
            .conditions
            .iter()
            .find(|c| c.type_ == "SpecValid")
            .unwrap();
        assert_eq!(spec_valid.status, "False");
    }

    #[test]
    fn test_unchanged_status_is_detected() {
        let mut a = alert(None);
        let first = build_status(&a, &Ok(vec![]));
        a.status = Some(first.clone());
        let second = build_status(&a, &Ok(vec![]));
        assert!(same_status(&first, &second));
        assert_eq!(
            first.conditions[0].last_transition_time,
            second.conditions[0].last_transition_time
        );

        let failed = build_status(&a, &Err(Error::KubeError("boom".to_string())));
        assert!(!same_status(&first, &failed));
    }
}
