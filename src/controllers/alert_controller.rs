//! Controller for Alert resources
//!
//! `Controller` watches Alerts and the objects they own, deduplicates
//! triggers per Alert and never runs two passes for the same Alert at once.
//! Each pass goes through [`AlertReconciler::reconcile_one`].

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use governor::DefaultDirectRateLimiter;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use kube::{Api, Resource, ResourceExt};
use kube_runtime::controller::{self, Action, Controller};
use kube_runtime::finalizer::{finalizer, Event};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::builders::{APP_LABEL, APP_NAME, INSTANCE_LABEL, INSTANCE_NAMESPACE_LABEL};
use crate::controllers::backoff::{reconcile_limiter, KeyedBackoff};
use crate::controllers::Context;
use crate::crd::Alert;
use crate::metrics::prometheus::RECONCILE_REQUEUES;
use crate::reconcilers::alert::AlertReconciler;
use crate::reconcilers::object_key;
use crate::{Error, Result};

/// Finalizer guarding removal of an Alert's resources
pub const FINALIZER: &str = "synopsys.com/alert-finalizer";

/// Delay before retrying an Alert that failed with a non-transient error
pub const PERMANENT_ERROR_DELAY: Duration = Duration::from_secs(300);

/// State shared by every reconcile of the controller
pub struct AlertDriver {
    ctx: Arc<Context>,
    reconciler: AlertReconciler,
    backoff: KeyedBackoff,
    limiter: DefaultDirectRateLimiter,
}

impl AlertDriver {
    pub fn new(ctx: Arc<Context>, reconciler: AlertReconciler) -> Result<Self> {
        let limiter = reconcile_limiter(ctx.config.reconcile_qps, ctx.config.reconcile_burst)?;
        Ok(Self {
            ctx,
            reconciler,
            backoff: KeyedBackoff::default(),
            limiter,
        })
    }
}

/// Run the Alert controller until `shutdown` is cancelled.
///
/// Cancellation stops new passes from starting; passes already in flight run
/// to completion.
pub async fn run(ctx: Arc<Context>, shutdown: CancellationToken) -> Result<()> {
    let alerts: Api<Alert> = scoped_api(&ctx);
    let owned = watcher::Config::default().labels(&format!("{}={}", APP_LABEL, APP_NAME));
    let concurrency = u16::try_from(ctx.config.threadiness).unwrap_or(u16::MAX);

    info!(
        namespace = ctx.config.watch_namespace.as_deref().unwrap_or("*"),
        concurrency,
        dry_run = ctx.config.dry_run,
        "Starting Alert controller"
    );

    let controller = Controller::new(alerts, watcher::Config::default().any_semantic())
        .with_config(controller::Config::default().concurrency(concurrency))
        .watches(scoped_api::<ServiceAccount>(&ctx), owned.clone(), owner_of)
        .watches(scoped_api::<ConfigMap>(&ctx), owned.clone(), owner_of)
        .watches(scoped_api::<Secret>(&ctx), owned.clone(), owner_of)
        .watches(scoped_api::<Service>(&ctx), owned.clone(), owner_of)
        .watches(scoped_api::<Deployment>(&ctx), owned, owner_of)
        .graceful_shutdown_on(shutdown.cancelled_owned());

    let reconciler = AlertReconciler::new(Arc::clone(&ctx), controller.store());
    let driver = Arc::new(AlertDriver::new(Arc::clone(&ctx), reconciler)?);

    controller
        .run(reconcile, error_policy, driver)
        .for_each(|res| async move {
            match res {
                Ok((alert, _)) => debug!("Reconciled {}", alert),
                Err(e) => warn!("Alert controller error: {}", e),
            }
        })
        .await;

    info!("Alert controller stopped");
    Ok(())
}

fn scoped_api<K>(ctx: &Context) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match &ctx.config.watch_namespace {
        Some(ns) => Api::namespaced(ctx.client.clone(), ns),
        None => Api::all(ctx.client.clone()),
    }
}

/// The Alert an owned object belongs to, read from its instance labels
pub fn owner_of<K>(obj: K) -> Option<ObjectRef<Alert>>
where
    K: Resource + DeserializeOwned,
{
    let labels = obj.labels();
    if labels.get(APP_LABEL).map(String::as_str) != Some(APP_NAME) {
        return None;
    }
    let name = labels.get(INSTANCE_LABEL)?;
    let namespace = labels
        .get(INSTANCE_NAMESPACE_LABEL)
        .cloned()
        .or_else(|| obj.namespace())?;
    Some(ObjectRef::new(name).within(&namespace))
}

#[instrument(skip(alert, driver), fields(name = %alert.name_any(), namespace = alert.namespace().unwrap_or_default()))]
async fn reconcile(alert: Arc<Alert>, driver: Arc<AlertDriver>) -> Result<Action> {
    driver.limiter.until_ready().await;

    let namespace = alert.namespace().unwrap_or_default();
    let key = object_key(alert.namespace().as_deref(), &alert.name_any());
    let alerts: Api<Alert> = Api::namespaced(driver.ctx.client.clone(), &namespace);
    let resync = driver.ctx.config.resync_interval;

    let (driver_ref, key_ref) = (&driver, &key);
    let action = finalizer(&alerts, FINALIZER, alert, |event| async move {
        let (driver, key) = (driver_ref, key_ref);
        match event {
            Event::Apply(_) => driver
                .reconciler
                .reconcile_one(&key)
                .await
                .map(|_| Action::requeue(resync)),
            Event::Cleanup(_) => {
                info!(%key, "Alert deleted, removing its resources");
                driver
                    .reconciler
                    .reconcile_one(&key)
                    .await
                    .map(|_| Action::await_change())
            }
        }
    })
    .await?;

    driver.backoff.reset(&key);
    Ok(action)
}

fn error_policy(alert: Arc<Alert>, err: &Error, driver: Arc<AlertDriver>) -> Action {
    let key = object_key(alert.namespace().as_deref(), &alert.name_any());
    retry_action(&driver.backoff, &key, err)
}

/// Transient failures back off per key; anything else waits for a change or
/// the permanent-error delay.
pub fn retry_action(backoff: &KeyedBackoff, key: &str, err: &Error) -> Action {
    if err.is_transient() {
        RECONCILE_REQUEUES
            .with_label_values(&["Alert", "transient"])
            .inc();
        let delay = backoff.next_delay(key);
        warn!(
            key,
            failures = backoff.failures(key),
            ?delay,
            "Transient error, requeueing: {}",
            err
        );
        Action::requeue(delay)
    } else {
        RECONCILE_REQUEUES
            .with_label_values(&["Alert", "permanent"])
            .inc();
        error!(key, "Reconcile failed: {}", err);
        Action::requeue(PERMANENT_ERROR_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn labelled(namespace: &str, labels: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("demo-alert-blackduck-config".to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_owner_of_uses_instance_labels() {
        let cm = labelled(
            "ops",
            &[
                (APP_LABEL, APP_NAME),
                (INSTANCE_LABEL, "demo"),
                (INSTANCE_NAMESPACE_LABEL, "ops"),
            ],
        );
        assert_eq!(owner_of(cm), Some(ObjectRef::new("demo").within("ops")));
    }

    #[test]
    fn test_owner_of_falls_back_to_object_namespace() {
        let cm = labelled("dev", &[(APP_LABEL, APP_NAME), (INSTANCE_LABEL, "demo")]);
        assert_eq!(owner_of(cm), Some(ObjectRef::new("demo").within("dev")));
    }

    #[test]
    fn test_owner_of_ignores_foreign_objects() {
        assert_eq!(owner_of(labelled("ops", &[(INSTANCE_LABEL, "demo")])), None);
        assert_eq!(owner_of(labelled("ops", &[(APP_LABEL, APP_NAME)])), None);
        assert_eq!(
            owner_of(labelled("ops", &[(APP_LABEL, "other"), (INSTANCE_LABEL, "demo")])),
            None
        );
    }

    #[test]
    fn test_transient_errors_back_off_per_key() {
        let backoff = KeyedBackoff::default();
        let err = Error::KubeError("connection reset".into());

        assert_eq!(
            retry_action(&backoff, "ops/demo", &err),
            Action::requeue(Duration::from_millis(5))
        );
        assert_eq!(
            retry_action(&backoff, "ops/demo", &err),
            Action::requeue(Duration::from_millis(10))
        );
        assert_eq!(backoff.failures("ops/demo"), 2);
    }

    #[test]
    fn test_permanent_errors_wait_longer() {
        let backoff = KeyedBackoff::default();
        let err = Error::ValidationError("port out of range".into());

        assert_eq!(
            retry_action(&backoff, "ops/demo", &err),
            Action::requeue(PERMANENT_ERROR_DELAY)
        );
        assert_eq!(backoff.failures("ops/demo"), 0);
    }
}
