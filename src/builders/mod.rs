//! Desired-state builders for Alert instances
//!
//! Turns an [`Alert`] into the [`ComponentList`] the updater converges.

pub mod config_builder;
pub mod deployment_builder;
pub mod secret_builder;
pub mod service_builder;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{LocalObjectReference, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::debug;

use crate::config::ImageCatalog;
use crate::crd::Alert;
use crate::updater::ComponentList;
use crate::{Error, Result};

pub const APP_LABEL: &str = "app";
pub const APP_NAME: &str = "alert";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
/// Namespace of the owning Alert; cluster-scoped objects carry no namespace of their own
pub const INSTANCE_NAMESPACE_LABEL: &str = "synopsys.com/instance-namespace";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const COMPONENT_LABEL: &str = "component";
pub const MANAGER: &str = "converge-operator";

/// Label selector scoping everything owned by one Alert instance
pub fn instance_selector(namespace: &str, name: &str) -> String {
    format!(
        "{}={},{}={},{}={}",
        APP_LABEL, APP_NAME, INSTANCE_LABEL, name, INSTANCE_NAMESPACE_LABEL, namespace
    )
}

/// `<instance>-alert` or `<instance>-alert-<suffix>`
pub fn resource_name(instance: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        format!("{}-{}", instance, APP_NAME)
    } else {
        format!("{}-{}-{}", instance, APP_NAME, suffix)
    }
}

/// Labels put on every object of an instance
pub fn build_labels(namespace: &str, instance: &str, component: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(instance, component);
    labels.insert(INSTANCE_NAMESPACE_LABEL.to_string(), namespace.to_string());
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER.to_string());
    labels
}

/// Labels used by pod selectors; a subset of [`build_labels`]
pub fn selector_labels(instance: &str, component: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_string(), APP_NAME.to_string());
    labels.insert(INSTANCE_LABEL.to_string(), instance.to_string());
    labels.insert(COMPONENT_LABEL.to_string(), component.to_string());
    labels
}

/// Validate an Alert spec before building components
pub fn validate(alert: &Alert, catalog: &ImageCatalog) -> Result<()> {
    let spec = &alert.spec;

    if spec.version.trim().is_empty() {
        return Err(Error::ValidationError("version cannot be empty".to_string()));
    }

    if spec.alert_image.is_none() && !catalog.supports(&spec.version) {
        return Err(Error::ValidationError(format!(
            "version {} is not in the image catalog and no alertImage is set",
            spec.version
        )));
    }

    if !(1..=65535).contains(&spec.port) {
        return Err(Error::ValidationError(format!(
            "port must be between 1 and 65535, got {}",
            spec.port
        )));
    }

    let valid_expose = ["NODEPORT", "LOADBALANCER", "NONE"];
    if !valid_expose.contains(&spec.expose_service.to_ascii_uppercase().as_str()) {
        return Err(Error::ValidationError(format!(
            "exposeService must be one of: {:?}",
            valid_expose
        )));
    }

    if spec.certificate.is_some() != spec.certificate_key.is_some() {
        return Err(Error::ValidationError(
            "certificate and certificateKey must be set together".to_string(),
        ));
    }

    if let Some(state) = &spec.desired_state {
        if !state.eq_ignore_ascii_case("STOP") && !state.eq_ignore_ascii_case("RUNNING") {
            return Err(Error::ValidationError(format!(
                "desiredState must be RUNNING or STOP, got {}",
                state
            )));
        }
    }

    config_builder::parse_environs(&spec.environs)?;
    Ok(())
}

/// Build the desired set for an Alert instance
pub fn alert_components(alert: &Alert, catalog: &ImageCatalog) -> Result<ComponentList> {
    validate(alert, catalog)?;

    let name = alert.name_any();
    let namespace = alert.namespace().unwrap_or_default();
    let spec = &alert.spec;
    let mut components = ComponentList::new();

    components.add(&build_service_account(&name, &namespace, &spec.image_pull_secrets))?;

    let config_map = config_builder::build_config_map(alert)?;
    let config_hash = config_builder::config_hash(&config_map);
    components.add(&config_map)?;

    components.add(&secret_builder::build_alert_secret(alert))?;
    let certificate = secret_builder::build_certificate_secret(alert);
    if let Some(secret) = &certificate {
        components.add(secret)?;
    }

    components.add(&service_builder::build_cluster_service(alert))?;
    if let Some(exposed) = service_builder::build_exposed_service(alert) {
        components.add(&exposed)?;
    }

    components.add(&deployment_builder::build_alert_deployment(
        alert,
        catalog,
        &config_hash,
        certificate.is_some(),
    )?)?;

    if spec.stand_alone {
        components.add(&deployment_builder::build_cfssl_deployment(alert, catalog, &config_hash)?)?;
        components.add(&service_builder::build_cfssl_service(alert))?;
    }

    debug!(
        namespace = %namespace,
        name = %name,
        count = components.len(),
        "Built Alert components"
    );
    Ok(components)
}

fn build_service_account(name: &str, namespace: &str, pull_secrets: &[String]) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(resource_name(name, "")),
            namespace: Some(namespace.to_string()),
            labels: Some(build_labels(namespace, name, "serviceaccount")),
            ..Default::default()
        },
        image_pull_secrets: if pull_secrets.is_empty() {
            None
        } else {
            Some(
                pull_secrets
                    .iter()
                    .map(|s| LocalObjectReference { name: s.clone() })
                    .collect(),
            )
        },
        ..Default::default()
    }
}
