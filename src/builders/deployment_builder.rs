//! Kubernetes Deployment builders for Alert and cfssl pods

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapEnvSource, Container, ContainerPort, EmptyDirVolumeSource, EnvFromSource, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, SecretEnvSource, SecretVolumeSource,
    TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::builders::secret_builder::{CERT_FILE_KEY, KEY_FILE_KEY};
use crate::builders::service_builder::CFSSL_PORT;
use crate::builders::{build_labels, resource_name, selector_labels};
use crate::config::{ImageCatalog, ALERT_COMPONENT, CFSSL_COMPONENT};
use crate::crd::Alert;
use crate::{Error, Result};

pub const CONFIG_CHECKSUM_ANNOTATION: &str = "checksum/config";

/// Build the Deployment running Alert itself
pub fn build_alert_deployment(
    alert: &Alert,
    catalog: &ImageCatalog,
    config_hash: &str,
    with_certificate: bool,
) -> Result<Deployment> {
    let name = alert.name_any();
    let spec = &alert.spec;
    let image = resolve_image(spec.alert_image.as_deref(), catalog, &spec.version, ALERT_COMPONENT)?;

    let mut volume_mounts = vec![VolumeMount {
        name: "dir-alert".to_string(),
        mount_path: "/opt/blackduck/alert/alert-config".to_string(),
        ..Default::default()
    }];
    let mut volumes = vec![Volume {
        name: "dir-alert".to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }];

    if with_certificate {
        volume_mounts.push(VolumeMount {
            name: "certificate".to_string(),
            mount_path: "/tmp/secrets".to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "certificate".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(resource_name(&name, "certificate")),
                items: Some(vec![
                    key_to_path(CERT_FILE_KEY),
                    key_to_path(KEY_FILE_KEY),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let container = Container {
        name: "alert".to_string(),
        image: Some(image),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![ContainerPort {
            container_port: spec.port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env_from: Some(vec![
            config_env(&name),
            EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    name: resource_name(&name, "secret"),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ]),
        resources: Some(memory_resources(&spec.alert_memory)),
        volume_mounts: Some(volume_mounts),
        liveness_probe: Some(tcp_probe(spec.port, 240)),
        readiness_probe: Some(tcp_probe(spec.port, 30)),
        ..Default::default()
    };

    Ok(build_deployment(
        alert,
        resource_name(&name, ""),
        "alert",
        config_hash,
        PodSpec {
            containers: vec![container],
            volumes: Some(volumes),
            service_account_name: Some(resource_name(&name, "")),
            ..Default::default()
        },
    ))
}

/// Build the Deployment running the bundled cfssl service
pub fn build_cfssl_deployment(
    alert: &Alert,
    catalog: &ImageCatalog,
    config_hash: &str,
) -> Result<Deployment> {
    let name = alert.name_any();
    let spec = &alert.spec;
    let image = resolve_image(spec.cfssl_image.as_deref(), catalog, &spec.version, CFSSL_COMPONENT)?;

    let container = Container {
        name: CFSSL_COMPONENT.to_string(),
        image: Some(image),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![ContainerPort {
            container_port: CFSSL_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env_from: Some(vec![config_env(&name)]),
        resources: Some(memory_resources(&spec.cfssl_memory)),
        volume_mounts: Some(vec![VolumeMount {
            name: "dir-cfssl".to_string(),
            mount_path: "/etc/cfssl".to_string(),
            ..Default::default()
        }]),
        liveness_probe: Some(tcp_probe(CFSSL_PORT, 240)),
        readiness_probe: Some(tcp_probe(CFSSL_PORT, 10)),
        ..Default::default()
    };

    Ok(build_deployment(
        alert,
        resource_name(&name, "cfssl"),
        "cfssl",
        config_hash,
        PodSpec {
            containers: vec![container],
            volumes: Some(vec![Volume {
                name: "dir-cfssl".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            service_account_name: Some(resource_name(&name, "")),
            ..Default::default()
        },
    ))
}

fn build_deployment(
    alert: &Alert,
    deployment_name: String,
    component: &str,
    config_hash: &str,
    pod_spec: PodSpec,
) -> Deployment {
    let name = alert.name_any();
    let labels = build_labels(&alert.namespace().unwrap_or_default(), &name, component);
    let selector = selector_labels(&name, component);

    let mut pod_annotations = BTreeMap::new();
    pod_annotations.insert(
        CONFIG_CHECKSUM_ANNOTATION.to_string(),
        config_hash.to_string(),
    );

    let replicas = if alert.spec.is_stopped() { 0 } else { 1 };

    Deployment {
        metadata: ObjectMeta {
            name: Some(deployment_name),
            namespace: alert.namespace(),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn resolve_image(
    explicit: Option<&str>,
    catalog: &ImageCatalog,
    version: &str,
    component: &str,
) -> Result<String> {
    match explicit {
        Some(image) if !image.trim().is_empty() => Ok(image.to_string()),
        _ => catalog.image(version, component).ok_or_else(|| {
            Error::ValidationError(format!(
                "no {} image for version {} in the image catalog",
                component, version
            ))
        }),
    }
}

fn config_env(name: &str) -> EnvFromSource {
    EnvFromSource {
        config_map_ref: Some(ConfigMapEnvSource {
            name: resource_name(name, "blackduck-config"),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Memory request equals limit so the pod is never evicted for overcommit
fn memory_resources(memory: &str) -> ResourceRequirements {
    let mut quantities = BTreeMap::new();
    quantities.insert("memory".to_string(), Quantity(memory.to_string()));
    ResourceRequirements {
        requests: Some(quantities.clone()),
        limits: Some(quantities),
        ..Default::default()
    }
}

fn tcp_probe(port: i32, initial_delay_seconds: i32) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(30),
        timeout_seconds: Some(10),
        failure_threshold: Some(10),
        ..Default::default()
    }
}

fn key_to_path(key: &str) -> k8s_openapi::api::core::v1::KeyToPath {
    k8s_openapi::api::core::v1::KeyToPath {
        key: key.to_string(),
        path: key.to_string(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::AlertSpec;

    fn alert(extra: serde_json::Value) -> Alert {
        let mut value = serde_json::json!({"version": "5.3.0"});
        value.as_object_mut().unwrap().extend(extra.as_object().unwrap().clone());
        let spec: AlertSpec = serde_json::from_value(value).unwrap();
        let mut alert = Alert::new("demo", spec);
        alert.metadata.namespace = Some("ops".to_string());
        alert
    }

    fn container(d: &Deployment) -> &Container {
        &d.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
    }

    #[test]
    fn test_alert_deployment_uses_catalog_image() {
        let catalog = ImageCatalog::default();
        let d = build_alert_deployment(&alert(serde_json::json!({})), &catalog, "abc", false)
            .unwrap();
        assert_eq!(d.metadata.name.as_deref(), Some("demo-alert"));
        assert_eq!(
            container(&d).image.as_deref(),
            Some("docker.io/blackducksoftware/blackduck-alert:5.3.0")
        );
        let annotations = d.spec.as_ref().unwrap().template.metadata.as_ref().unwrap()
            .annotations.as_ref().unwrap();
        assert_eq!(annotations[CONFIG_CHECKSUM_ANNOTATION], "abc");
    }

    #[test]
    fn test_memory_request_equals_limit() {
        let catalog = ImageCatalog::default();
        let d = build_alert_deployment(
            &alert(serde_json::json!({"alertMemory": "3Gi"})),
            &catalog,
            "abc",
            false,
        )
        .unwrap();
        let resources = container(&d).resources.as_ref().unwrap();
        assert_eq!(resources.requests, resources.limits);
        assert_eq!(resources.limits.as_ref().unwrap()["memory"].0, "3Gi");
    }

    #[test]
    fn test_certificate_volume_is_mounted() {
        let catalog = ImageCatalog::default();
        let d = build_alert_deployment(&alert(serde_json::json!({})), &catalog, "abc", true)
            .unwrap();
        let pod = d.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert!(pod.volumes.as_ref().unwrap().iter().any(|v| v.name == "certificate"));
    }

    #[test]
    fn test_stop_scales_to_zero() {
        let catalog = ImageCatalog::default();
        let d = build_alert_deployment(
            &alert(serde_json::json!({"desiredState": "STOP"})),
            &catalog,
            "abc",
            false,
        )
        .unwrap();
        assert_eq!(d.spec.unwrap().replicas, Some(0));
    }

    #[test]
    fn test_unknown_version_without_image_fails() {
        let catalog = ImageCatalog::default();
        let err = build_cfssl_deployment(
            &alert(serde_json::json!({"version": "0.0.1"})),
            &catalog,
            "abc",
        )
        .unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));

        let d = build_cfssl_deployment(
            &alert(serde_json::json!({"version": "0.0.1", "cfsslImage": "my/cfssl:1"})),
            &catalog,
            "abc",
        )
        .unwrap();
        assert_eq!(container(&d).image.as_deref(), Some("my/cfssl:1"));
    }
}
