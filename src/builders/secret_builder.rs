//! Alert secrets

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::builders::{build_labels, resource_name};
use crate::crd::Alert;

pub const CERT_FILE_KEY: &str = "WEBSERVER_CUSTOM_CERT_FILE";
pub const KEY_FILE_KEY: &str = "WEBSERVER_CUSTOM_KEY_FILE";

/// Encryption settings consumed by Alert through `envFrom`
pub fn build_alert_secret(alert: &Alert) -> Secret {
    let name = alert.name_any();
    let spec = &alert.spec;

    let mut string_data = BTreeMap::new();
    if let Some(password) = &spec.encryption_password {
        string_data.insert("ALERT_ENCRYPTION_PASSWORD".to_string(), password.clone());
    }
    if let Some(salt) = &spec.encryption_global_salt {
        string_data.insert("ALERT_ENCRYPTION_GLOBAL_SALT".to_string(), salt.clone());
    }

    Secret {
        metadata: ObjectMeta {
            name: Some(resource_name(&name, "secret")),
            namespace: alert.namespace(),
            labels: Some(build_labels(&alert.namespace().unwrap_or_default(), &name, "secret")),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    }
}

/// Custom web server certificate, only when both halves are configured
pub fn build_certificate_secret(alert: &Alert) -> Option<Secret> {
    let name = alert.name_any();
    let spec = &alert.spec;
    let (cert, key) = (spec.certificate.as_ref()?, spec.certificate_key.as_ref()?);

    let mut string_data = BTreeMap::new();
    string_data.insert(CERT_FILE_KEY.to_string(), cert.clone());
    string_data.insert(KEY_FILE_KEY.to_string(), key.clone());

    Some(Secret {
        metadata: ObjectMeta {
            name: Some(resource_name(&name, "certificate")),
            namespace: alert.namespace(),
            labels: Some(build_labels(&alert.namespace().unwrap_or_default(), &name, "secret")),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    })
}
