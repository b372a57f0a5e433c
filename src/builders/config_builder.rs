//! Alert environment ConfigMap

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use crate::builders::{build_labels, resource_name};
use crate::crd::Alert;
use crate::{Error, Result};

/// Parse `KEY:VALUE` environment entries. The value may itself contain ':'.
pub fn parse_environs(environs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for entry in environs {
        let (key, value) = entry.split_once(':').ok_or_else(|| {
            Error::ValidationError(format!(
                "environ '{}' must have the form KEY:VALUE",
                entry
            ))
        })?;
        let key = key.trim();
        if key.is_empty() || key.chars().any(char::is_whitespace) {
            return Err(Error::ValidationError(format!(
                "environ '{}' has an invalid key",
                entry
            )));
        }
        out.insert(key.to_string(), value.trim().to_string());
    }
    Ok(out)
}

/// Environment shared by the Alert and cfssl containers
pub fn build_config_map(alert: &Alert) -> Result<ConfigMap> {
    let name = alert.name_any();
    let spec = &alert.spec;

    let mut data = BTreeMap::new();
    data.insert("ALERT_SERVER_PORT".to_string(), spec.port.to_string());
    if spec.stand_alone {
        data.insert("HUB_CFSSL_HOST".to_string(), resource_name(&name, "cfssl"));
    }
    // Explicit environs win over computed defaults
    data.extend(parse_environs(&spec.environs)?);

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(resource_name(&name, "blackduck-config")),
            namespace: alert.namespace(),
            labels: Some(build_labels(&alert.namespace().unwrap_or_default(), &name, "configmap")),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

/// Short checksum of the ConfigMap data, stamped on pod templates so a
/// configuration change rolls the pods
pub fn config_hash(config_map: &ConfigMap) -> String {
    let mut hasher = Sha256::new();
    for (k, v) in config_map.data.iter().flatten() {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())[..16].to_string()
}
