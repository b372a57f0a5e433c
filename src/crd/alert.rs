//! Alert Custom Resource Definition

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Alert resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "synopsys.com",
    version = "v1",
    kind = "Alert",
    plural = "alerts",
    singular = "alert",
    shortname = "alt",
    namespaced,
    status = "AlertStatus",
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Version", "type": "string", "jsonPath": ".spec.version"}"#,
    printcolumn = r#"{"name": "Expose", "type": "string", "jsonPath": ".spec.exposeService"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AlertSpec {
    /// Alert release, used to look up images in the image catalog
    pub version: String,

    /// Explicit Alert image, overrides the catalog
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_image: Option<String>,

    /// Explicit cfssl image, overrides the catalog
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cfssl_image: Option<String>,

    /// Run a bundled cfssl certificate service
    #[serde(default = "default_true")]
    pub stand_alone: bool,

    /// External exposure: NODEPORT, LOADBALANCER or NONE
    #[serde(default = "default_expose_service")]
    pub expose_service: String,

    /// HTTPS port served by Alert
    #[serde(default = "default_port")]
    pub port: i32,

    /// Extra environment entries in `KEY:VALUE` form
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environs: Vec<String>,

    /// Encryption password stored in the Alert secret
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_password: Option<String>,

    /// Encryption global salt stored in the Alert secret
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_global_salt: Option<String>,

    /// PEM certificate served by Alert; requires certificateKey
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,

    /// PEM private key for certificate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_key: Option<String>,

    /// Memory for the Alert container (request and limit)
    #[serde(default = "default_alert_memory")]
    pub alert_memory: String,

    /// Memory for the cfssl container (request and limit)
    #[serde(default = "default_cfssl_memory")]
    pub cfssl_memory: String,

    /// Image pull secrets attached to the Alert service account
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,

    /// RUNNING (default) or STOP, which scales workloads to zero
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_state: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_expose_service() -> String {
    "NONE".to_string()
}

fn default_port() -> i32 {
    8443
}

fn default_alert_memory() -> String {
    "2560M".to_string()
}

fn default_cfssl_memory() -> String {
    "640M".to_string()
}

impl AlertSpec {
    /// Whether the instance has been asked to stop
    pub fn is_stopped(&self) -> bool {
        self.desired_state
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("STOP"))
    }
}

/// Alert status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AlertStatus {
    /// Converged, Stopped, Error or Pending
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Generation the status was computed for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last update time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (Converged, SpecValid)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status (True, False, Unknown)
    pub status: String,

    /// Last transition time
    pub last_transition_time: DateTime<Utc>,

    /// Reason for the condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let spec: AlertSpec = serde_json::from_value(serde_json::json!({"version": "5.3.0"})).unwrap();
        assert!(spec.stand_alone);
        assert_eq!(spec.expose_service, "NONE");
        assert_eq!(spec.port, 8443);
        assert_eq!(spec.alert_memory, "2560M");
        assert!(!spec.is_stopped());
    }

    #[test]
    fn test_stop_is_case_insensitive() {
        let spec: AlertSpec = serde_json::from_value(
            serde_json::json!({"version": "5.3.0", "desiredState": "stop"}),
        )
        .unwrap();
        assert!(spec.is_stopped());
    }
}
