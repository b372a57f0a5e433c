//! Desired resources produced by component builders
//!
//! A [`DesiredResource`] carries only what the operator intends to own: kind,
//! name, optional namespace, labels, annotations and the object body. It is
//! turned into a typed object by the kind adapter right before planning.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{Error, Result};

/// The closed set of resource kinds the updater manages
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    ServiceAccount,
    ClusterRole,
    ClusterRoleBinding,
    ConfigMap,
    Secret,
    Service,
    ReplicationController,
    Deployment,
    StatefulSet,
}

impl ResourceKind {
    /// Order in which kinds are converged within one pass.
    ///
    /// Identities and RBAC first, then configuration, then networking, then
    /// workloads, so pods never start against missing config.
    pub const ORDERED: [ResourceKind; 9] = [
        ResourceKind::ServiceAccount,
        ResourceKind::ClusterRole,
        ResourceKind::ClusterRoleBinding,
        ResourceKind::ConfigMap,
        ResourceKind::Secret,
        ResourceKind::Service,
        ResourceKind::ReplicationController,
        ResourceKind::Deployment,
        ResourceKind::StatefulSet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::ClusterRole => "ClusterRole",
            ResourceKind::ClusterRoleBinding => "ClusterRoleBinding",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Secret => "Secret",
            ResourceKind::Service => "Service",
            ResourceKind::ReplicationController => "ReplicationController",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::StatefulSet => "StatefulSet",
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            ResourceKind::ClusterRole | ResourceKind::ClusterRoleBinding => {
                "rbac.authorization.k8s.io/v1"
            }
            ResourceKind::Deployment | ResourceKind::StatefulSet => "apps/v1",
            _ => "v1",
        }
    }

    pub fn is_namespaced(&self) -> bool {
        !matches!(
            self,
            ResourceKind::ClusterRole | ResourceKind::ClusterRoleBinding
        )
    }

    /// Kinds that run pods and are subject to forced rollouts
    pub fn is_workload(&self) -> bool {
        matches!(
            self,
            ResourceKind::ReplicationController
                | ResourceKind::Deployment
                | ResourceKind::StatefulSet
        )
    }

    /// Kinds whose changes must be picked up by restarting pods
    pub fn carries_config(&self) -> bool {
        matches!(self, ResourceKind::ConfigMap | ResourceKind::Secret)
    }

    pub fn from_kind_str(kind: &str) -> Option<ResourceKind> {
        ResourceKind::ORDERED
            .into_iter()
            .find(|k| k.as_str() == kind)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One resource the operator wants to exist
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredResource {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Object body without `apiVersion`, `kind` and `metadata`
    pub spec: Value,
}

impl DesiredResource {
    pub fn new(kind: ResourceKind, name: impl Into<String>, spec: Value) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            spec,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels.extend(labels);
        self
    }

    pub fn with_annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.annotations.extend(annotations);
        self
    }

    /// Build a desired resource from a typed object.
    ///
    /// Metadata other than name, namespace, labels and annotations is dropped.
    pub fn from_object<K>(obj: &K) -> Result<Self>
    where
        K: kube::Resource<DynamicType = ()> + Serialize,
    {
        let kind_str = K::kind(&());
        let kind = ResourceKind::from_kind_str(&kind_str).ok_or_else(|| {
            Error::ConversionError(format!("unsupported kind {}", kind_str))
        })?;
        let meta = obj.meta();
        let name = meta.name.clone().unwrap_or_default();
        if name.is_empty() {
            return Err(Error::ConversionError(format!("{} without a name", kind)));
        }

        let mut body = match serde_json::to_value(obj)? {
            Value::Object(map) => map,
            _ => {
                return Err(Error::ConversionError(format!(
                    "{} {} did not serialize to an object",
                    kind, name
                )))
            }
        };
        body.remove("apiVersion");
        body.remove("kind");
        body.remove("metadata");

        Ok(Self {
            kind,
            name,
            namespace: meta.namespace.clone(),
            labels: meta.labels.clone().unwrap_or_default(),
            annotations: meta.annotations.clone().unwrap_or_default(),
            spec: Value::Object(body),
        })
    }

    /// Compose the full object and deserialize it as `K`.
    ///
    /// Namespaced kinds without an explicit namespace land in `default_namespace`.
    pub fn to_object<K>(&self, default_namespace: &str) -> Result<K>
    where
        K: kube::Resource<DynamicType = ()> + DeserializeOwned,
    {
        let expected = K::kind(&());
        if self.kind.as_str() != expected {
            return Err(Error::ConversionError(format!(
                "desired {} {} cannot be converted to {}",
                self.kind, self.name, expected
            )));
        }
        if self.name.is_empty() {
            return Err(Error::ConversionError(format!(
                "desired {} has an empty name",
                self.kind
            )));
        }

        let mut body = match &self.spec {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(Error::ConversionError(format!(
                    "desired {} {} has a non-object body: {}",
                    self.kind, self.name, other
                )))
            }
        };

        let mut metadata = Map::new();
        metadata.insert("name".into(), Value::String(self.name.clone()));
        if self.kind.is_namespaced() {
            let ns = self
                .namespace
                .clone()
                .unwrap_or_else(|| default_namespace.to_string());
            metadata.insert("namespace".into(), Value::String(ns));
        }
        if !self.labels.is_empty() {
            metadata.insert("labels".into(), serde_json::to_value(&self.labels)?);
        }
        if !self.annotations.is_empty() {
            metadata.insert("annotations".into(), serde_json::to_value(&self.annotations)?);
        }

        body.insert("apiVersion".into(), Value::String(self.kind.api_version().into()));
        body.insert("kind".into(), Value::String(self.kind.as_str().into()));
        body.insert("metadata".into(), Value::Object(metadata));

        serde_json::from_value(Value::Object(body)).map_err(|e| {
            Error::ConversionError(format!(
                "desired {} {} does not deserialize: {}",
                self.kind, self.name, e
            ))
        })
    }
}

/// The desired set for one owner, in builder order
#[derive(Clone, Debug, Default)]
pub struct ComponentList {
    pub resources: Vec<DesiredResource>,
}

impl ComponentList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, resource: DesiredResource) {
        self.resources.push(resource);
    }

    /// Add a typed object
    pub fn add<K>(&mut self, obj: &K) -> Result<()>
    where
        K: kube::Resource<DynamicType = ()> + Serialize,
    {
        self.resources.push(DesiredResource::from_object(obj)?);
        Ok(())
    }

    pub fn of_kind(&self, kind: ResourceKind) -> Vec<DesiredResource> {
        self.resources
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Secret};
    use k8s_openapi::api::rbac::v1::ClusterRole;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;

    #[test]
    fn test_to_object_fills_metadata() {
        let desired = DesiredResource::new(
            ResourceKind::ConfigMap,
            "cfg",
            json!({"data": {"A": "1"}}),
        )
        .with_labels([("app".to_string(), "alert".to_string())].into());

        let cm: ConfigMap = desired.to_object("ops").unwrap();
        assert_eq!(cm.metadata.name.as_deref(), Some("cfg"));
        assert_eq!(cm.metadata.namespace.as_deref(), Some("ops"));
        assert_eq!(cm.metadata.labels.unwrap()["app"], "alert");
        assert_eq!(cm.data.unwrap()["A"], "1");
    }

    #[test]
    fn test_cluster_scoped_kind_has_no_namespace() {
        let desired =
            DesiredResource::new(ResourceKind::ClusterRole, "reader", json!({"rules": []}))
                .with_namespace("ignored");
        let role: ClusterRole = desired.to_object("ops").unwrap();
        assert!(role.metadata.namespace.is_none());
    }

    #[test]
    fn test_wrong_kind_is_conversion_error() {
        let desired = DesiredResource::new(ResourceKind::ConfigMap, "cfg", json!({}));
        let err = desired.to_object::<Secret>("ops").unwrap_err();
        assert!(matches!(err, Error::ConversionError(_)));
    }

    #[test]
    fn test_empty_name_is_conversion_error() {
        let desired = DesiredResource::new(ResourceKind::ConfigMap, "", json!({}));
        assert!(matches!(
            desired.to_object::<ConfigMap>("ops"),
            Err(Error::ConversionError(_))
        ));
    }

    #[test]
    fn test_bad_body_is_conversion_error() {
        let desired = DesiredResource::new(ResourceKind::ConfigMap, "cfg", json!({"data": 5}));
        assert!(matches!(
            desired.to_object::<ConfigMap>("ops"),
            Err(Error::ConversionError(_))
        ));
        let desired = DesiredResource::new(ResourceKind::ConfigMap, "cfg", json!([1, 2]));
        assert!(matches!(
            desired.to_object::<ConfigMap>("ops"),
            Err(Error::ConversionError(_))
        ));
    }

    #[test]
    fn test_from_object_strips_envelope() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("cfg".into()),
                namespace: Some("ops".into()),
                resource_version: Some("42".into()),
                ..Default::default()
            },
            data: Some([("A".to_string(), "1".to_string())].into()),
            ..Default::default()
        };
        let desired = DesiredResource::from_object(&cm).unwrap();
        assert_eq!(desired.kind, ResourceKind::ConfigMap);
        assert_eq!(desired.namespace.as_deref(), Some("ops"));
        assert_eq!(desired.spec, json!({"data": {"A": "1"}}));
    }

    #[test]
    fn test_ordered_puts_config_before_workloads() {
        let pos = |k| ResourceKind::ORDERED.iter().position(|x| *x == k).unwrap();
        assert!(pos(ResourceKind::ConfigMap) < pos(ResourceKind::Deployment));
        assert!(pos(ResourceKind::ServiceAccount) < pos(ResourceKind::ClusterRoleBinding));
    }
}
