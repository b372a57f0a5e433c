//! Per-kind behaviour for the closed set of managed resource kinds

use std::fmt::Debug;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{
    ConfigMap, ReplicationController, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::updater::desired::ResourceKind;
use crate::updater::drift;

mod sealed {
    pub trait Sealed {}
}

/// A Kubernetes kind the updater knows how to converge.
///
/// Implemented only for the nine kinds listed in [`ResourceKind::ORDERED`].
pub trait ManagedKind:
    Resource<DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
    + sealed::Sealed
{
    const KIND: ResourceKind;

    /// Api handle scoped to `namespace`, or cluster-wide for cluster-scoped kinds
    fn api(client: Client, namespace: &str) -> Api<Self>;

    /// Whether the observed object differs from the desired one in owned fields
    fn has_drifted(desired: &Self, observed: &Self) -> bool;

    /// Partial object holding only the fields a patch may touch
    fn owned_fields(&self) -> Value;

    /// Copy server-assigned values that must survive a patch
    fn adopt_server_fields(&mut self, _observed: &Self) {}

    /// Desired replica count for workload kinds
    fn replicas(&self) -> Option<i32> {
        None
    }
}

macro_rules! namespaced_api {
    () => {
        fn api(client: Client, namespace: &str) -> Api<Self> {
            Api::namespaced(client, namespace)
        }
    };
}

macro_rules! cluster_api {
    () => {
        fn api(client: Client, _namespace: &str) -> Api<Self> {
            Api::all(client)
        }
    };
}

impl sealed::Sealed for ServiceAccount {}
impl ManagedKind for ServiceAccount {
    const KIND: ResourceKind = ResourceKind::ServiceAccount;
    namespaced_api!();

    fn has_drifted(desired: &Self, observed: &Self) -> bool {
        drift::service_account_drifted(desired, observed)
    }

    fn owned_fields(&self) -> Value {
        json!({
            "imagePullSecrets": self.image_pull_secrets,
            "automountServiceAccountToken": self.automount_service_account_token,
        })
    }
}

impl sealed::Sealed for ClusterRole {}
impl ManagedKind for ClusterRole {
    const KIND: ResourceKind = ResourceKind::ClusterRole;
    cluster_api!();

    fn has_drifted(desired: &Self, observed: &Self) -> bool {
        drift::cluster_role_drifted(desired, observed)
    }

    fn owned_fields(&self) -> Value {
        if self.aggregation_rule.is_some() {
            json!({ "aggregationRule": self.aggregation_rule })
        } else {
            json!({ "rules": self.rules })
        }
    }
}

impl sealed::Sealed for ClusterRoleBinding {}
impl ManagedKind for ClusterRoleBinding {
    const KIND: ResourceKind = ResourceKind::ClusterRoleBinding;
    cluster_api!();

    fn has_drifted(desired: &Self, observed: &Self) -> bool {
        drift::cluster_role_binding_drifted(desired, observed)
    }

    fn owned_fields(&self) -> Value {
        json!({ "subjects": self.subjects })
    }
}

impl sealed::Sealed for ConfigMap {}
impl ManagedKind for ConfigMap {
    const KIND: ResourceKind = ResourceKind::ConfigMap;
    namespaced_api!();

    fn has_drifted(desired: &Self, observed: &Self) -> bool {
        drift::config_map_drifted(desired, observed)
    }

    fn owned_fields(&self) -> Value {
        json!({
            "data": self.data,
            "binaryData": self.binary_data,
        })
    }
}

impl sealed::Sealed for Secret {}
impl ManagedKind for Secret {
    const KIND: ResourceKind = ResourceKind::Secret;
    namespaced_api!();

    fn has_drifted(desired: &Self, observed: &Self) -> bool {
        drift::secret_drifted(desired, observed)
    }

    fn owned_fields(&self) -> Value {
        json!({ "data": drift::effective_secret_data(self) })
    }
}

impl sealed::Sealed for Service {}
impl ManagedKind for Service {
    const KIND: ResourceKind = ResourceKind::Service;
    namespaced_api!();

    fn has_drifted(desired: &Self, observed: &Self) -> bool {
        drift::service_drifted(desired, observed)
    }

    fn owned_fields(&self) -> Value {
        let spec = self.spec.clone().unwrap_or_default();
        json!({
            "spec": {
                "type": spec.type_,
                "selector": spec.selector,
                "ports": spec.ports,
            }
        })
    }

    /// Keep allocated node ports so external endpoints do not move
    fn adopt_server_fields(&mut self, observed: &Self) {
        let Some(observed_ports) = observed.spec.as_ref().and_then(|s| s.ports.as_ref()) else {
            return;
        };
        let Some(ports) = self.spec.as_mut().and_then(|s| s.ports.as_mut()) else {
            return;
        };
        for port in ports.iter_mut().filter(|p| p.node_port.is_none()) {
            port.node_port = observed_ports
                .iter()
                .find(|o| o.name == port.name && o.port == port.port)
                .or_else(|| observed_ports.iter().find(|o| o.name.is_some() && o.name == port.name))
                .and_then(|o| o.node_port);
        }
    }
}

impl sealed::Sealed for ReplicationController {}
impl ManagedKind for ReplicationController {
    const KIND: ResourceKind = ResourceKind::ReplicationController;
    namespaced_api!();

    fn has_drifted(desired: &Self, observed: &Self) -> bool {
        let (want, have) = (desired.spec.as_ref(), observed.spec.as_ref());
        drift::workload_drifted(
            want.and_then(|s| s.replicas),
            want.and_then(|s| s.template.as_ref()),
            have.and_then(|s| s.replicas),
            have.and_then(|s| s.template.as_ref()),
        )
    }

    fn owned_fields(&self) -> Value {
        let spec = self.spec.clone().unwrap_or_default();
        json!({ "spec": { "replicas": spec.replicas, "template": spec.template } })
    }

    fn replicas(&self) -> Option<i32> {
        Some(self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1))
    }
}

impl sealed::Sealed for Deployment {}
impl ManagedKind for Deployment {
    const KIND: ResourceKind = ResourceKind::Deployment;
    namespaced_api!();

    fn has_drifted(desired: &Self, observed: &Self) -> bool {
        let (want, have) = (desired.spec.as_ref(), observed.spec.as_ref());
        drift::workload_drifted(
            want.and_then(|s| s.replicas),
            want.map(|s| &s.template),
            have.and_then(|s| s.replicas),
            have.map(|s| &s.template),
        )
    }

    fn owned_fields(&self) -> Value {
        let spec = self.spec.clone().unwrap_or_default();
        json!({ "spec": { "replicas": spec.replicas, "template": spec.template } })
    }

    fn replicas(&self) -> Option<i32> {
        Some(self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1))
    }
}

impl sealed::Sealed for StatefulSet {}
impl ManagedKind for StatefulSet {
    const KIND: ResourceKind = ResourceKind::StatefulSet;
    namespaced_api!();

    fn has_drifted(desired: &Self, observed: &Self) -> bool {
        let (want, have) = (desired.spec.as_ref(), observed.spec.as_ref());
        drift::stateful_set_drifted(
            want.and_then(|s| s.replicas),
            want.map(|s| &s.template),
            have.and_then(|s| s.replicas),
            have.map(|s| &s.template),
        )
    }

    fn owned_fields(&self) -> Value {
        let spec = self.spec.clone().unwrap_or_default();
        json!({ "spec": { "replicas": spec.replicas, "template": spec.template } })
    }

    fn replicas(&self) -> Option<i32> {
        Some(self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1))
    }
}
