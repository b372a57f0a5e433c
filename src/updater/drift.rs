//! Drift detection between desired and observed objects
//!
//! Each comparison projects both sides onto the fields the operator owns and
//! normalises what the API server rewrites (defaults, quantity formatting,
//! `stringData`), so a freshly applied object never reports drift.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, Container, EnvVar, KeyToPath, PodSpec, PodTemplateSpec, Secret,
    Service, ServiceAccount, ServicePort, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use tracing::{debug, warn};

use crate::updater::quantity::CanonicalQuantity;

/// Comparable view of a single container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerProjection {
    pub image: Option<String>,
    pub cpu_request: Option<CanonicalQuantity>,
    pub cpu_limit: Option<CanonicalQuantity>,
    pub memory_request: Option<CanonicalQuantity>,
    pub memory_limit: Option<CanonicalQuantity>,
}

/// Comparable view of a workload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadProjection {
    pub replicas: i32,
    /// Keyed by lowercased container name
    pub containers: BTreeMap<String, ContainerProjection>,
}

impl WorkloadProjection {
    pub fn new(replicas: Option<i32>, template: Option<&PodTemplateSpec>) -> Self {
        let containers = template
            .and_then(|t| t.spec.as_ref())
            .map(|pod| {
                pod.containers
                    .iter()
                    .map(|c| (c.name.to_lowercase(), project_container(c)))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            replicas: replicas.unwrap_or(1),
            containers,
        }
    }
}

fn resource(
    map: Option<&BTreeMap<String, Quantity>>,
    name: &str,
) -> Option<CanonicalQuantity> {
    map.and_then(|m| m.get(name))
        .map(|q| CanonicalQuantity::parse(&q.0))
}

fn project_container(c: &Container) -> ContainerProjection {
    let requests = c.resources.as_ref().and_then(|r| r.requests.as_ref());
    let limits = c.resources.as_ref().and_then(|r| r.limits.as_ref());
    ContainerProjection {
        image: c.image.clone(),
        cpu_request: resource(requests, "cpu"),
        cpu_limit: resource(limits, "cpu"),
        memory_request: resource(requests, "memory"),
        memory_limit: resource(limits, "memory"),
    }
}

/// Deployment and ReplicationController drift: replicas plus per-container projection
pub fn workload_drifted(
    desired_replicas: Option<i32>,
    desired_template: Option<&PodTemplateSpec>,
    observed_replicas: Option<i32>,
    observed_template: Option<&PodTemplateSpec>,
) -> bool {
    let desired = WorkloadProjection::new(desired_replicas, desired_template);
    let observed = WorkloadProjection::new(observed_replicas, observed_template);

    if desired.replicas != observed.replicas {
        debug!(desired = desired.replicas, observed = observed.replicas, "replicas drifted");
        return true;
    }
    if desired.containers.len() != observed.containers.len() {
        debug!("container set drifted");
        return true;
    }
    for (name, want) in &desired.containers {
        match observed.containers.get(name) {
            Some(have) if have == want => {}
            Some(have) => {
                debug!(container = %name, ?want, ?have, "container drifted");
                return true;
            }
            None => {
                debug!(container = %name, "container missing");
                return true;
            }
        }
    }
    false
}

/// StatefulSet drift: workload projection plus env, envFrom, mounts and volumes
pub fn stateful_set_drifted(
    desired_replicas: Option<i32>,
    desired_template: Option<&PodTemplateSpec>,
    observed_replicas: Option<i32>,
    observed_template: Option<&PodTemplateSpec>,
) -> bool {
    if workload_drifted(
        desired_replicas,
        desired_template,
        observed_replicas,
        observed_template,
    ) {
        return true;
    }

    let empty = PodSpec::default();
    let desired_pod = desired_template.and_then(|t| t.spec.as_ref()).unwrap_or(&empty);
    let observed_pod = observed_template.and_then(|t| t.spec.as_ref()).unwrap_or(&empty);

    for want in &desired_pod.containers {
        let Some(have) = observed_pod
            .containers
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(&want.name))
        else {
            return true;
        };
        if sorted_env(want) != sorted_env(have) {
            debug!(container = %want.name, "env drifted");
            return true;
        }
        if want.env_from.clone().unwrap_or_default() != have.env_from.clone().unwrap_or_default()
        {
            debug!(container = %want.name, "envFrom drifted");
            return true;
        }
        if sorted_mounts(want) != sorted_mounts(have) {
            debug!(container = %want.name, "volume mounts drifted");
            return true;
        }
    }

    !volumes_equal(
        desired_pod.volumes.as_deref().unwrap_or_default(),
        observed_pod.volumes.as_deref().unwrap_or_default(),
    )
}

fn sorted_env(c: &Container) -> Vec<EnvVar> {
    let mut env = c.env.clone().unwrap_or_default();
    env.sort_by(|a, b| a.name.cmp(&b.name));
    env
}

fn sorted_mounts(c: &Container) -> Vec<VolumeMount> {
    let mut mounts = c.volume_mounts.clone().unwrap_or_default();
    mounts.sort_by(|a, b| (&a.name, &a.mount_path).cmp(&(&b.name, &b.mount_path)));
    mounts
}

fn sorted_items(items: Option<&Vec<KeyToPath>>) -> Vec<KeyToPath> {
    let mut items = items.cloned().unwrap_or_default();
    items.sort_by(|a, b| a.key.cmp(&b.key));
    items
}

/// Structural volume comparison, order-insensitive by volume name
pub fn volumes_equal(desired: &[Volume], observed: &[Volume]) -> bool {
    if desired.len() != observed.len() {
        return false;
    }
    let mut desired: Vec<&Volume> = desired.iter().collect();
    let mut observed: Vec<&Volume> = observed.iter().collect();
    desired.sort_by(|a, b| a.name.cmp(&b.name));
    observed.sort_by(|a, b| a.name.cmp(&b.name));

    desired.iter().zip(observed.iter()).all(|(want, have)| {
        if want.name != have.name {
            return false;
        }
        match (&want.secret, &have.secret, &want.config_map, &have.config_map) {
            (Some(w), Some(h), _, _) => {
                w.secret_name == h.secret_name
                    && sorted_items(w.items.as_ref()) == sorted_items(h.items.as_ref())
            }
            (_, _, Some(w), Some(h)) => {
                w.name == h.name
                    && sorted_items(w.items.as_ref()) == sorted_items(h.items.as_ref())
            }
            (Some(_), None, _, _) | (None, Some(_), _, _) => false,
            (_, _, Some(_), None) | (_, _, None, Some(_)) => false,
            _ => want == have,
        }
    })
}

fn same_map<V: PartialEq>(a: Option<&BTreeMap<String, V>>, b: Option<&BTreeMap<String, V>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        (Some(m), None) | (None, Some(m)) => m.is_empty(),
        (None, None) => true,
    }
}

pub fn config_map_drifted(desired: &ConfigMap, observed: &ConfigMap) -> bool {
    !same_map(desired.data.as_ref(), observed.data.as_ref())
        || !same_map(desired.binary_data.as_ref(), observed.binary_data.as_ref())
}

/// `data` with `stringData` folded in, as the API server stores it
pub fn effective_secret_data(secret: &Secret) -> BTreeMap<String, ByteString> {
    let mut data = secret.data.clone().unwrap_or_default();
    if let Some(string_data) = &secret.string_data {
        for (k, v) in string_data {
            data.insert(k.clone(), ByteString(v.as_bytes().to_vec()));
        }
    }
    data
}

pub fn secret_drifted(desired: &Secret, observed: &Secret) -> bool {
    effective_secret_data(desired) != effective_secret_data(observed)
}

pub fn service_account_drifted(desired: &ServiceAccount, observed: &ServiceAccount) -> bool {
    desired.image_pull_secrets.clone().unwrap_or_default()
        != observed.image_pull_secrets.clone().unwrap_or_default()
        || (desired.automount_service_account_token.is_some()
            && desired.automount_service_account_token
                != observed.automount_service_account_token)
}

/// Aggregated roles have their rules filled in by the controller manager, so
/// only the aggregation rule is compared for them.
pub fn cluster_role_drifted(desired: &ClusterRole, observed: &ClusterRole) -> bool {
    if desired.aggregation_rule.is_some() {
        return desired.aggregation_rule != observed.aggregation_rule;
    }
    desired.rules.clone().unwrap_or_default() != observed.rules.clone().unwrap_or_default()
}

fn normalize_subject(s: &Subject) -> Subject {
    let mut s = s.clone();
    if s.api_group.as_deref().map_or(true, str::is_empty) {
        s.api_group = match s.kind.as_str() {
            "User" | "Group" => Some("rbac.authorization.k8s.io".to_string()),
            _ => None,
        };
    }
    s
}

fn normalized_subjects(crb: &ClusterRoleBinding) -> Vec<Subject> {
    let mut subjects: Vec<Subject> = crb
        .subjects
        .iter()
        .flatten()
        .map(normalize_subject)
        .collect();
    subjects.sort_by(|a, b| {
        (&a.kind, &a.namespace, &a.name).cmp(&(&b.kind, &b.namespace, &b.name))
    });
    subjects
}

/// Binding drift covers subjects only; `roleRef` is immutable once created.
pub fn cluster_role_binding_drifted(
    desired: &ClusterRoleBinding,
    observed: &ClusterRoleBinding,
) -> bool {
    if desired.role_ref != observed.role_ref {
        warn!(
            name = desired.metadata.name.as_deref().unwrap_or_default(),
            desired = %desired.role_ref.name,
            observed = %observed.role_ref.name,
            "ClusterRoleBinding roleRef differs but is immutable; leaving it unchanged"
        );
    }
    normalized_subjects(desired) != normalized_subjects(observed)
}

/// Port view with server defaults applied
#[derive(Debug, PartialEq, Eq)]
struct PortProjection {
    name: Option<String>,
    port: i32,
    target_port: IntOrString,
    protocol: String,
    node_port: Option<i32>,
}

fn project_port(p: &ServicePort, compare_node_port: bool) -> PortProjection {
    PortProjection {
        name: p.name.clone().filter(|n| !n.is_empty()),
        port: p.port,
        target_port: p
            .target_port
            .clone()
            .unwrap_or(IntOrString::Int(p.port)),
        protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
        node_port: if compare_node_port { p.node_port } else { None },
    }
}

pub fn service_drifted(desired: &Service, observed: &Service) -> bool {
    let empty = Default::default();
    let want = desired.spec.as_ref().unwrap_or(&empty);
    let have = observed.spec.as_ref().unwrap_or(&empty);

    let want_type = want.type_.as_deref().unwrap_or("ClusterIP");
    let have_type = have.type_.as_deref().unwrap_or("ClusterIP");
    if want_type != have_type {
        return true;
    }
    if !same_map(want.selector.as_ref(), have.selector.as_ref()) {
        return true;
    }

    let want_ports = want.ports.as_deref().unwrap_or_default();
    let have_ports = have.ports.as_deref().unwrap_or_default();
    if want_ports.len() != have_ports.len() {
        return true;
    }
    want_ports.iter().any(|wp| {
        let compare_node_port = wp.node_port.is_some();
        let projected = project_port(wp, compare_node_port);
        !have_ports
            .iter()
            .any(|hp| project_port(hp, compare_node_port) == projected)
    })
}
