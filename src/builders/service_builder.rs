//! Kubernetes Service builders for Alert and cfssl

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::builders::{build_labels, resource_name, selector_labels};
use crate::crd::Alert;

pub const CFSSL_PORT: i32 = 8888;

/// In-cluster Service for the Alert web server
pub fn build_cluster_service(alert: &Alert) -> Service {
    let name = alert.name_any();
    build_service(
        alert,
        resource_name(&name, ""),
        "alert",
        "ClusterIP",
        alert.spec.port,
    )
}

/// NodePort or LoadBalancer Service, depending on `exposeService`
pub fn build_exposed_service(alert: &Alert) -> Option<Service> {
    let type_ = match alert.spec.expose_service.to_ascii_uppercase().as_str() {
        "NODEPORT" => "NodePort",
        "LOADBALANCER" => "LoadBalancer",
        _ => return None,
    };
    let name = alert.name_any();
    Some(build_service(
        alert,
        resource_name(&name, "exposed"),
        "alert",
        type_,
        alert.spec.port,
    ))
}

/// Service for the bundled cfssl certificate authority
pub fn build_cfssl_service(alert: &Alert) -> Service {
    let name = alert.name_any();
    build_service(
        alert,
        resource_name(&name, "cfssl"),
        "cfssl",
        "ClusterIP",
        CFSSL_PORT,
    )
}

fn build_service(
    alert: &Alert,
    service_name: String,
    component: &str,
    type_: &str,
    port: i32,
) -> Service {
    let name = alert.name_any();

    Service {
        metadata: ObjectMeta {
            name: Some(service_name),
            namespace: alert.namespace(),
            labels: Some(build_labels(&alert.namespace().unwrap_or_default(), &name, component)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(type_.to_string()),
            selector: Some(selector_labels(&name, component)),
            ports: Some(vec![ServicePort {
                name: Some(format!("{}-tcp", port)),
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::AlertSpec;

    fn alert(expose: &str) -> Alert {
        let spec: AlertSpec = serde_json::from_value(serde_json::json!({
            "version": "5.3.0",
            "exposeService": expose
        }))
        .unwrap();
        Alert::new("demo", spec)
    }

    #[test]
    fn test_cluster_service() {
        let svc = build_cluster_service(&alert("NONE"));
        assert_eq!(svc.metadata.name.as_deref(), Some("demo-alert"));
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(spec.ports.unwrap()[0].port, 8443);
        assert_eq!(spec.selector.unwrap()["component"], "alert");
    }

    #[test]
    fn test_exposed_service_type() {
        assert!(build_exposed_service(&alert("NONE")).is_none());
        let svc = build_exposed_service(&alert("nodeport")).unwrap();
        assert_eq!(svc.metadata.name.as_deref(), Some("demo-alert-exposed"));
        assert_eq!(svc.spec.unwrap().type_.as_deref(), Some("NodePort"));
        let svc = build_exposed_service(&alert("LOADBALANCER")).unwrap();
        assert_eq!(svc.spec.unwrap().type_.as_deref(), Some("LoadBalancer"));
    }

    #[test]
    fn test_cfssl_service_port() {
        let svc = build_cfssl_service(&alert("NONE"));
        assert_eq!(svc.spec.unwrap().ports.unwrap()[0].port, CFSSL_PORT);
    }
}
