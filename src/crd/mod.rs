//! Custom Resource Definitions for the converge operator

mod alert;

pub use alert::*;

use kube::CustomResourceExt;

use crate::Result;

/// Generate CRD YAML manifests for all custom resources
pub fn generate_crds() -> Result<Vec<String>> {
    let crd = serde_yaml::to_string(&Alert::crd())
        .map_err(|e| crate::Error::ConfigError(format!("failed to render Alert CRD: {}", e)))?;
    Ok(vec![crd])
}
