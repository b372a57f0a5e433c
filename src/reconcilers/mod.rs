//! Reconciliation logic for custom resources

pub mod alert;

use crate::{Error, Result};

/// Join a namespace and name into a `namespace/name` key
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

/// Split a `namespace/name` key; a bare name has no namespace
pub fn split_key(key: &str) -> Result<(Option<&str>, &str)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((None, *name)),
        [ns, name] if !ns.is_empty() && !name.is_empty() => Ok((Some(*ns), *name)),
        _ => Err(Error::ValidationError(format!("invalid object key '{}'", key))),
    }
}
