//! Work queue keys of the form `namespace/name`.

use kube::ResourceExt;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid resource key: {0:?}")]
    Malformed(String),
}

/// Builds the queue key of an object. Objects without a namespace are keyed by name only.
pub fn key_for<K: ResourceExt>(obj: &K) -> String {
    let name = obj.name_any();
    match obj.namespace() {
        Some(ns) if !ns.is_empty() => join_key(&ns, &name),
        _ => name,
    }
}

pub fn join_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Splits a key into `(namespace, name)`. A key without a separator has the empty namespace.
pub fn split_key(key: &str) -> Result<(&str, &str), KeyError> {
    let mut parts = key.split('/');
    let (namespace, name) = match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) => ("", name),
        (Some(namespace), Some(name), None) => (namespace, name),
        _ => return Err(KeyError::Malformed(key.to_string())),
    };
    if name.is_empty() {
        return Err(KeyError::Malformed(key.to_string()));
    }
    Ok((namespace, name))
}
