//! Pod identity used as the work queue key and in log fields

use std::fmt;

use k8s_openapi::api::core::v1::Pod;

use crate::Error;

/// Namespace + name of a pod.
///
/// Rendered as `namespace/name`. The queue carries nothing but this key; the
/// reconciler always re-reads the live pod.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
}

impl PodKey {
    /// Create a key from its parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of the given pod, or `None` if it lacks a name or namespace
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let namespace = pod.metadata.namespace.as_deref().filter(|s| !s.is_empty())?;
        let name = pod.metadata.name.as_deref().filter(|s| !s.is_empty())?;
        Some(Self::new(namespace, name))
    }

    /// Parse a `namespace/name` key
    pub fn parse(key: &str) -> Result<Self, Error> {
        let mut parts = key.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(ns), Some(name), None) if !ns.is_empty() && !name.is_empty() => {
                Ok(Self::new(ns, name))
            }
            _ => Err(Error::invalid_key(key)),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl std::str::FromStr for PodKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
