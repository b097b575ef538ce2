//! Registration record
//!
//! `InitializerConfiguration` is not part of the generated Kubernetes types,
//! so it is declared here with a hand-written [`kube::Resource`] impl.

use std::borrow::Cow;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// API group of the registration record
pub const REGISTRATION_GROUP: &str = "admissionregistration.k8s.io";
/// API version of the registration record
pub const REGISTRATION_VERSION: &str = "v1alpha1";
/// Kind of the registration record
pub const REGISTRATION_KIND: &str = "InitializerConfiguration";
/// Plural resource name of the registration record
pub const REGISTRATION_PLURAL: &str = "initializerconfigurations";

/// Cluster-scoped list of initializers and the resources they act on
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializerConfiguration {
    /// `admissionregistration.k8s.io/v1alpha1`
    pub api_version: String,
    /// `InitializerConfiguration`
    pub kind: String,
    /// Standard object metadata
    pub metadata: ObjectMeta,
    /// Registered initializers
    #[serde(default)]
    pub initializers: Vec<Initializer>,
}

/// One registered initializer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Initializer {
    /// Name pods carry in their pending list
    pub name: String,
    /// Resources this initializer handles
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Resource selector of an initializer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// API groups, `*` for all
    #[serde(default)]
    pub api_groups: Vec<String>,
    /// API versions, `*` for all
    #[serde(default)]
    pub api_versions: Vec<String>,
    /// Resource names
    #[serde(default)]
    pub resources: Vec<String>,
}

impl InitializerConfiguration {
    /// Create a record with the given name and initializers
    pub fn new(name: impl Into<String>, initializers: Vec<Initializer>) -> Self {
        Self {
            api_version: format!("{}/{}", REGISTRATION_GROUP, REGISTRATION_VERSION),
            kind: REGISTRATION_KIND.to_string(),
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            initializers,
        }
    }

    /// Whether an initializer with this name is registered
    pub fn contains(&self, initializer_name: &str) -> bool {
        self.initializers.iter().any(|i| i.name == initializer_name)
    }
}

impl Initializer {
    /// Entry for an initializer acting on pods of every group and version
    pub fn for_pods(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: vec![Rule {
                api_groups: vec!["*".to_string()],
                api_versions: vec!["*".to_string()],
                resources: vec!["pods".to_string()],
            }],
        }
    }
}

impl kube::Resource for InitializerConfiguration {
    type DynamicType = ();
    type Scope = k8s_openapi::ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(REGISTRATION_KIND)
    }

    fn group(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(REGISTRATION_GROUP)
    }

    fn version(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(REGISTRATION_VERSION)
    }

    fn plural(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(REGISTRATION_PLURAL)
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
