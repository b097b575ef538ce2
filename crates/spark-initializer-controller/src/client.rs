//! Control-plane access
//!
//! Every API call the initializer makes goes through [`ControlPlane`], so the
//! reconciler and registration logic can be tested against a mock while
//! production uses [`KubeControlPlane`].

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use spark_initializer_common::{Error, PodKey, Result, FIELD_MANAGER};

use crate::resources::InitializerConfiguration;

/// Operations on pods and the registration record
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Fetch a pod; `None` if it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Replace a pod with the given object
    async fn update_pod(&self, pod: &Pod) -> Result<Pod>;

    /// Apply a strategic merge patch to a pod
    async fn patch_pod(&self, namespace: &str, name: &str, patch: &serde_json::Value)
        -> Result<Pod>;

    /// Fetch the registration record; `None` if it does not exist
    async fn get_registration(&self, name: &str) -> Result<Option<InitializerConfiguration>>;

    /// Create the registration record
    async fn create_registration(
        &self,
        registration: &InitializerConfiguration,
    ) -> Result<InitializerConfiguration>;

    /// Replace the registration record
    async fn update_registration(
        &self,
        registration: &InitializerConfiguration,
    ) -> Result<InitializerConfiguration>;

    /// Delete the registration record
    async fn delete_registration(&self, name: &str) -> Result<()>;
}

/// [`ControlPlane`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
}

impl KubeControlPlane {
    /// Create a control plane facade over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn registrations(&self) -> Api<InitializerConfiguration> {
        Api::all(self.client.clone())
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.pods(namespace).get_opt(name).await?)
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod> {
        let key = PodKey::from_pod(pod).ok_or_else(|| {
            Error::invalid_key(pod.metadata.name.clone().unwrap_or_default())
        })?;
        debug!(pod = %key, "replacing pod");
        Ok(self
            .pods(&key.namespace)
            .replace(&key.name, &post_params(), pod)
            .await?)
    }

    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<Pod> {
        debug!(namespace = %namespace, pod = %name, "strategic merge patching pod");
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(self
            .pods(namespace)
            .patch(name, &params, &Patch::Strategic(patch))
            .await?)
    }

    async fn get_registration(&self, name: &str) -> Result<Option<InitializerConfiguration>> {
        Ok(self.registrations().get_opt(name).await?)
    }

    async fn create_registration(
        &self,
        registration: &InitializerConfiguration,
    ) -> Result<InitializerConfiguration> {
        Ok(self
            .registrations()
            .create(&post_params(), registration)
            .await?)
    }

    async fn update_registration(
        &self,
        registration: &InitializerConfiguration,
    ) -> Result<InitializerConfiguration> {
        let name = registration.metadata.name.clone().unwrap_or_default();
        Ok(self
            .registrations()
            .replace(&name, &post_params(), registration)
            .await?)
    }

    async fn delete_registration(&self, name: &str) -> Result<()> {
        self.registrations()
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}
