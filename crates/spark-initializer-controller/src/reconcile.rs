//! Reconciliation of a single pod
//!
//! The reconciler always works on a freshly fetched pod. Spark pods are
//! mutated and submitted as a minimal strategic merge patch; everything else only has
//! the sentinel removed and is written back whole.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, instrument};

use spark_initializer_common::{InitializerConfig, PodKey, Result};
use spark_initializer_mutation::{has_marker, Mutator};

use crate::client::ControlPlane;
use crate::dispatcher::{is_workload_pod, workload_role};
use crate::patch::{is_empty_patch, pod_patch};

/// Result of a successful reconciliation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Spark pod mutated and patched
    Patched,
    /// Non-Spark pod released by whole-object update
    Released,
    /// Pod no longer exists
    NotFound,
    /// Pod no longer waits for us
    AlreadyInitialized,
}

impl ReconcileOutcome {
    /// Metric label
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Patched => "patched",
            Self::Released => "released",
            Self::NotFound => "not_found",
            Self::AlreadyInitialized => "already_initialized",
        }
    }

    /// Whether the pod was written
    pub fn wrote_pod(self) -> bool {
        matches!(self, Self::Patched | Self::Released)
    }
}

/// Fetches, mutates and submits pods
pub struct Reconciler {
    control_plane: Arc<dyn ControlPlane>,
    mutator: Mutator,
    config: Arc<InitializerConfig>,
}

impl Reconciler {
    /// Create a reconciler
    pub fn new(control_plane: Arc<dyn ControlPlane>, config: Arc<InitializerConfig>) -> Self {
        Self {
            control_plane,
            mutator: Mutator::new(&config),
            config,
        }
    }

    /// Reconcile the pod behind `key`.
    ///
    /// A missing pod or a pod without the sentinel is a success. Errors are
    /// meant to be retried by the caller; pods without containers fail with
    /// a permanent validation error.
    #[instrument(skip(self, key), fields(pod = %key))]
    pub async fn reconcile(&self, key: &PodKey) -> Result<ReconcileOutcome> {
        let Some(pod) = self
            .control_plane
            .get_pod(&key.namespace, &key.name)
            .await?
        else {
            debug!("pod no longer exists");
            return Ok(ReconcileOutcome::NotFound);
        };

        if !has_marker(&pod, &self.config.initializer_name) {
            debug!("pod already initialized");
            return Ok(ReconcileOutcome::AlreadyInitialized);
        }

        if !is_workload_pod(&pod, &self.config) {
            self.handle_non_workload_pod(&pod).await?;
            return Ok(ReconcileOutcome::Released);
        }

        info!(
            role = workload_role(&pod, &self.config).unwrap_or_default(),
            "processing Spark pod"
        );
        let mutation = self.mutator.mutate(&pod)?;
        let patch = pod_patch(&mutation.original, &mutation.mutated)?;
        if is_empty_patch(&patch) {
            return Ok(ReconcileOutcome::AlreadyInitialized);
        }

        self.control_plane
            .patch_pod(&key.namespace, &key.name, &patch)
            .await?;
        info!("initialized Spark pod");
        Ok(ReconcileOutcome::Patched)
    }

    /// Release a non-Spark pod: remove the sentinel and replace the pod
    pub async fn handle_non_workload_pod(&self, pod: &Pod) -> Result<Pod> {
        let released = self.mutator.release(pod);
        self.control_plane.update_pod(&released).await
    }
}
