//! Initializer configuration
//!
//! Every component receives an [`InitializerConfig`] at construction instead of
//! reading process-wide constants, so tests can run several independently
//! configured initializers side by side.

use std::time::Duration;

/// Name that appears in the pending list of pods awaiting this initializer
pub const DEFAULT_INITIALIZER_NAME: &str = "pod-initializer.spark-operator.k8s.io";

/// Name of the cluster-scoped registration record
pub const DEFAULT_REGISTRATION_NAME: &str = "spark-pod-initializer-config";

/// Label distinguishing Spark pods from other pods
pub const DEFAULT_ROLE_LABEL: &str = "spark-role";

/// `spark-role` value of driver pods
pub const DEFAULT_DRIVER_ROLE: &str = "driver";

/// `spark-role` value of executor pods
pub const DEFAULT_EXECUTOR_ROLE: &str = "executor";

/// Annotation domain used by the Spark operator
pub const DEFAULT_ANNOTATION_PREFIX: &str = "sparkoperator.k8s.io";

/// Default number of concurrent queue workers
pub const DEFAULT_WORKERS: usize = 4;

/// What to do when the inline path for a non-Spark pod fails
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NonWorkloadFailurePolicy {
    /// Log the failure and move on; the pod stays uninitialized until it is
    /// observed again
    #[default]
    BestEffort,
    /// Hand the key to the retry queue like any Spark pod
    Retry,
}

/// What to do with a key whose reconciliation keeps failing permanently
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TerminalFailurePolicy {
    /// Keep requeueing with backoff until the pod changes or is deleted
    #[default]
    RetryForever,
    /// Retry a permanent error this many times, then drop the key
    GiveUpAfter(u32),
}

impl TerminalFailurePolicy {
    /// Whether a key should be dropped after its `failures`-th consecutive
    /// permanent failure. Transient failures are not counted.
    pub fn should_give_up(&self, failures: u32) -> bool {
        match self {
            Self::RetryForever => false,
            Self::GiveUpAfter(retries) => failures > *retries,
        }
    }
}

/// Backoff settings for the retry queue
#[derive(Clone, Debug, PartialEq)]
pub struct QueueConfig {
    /// Delay after the second consecutive failure; doubles afterwards
    pub base_delay: Duration,
    /// Ceiling for the per-key delay
    pub max_delay: Duration,
    /// Sustained overall requeue rate
    pub qps: f64,
    /// Requeues allowed in a burst before `qps` applies
    pub burst: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            qps: 10.0,
            burst: 100,
        }
    }
}

/// Annotation keys the mutation rules look for
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnotationConfig {
    /// Domain prefix, without the trailing slash
    pub prefix: String,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_ANNOTATION_PREFIX.to_string(),
        }
    }
}

impl AnnotationConfig {
    /// Full annotation key for `suffix`
    pub fn key(&self, suffix: &str) -> String {
        format!("{}/{}", self.prefix, suffix)
    }

    /// Name of the Spark ConfigMap to mount at the Spark conf dir
    pub fn spark_config_map(&self) -> String {
        self.key("sparkConfigMap")
    }

    /// Name of the Hadoop ConfigMap to mount at the Hadoop conf dir
    pub fn hadoop_config_map(&self) -> String {
        self.key("hadoopConfigMap")
    }

    /// Prefix of `configMap.<name>: <mount path>` annotations
    pub fn config_map_prefix(&self) -> String {
        self.key("configMap.")
    }

    /// Prefix of `GCPServiceAccount.<name>: <mount path>` annotations
    pub fn gcp_service_account_prefix(&self) -> String {
        self.key("GCPServiceAccount.")
    }

    /// Prefix of `secret.<name>: <mount path>` annotations
    pub fn secret_prefix(&self) -> String {
        self.key("secret.")
    }

    /// JSON-encoded OwnerReference to attach to the pod
    pub fn owner_reference(&self) -> String {
        self.key("ownerReference")
    }
}

/// Configuration shared by every initializer component
#[derive(Clone, Debug, PartialEq)]
pub struct InitializerConfig {
    /// Name of this initializer in pods' pending lists
    pub initializer_name: String,
    /// Name of the registration record
    pub registration_name: String,
    /// Label carrying the Spark role
    pub role_label: String,
    /// Role value of driver pods
    pub driver_role: String,
    /// Role value of executor pods
    pub executor_role: String,
    /// Namespace to watch; `None` watches all namespaces
    pub watch_namespace: Option<String>,
    /// Annotation keys
    pub annotations: AnnotationConfig,
    /// Retry queue backoff
    pub queue: QueueConfig,
    /// Failure handling for the inline non-Spark path
    pub non_workload_failure: NonWorkloadFailurePolicy,
    /// Failure handling for permanently failing keys
    pub terminal_failure: TerminalFailurePolicy,
}

impl Default for InitializerConfig {
    fn default() -> Self {
        Self {
            initializer_name: DEFAULT_INITIALIZER_NAME.to_string(),
            registration_name: DEFAULT_REGISTRATION_NAME.to_string(),
            role_label: DEFAULT_ROLE_LABEL.to_string(),
            driver_role: DEFAULT_DRIVER_ROLE.to_string(),
            executor_role: DEFAULT_EXECUTOR_ROLE.to_string(),
            watch_namespace: None,
            annotations: AnnotationConfig::default(),
            queue: QueueConfig::default(),
            non_workload_failure: NonWorkloadFailurePolicy::default(),
            terminal_failure: TerminalFailurePolicy::default(),
        }
    }
}

impl InitializerConfig {
    /// Whether `role` is a recognized Spark role
    pub fn is_workload_role(&self, role: &str) -> bool {
        role == self.driver_role || role == self.executor_role
    }
}
