//! Watch event dispatch
//!
//! A single loop consumes [`PodEvent`]s. Spark pods go to the retry queue;
//! other pods that carry the sentinel are released inline.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use spark_initializer_common::metrics::{record_inline_update, record_queue_depth};
use spark_initializer_common::{InitializerConfig, NonWorkloadFailurePolicy, PodKey};
use spark_initializer_mutation::has_marker;
use spark_initializer_queue::RateLimitingQueue;

use crate::lifecycle::{ProcessingStage, StageTracker};
use crate::reconcile::Reconciler;
use crate::watch::PodEvent;

/// Where an added pod goes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// Not waiting for us
    Ignore,
    /// Spark pod: handled by the workers
    Enqueue(PodKey),
    /// Other pod waiting for us: released right away
    Inline,
}

/// Spark role of the pod, if it has a recognized one
pub fn workload_role<'a>(pod: &'a Pod, config: &InitializerConfig) -> Option<&'a str> {
    pod.metadata
        .labels
        .as_ref()?
        .get(&config.role_label)
        .map(String::as_str)
        .filter(|role| config.is_workload_role(role))
}

/// Whether the pod is a Spark driver or executor
pub fn is_workload_pod(pod: &Pod, config: &InitializerConfig) -> bool {
    workload_role(pod, config).is_some()
}

/// Decide what to do with a newly observed pod
pub fn classify(pod: &Pod, config: &InitializerConfig) -> Route {
    if !has_marker(pod, &config.initializer_name) {
        return Route::Ignore;
    }
    if !is_workload_pod(pod, config) {
        return Route::Inline;
    }
    match PodKey::from_pod(pod) {
        Some(key) => Route::Enqueue(key),
        None => Route::Ignore,
    }
}

/// Consumes watch events and routes them
pub struct Dispatcher {
    config: Arc<InitializerConfig>,
    queue: RateLimitingQueue<PodKey>,
    reconciler: Arc<Reconciler>,
    stages: Arc<StageTracker>,
}

impl Dispatcher {
    /// Create a dispatcher feeding `queue`
    pub fn new(
        config: Arc<InitializerConfig>,
        queue: RateLimitingQueue<PodKey>,
        reconciler: Arc<Reconciler>,
        stages: Arc<StageTracker>,
    ) -> Self {
        Self {
            config,
            queue,
            reconciler,
            stages,
        }
    }

    /// Dispatch events until `stop` fires or the sender side closes
    pub async fn run(self, mut events: mpsc::Receiver<PodEvent>, stop: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = stop.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(event) => self.handle(event).await,
                None => {
                    warn!("pod event channel closed");
                    break;
                }
            }
        }
        debug!("dispatcher stopped");
    }

    /// Handle a single event
    pub async fn handle(&self, event: PodEvent) {
        match event {
            PodEvent::Added(pod) => self.on_added(pod).await,
            PodEvent::Deleted(pod) => self.on_deleted(&pod),
        }
    }

    async fn on_added(&self, pod: Pod) {
        match classify(&pod, &self.config) {
            Route::Ignore => {}
            Route::Enqueue(key) => {
                info!(
                    pod = %key,
                    role = workload_role(&pod, &self.config).unwrap_or_default(),
                    "queueing Spark pod"
                );
                self.observe(&key);
                self.advance(&key, ProcessingStage::Queued);
                self.queue.add_rate_limited(key);
                record_queue_depth(self.queue.len());
            }
            Route::Inline => self.release_inline(&pod).await,
        }
    }

    async fn release_inline(&self, pod: &Pod) {
        let Some(key) = PodKey::from_pod(pod) else {
            return;
        };
        self.observe(&key);
        self.advance(&key, ProcessingStage::Mutating);

        match self.reconciler.handle_non_workload_pod(pod).await {
            Ok(_) => {
                record_inline_update("updated");
                debug!(pod = %key, "released non-Spark pod");
                self.advance(&key, ProcessingStage::Patched);
                self.advance(&key, ProcessingStage::Done);
            }
            Err(e) => {
                record_inline_update("error");
                match self.config.non_workload_failure {
                    NonWorkloadFailurePolicy::BestEffort => {
                        error!(pod = %key, error = %e, "failed to release non-Spark pod");
                        self.stages.remove(&key);
                    }
                    NonWorkloadFailurePolicy::Retry => {
                        warn!(pod = %key, error = %e, "failed to release non-Spark pod, queueing for retry");
                        self.advance(&key, ProcessingStage::Queued);
                        self.queue.add_rate_limited(key);
                    }
                }
            }
        }
    }

    fn on_deleted(&self, pod: &Pod) {
        let Some(key) = PodKey::from_pod(pod) else {
            return;
        };
        if is_workload_pod(pod, &self.config) {
            info!(pod = %key, "Spark pod deleted, removing it from the work queue");
            self.queue.forget(&key);
            self.queue.done(&key);
        }
        self.stages.remove(&key);
    }

    fn observe(&self, key: &PodKey) {
        if let Err(e) = self.stages.observe(key) {
            warn!(pod = %key, error = %e, "unexpected stage on observe");
        }
    }

    fn advance(&self, key: &PodKey, to: ProcessingStage) {
        if let Err(e) = self.stages.transition(key, to) {
            warn!(pod = %key, error = %e, "rejected stage transition");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockControlPlane;
    use k8s_openapi::api::core::v1::{Container, PodSchedulingGate, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::core::ErrorResponse;
    use rstest::rstest;
    use spark_initializer_common::Error;
    use spark_initializer_queue::ItemExponentialFailureRateLimiter;
    use std::collections::BTreeMap;
    use std::time::Duration;

    const GATE: &str = "pod-initializer.spark-operator.k8s.io";

    fn pod(name: &str, role: Option<&str>, gated: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                labels: role.map(|r| BTreeMap::from([("spark-role".to_string(), r.to_string())])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".to_string(),
                    ..Default::default()
                }],
                scheduling_gates: gated.then(|| {
                    vec![PodSchedulingGate {
                        name: GATE.to_string(),
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[rstest]
    #[case::driver(Some("driver"), true, Route::Enqueue(PodKey::new("ns", "p")))]
    #[case::executor(Some("executor"), true, Route::Enqueue(PodKey::new("ns", "p")))]
    #[case::other_role(Some("shuffle"), true, Route::Inline)]
    #[case::unlabelled(None, true, Route::Inline)]
    #[case::initialized_driver(Some("driver"), false, Route::Ignore)]
    #[case::initialized_other(None, false, Route::Ignore)]
    fn test_classification(#[case] role: Option<&str>, #[case] gated: bool, #[case] expected: Route) {
        let config = InitializerConfig::default();
        assert_eq!(classify(&pod("p", role, gated), &config), expected);
    }

    fn dispatcher(
        cp: MockControlPlane,
        config: InitializerConfig,
    ) -> (Dispatcher, RateLimitingQueue<PodKey>, Arc<StageTracker>) {
        let config = Arc::new(config);
        let queue = RateLimitingQueue::new(
            "test",
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1)),
        );
        let stages = Arc::new(StageTracker::new());
        let reconciler = Arc::new(Reconciler::new(Arc::new(cp), config.clone()));
        (
            Dispatcher::new(config, queue.clone(), reconciler, stages.clone()),
            queue,
            stages,
        )
    }

    fn api_error() -> Error {
        Error::from(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "unavailable".to_string(),
            reason: "ServiceUnavailable".to_string(),
            code: 503,
        }))
    }

    #[tokio::test]
    async fn test_driver_is_queued_without_api_calls() {
        let (dispatcher, queue, stages) = dispatcher(MockControlPlane::new(), InitializerConfig::default());
        dispatcher.handle(PodEvent::Added(pod("driver-1", Some("driver"), true))).await;

        let key = PodKey::new("ns", "driver-1");
        assert_eq!(queue.len(), 1);
        assert_eq!(stages.stage(&key), Some(ProcessingStage::Queued));
        assert_eq!(queue.get().await, Some(key));
    }

    /// Story: a utility pod waiting for us is released by a single
    /// whole-object update with only the sentinel removed, and never queued
    #[tokio::test]
    async fn story_non_spark_pod_is_released_inline() {
        let mut cp = MockControlPlane::new();
        cp.expect_update_pod()
            .withf(|p| {
                p.metadata.name.as_deref() == Some("util-1")
                    && p.spec.as_ref().unwrap().scheduling_gates.is_none()
                    && p.spec.as_ref().unwrap().volumes.is_none()
            })
            .times(1)
            .returning(|p| Ok(p.clone()));
        cp.expect_patch_pod().never();

        let (dispatcher, queue, stages) = dispatcher(cp, InitializerConfig::default());
        dispatcher.handle(PodEvent::Added(pod("util-1", None, true))).await;

        assert!(queue.is_empty());
        assert_eq!(
            stages.stage(&PodKey::new("ns", "util-1")),
            Some(ProcessingStage::Done)
        );
    }

    #[tokio::test]
    async fn test_inline_failure_is_best_effort_by_default() {
        let mut cp = MockControlPlane::new();
        cp.expect_update_pod().times(1).returning(|_| Err(api_error()));

        let (dispatcher, queue, stages) = dispatcher(cp, InitializerConfig::default());
        dispatcher.handle(PodEvent::Added(pod("util-1", None, true))).await;

        assert!(queue.is_empty());
        assert!(stages.is_empty());
    }

    #[tokio::test]
    async fn test_inline_failure_can_be_retried() {
        let mut cp = MockControlPlane::new();
        cp.expect_update_pod().times(1).returning(|_| Err(api_error()));

        let config = InitializerConfig {
            non_workload_failure: NonWorkloadFailurePolicy::Retry,
            ..Default::default()
        };
        let (dispatcher, queue, stages) = dispatcher(cp, config);
        dispatcher.handle(PodEvent::Added(pod("util-1", None, true))).await;

        let key = PodKey::new("ns", "util-1");
        assert_eq!(queue.len(), 1);
        assert_eq!(stages.stage(&key), Some(ProcessingStage::Queued));
    }

    #[tokio::test]
    async fn test_initialized_pods_are_ignored() {
        let (dispatcher, queue, stages) = dispatcher(MockControlPlane::new(), InitializerConfig::default());
        dispatcher.handle(PodEvent::Added(pod("driver-1", Some("driver"), false))).await;
        dispatcher.handle(PodEvent::Added(pod("util-1", None, false))).await;
        assert!(queue.is_empty());
        assert!(stages.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_spark_pod_is_forgotten() {
        let (dispatcher, queue, stages) = dispatcher(MockControlPlane::new(), InitializerConfig::default());
        let driver = pod("driver-1", Some("driver"), true);
        let key = PodKey::new("ns", "driver-1");

        dispatcher.handle(PodEvent::Added(driver.clone())).await;
        // Simulate an earlier failure so there is backoff to forget
        queue.add_rate_limited(key.clone());
        assert_eq!(queue.num_requeues(&key), 2);

        dispatcher.handle(PodEvent::Deleted(driver)).await;
        assert_eq!(queue.num_requeues(&key), 0);
        assert!(stages.stage(&key).is_none());
    }

    #[tokio::test]
    async fn test_run_stops_when_cancelled() {
        let (dispatcher, _queue, _stages) = dispatcher(MockControlPlane::new(), InitializerConfig::default());
        let (_tx, rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        stop.cancel();
        dispatcher.run(rx, stop).await;
    }
}
