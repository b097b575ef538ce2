//! Initializer process lifecycle
//!
//! [`Initializer::run`] registers, starts the dispatcher and the workers,
//! blocks until the stop token fires, then drains and deregisters.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use spark_initializer_common::{InitializerConfig, PodKey, Result};
use spark_initializer_queue::{default_controller_rate_limiter, RateLimitingQueue};

use crate::client::ControlPlane;
use crate::dispatcher::Dispatcher;
use crate::lifecycle::StageTracker;
use crate::reconcile::Reconciler;
use crate::registration::{deregister, ensure_registered};
use crate::watch::PodEvent;
use crate::worker::{run_worker, WorkerContext};

/// Name of the retry queue in logs
const QUEUE_NAME: &str = "spark-pod-initializer";

/// The Spark pod initializer
#[derive(Clone)]
pub struct Initializer {
    config: Arc<InitializerConfig>,
    control_plane: Arc<dyn ControlPlane>,
    queue: RateLimitingQueue<PodKey>,
    reconciler: Arc<Reconciler>,
    stages: Arc<StageTracker>,
}

impl Initializer {
    /// Create an initializer talking to `control_plane`
    pub fn new(config: InitializerConfig, control_plane: Arc<dyn ControlPlane>) -> Self {
        let config = Arc::new(config);
        let limiter = default_controller_rate_limiter(
            config.queue.base_delay,
            config.queue.max_delay,
            config.queue.qps,
            config.queue.burst,
        );
        let reconciler = Arc::new(Reconciler::new(control_plane.clone(), config.clone()));
        Self {
            config,
            control_plane,
            queue: RateLimitingQueue::new(QUEUE_NAME, limiter),
            reconciler,
            stages: Arc::new(StageTracker::new()),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &InitializerConfig {
        &self.config
    }

    /// Retry queue shared by the dispatcher and the workers
    pub fn queue(&self) -> &RateLimitingQueue<PodKey> {
        &self.queue
    }

    /// Processing stages of the pods in flight
    pub fn stages(&self) -> &StageTracker {
        &self.stages
    }

    /// Run until `stop` fires.
    ///
    /// Returns at once if registration fails. Otherwise the result of
    /// deregistration is returned after workers have drained the queue.
    pub async fn run(
        &self,
        workers: usize,
        events: mpsc::Receiver<PodEvent>,
        stop: CancellationToken,
    ) -> Result<()> {
        ensure_registered(self.control_plane.as_ref(), &self.config).await?;

        let workers = if workers == 0 {
            warn!("worker count of 0 requested, using 1");
            1
        } else {
            workers
        };
        info!(
            workers,
            initializer = %self.config.initializer_name,
            "starting Spark pod initializer"
        );

        let dispatcher = Dispatcher::new(
            self.config.clone(),
            self.queue.clone(),
            self.reconciler.clone(),
            self.stages.clone(),
        );
        let dispatch = tokio::spawn(dispatcher.run(events, stop.clone()));

        let ctx = WorkerContext {
            queue: self.queue.clone(),
            reconciler: self.reconciler.clone(),
            stages: self.stages.clone(),
            config: self.config.clone(),
        };
        let pool: Vec<JoinHandle<()>> = (0..workers)
            .map(|id| tokio::spawn(run_worker(id, ctx.clone())))
            .collect();

        stop.cancelled().await;
        info!("shutting down Spark pod initializer");

        self.queue.shut_down();
        if let Err(e) = dispatch.await {
            error!(error = %e, "dispatcher task failed");
        }
        for handle in pool {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task failed");
            }
        }

        let result = deregister(self.control_plane.as_ref(), &self.config).await;
        if let Err(e) = &result {
            error!(error = %e, "failed to deregister");
        }
        result
    }

    /// Run in the background, sending the final result on `outcome`
    pub fn start(
        &self,
        workers: usize,
        events: mpsc::Receiver<PodEvent>,
        stop: CancellationToken,
        outcome: oneshot::Sender<Result<()>>,
    ) -> JoinHandle<()> {
        let initializer = self.clone();
        tokio::spawn(async move {
            let result = initializer.run(workers, events, stop).await;
            if outcome.send(result).is_err() {
                warn!("initializer outcome receiver dropped");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockControlPlane;
    use crate::resources::InitializerConfiguration;
    use kube::core::ErrorResponse;
    use spark_initializer_common::Error;

    #[tokio::test]
    async fn test_registration_failure_returns_immediately() {
        let mut cp = MockControlPlane::new();
        cp.expect_get_registration().returning(|_| Ok(None));
        cp.expect_create_registration().returning(|_| {
            Err(Error::from(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "forbidden".to_string(),
                reason: "Forbidden".to_string(),
                code: 403,
            })))
        });
        cp.expect_delete_registration().never();

        let initializer = Initializer::new(InitializerConfig::default(), Arc::new(cp));
        let (_tx, rx) = mpsc::channel(1);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        // Never cancelled: must not block
        initializer.start(2, rx, CancellationToken::new(), outcome_tx);

        let err = outcome_rx.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Registration { .. }));
    }

    #[tokio::test]
    async fn test_stop_deregisters() {
        let mut cp = MockControlPlane::new();
        cp.expect_get_registration().returning(|_| Ok(None));
        cp.expect_create_registration()
            .returning(|r: &InitializerConfiguration| Ok(r.clone()));
        cp.expect_delete_registration()
            .withf(|name| name == "spark-pod-initializer-config")
            .times(1)
            .returning(|_| Ok(()));

        let initializer = Initializer::new(InitializerConfig::default(), Arc::new(cp));
        let (_tx, rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        initializer.start(0, rx, stop.clone(), outcome_tx);

        stop.cancel();
        outcome_rx.await.unwrap().unwrap();
        assert!(initializer.queue().is_shutting_down());
    }
}
