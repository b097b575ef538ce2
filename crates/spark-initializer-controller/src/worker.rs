//! Queue workers
//!
//! Each worker pops a key, reconciles it and either forgets it (success) or
//! requeues it with backoff (failure). A panic while reconciling one key is
//! caught and treated as a failure of that key only.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use spark_initializer_common::metrics::{record_queue_depth, record_reconcile};
use spark_initializer_common::{Error, InitializerConfig, PodKey};
use spark_initializer_queue::RateLimitingQueue;

use crate::lifecycle::{ProcessingStage, StageTracker};
use crate::reconcile::{ReconcileOutcome, Reconciler};

/// Shared state of the worker pool
#[derive(Clone)]
pub struct WorkerContext {
    /// Retry queue
    pub queue: RateLimitingQueue<PodKey>,
    /// Reconciler used for every key
    pub reconciler: Arc<Reconciler>,
    /// Processing stages
    pub stages: Arc<StageTracker>,
    /// Initializer configuration
    pub config: Arc<InitializerConfig>,
}

/// Process keys until the queue shuts down
pub async fn run_worker(id: usize, ctx: WorkerContext) {
    debug!(worker = id, "worker started");
    while let Some(key) = ctx.queue.get().await {
        process_item(&ctx, key).await;
    }
    debug!(worker = id, "worker stopped");
}

/// Reconcile one key and settle it in the queue
pub async fn process_item(ctx: &WorkerContext, key: PodKey) {
    advance(ctx, &key, ProcessingStage::Mutating);

    let started = Instant::now();
    let result = AssertUnwindSafe(ctx.reconciler.reconcile(&key))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            error!(pod = %key, panic = %message, "reconcile panicked");
            Err(Error::internal_with_context("worker", format!("reconcile panicked: {}", message)))
        });
    let elapsed = started.elapsed().as_secs_f64();

    match result {
        Ok(outcome) => {
            record_reconcile(outcome.as_str(), elapsed);
            ctx.queue.forget(&key);
            ctx.stages.clear_failures(&key);
            settle_success(ctx, &key, outcome);
        }
        Err(e) => {
            record_reconcile("error", elapsed);
            handle_failure(ctx, &key, e);
        }
    }

    ctx.queue.done(&key);
    record_queue_depth(ctx.queue.len());
}

fn settle_success(ctx: &WorkerContext, key: &PodKey, outcome: ReconcileOutcome) {
    if outcome.wrote_pod() {
        advance(ctx, key, ProcessingStage::Patched);
        advance(ctx, key, ProcessingStage::Done);
    } else {
        debug!(pod = %key, outcome = outcome.as_str(), "nothing to do");
        ctx.stages.remove(key);
    }
}

fn handle_failure(ctx: &WorkerContext, key: &PodKey, error: Error) {
    let requeues = ctx.queue.num_requeues(key);
    if !error.is_permanent() {
        ctx.stages.clear_failures(key);
        info!(pod = %key, error = %error, requeues, "reconcile failed, retrying");
        requeue(ctx, key);
        return;
    }

    let failures = ctx.stages.record_permanent_failure(key);
    if ctx.config.terminal_failure.should_give_up(failures) {
        error!(pod = %key, error = %error, failures, "giving up on pod");
        record_reconcile("dropped", 0.0);
        ctx.queue.forget(key);
        ctx.stages.remove(key);
        return;
    }

    warn!(pod = %key, error = %error, failures, "pod cannot be initialized as-is, retrying");
    requeue(ctx, key);
}

fn requeue(ctx: &WorkerContext, key: &PodKey) {
    advance(ctx, key, ProcessingStage::Queued);
    ctx.queue.add_rate_limited(key.clone());
}

fn advance(ctx: &WorkerContext, key: &PodKey, to: ProcessingStage) {
    if let Err(e) = ctx.stages.transition(key, to) {
        debug!(pod = %key, error = %e, "rejected stage transition");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
