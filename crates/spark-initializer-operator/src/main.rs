//! Spark pod initializer - releases Spark driver and executor pods once their
//! volumes, mounts and owner are in place

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use spark_initializer_common::config::{
    DEFAULT_ANNOTATION_PREFIX, DEFAULT_INITIALIZER_NAME, DEFAULT_REGISTRATION_NAME, DEFAULT_WORKERS,
};
use spark_initializer_common::kube_utils::{create_client, ClientOptions};
use spark_initializer_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use spark_initializer_common::{
    AnnotationConfig, InitializerConfig, NonWorkloadFailurePolicy, QueueConfig,
    TerminalFailurePolicy,
};
use spark_initializer_controller::{spawn_pod_watcher, Initializer, KubeControlPlane};

/// Mutates Spark pods waiting for the initializer and releases them
#[derive(Parser, Debug)]
#[command(name = "spark-initializer", version, about, long_about = None)]
struct Cli {
    /// Number of concurrent queue workers
    #[arg(long, env = "SPARK_INITIALIZER_WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Path to a kubeconfig; in-cluster config is used when omitted
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long)]
    context: Option<String>,

    /// Only watch pods in this namespace
    #[arg(long, env = "SPARK_INITIALIZER_NAMESPACE")]
    namespace: Option<String>,

    /// Name of the initializer in pods' pending lists
    #[arg(long, env = "SPARK_INITIALIZER_NAME", default_value = DEFAULT_INITIALIZER_NAME)]
    initializer_name: String,

    /// Name of the registration record
    #[arg(long, env = "SPARK_INITIALIZER_REGISTRATION", default_value = DEFAULT_REGISTRATION_NAME)]
    registration_name: String,

    /// Domain of the annotations that request mounts
    #[arg(long, env = "SPARK_INITIALIZER_ANNOTATION_PREFIX", default_value = DEFAULT_ANNOTATION_PREFIX)]
    annotation_prefix: String,

    /// Retry failed releases of non-Spark pods instead of logging them
    #[arg(long, env = "SPARK_INITIALIZER_NON_WORKLOAD_RETRY")]
    non_workload_retry: bool,

    /// Drop a pod after this many retries of a permanent error (0 = never)
    #[arg(long, env = "SPARK_INITIALIZER_MAX_PERMANENT_RETRIES", default_value_t = 0)]
    max_permanent_retries: u32,

    /// Backoff after the second failure of a pod, in milliseconds
    #[arg(long, env = "SPARK_INITIALIZER_BASE_DELAY_MS", default_value_t = 5)]
    base_delay_ms: u64,

    /// Longest backoff of a pod, in seconds
    #[arg(long, env = "SPARK_INITIALIZER_MAX_DELAY_SECS", default_value_t = 1000)]
    max_delay_secs: u64,

    /// Sustained requeue rate across all pods
    #[arg(long, env = "SPARK_INITIALIZER_QPS", default_value_t = 10.0)]
    qps: f64,

    /// Requeues allowed in a burst
    #[arg(long, env = "SPARK_INITIALIZER_BURST", default_value_t = 100)]
    burst: u32,

    /// Log format: json or text
    #[arg(long, env = "SPARK_INITIALIZER_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

impl Cli {
    fn initializer_config(&self) -> InitializerConfig {
        InitializerConfig {
            initializer_name: self.initializer_name.clone(),
            registration_name: self.registration_name.clone(),
            watch_namespace: self.namespace.clone().filter(|ns| !ns.is_empty()),
            annotations: AnnotationConfig {
                prefix: self.annotation_prefix.trim_end_matches('/').to_string(),
            },
            queue: QueueConfig {
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_secs(self.max_delay_secs),
                qps: self.qps,
                burst: self.burst,
            },
            non_workload_failure: if self.non_workload_retry {
                NonWorkloadFailurePolicy::Retry
            } else {
                NonWorkloadFailurePolicy::BestEffort
            },
            terminal_failure: match self.max_permanent_retries {
                0 => TerminalFailurePolicy::RetryForever,
                n => TerminalFailurePolicy::GiveUpAfter(n),
            },
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _telemetry = init_telemetry(&TelemetryConfig {
        log_format: cli.log_format,
        ..Default::default()
    })
    .context("failed to initialize telemetry")?;

    let config = cli.initializer_config();
    info!(
        initializer = %config.initializer_name,
        registration = %config.registration_name,
        namespace = config.watch_namespace.as_deref().unwrap_or("<all>"),
        workers = cli.workers,
        "starting"
    );

    let client = create_client(&ClientOptions {
        kubeconfig: cli.kubeconfig.clone(),
        context: cli.context.clone(),
        ..Default::default()
    })
        .await
        .context("failed to create kubernetes client")?;

    let stop = CancellationToken::new();
    tokio::spawn(cancel_on_signal(stop.clone()));

    let (events, watch) = spawn_pod_watcher(client.clone(), &config, stop.clone());
    let initializer = Initializer::new(config, Arc::new(KubeControlPlane::new(client)));
    let (outcome_tx, outcome_rx) = oneshot::channel();
    initializer.start(cli.workers, events, stop.clone(), outcome_tx);

    let outcome = outcome_rx
        .await
        .context("initializer stopped without reporting")?;
    // Registration failures return before the stop token fires
    stop.cancel();
    if let Err(e) = watch.await {
        warn!(error = %e, "pod watch task failed");
    }

    if let Err(e) = &outcome {
        error!(error = %e, "initializer exited with error");
    } else {
        info!("stopped");
    }
    outcome.map_err(anyhow::Error::from)
}

async fn cancel_on_signal(stop: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received interrupt"),
                    _ = term.recv() => info!("received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM, only ctrl-c stops the initializer");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received interrupt");
    }
    stop.cancel();
}
