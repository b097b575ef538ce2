//! Pod watch
//!
//! Turns the raw `kube` watcher stream into add and delete notifications.
//! An update to a pod that was already seen produces nothing; only the first
//! sighting counts as an add. Pods that vanish across a relist are reported
//! as deleted with their last known state.

use std::collections::{HashMap, HashSet};

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use spark_initializer_common::{InitializerConfig, PodKey};

/// Capacity of the channel between the watch task and the dispatcher
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Server-side watch timeout, below the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Pod lifecycle notification
#[derive(Clone, Debug, PartialEq)]
pub enum PodEvent {
    /// First sighting of a pod
    Added(Pod),
    /// Pod is gone; carries the last known state
    Deleted(Pod),
}

impl PodEvent {
    /// The pod the event is about
    pub fn pod(&self) -> &Pod {
        match self {
            Self::Added(pod) | Self::Deleted(pod) => pod,
        }
    }
}

/// Informer-style bookkeeping over watcher events
#[derive(Debug, Default)]
pub struct PodTracker {
    known: HashMap<PodKey, Pod>,
    relist: Option<HashSet<PodKey>>,
}

impl PodTracker {
    /// Create a tracker that has seen nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pods currently known
    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// Whether no pods are known
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Convert one watcher event into zero or more pod events
    pub fn handle(&mut self, event: Event<Pod>) -> Vec<PodEvent> {
        match event {
            Event::Init => {
                debug!(known = self.known.len(), "pod relist started");
                self.relist = Some(HashSet::new());
                Vec::new()
            }
            Event::InitApply(pod) | Event::Apply(pod) => self.apply(pod).into_iter().collect(),
            Event::InitDone => self.finish_relist(),
            Event::Delete(pod) => {
                let Some(key) = checked_key(&pod) else {
                    return Vec::new();
                };
                self.known.remove(&key);
                if let Some(relist) = self.relist.as_mut() {
                    relist.remove(&key);
                }
                vec![PodEvent::Deleted(pod)]
            }
        }
    }

    fn apply(&mut self, pod: Pod) -> Option<PodEvent> {
        let key = checked_key(&pod)?;
        if let Some(relist) = self.relist.as_mut() {
            relist.insert(key.clone());
        }
        match self.known.insert(key, pod.clone()) {
            None => Some(PodEvent::Added(pod)),
            Some(_) => None,
        }
    }

    fn finish_relist(&mut self) -> Vec<PodEvent> {
        let Some(seen) = self.relist.take() else {
            return Vec::new();
        };
        let gone: Vec<PodKey> = self
            .known
            .keys()
            .filter(|k| !seen.contains(*k))
            .cloned()
            .collect();
        debug!(known = seen.len(), vanished = gone.len(), "pod relist finished");
        gone.into_iter()
            .filter_map(|k| self.known.remove(&k))
            .map(PodEvent::Deleted)
            .collect()
    }
}

fn checked_key(pod: &Pod) -> Option<PodKey> {
    let key = PodKey::from_pod(pod);
    if key.is_none() {
        warn!(
            name = ?pod.metadata.name,
            namespace = ?pod.metadata.namespace,
            "dropping pod event without name or namespace"
        );
    }
    key
}

/// Start watching pods and forwarding add/delete events.
///
/// The task ends when `stop` fires or the receiver is dropped.
pub fn spawn_pod_watcher(
    client: Client,
    config: &InitializerConfig,
    stop: CancellationToken,
) -> (mpsc::Receiver<PodEvent>, JoinHandle<()>) {
    let api: Api<Pod> = match config.watch_namespace.as_deref() {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let scope = config
        .watch_namespace
        .clone()
        .unwrap_or_else(|| "<all>".to_string());
    let watch_config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let handle = tokio::spawn(async move {
        info!(namespace = %scope, "starting pod watch");
        let stream = watcher::watcher(api, watch_config).default_backoff();
        forward_events(stream, tx, stop).await;
        info!(namespace = %scope, "pod watch stopped");
    });
    (rx, handle)
}

/// Drive a watcher stream through a [`PodTracker`] into `tx`
pub async fn forward_events<S>(stream: S, tx: mpsc::Sender<PodEvent>, stop: CancellationToken)
where
    S: Stream<Item = Result<Event<Pod>, watcher::Error>> + Send,
{
    let mut stream = std::pin::pin!(stream);
    let mut tracker = PodTracker::new();

    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => return,
            next = stream.next() => next,
        };
        let event = match next {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!(error = %e, "pod watch error, retrying with backoff");
                continue;
            }
            None => {
                warn!("pod watch stream ended");
                return;
            }
        };

        for pod_event in tracker.handle(event) {
            tokio::select! {
                _ = stop.cancelled() => return,
                sent = tx.send(pod_event) => {
                    if sent.is_err() {
                        debug!("event receiver closed, stopping pod watch");
                        return;
                    }
                }
            }
        }
    }
}
