//! Spark pod initializer control loop
//!
//! Pods created with the initializer's sentinel are observed by the
//! [`watch`] task and routed by the [`dispatcher`]. Spark driver and executor
//! pods go through the rate-limited retry queue to the [`worker`] pool, where
//! the [`reconcile`] step mutates and patches them; other pods are released
//! inline. [`registration`] keeps the control plane informed that the
//! initializer exists, and [`runner::Initializer`] ties it all together.

#![deny(missing_docs)]

pub mod client;
pub mod dispatcher;
pub mod lifecycle;
pub mod patch;
pub mod reconcile;
pub mod registration;
pub mod resources;
pub mod runner;
pub mod watch;
pub mod worker;

pub use client::{ControlPlane, KubeControlPlane};
pub use dispatcher::{classify, Dispatcher, Route};
pub use lifecycle::{ProcessingStage, StageError, StageTracker};
pub use patch::{apply_strategic_merge_patch, create_merge_patch, create_strategic_merge_patch};
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use registration::{deregister, ensure_registered};
pub use resources::{Initializer as RegisteredInitializer, InitializerConfiguration, Rule};
pub use runner::Initializer;
pub use watch::{spawn_pod_watcher, PodEvent, PodTracker};
