//! Common types for the Spark pod initializer: configuration, errors, pod keys
//! and telemetry

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod key;
pub mod kube_utils;
pub mod metrics;
pub mod telemetry;

pub use config::{
    AnnotationConfig, InitializerConfig, NonWorkloadFailurePolicy, QueueConfig,
    TerminalFailurePolicy,
};
pub use error::Error;
pub use key::PodKey;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager recorded on patches and updates made by the initializer
pub const FIELD_MANAGER: &str = "spark-pod-initializer";
