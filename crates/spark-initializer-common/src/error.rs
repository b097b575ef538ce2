//! Error types for the Spark pod initializer
//!
//! Errors carry the pod or resource they concern so that a single log line is
//! enough to find the object that failed. The worker pool uses
//! [`Error::is_permanent`] to tell retryable API failures apart from pods that
//! will never succeed without a change to their spec.

use thiserror::Error;

/// Main error type for initializer operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Registration record could not be created, updated or deleted
    #[error("registration error for {name}: {message}")]
    Registration {
        /// Name of the registration record
        name: String,
        /// Description of what failed
        message: String,
    },

    /// Pod failed validation and cannot be mutated as-is
    #[error("validation error for pod {pod}: {message}")]
    Validation {
        /// Queue key of the offending pod (`namespace/name`)
        pod: String,
        /// Description of what's invalid
        message: String,
    },

    /// Queue key could not be split into namespace and name
    #[error("malformed queue key {key:?}")]
    InvalidKey {
        /// The key as received
        key: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g., "create_client", "worker")
        context: String,
    },
}

impl Error {
    /// Create a registration error for the named record
    pub fn registration(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Registration {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error for the given pod key
    pub fn validation(pod: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            pod: pod.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid key error
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::InvalidKey { key: key.into() }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether retrying without outside intervention cannot succeed.
    ///
    /// Validation and malformed-key errors describe the pod or the key
    /// itself; everything else may clear up on its own.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::Validation { .. } | Error::InvalidKey { .. })
    }

    /// Whether this is a Kubernetes 404 response
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(e) } if e.code == 404)
    }

    /// Whether this is a Kubernetes 409 (optimistic concurrency) response
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(e) } if e.code == 409)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    /// Story: a pod without containers is reported with its key and never
    /// looks like something a retry will fix
    #[test]
    fn story_validation_errors_are_permanent() {
        let err = Error::validation("spark/driver-2", "no container found in pod");
        assert!(err.to_string().contains("spark/driver-2"));
        assert!(err.to_string().contains("no container"));
        assert!(err.is_permanent());

        assert!(Error::invalid_key("a/b/c").is_permanent());
    }

    /// Story: API failures are retried with backoff
    #[test]
    fn story_api_errors_are_retryable() {
        let err = api_error(500);
        assert!(!err.is_permanent());
        assert!(err.to_string().contains("kubernetes error"));

        let err = Error::registration("spark-pod-initializer-config", "update rejected");
        assert!(!err.is_permanent());
        assert!(err.to_string().contains("spark-pod-initializer-config"));
    }

    #[test]
    fn test_not_found_and_conflict_are_classified() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(404).is_conflict());
        assert!(api_error(409).is_conflict());
        assert!(!api_error(500).is_not_found());
        assert!(!Error::serialization("bad json").is_not_found());
    }

    #[test]
    fn test_invalid_key_shows_raw_key() {
        let err = Error::invalid_key("no-slash");
        assert_eq!(err.to_string(), "malformed queue key \"no-slash\"");
    }

    #[test]
    fn test_serde_errors_convert_to_serialization() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[test]
    fn test_internal_error_includes_context() {
        let err = Error::internal_with_context("worker", "panicked while reconciling");
        assert!(err.to_string().contains("[worker]"));
    }
}
