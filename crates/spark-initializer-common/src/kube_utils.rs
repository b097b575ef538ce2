//! Kubernetes client construction

use std::path::PathBuf;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Connection timeout of API clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read timeout of API clients.
///
/// Pod watches ask the server to close them before this expires.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Where and how to connect
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Kubeconfig file; in-cluster config or `KUBECONFIG` when `None`
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context; the current context when `None`
    pub context: Option<String>,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Response read timeout
    pub read_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            context: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

fn client_error(message: String) -> Error {
    Error::internal_with_context("create_client", message)
}

/// Create a kube client
pub async fn create_client(options: &ClientOptions) -> Result<Client, Error> {
    let kube_options = KubeConfigOptions {
        context: options.context.clone(),
        ..Default::default()
    };

    let mut config = match (&options.kubeconfig, &options.context) {
        (Some(path), _) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| client_error(format!("failed to read {}: {}", path.display(), e)))?;
            Config::from_custom_kubeconfig(kubeconfig, &kube_options)
                .await
                .map_err(|e| client_error(format!("failed to load kubeconfig: {}", e)))?
        }
        (None, Some(_)) => Config::from_kubeconfig(&kube_options)
            .await
            .map_err(|e| client_error(format!("failed to load kubeconfig: {}", e)))?,
        (None, None) => Config::infer()
            .await
            .map_err(|e| client_error(format!("failed to infer config: {}", e)))?,
    };

    config.connect_timeout = Some(options.connect_timeout);
    config.read_timeout = Some(options.read_timeout);
    Client::try_from(config).map_err(|e| client_error(format!("failed to build client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_timeout_outlasts_watch_timeout() {
        let options = ClientOptions::default();
        assert!(options.read_timeout > Duration::from_secs(25));
        assert!(options.kubeconfig.is_none());
    }

    #[tokio::test]
    async fn test_missing_kubeconfig_is_reported() {
        let options = ClientOptions {
            kubeconfig: Some(PathBuf::from("/nonexistent/kubeconfig")),
            ..Default::default()
        };
        match create_client(&options).await {
            Ok(_) => panic!("client created from a missing kubeconfig"),
            Err(err) => assert!(err.to_string().contains("/nonexistent/kubeconfig")),
        }
    }
}
