//! Volume, mount and environment helpers
//!
//! Re-adding an identical volume or mount is a no-op and setting an env var
//! overwrites any previous value. A volume name that is already taken by a
//! volume with a different source is reported as a [`VolumeConflict`] and the
//! existing volume is kept.

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EnvVar, PodSpec, SecretVolumeSource, Volume, VolumeMount,
};
use thiserror::Error;

/// Volume holding the Spark ConfigMap
pub const SPARK_CONFIG_MAP_VOLUME_NAME: &str = "spark-configmap-volume";
/// Volume holding the Hadoop ConfigMap
pub const HADOOP_CONFIG_MAP_VOLUME_NAME: &str = "hadoop-configmap-volume";
/// Volume holding the GCP service account key
pub const GCP_SERVICE_ACCOUNT_VOLUME_NAME: &str = "gcp-service-account-secret-volume";

/// Mount point of the Spark ConfigMap
pub const DEFAULT_SPARK_CONF_DIR: &str = "/etc/spark/conf";
/// Mount point of the Hadoop ConfigMap
pub const DEFAULT_HADOOP_CONF_DIR: &str = "/etc/hadoop/conf";

/// Env var pointing Spark at its configuration
pub const SPARK_CONF_DIR_ENV: &str = "SPARK_CONF_DIR";
/// Env var pointing Hadoop at its configuration
pub const HADOOP_CONF_DIR_ENV: &str = "HADOOP_CONF_DIR";
/// Env var read by Google client libraries
pub const GOOGLE_APPLICATION_CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";
/// File name of the key inside a service account secret
pub const SERVICE_ACCOUNT_KEY_FILE: &str = "key.json";

/// A volume name is already used by a volume with another source
#[derive(Debug, Error, PartialEq, Eq)]
#[error("volume {volume} already exists with a different source")]
pub struct VolumeConflict {
    /// Name of the contested volume
    pub volume: String,
}

/// Volume name used for a generically mounted ConfigMap
pub fn config_map_volume_name(config_map: &str) -> String {
    format!("{}-configmap-volume", config_map)
}

/// Volume name used for a generically mounted Secret
pub fn secret_volume_name(secret: &str) -> String {
    format!("{}-secret-volume", secret)
}

/// Add a volume backed by the named ConfigMap
pub fn add_config_map_volume(
    spec: &mut PodSpec,
    volume_name: &str,
    config_map: &str,
) -> Result<(), VolumeConflict> {
    add_volume(
        spec,
        Volume {
            name: volume_name.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
    )
}

/// Add a volume backed by the named Secret
pub fn add_secret_volume(
    spec: &mut PodSpec,
    volume_name: &str,
    secret: &str,
) -> Result<(), VolumeConflict> {
    add_volume(
        spec,
        Volume {
            name: volume_name.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
    )
}

fn add_volume(spec: &mut PodSpec, volume: Volume) -> Result<(), VolumeConflict> {
    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    if let Some(existing) = volumes.iter().find(|v| v.name == volume.name) {
        if *existing == volume {
            return Ok(());
        }
        return Err(VolumeConflict {
            volume: volume.name,
        });
    }
    volumes.push(volume);
    Ok(())
}

/// Mount a volume read-only into the container
pub fn mount_read_only(container: &mut Container, volume_name: &str, mount_path: &str) {
    let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
    if mounts
        .iter()
        .any(|m| m.name == volume_name && m.mount_path == mount_path)
    {
        return;
    }
    mounts.push(VolumeMount {
        name: volume_name.to_string(),
        mount_path: mount_path.to_string(),
        read_only: Some(true),
        ..Default::default()
    });
}

/// Set an environment variable on the container
pub fn set_env(container: &mut Container, name: &str, value: &str) {
    let env = container.env.get_or_insert_with(Vec::new);
    let var = EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    };
    match env.iter_mut().find(|e| e.name == name) {
        Some(existing) => *existing = var,
        None => env.push(var),
    }
}

/// Path of the service account key file under `mount_path`
pub fn service_account_key_path(mount_path: &str) -> String {
    format!(
        "{}/{}",
        mount_path.trim_end_matches('/'),
        SERVICE_ACCOUNT_KEY_FILE
    )
}
