//! Pod mutation
//!
//! [`Mutator::mutate`] never modifies the pod it is given. It returns the
//! original next to a mutated copy so the caller can compute a minimal patch.

use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;
use tracing::{debug, info, warn};

use spark_initializer_common::{AnnotationConfig, InitializerConfig, PodKey};

use crate::marker::remove_marker;
use crate::owner::attach_owner_reference;
use crate::resolvers::{self, Annotations};
use crate::volumes::{
    add_config_map_volume, add_secret_volume, config_map_volume_name, mount_read_only,
    secret_volume_name, service_account_key_path, set_env, DEFAULT_HADOOP_CONF_DIR,
    DEFAULT_SPARK_CONF_DIR, GCP_SERVICE_ACCOUNT_VOLUME_NAME, GOOGLE_APPLICATION_CREDENTIALS_ENV,
    HADOOP_CONFIG_MAP_VOLUME_NAME, HADOOP_CONF_DIR_ENV, SPARK_CONFIG_MAP_VOLUME_NAME,
    SPARK_CONF_DIR_ENV,
};

/// Errors raised while mutating a pod
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MutationError {
    /// The pod has no container to mount into
    #[error("no container found in pod {pod}")]
    NoContainers {
        /// `namespace/name` of the pod
        pod: String,
    },
}

impl From<MutationError> for spark_initializer_common::Error {
    fn from(e: MutationError) -> Self {
        match &e {
            MutationError::NoContainers { pod } => Self::validation(pod.clone(), e.to_string()),
        }
    }
}

/// A pod before and after mutation
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    /// The pod as fetched
    pub original: Pod,
    /// The pod with every mutation applied
    pub mutated: Pod,
}

impl Mutation {
    /// Whether the mutation changed nothing
    pub fn is_noop(&self) -> bool {
        self.original == self.mutated
    }
}

/// Applies the annotation-driven mutations to Spark pods
#[derive(Clone, Debug)]
pub struct Mutator {
    annotations: AnnotationConfig,
    initializer_name: String,
}

impl Mutator {
    /// Create a mutator for the given initializer configuration
    pub fn new(config: &InitializerConfig) -> Self {
        Self {
            annotations: config.annotations.clone(),
            initializer_name: config.initializer_name.clone(),
        }
    }

    /// Name of the sentinel this mutator removes
    pub fn initializer_name(&self) -> &str {
        &self.initializer_name
    }

    /// Mutate a driver or executor pod.
    ///
    /// Steps, in order: owner reference, Spark and Hadoop config, generic
    /// ConfigMaps, service account and generic Secrets, and finally removal
    /// of the sentinel. All mounts go into the first container.
    pub fn mutate(&self, pod: &Pod) -> Result<Mutation, MutationError> {
        let pod_ref = display_key(pod);
        let has_container = pod
            .spec
            .as_ref()
            .is_some_and(|s| !s.containers.is_empty());
        if !has_container {
            return Err(MutationError::NoContainers { pod: pod_ref });
        }

        let mut mutated = pod.clone();
        let annotations = pod.metadata.annotations.clone().unwrap_or_default();

        if let Some(raw) = resolvers::owner_reference(&annotations, &self.annotations) {
            match attach_owner_reference(&mut mutated, raw) {
                Ok(()) => debug!(pod = %pod_ref, "attached owner reference"),
                Err(e) => warn!(
                    pod = %pod_ref,
                    error = %e,
                    "ignoring malformed owner reference annotation"
                ),
            }
        }

        self.mount_config_maps(&mut mutated, &annotations, &pod_ref);
        self.mount_secrets(&mut mutated, &annotations, &pod_ref);

        if remove_marker(&mut mutated, &self.initializer_name) {
            debug!(pod = %pod_ref, "removed initializer from pending list");
        }

        Ok(Mutation {
            original: pod.clone(),
            mutated,
        })
    }

    /// Copy of the pod with only the sentinel removed.
    ///
    /// Used for pods that are not Spark pods: they are released without any
    /// other change.
    pub fn release(&self, pod: &Pod) -> Pod {
        let mut released = pod.clone();
        remove_marker(&mut released, &self.initializer_name);
        released
    }

    fn mount_config_maps(&self, pod: &mut Pod, annotations: &Annotations, pod_ref: &str) {
        let Some(spec) = pod.spec.as_mut() else {
            return;
        };

        if let Some(name) = resolvers::spark_config_map(annotations, &self.annotations) {
            info!(pod = %pod_ref, config_map = %name, "mounting Spark ConfigMap");
            match add_config_map_volume(spec, SPARK_CONFIG_MAP_VOLUME_NAME, name) {
                Ok(()) => {
                    let container = &mut spec.containers[0];
                    mount_read_only(
                        container,
                        SPARK_CONFIG_MAP_VOLUME_NAME,
                        DEFAULT_SPARK_CONF_DIR,
                    );
                    set_env(container, SPARK_CONF_DIR_ENV, DEFAULT_SPARK_CONF_DIR);
                }
                Err(e) => warn!(pod = %pod_ref, error = %e, "skipping Spark ConfigMap"),
            }
        }

        if let Some(name) = resolvers::hadoop_config_map(annotations, &self.annotations) {
            info!(pod = %pod_ref, config_map = %name, "mounting Hadoop ConfigMap");
            match add_config_map_volume(spec, HADOOP_CONFIG_MAP_VOLUME_NAME, name) {
                Ok(()) => {
                    let container = &mut spec.containers[0];
                    mount_read_only(
                        container,
                        HADOOP_CONFIG_MAP_VOLUME_NAME,
                        DEFAULT_HADOOP_CONF_DIR,
                    );
                    set_env(container, HADOOP_CONF_DIR_ENV, DEFAULT_HADOOP_CONF_DIR);
                }
                Err(e) => warn!(pod = %pod_ref, error = %e, "skipping Hadoop ConfigMap"),
            }
        }

        for (name, path) in resolvers::general_config_maps(annotations, &self.annotations) {
            info!(pod = %pod_ref, config_map = %name, path = %path, "mounting ConfigMap");
            let volume = config_map_volume_name(&name);
            match add_config_map_volume(spec, &volume, &name) {
                Ok(()) => mount_read_only(&mut spec.containers[0], &volume, &path),
                Err(e) => {
                    warn!(pod = %pod_ref, error = %e, config_map = %name, "skipping ConfigMap")
                }
            }
        }
    }

    fn mount_secrets(&self, pod: &mut Pod, annotations: &Annotations, pod_ref: &str) {
        let Some(spec) = pod.spec.as_mut() else {
            return;
        };

        if let Some((secret, path)) =
            resolvers::gcp_service_account_secret(annotations, &self.annotations)
        {
            info!(pod = %pod_ref, secret = %secret, "mounting GCP service account secret");
            match add_secret_volume(spec, GCP_SERVICE_ACCOUNT_VOLUME_NAME, secret) {
                Ok(()) => {
                    let container = &mut spec.containers[0];
                    mount_read_only(container, GCP_SERVICE_ACCOUNT_VOLUME_NAME, path);
                    set_env(
                        container,
                        GOOGLE_APPLICATION_CREDENTIALS_ENV,
                        &service_account_key_path(path),
                    );
                }
                Err(e) => warn!(pod = %pod_ref, error = %e, "skipping GCP service account secret"),
            }
        }

        for (secret, path) in resolvers::general_secrets(annotations, &self.annotations) {
            info!(pod = %pod_ref, secret = %secret, path = %path, "mounting secret");
            let volume = secret_volume_name(&secret);
            match add_secret_volume(spec, &volume, &secret) {
                Ok(()) => mount_read_only(&mut spec.containers[0], &volume, &path),
                Err(e) => warn!(pod = %pod_ref, error = %e, secret = %secret, "skipping secret"),
            }
        }
    }
}

fn display_key(pod: &Pod) -> String {
    PodKey::from_pod(pod)
        .map(|k| k.to_string())
        .unwrap_or_else(|| pod.metadata.name.clone().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::has_marker;
    use k8s_openapi::api::core::v1::{Container, PodSchedulingGate, PodSpec, Volume};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    const GATE: &str = "pod-initializer.spark-operator.k8s.io";

    fn pod(annotations: &[(&str, &str)], containers: usize) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("driver-1".to_string()),
                namespace: Some("ns".to_string()),
                labels: Some(BTreeMap::from([(
                    "spark-role".to_string(),
                    "driver".to_string(),
                )])),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: (0..containers)
                    .map(|i| Container {
                        name: format!("c{}", i),
                        ..Default::default()
                    })
                    .collect(),
                scheduling_gates: Some(vec![PodSchedulingGate {
                    name: GATE.to_string(),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn mutator() -> Mutator {
        Mutator::new(&InitializerConfig::default())
    }

    fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
        container
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .as_deref()
    }

    /// Story: a driver asking for its Spark configuration gets the ConfigMap
    /// mounted read-only at the conf dir, the env var pointing at it, and is
    /// released from the pending list
    #[test]
    fn story_spark_config_map_is_mounted() {
        let original = pod(&[("sparkoperator.k8s.io/sparkConfigMap", "cm1")], 2);
        let mutation = mutator().mutate(&original).unwrap();
        let spec = mutation.mutated.spec.as_ref().unwrap();

        let volumes = spec.volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, SPARK_CONFIG_MAP_VOLUME_NAME);
        assert_eq!(volumes[0].config_map.as_ref().unwrap().name, "cm1");

        let container = &spec.containers[0];
        let mount = &container.volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, "/etc/spark/conf");
        assert_eq!(mount.read_only, Some(true));
        assert_eq!(env_value(container, "SPARK_CONF_DIR"), Some("/etc/spark/conf"));

        // Only the first container is touched
        assert!(spec.containers[1].volume_mounts.is_none());

        assert!(!has_marker(&mutation.mutated, GATE));
        assert!(spec.scheduling_gates.is_none());
        assert_eq!(mutation.original, original);
    }

    #[test]
    fn test_every_annotation_kind_is_applied() {
        let original = pod(
            &[
                ("sparkoperator.k8s.io/hadoopConfigMap", "hadoop"),
                ("sparkoperator.k8s.io/configMap.jars", "/opt/jars"),
                ("sparkoperator.k8s.io/GCPServiceAccount.gcp-key", "/mnt/secrets"),
                ("sparkoperator.k8s.io/secret.db", "/etc/db"),
            ],
            1,
        );
        let mutation = mutator().mutate(&original).unwrap();
        let spec = mutation.mutated.spec.unwrap();

        let names: Vec<_> = spec
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .map(|v| v.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                HADOOP_CONFIG_MAP_VOLUME_NAME,
                "jars-configmap-volume",
                GCP_SERVICE_ACCOUNT_VOLUME_NAME,
                "db-secret-volume"
            ]
        );

        let container = &spec.containers[0];
        assert_eq!(env_value(container, "HADOOP_CONF_DIR"), Some("/etc/hadoop/conf"));
        assert_eq!(
            env_value(container, "GOOGLE_APPLICATION_CREDENTIALS"),
            Some("/mnt/secrets/key.json")
        );
        assert_eq!(container.volume_mounts.as_ref().unwrap().len(), 4);
    }

    /// Story: a job mounts both a ConfigMap and a Secret called `db`; each
    /// gets its own volume and its own mount
    #[test]
    fn story_config_map_and_secret_with_same_name_both_mount() {
        let original = pod(
            &[
                ("sparkoperator.k8s.io/configMap.db", "/etc/db/conf"),
                ("sparkoperator.k8s.io/secret.db", "/etc/db/creds"),
            ],
            1,
        );
        let spec = mutator().mutate(&original).unwrap().mutated.spec.unwrap();

        let volumes = spec.volumes.unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].name, "db-configmap-volume");
        assert_eq!(volumes[0].config_map.as_ref().unwrap().name, "db");
        assert_eq!(volumes[1].name, "db-secret-volume");
        assert_eq!(
            volumes[1].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("db")
        );

        let mounts = spec.containers[0].volume_mounts.as_ref().unwrap();
        let mounted: Vec<_> = mounts
            .iter()
            .map(|m| (m.name.as_str(), m.mount_path.as_str()))
            .collect();
        assert_eq!(
            mounted,
            vec![
                ("db-configmap-volume", "/etc/db/conf"),
                ("db-secret-volume", "/etc/db/creds")
            ]
        );
    }

    #[test]
    fn test_contested_volume_name_keeps_first_source() {
        // `configMap.spark` derives the same volume name as the Spark config
        let original = pod(
            &[
                ("sparkoperator.k8s.io/sparkConfigMap", "cm1"),
                ("sparkoperator.k8s.io/configMap.spark", "/opt/spark"),
            ],
            1,
        );
        let spec = mutator().mutate(&original).unwrap().mutated.spec.unwrap();

        let volumes = spec.volumes.unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, SPARK_CONFIG_MAP_VOLUME_NAME);
        assert_eq!(volumes[0].config_map.as_ref().unwrap().name, "cm1");

        let mounts = spec.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].mount_path, DEFAULT_SPARK_CONF_DIR);
    }

    #[test]
    fn test_existing_volume_with_other_source_is_left_alone() {
        let mut original = pod(&[("sparkoperator.k8s.io/sparkConfigMap", "cm1")], 1);
        original.spec.as_mut().unwrap().volumes = Some(vec![Volume {
            name: SPARK_CONFIG_MAP_VOLUME_NAME.to_string(),
            empty_dir: Some(Default::default()),
            ..Default::default()
        }]);
        let mutation = mutator().mutate(&original).unwrap();
        let spec = mutation.mutated.spec.as_ref().unwrap();

        assert!(spec.volumes.as_ref().unwrap()[0].empty_dir.is_some());
        assert!(spec.containers[0].volume_mounts.is_none());
        assert!(spec.containers[0].env.is_none());
        assert!(!has_marker(&mutation.mutated, GATE));
    }

    #[test]
    fn test_owner_reference_is_attached() {
        let original = pod(
            &[(
                "sparkoperator.k8s.io/ownerReference",
                r#"{"apiVersion":"sparkoperator.k8s.io/v1beta1","kind":"SparkApplication","name":"pi","uid":"u-1"}"#,
            )],
            1,
        );
        let mutated = mutator().mutate(&original).unwrap().mutated;
        assert_eq!(mutated.metadata.owner_references.unwrap()[0].name, "pi");
    }

    #[test]
    fn test_malformed_owner_reference_is_skipped() {
        let original = pod(&[("sparkoperator.k8s.io/ownerReference", "garbage")], 1);
        let mutated = mutator().mutate(&original).unwrap().mutated;
        assert!(mutated.metadata.owner_references.is_none());
        assert!(!has_marker(&mutated, GATE));
    }

    #[test]
    fn test_pod_without_containers_is_rejected() {
        let err = mutator().mutate(&pod(&[], 0)).unwrap_err();
        assert_eq!(
            err,
            MutationError::NoContainers {
                pod: "ns/driver-1".to_string()
            }
        );
        let err: spark_initializer_common::Error = err.into();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_release_only_removes_marker() {
        let original = pod(&[("sparkoperator.k8s.io/sparkConfigMap", "cm1")], 1);
        let released = mutator().release(&original);
        assert!(!has_marker(&released, GATE));

        let mut expected = original.clone();
        expected.spec.as_mut().unwrap().scheduling_gates = None;
        assert_eq!(released, expected);
    }

    #[test]
    fn test_pod_without_annotations_only_loses_marker() {
        let mut original = pod(&[], 1);
        original.metadata.annotations = None;
        let mutation = mutator().mutate(&original).unwrap();
        assert!(!mutation.is_noop());
        assert!(mutation.mutated.spec.as_ref().unwrap().volumes.is_none());
    }
}
