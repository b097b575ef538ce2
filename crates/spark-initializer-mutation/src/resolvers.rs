//! Annotation rules
//!
//! Pure lookups over a pod's annotation map. Each function answers one
//! question ("which ConfigMap should be mounted as the Spark conf dir?") and
//! never touches the pod itself.

use std::collections::BTreeMap;

use spark_initializer_common::AnnotationConfig;

/// Annotation map of a pod
pub type Annotations = BTreeMap<String, String>;

/// Name of the ConfigMap holding the Spark configuration
pub fn spark_config_map<'a>(annotations: &'a Annotations, keys: &AnnotationConfig) -> Option<&'a str> {
    non_empty(annotations, &keys.spark_config_map())
}

/// Name of the ConfigMap holding the Hadoop configuration
pub fn hadoop_config_map<'a>(
    annotations: &'a Annotations,
    keys: &AnnotationConfig,
) -> Option<&'a str> {
    non_empty(annotations, &keys.hadoop_config_map())
}

/// ConfigMaps to mount, by name, with their mount paths
pub fn general_config_maps(annotations: &Annotations, keys: &AnnotationConfig) -> BTreeMap<String, String> {
    with_prefix(annotations, &keys.config_map_prefix()).collect()
}

/// Secret holding a GCP service account key and the directory to mount it at.
///
/// Only one service account is mounted; with several annotations the
/// lexicographically first secret name wins.
pub fn gcp_service_account_secret<'a>(
    annotations: &'a Annotations,
    keys: &AnnotationConfig,
) -> Option<(&'a str, &'a str)> {
    let prefix = keys.gcp_service_account_prefix();
    annotations.iter().find_map(|(key, path)| {
        let name = key.strip_prefix(prefix.as_str())?;
        (!name.is_empty() && !path.is_empty()).then_some((name, path.as_str()))
    })
}

/// Secrets to mount, by name, with their mount paths
pub fn general_secrets(annotations: &Annotations, keys: &AnnotationConfig) -> BTreeMap<String, String> {
    with_prefix(annotations, &keys.secret_prefix()).collect()
}

/// Raw JSON of the owner reference to attach
pub fn owner_reference<'a>(annotations: &'a Annotations, keys: &AnnotationConfig) -> Option<&'a str> {
    non_empty(annotations, &keys.owner_reference())
}

fn non_empty<'a>(annotations: &'a Annotations, key: &str) -> Option<&'a str> {
    annotations
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
}

fn with_prefix<'a>(
    annotations: &'a Annotations,
    prefix: &'a str,
) -> impl Iterator<Item = (String, String)> + 'a {
    annotations.iter().filter_map(move |(key, path)| {
        let name = key.strip_prefix(prefix)?;
        if name.is_empty() || path.is_empty() {
            return None;
        }
        Some((name.to_string(), path.clone()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn annotations(pairs: &[(&str, &str)]) -> Annotations {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_primary_and_secondary_config() {
        let keys = AnnotationConfig::default();
        let a = annotations(&[
            ("sparkoperator.k8s.io/sparkConfigMap", "spark-conf"),
            ("sparkoperator.k8s.io/hadoopConfigMap", "hadoop-conf"),
        ]);
        assert_eq!(spark_config_map(&a, &keys), Some("spark-conf"));
        assert_eq!(hadoop_config_map(&a, &keys), Some("hadoop-conf"));
        assert_eq!(owner_reference(&a, &keys), None);
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let keys = AnnotationConfig::default();
        let a = annotations(&[("sparkoperator.k8s.io/sparkConfigMap", " ")]);
        assert_eq!(spark_config_map(&a, &keys), None);
    }

    #[test]
    fn test_general_config_maps_collects_every_match() {
        let keys = AnnotationConfig::default();
        let a = annotations(&[
            ("sparkoperator.k8s.io/configMap.extra", "/etc/extra"),
            ("sparkoperator.k8s.io/configMap.jars", "/opt/jars"),
            ("sparkoperator.k8s.io/secret.db", "/etc/db"),
            ("other.io/configMap.foreign", "/nope"),
        ]);
        let found = general_config_maps(&a, &keys);
        assert_eq!(found.len(), 2);
        assert_eq!(found["extra"], "/etc/extra");
        assert_eq!(found["jars"], "/opt/jars");
    }

    #[rstest]
    #[case::empty_name("sparkoperator.k8s.io/secret.", "/etc/x")]
    #[case::empty_path("sparkoperator.k8s.io/secret.db", "")]
    #[case::wrong_domain("example.com/secret.db", "/etc/db")]
    fn test_incomplete_secret_annotations_are_skipped(#[case] key: &str, #[case] path: &str) {
        let keys = AnnotationConfig::default();
        assert!(general_secrets(&annotations(&[(key, path)]), &keys).is_empty());
    }

    #[test]
    fn test_gcp_service_account_first_name_wins() {
        let keys = AnnotationConfig::default();
        let a = annotations(&[
            ("sparkoperator.k8s.io/GCPServiceAccount.zeta", "/mnt/zeta"),
            ("sparkoperator.k8s.io/GCPServiceAccount.alpha", "/mnt/alpha"),
        ]);
        assert_eq!(
            gcp_service_account_secret(&a, &keys),
            Some(("alpha", "/mnt/alpha"))
        );
    }

    #[test]
    fn test_custom_prefix_is_honored() {
        let keys = AnnotationConfig {
            prefix: "spark.example.com".to_string(),
        };
        let a = annotations(&[
            ("spark.example.com/secret.db", "/etc/db"),
            ("sparkoperator.k8s.io/secret.ignored", "/etc/ignored"),
        ]);
        let secrets = general_secrets(&a, &keys);
        assert_eq!(secrets.keys().collect::<Vec<_>>(), vec!["db"]);
    }
}
