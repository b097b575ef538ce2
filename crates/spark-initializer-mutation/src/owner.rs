//! Owner attachment

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::api::core::v1::Pod;

/// Parse `raw` as an `OwnerReference` and append it to the pod.
///
/// A reference with the same UID already on the pod is not added twice.
pub fn attach_owner_reference(pod: &mut Pod, raw: &str) -> Result<(), serde_json::Error> {
    let owner: OwnerReference = serde_json::from_str(raw)?;
    let owners = pod.metadata.owner_references.get_or_insert_with(Vec::new);
    if !owners.iter().any(|o| o.uid == owner.uid) {
        owners.push(owner);
    }
    Ok(())
}
