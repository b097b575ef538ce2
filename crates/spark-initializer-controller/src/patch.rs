//! Patch computation
//!
//! Spark pods are submitted as a two-way strategic merge patch. Lists with a
//! merge key (volumes by `name`, mounts by `mountPath`, owner references by
//! `uid`, ...) are diffed element by element: the patch only names the
//! elements that were added or changed, and removed elements become
//! `$patch: delete` directives keyed by their merge key. Concurrent changes by
//! other writers to other elements of the same list survive the patch.
//!
//! [`create_merge_patch`] is the plain RFC 7386 variant, where every changed
//! list is replaced wholesale.

use k8s_openapi::api::core::v1::Pod;
use serde_json::{Map, Value};

use spark_initializer_common::Result;

/// Directive key of strategic merge patch list elements
pub const PATCH_DIRECTIVE: &str = "$patch";

/// Directive value removing a list element
pub const DELETE_DIRECTIVE: &str = "delete";

/// Merge key of a pod list field, if the API server merges it by key
pub fn merge_key(field: &str) -> Option<&'static str> {
    match field {
        "containers" | "initContainers" | "ephemeralContainers" | "volumes" | "env"
        | "schedulingGates" | "imagePullSecrets" | "resourceClaims" => Some("name"),
        "volumeMounts" => Some("mountPath"),
        "volumeDevices" => Some("devicePath"),
        "ownerReferences" => Some("uid"),
        "ports" => Some("containerPort"),
        "hostAliases" => Some("ip"),
        _ => None,
    }
}

#[derive(Clone, Copy)]
enum Lists {
    Replace,
    MergeByKey,
}

/// Two-way JSON merge patch (RFC 7386) turning `original` into `modified`.
///
/// Keys missing from `modified` become `null`; nested objects are diffed
/// recursively; arrays and scalars are replaced wholesale.
pub fn create_merge_patch(original: &Value, modified: &Value) -> Value {
    diff(original, modified, Lists::Replace)
}

/// Two-way strategic merge patch turning `original` into `modified`.
///
/// Like [`create_merge_patch`], except for lists named in [`merge_key`]:
/// those carry only added and changed elements plus delete directives. A
/// keyed list that disappears from `modified` is emptied element by element.
pub fn create_strategic_merge_patch(original: &Value, modified: &Value) -> Value {
    diff(original, modified, Lists::MergeByKey)
}

fn diff(original: &Value, modified: &Value, lists: Lists) -> Value {
    match (original, modified) {
        (Value::Object(original), Value::Object(modified)) => {
            Value::Object(diff_objects(original, modified, lists))
        }
        _ => modified.clone(),
    }
}

fn diff_objects(
    original: &Map<String, Value>,
    modified: &Map<String, Value>,
    lists: Lists,
) -> Map<String, Value> {
    let mut patch = Map::new();

    for (key, old) in original {
        if modified.contains_key(key) {
            continue;
        }
        match (lists, old, merge_key(key)) {
            (Lists::MergeByKey, Value::Array(old), Some(merge)) => {
                match diff_keyed_list(old, &[], merge, lists) {
                    Some(items) if items.is_empty() => {}
                    Some(items) => {
                        patch.insert(key.clone(), Value::Array(items));
                    }
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                }
            }
            _ => {
                patch.insert(key.clone(), Value::Null);
            }
        }
    }

    for (key, new) in modified {
        let Some(old) = original.get(key) else {
            patch.insert(key.clone(), new.clone());
            continue;
        };
        if old == new {
            continue;
        }
        match (lists, old, new, merge_key(key)) {
            (_, Value::Object(old), Value::Object(new), _) => {
                patch.insert(key.clone(), Value::Object(diff_objects(old, new, lists)));
            }
            (Lists::MergeByKey, Value::Array(old), Value::Array(new), Some(merge)) => {
                let value = diff_keyed_list(old, new, merge, lists)
                    .map_or_else(|| Value::Array(new.clone()), Value::Array);
                patch.insert(key.clone(), value);
            }
            _ => {
                patch.insert(key.clone(), new.clone());
            }
        }
    }

    patch
}

/// Element-wise diff of a keyed list; `None` when an element has no merge key
fn diff_keyed_list(
    original: &[Value],
    modified: &[Value],
    merge: &str,
    lists: Lists,
) -> Option<Vec<Value>> {
    let id = |v: &Value| v.as_object().and_then(|o| o.get(merge)).cloned();
    if original.iter().chain(modified).any(|v| id(v).is_none()) {
        return None;
    }

    let mut items = Vec::new();
    for new in modified {
        let new_id = id(new)?;
        match original.iter().find(|&old| id(old).as_ref() == Some(&new_id)) {
            None => items.push(new.clone()),
            Some(old) if old == new => {}
            Some(old) => {
                let (Value::Object(old), Value::Object(new)) = (old, new) else {
                    return None;
                };
                let mut changed = diff_objects(old, new, lists);
                changed.insert(merge.to_string(), new_id);
                items.push(Value::Object(changed));
            }
        }
    }

    for old in original {
        let old_id = id(old)?;
        if !modified.iter().any(|new| id(new).as_ref() == Some(&old_id)) {
            let mut directive = Map::new();
            directive.insert(PATCH_DIRECTIVE.to_string(), Value::from(DELETE_DIRECTIVE));
            directive.insert(merge.to_string(), old_id);
            items.push(Value::Object(directive));
        }
    }

    Some(items)
}

/// Apply a strategic merge patch to `doc` the way the API server does for
/// pods. Keyed lists that end up empty are removed.
pub fn apply_strategic_merge_patch(doc: &mut Value, patch: &Value) {
    if let (Some(target), Some(fields)) = (doc.as_object_mut(), patch.as_object()) {
        apply_object(target, fields);
        return;
    }
    *doc = patch.clone();
}

fn apply_object(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        if key.starts_with('$') {
            continue;
        }
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(nested) => {
                let entry = target
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !entry.is_object() {
                    *entry = Value::Object(Map::new());
                }
                if let Some(entry) = entry.as_object_mut() {
                    apply_object(entry, nested);
                }
            }
            Value::Array(items) => match merge_key(key) {
                Some(merge) if items.iter().all(|i| i.get(merge).is_some()) => {
                    let mut list = match target.remove(key) {
                        Some(Value::Array(list)) => list,
                        _ => Vec::new(),
                    };
                    apply_keyed_list(&mut list, items, merge);
                    if !list.is_empty() {
                        target.insert(key.clone(), Value::Array(list));
                    }
                }
                _ => {
                    target.insert(key.clone(), value.clone());
                }
            },
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn apply_keyed_list(list: &mut Vec<Value>, items: &[Value], merge: &str) {
    for item in items {
        let Some(item_id) = item.get(merge) else {
            continue;
        };
        let matches = |v: &Value| v.get(merge) == Some(item_id);

        if item.get(PATCH_DIRECTIVE).and_then(Value::as_str) == Some(DELETE_DIRECTIVE) {
            list.retain(|v| !matches(v));
            continue;
        }
        let Some(fields) = item.as_object() else {
            continue;
        };
        match list.iter().position(|v| matches(v)) {
            Some(index) => {
                if let Value::Object(existing) = &mut list[index] {
                    apply_object(existing, fields);
                }
            }
            None => {
                let mut added = Map::new();
                apply_object(&mut added, fields);
                list.push(Value::Object(added));
            }
        }
    }
}

/// Strategic merge patch between two versions of a pod
pub fn pod_patch(original: &Pod, modified: &Pod) -> Result<Value> {
    let original = serde_json::to_value(original)?;
    let modified = serde_json::to_value(modified)?;
    Ok(create_strategic_merge_patch(&original, &modified))
}

/// Whether a patch changes nothing
pub fn is_empty_patch(patch: &Value) -> bool {
    patch.as_object().is_some_and(Map::is_empty)
}
