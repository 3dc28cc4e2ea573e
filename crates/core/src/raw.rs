//! Schemaless extraction over a generic JSON view of a Kubernetes object.
//!
//! Parents are heterogeneous, often custom resources with no schema we can
//! rely on; everything causally relevant (generation, observedGeneration,
//! conditions, annotations, managed-fields provenance) is pulled out of the
//! raw tree here, once. Typed callers may take a fast path over `ObjectMeta`
//! for metadata and fall back to these lookups for status.

use serde_json::Value;

use crate::Condition;

/// metadata.generation, defaulting to 0 when absent.
pub fn generation(obj: &Value) -> i64 {
    obj.pointer("/metadata/generation").and_then(Value::as_i64).unwrap_or(0)
}

/// A single annotation value, if present.
pub fn annotation<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.pointer("/metadata/annotations")?.get(key)?.as_str()
}

/// metadata.deletionTimestamp as an opaque RFC3339 string.
pub fn deletion_timestamp(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/deletionTimestamp")?.as_str()
}

/// The owner reference flagged `controller: true`, as (apiVersion, kind, name).
/// Exactly one such reference is assumed; the first wins.
pub fn controller_owner(obj: &Value) -> Option<(String, String, String)> {
    let owners = obj.pointer("/metadata/ownerReferences")?.as_array()?;
    owners
        .iter()
        .find(|o| o.get("controller").and_then(Value::as_bool).unwrap_or(false))
        .and_then(|o| {
            let api_version = o.get("apiVersion")?.as_str()?.to_string();
            let kind = o.get("kind")?.as_str()?.to_string();
            let name = o.get("name")?.as_str()?.to_string();
            Some((api_version, kind, name))
        })
}

/// status.observedGeneration, falling back to the generation stamp on a
/// `Synced` condition, then on a `Ready` condition. The full conditions list
/// is scanned and `Synced` wins whenever both are present, independent of
/// their order in the list.
pub fn observed_generation(obj: &Value) -> Option<i64> {
    if let Some(g) = obj.pointer("/status/observedGeneration").and_then(Value::as_i64) {
        return Some(g);
    }
    let conds = obj.pointer("/status/conditions")?.as_array()?;
    let mut synced = None;
    let mut ready = None;
    for c in conds {
        let stamp = c.get("observedGeneration").and_then(Value::as_i64);
        match (c.get("type").and_then(Value::as_str), stamp) {
            (Some("Synced"), Some(g)) if synced.is_none() => synced = Some(g),
            (Some("Ready"), Some(g)) if ready.is_none() => ready = Some(g),
            _ => {}
        }
    }
    synced.or(ready)
}

/// status.conditions copied verbatim (type/status/reason/message) in source order.
pub fn conditions(obj: &Value) -> Vec<Condition> {
    let Some(conds) = obj.pointer("/status/conditions").and_then(Value::as_array) else {
        return Vec::new();
    };
    conds
        .iter()
        .map(|c| {
            let s = |k: &str| c.get(k).and_then(Value::as_str).unwrap_or("").to_string();
            Condition { type_: s("type"), status: s("status"), reason: s("reason"), message: s("message") }
        })
        .collect()
}

/// Field manager that last claimed ownership of the observed-generation
/// field: either `f:status.f:observedGeneration` directly, or the
/// `f:observedGeneration` entry under a `Synced`/`Ready` condition key.
/// Returns the first claimant in managedFields order, else None.
pub fn status_manager(obj: &Value) -> Option<String> {
    let entries = obj.pointer("/metadata/managedFields")?.as_array()?;
    for entry in entries {
        let Some(manager) = entry.get("manager").and_then(Value::as_str) else { continue };
        let Some(status) = entry.pointer("/fieldsV1/f:status").and_then(Value::as_object) else {
            continue;
        };
        if status.contains_key("f:observedGeneration") {
            return Some(manager.to_string());
        }
        if let Some(conds) = status.get("f:conditions").and_then(Value::as_object) {
            let claims = |ty: &str| {
                conds.iter().any(|(k, v)| {
                    k.starts_with("k:")
                        && k.contains(&format!("\"type\":\"{ty}\""))
                        && v.get("f:observedGeneration").is_some()
                })
            };
            if claims("Synced") || claims("Ready") {
                return Some(manager.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn direct_observed_generation_wins() {
        let obj = json!({
            "status": {
                "observedGeneration": 7,
                "conditions": [{"type": "Synced", "status": "True", "observedGeneration": 3}]
            }
        });
        assert_eq!(observed_generation(&obj), Some(7));
    }

    #[test]
    fn synced_wins_regardless_of_order() {
        let obj = json!({
            "status": {
                "conditions": [
                    {"type": "Ready", "status": "True", "observedGeneration": 2},
                    {"type": "Synced", "status": "True", "observedGeneration": 4}
                ]
            }
        });
        assert_eq!(observed_generation(&obj), Some(4));
    }

    #[test]
    fn ready_stamp_is_the_fallback() {
        let obj = json!({
            "status": { "conditions": [{"type": "Ready", "status": "True", "observedGeneration": 9}] }
        });
        assert_eq!(observed_generation(&obj), Some(9));
        let bare = json!({ "status": { "conditions": [{"type": "Ready", "status": "True"}] } });
        assert_eq!(observed_generation(&bare), None);
    }

    #[test]
    fn controller_owner_skips_non_controller_refs() {
        let obj = json!({
            "metadata": {
                "ownerReferences": [
                    {"apiVersion": "v1", "kind": "ConfigMap", "name": "cm"},
                    {"apiVersion": "apps/v1", "kind": "Deployment", "name": "web", "controller": true}
                ]
            }
        });
        let (av, kind, name) = controller_owner(&obj).unwrap();
        assert_eq!((av.as_str(), kind.as_str(), name.as_str()), ("apps/v1", "Deployment", "web"));

        let none = json!({"metadata": {"ownerReferences": [{"apiVersion": "v1", "kind": "Pod", "name": "p"}]}});
        assert!(controller_owner(&none).is_none());
    }

    #[test]
    fn status_manager_prefers_direct_claim() {
        let obj = json!({
            "metadata": {
                "managedFields": [
                    {"manager": "kubectl", "fieldsV1": {"f:spec": {"f:replicas": {}}}},
                    {"manager": "reconciler", "fieldsV1": {"f:status": {"f:observedGeneration": {}}}}
                ]
            }
        });
        assert_eq!(status_manager(&obj).as_deref(), Some("reconciler"));
    }

    #[test]
    fn status_manager_via_condition_entry() {
        let obj = json!({
            "metadata": {
                "managedFields": [
                    {"manager": "crossplane", "fieldsV1": {"f:status": {
                        "f:conditions": {
                            "k:{\"type\":\"Synced\"}": {"f:observedGeneration": {}, "f:status": {}}
                        }
                    }}}
                ]
            }
        });
        assert_eq!(status_manager(&obj).as_deref(), Some("crossplane"));
        let unclaimed = json!({"metadata": {"managedFields": [{"manager": "x", "fieldsV1": {"f:metadata": {}}}]}});
        assert!(status_manager(&unclaimed).is_none());
    }

    #[test]
    fn conditions_are_copied_in_source_order() {
        let obj = json!({
            "status": { "conditions": [
                {"type": "Synced", "status": "True", "reason": "ReconcileSuccess"},
                {"type": "Ready", "status": "False", "message": "waiting on children"}
            ]}
        });
        let out = conditions(&obj);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].type_, "Synced");
        assert_eq!(out[0].reason, "ReconcileSuccess");
        assert_eq!(out[1].status, "False");
        assert_eq!(out[1].message, "waiting on children");
    }
}
