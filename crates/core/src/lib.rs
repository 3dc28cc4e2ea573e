//! Kausality core types: parent references and state, lifecycle phases,
//! drift results, actor fingerprints and the bounded fingerprint lists
//! persisted in object annotations.

#![forbid(unsafe_code)]

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use smallvec::SmallVec;

pub mod raw;

/// Annotation on a parent listing fingerprints of actors that updated its status.
pub const CONTROLLERS_ANNOTATION: &str = "kausality.io/controllers";
/// Annotation on a child listing fingerprints of actors that updated its spec.
pub const UPDATERS_ANNOTATION: &str = "kausality.io/updaters";
/// Annotation on a parent recording the last observed lifecycle phase.
pub const PHASE_ANNOTATION: &str = "kausality.io/phase";

/// Upper bound on fingerprints kept per annotation; oldest evicted first.
pub const MAX_HASHES: usize = 5;

/// Identity of a controlling parent object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ParentRef {
    pub api_version: String,
    pub kind: String,
    /// None for cluster-scoped parents.
    pub namespace: Option<String>,
    pub name: String,
}

impl std::fmt::Display for ParentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.namespace.as_deref() {
            Some(ns) => write!(f, "{}/{}:{}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{}:{}", self.api_version, self.kind, self.name),
        }
    }
}

/// One status condition, normalized regardless of source representation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// Bounded list of actor fingerprints, insertion-ordered.
pub type HashList = SmallVec<[String; MAX_HASHES]>;

/// Read-only snapshot of a parent's causally-relevant state, taken once per
/// resolution. A pure function of the parent object at fetch time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParentState {
    pub reference: ParentRef,
    pub generation: i64,
    pub observed_generation: i64,
    /// Absence of observedGeneration is distinct from zero.
    pub has_observed_generation: bool,
    /// Field manager that last wrote the observed-generation field; empty = unknown.
    pub controller_manager: String,
    /// Fingerprints of actors that have historically updated this parent's status.
    pub controllers: HashList,
    pub deletion_timestamp: Option<Time>,
    pub conditions: Vec<Condition>,
    /// Sticky once true (sourced from the phase annotation).
    pub is_initialized: bool,
    /// Last externally recorded phase value; hint only, not authoritative.
    pub phase_from_annotation: String,
}

impl ParentState {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn condition_is_true(&self, type_: &str) -> bool {
        self.condition(type_).map(|c| c.status == "True").unwrap_or(false)
    }
}

/// Lifecycle phase of a parent, gating whether drift comparison applies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    Initializing,
    Initialized,
    Deleting,
}

impl LifecyclePhase {
    /// Value written to the phase annotation; Deleting is never recorded.
    pub fn annotation_value(self) -> Option<&'static str> {
        match self {
            LifecyclePhase::Initializing => Some("initializing"),
            LifecyclePhase::Initialized => Some("initialized"),
            LifecyclePhase::Deleting => None,
        }
    }
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecyclePhase::Initializing => "initializing",
            LifecyclePhase::Initialized => "initialized",
            LifecyclePhase::Deleting => "deleting",
        };
        f.write_str(s)
    }
}

/// Outcome of evaluating one mutation. Constructed fresh per request and
/// never mutated afterwards; `reason` is a stable, greppable audit string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftResult {
    pub allowed: bool,
    pub reason: String,
    pub drift_detected: bool,
    pub parent_ref: Option<ParentRef>,
    pub parent_state: Option<ParentState>,
    pub lifecycle_phase: LifecyclePhase,
}

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const BASE36_SPACE: u32 = 36 * 36 * 36 * 36 * 36;

/// Compact fingerprint of an actor identity: first 4 bytes of
/// SHA-256(identity) as a big-endian u32, reduced mod 36^5 and rendered
/// base-36, zero-padded to exactly 5 characters. Collisions are an accepted
/// bounded false-positive risk.
pub fn actor_hash(identity: &str) -> String {
    let digest = Sha256::digest(identity.as_bytes());
    let mut n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % BASE36_SPACE;
    let mut buf = [b'0'; 5];
    for slot in buf.iter_mut().rev() {
        *slot = BASE36[(n % 36) as usize];
        n /= 36;
    }
    // buf is ASCII by construction
    String::from_utf8(buf.to_vec()).unwrap_or_default()
}

/// Parse a comma-separated fingerprint annotation value.
pub fn parse_hash_list(value: &str) -> HashList {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Render a fingerprint list back to its annotation form.
pub fn join_hash_list(list: &HashList) -> String {
    list.join(",")
}

/// Append a fingerprint if absent, trimming to the most recent `MAX_HASHES`.
/// Returns false when the fingerprint was already present (no-op).
pub fn push_hash(list: &mut HashList, hash: &str) -> bool {
    if list.iter().any(|h| h == hash) {
        return false;
    }
    list.push(hash.to_string());
    while list.len() > MAX_HASHES {
        list.remove(0);
    }
    true
}
