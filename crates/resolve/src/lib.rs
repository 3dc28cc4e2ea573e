//! Kausality parent resolver: finds the controlling owner of a child object,
//! fetches it, and normalizes the causally-relevant slice of its state into
//! a [`ParentState`] snapshot.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use kube::{core::DynamicObject, Client};
use metrics::counter;
use serde_json::Value;
use tracing::debug;

use kausality_core::{
    parse_hash_list, raw, ParentRef, ParentState, CONTROLLERS_ANNOTATION, PHASE_ANNOTATION,
};

/// Failure to resolve a parent. Distinct from "no parent": these fail the
/// admission decision closed at the detector layer.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("malformed owner apiVersion {0:?}")]
    MalformedApiVersion(String),
    #[error("fetching parent {reference}: {source}")]
    Fetch {
        reference: ParentRef,
        source: kube::Error,
    },
    #[error("reading parent {reference}: {source}")]
    Decode {
        reference: ParentRef,
        source: serde_json::Error,
    },
}

/// Seam between the detector and the cluster. The live implementation is
/// [`KubeParentSource`]; tests substitute canned states.
#[async_trait]
pub trait ParentSource: Send + Sync {
    /// `Ok(None)` means the child has no controller owner reference and is
    /// not under causal management.
    async fn resolve(&self, child: &DynamicObject) -> Result<Option<ParentState>, ResolveError>;
}

/// Reference to the child's controlling owner, if any. The parent is looked
/// up in the child's own namespace; cluster-scoped parents referenced from a
/// namespaced child are not specially handled (covered by tests, kept as-is).
pub fn parent_ref_for(child: &DynamicObject) -> Result<Option<ParentRef>, ResolveError> {
    let owner = child
        .metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|o| o.controller.unwrap_or(false));
    let Some(owner) = owner else { return Ok(None) };
    // Validate early so a malformed reference fails closed, not at fetch time.
    kausality_kubehub::parse_api_version(&owner.api_version)
        .map_err(|_| ResolveError::MalformedApiVersion(owner.api_version.clone()))?;
    Ok(Some(ParentRef {
        api_version: owner.api_version.clone(),
        kind: owner.kind.clone(),
        namespace: child.metadata.namespace.clone(),
        name: owner.name.clone(),
    }))
}

/// Normalize a fetched parent object into a [`ParentState`]. Pure over the
/// JSON tree; this is the schemaless extraction path that works for
/// arbitrary custom resources.
pub fn parent_state_from_value(reference: ParentRef, obj: &Value) -> ParentState {
    let observed = raw::observed_generation(obj);
    let phase_from_annotation = raw::annotation(obj, PHASE_ANNOTATION).unwrap_or("").to_string();
    let controllers = raw::annotation(obj, CONTROLLERS_ANNOTATION)
        .map(parse_hash_list)
        .unwrap_or_default();
    let deletion_timestamp = raw::deletion_timestamp(obj)
        .and_then(|ts| serde_json::from_value(Value::String(ts.to_string())).ok());
    ParentState {
        generation: raw::generation(obj),
        observed_generation: observed.unwrap_or(0),
        has_observed_generation: observed.is_some(),
        controller_manager: raw::status_manager(obj).unwrap_or_default(),
        controllers,
        deletion_timestamp,
        conditions: raw::conditions(obj),
        is_initialized: phase_from_annotation == "initialized",
        phase_from_annotation,
        reference,
    }
}

/// Live resolver backed by a kube client. The single read per request is
/// typically cache-backed and inherits the caller's deadline; a timeout
/// surfaces as a fetch error and fails closed.
pub struct KubeParentSource {
    client: Client,
}

impl KubeParentSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ParentSource for KubeParentSource {
    async fn resolve(&self, child: &DynamicObject) -> Result<Option<ParentState>, ResolveError> {
        let Some(reference) = parent_ref_for(child)? else {
            debug!(child = ?child.metadata.name, "no controller owner reference");
            return Ok(None);
        };
        let api = kausality_kubehub::dynamic_api(
            self.client.clone(),
            &reference.api_version,
            &reference.kind,
            reference.namespace.as_deref(),
        )
        .await
        .map_err(|_| ResolveError::MalformedApiVersion(reference.api_version.clone()))?;
        let parent = api.get(&reference.name).await.map_err(|source| {
            counter!("kausality_resolve_errors_total", 1u64);
            ResolveError::Fetch { reference: reference.clone(), source }
        })?;
        let obj = serde_json::to_value(&parent)
            .map_err(|source| ResolveError::Decode { reference: reference.clone(), source })?;
        let state = parent_state_from_value(reference, &obj);
        debug!(
            parent = %state.reference,
            generation = state.generation,
            observed_generation = state.observed_generation,
            has_observed_generation = state.has_observed_generation,
            "resolved parent"
        );
        Ok(Some(state))
    }
}
