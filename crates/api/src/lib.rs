//! Kausality engine façade (in-process).
//!
//! This crate is the surface the admission-handling collaborator depends on:
//! one [`Engine::evaluate`] call per incoming mutation, returning the drift
//! decision plus the annotation map to fold into the admission response.
//! Webhook transport, policy rules and notification delivery live outside.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::{core::DynamicObject, Client};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use kausality_core::{
    Condition, DriftResult, HashList, LifecyclePhase, ParentRef, ParentState,
    CONTROLLERS_ANNOTATION, PHASE_ANNOTATION, UPDATERS_ANNOTATION,
};
pub use kausality_detect::{DriftDetector, InitStrategy, PhaseConfig};
pub use kausality_resolve::{KubeParentSource, ParentSource, ResolveError};
pub use kausality_track::{record_updater, ControllerTracker, TrackerConfig};

use kausality_core::parse_hash_list;

/// Kind of mutation carried by the admission request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

/// Slice of the admission request the engine consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionContext {
    pub username: String,
    /// Fallback identity when the username is empty.
    pub uid: String,
    /// Field manager of the write, when the apiserver reports one.
    pub field_manager: Option<String>,
    pub operation: Operation,
    /// Subresource being written ("status", "scale", ...), if any.
    pub subresource: Option<String>,
}

impl AdmissionContext {
    pub fn actor_identity(&self) -> &str {
        if self.username.is_empty() {
            &self.uid
        } else {
            &self.username
        }
    }

    pub fn is_status_update(&self) -> bool {
        self.subresource.as_deref() == Some("status")
    }

    fn spec_field_manager(&self) -> Option<&str> {
        self.field_manager.as_deref().filter(|fm| !fm.is_empty())
    }
}

/// Engine configuration, constructed once and passed in whole.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub phase: PhaseConfig,
    pub tracker: TrackerConfig,
}

/// Result of evaluating one admission request.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub result: DriftResult,
    /// Full annotation map for the response patch on spec writes; None for
    /// status writes and deletes (those cannot carry an annotation patch).
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Wires resolver, classifier, detector and ledger into one call per request.
pub struct Engine {
    source: Arc<dyn ParentSource>,
    detector: DriftDetector,
    tracker: ControllerTracker,
}

impl Engine {
    pub fn new(client: Client, cfg: EngineConfig) -> Self {
        let source: Arc<dyn ParentSource> = Arc::new(KubeParentSource::new(client.clone()));
        Self::with_source(source, client, cfg)
    }

    /// Swap in an alternate parent source (tests, cached backends).
    pub fn with_source(source: Arc<dyn ParentSource>, client: Client, cfg: EngineConfig) -> Self {
        Self {
            detector: DriftDetector::new(Arc::clone(&source), cfg.phase),
            tracker: ControllerTracker::new(client, cfg.tracker),
            source,
        }
    }

    /// Evaluate one mutation to `child`: resolve its parent, classify the
    /// lifecycle phase, render the drift decision, and keep the actor
    /// ledger current for future requests.
    pub async fn evaluate(&self, ctx: &AdmissionContext, child: &DynamicObject) -> Evaluation {
        let child_updaters: HashList = child
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(UPDATERS_ANNOTATION))
            .map(|v| parse_hash_list(v))
            .unwrap_or_default();

        let result = match self.source.resolve(child).await {
            Err(err) => self.detector.resolution_failure(&err),
            Ok(None) => self.detector.no_parent(),
            Ok(Some(state)) => match ctx.spec_field_manager() {
                Some(fm) => self.detector.detect_from_state_with_field_manager(Some(&state), fm),
                None => self.detector.detect_from_state_with_actor(
                    Some(&state),
                    ctx.actor_identity(),
                    &child_updaters,
                ),
            },
        };

        // Keep the parent's phase annotation current (sticky, best-effort).
        if let Some(state) = result.parent_state.as_ref() {
            let current = (!state.phase_from_annotation.is_empty())
                .then_some(state.phase_from_annotation.as_str());
            self.tracker.record_phase_async(&state.reference, current, result.lifecycle_phase);
        }

        let annotations = if ctx.is_status_update() {
            // The writer is acting as this object's controller; the
            // annotation cannot ride on a status response, so it goes
            // through the separate-write path.
            match self_ref(child) {
                Some(target) => {
                    let current = child
                        .metadata
                        .annotations
                        .as_ref()
                        .and_then(|a| a.get(CONTROLLERS_ANNOTATION))
                        .map(String::as_str);
                    self.tracker.record_controller_async(&target, current, ctx.actor_identity());
                }
                None => warn!("status update without typed identity; controller not recorded"),
            }
            None
        } else if matches!(ctx.operation, Operation::Create | Operation::Update) {
            Some(record_updater(child, ctx.actor_identity()))
        } else {
            None
        };

        debug!(
            actor = ctx.actor_identity(),
            allowed = result.allowed,
            drift = result.drift_detected,
            reason = %result.reason,
            "admission evaluated"
        );
        Evaluation { result, annotations }
    }
}

/// The child's own object reference, for writes where it plays the parent
/// role (status updates by its controller).
fn self_ref(obj: &DynamicObject) -> Option<ParentRef> {
    let types = obj.types.as_ref()?;
    Some(ParentRef {
        api_version: types.api_version.clone(),
        kind: types.kind.clone(),
        namespace: obj.metadata.namespace.clone(),
        name: obj.metadata.name.clone()?,
    })
}
