//! Kausality lifecycle classifier and drift detector.
//!
//! The classifier gates whether generation comparison applies at all; the
//! detector turns one incoming mutation into a [`DriftResult`], optionally
//! sharpened by field-manager or fingerprint attribution. Both are pure over
//! their inputs; only [`DriftDetector::detect`] touches the cluster, through
//! the [`ParentSource`] seam.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kube::core::DynamicObject;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use kausality_core::{actor_hash, DriftResult, LifecyclePhase, ParentState};
use kausality_resolve::{ParentSource, ResolveError};

/// One way a parent can signal that initialization has completed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InitStrategy {
    /// An `Initialized` condition with status `True`.
    InitializedCondition,
    /// A `Ready` condition with status `True`.
    ReadyCondition,
    /// observedGeneration exists AND at least one of {Ready, Available,
    /// Initialized} is `True`. The readiness check keeps "status synced but
    /// children not yet ready" out of steady state for reconcilers that
    /// stamp sync completion before full readiness.
    ObservedGenerationWithReadiness,
}

/// Ordered initialization strategies; first match wins. Swap the order for
/// resource types with different status conventions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub strategies: Vec<InitStrategy>,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            strategies: vec![
                InitStrategy::InitializedCondition,
                InitStrategy::ReadyCondition,
                InitStrategy::ObservedGenerationWithReadiness,
            ],
        }
    }
}

/// Classify a parent's lifecycle phase. `None` is conservatively
/// `Initialized` (nothing to gate). Deleting dominates everything; the
/// annotation-backed initialized flag is sticky and never regresses.
pub fn detect_phase(state: Option<&ParentState>, cfg: &PhaseConfig) -> LifecyclePhase {
    let Some(state) = state else { return LifecyclePhase::Initialized };
    if state.deletion_timestamp.is_some() {
        return LifecyclePhase::Deleting;
    }
    if state.is_initialized {
        return LifecyclePhase::Initialized;
    }
    for strategy in &cfg.strategies {
        let initialized = match strategy {
            InitStrategy::InitializedCondition => state.condition_is_true("Initialized"),
            InitStrategy::ReadyCondition => state.condition_is_true("Ready"),
            InitStrategy::ObservedGenerationWithReadiness => {
                state.has_observed_generation
                    && (state.condition_is_true("Ready")
                        || state.condition_is_true("Available")
                        || state.condition_is_true("Initialized"))
            }
        };
        if initialized {
            return LifecyclePhase::Initialized;
        }
    }
    LifecyclePhase::Initializing
}

/// Fallback attribution when no field manager is available. Returns
/// `(is_controller, can_determine)`; `can_determine == false` means
/// "insufficient information", never a definite answer either way.
pub fn is_controller_by_hash(
    state: &ParentState,
    actor: &str,
    child_updaters: &[String],
) -> (bool, bool) {
    let hash = actor_hash(actor);
    if child_updaters.len() == 1 {
        // A sole updater fingerprint is authoritative for this child.
        return (child_updaters[0] == hash, true);
    }
    let intersection: Vec<&String> = child_updaters
        .iter()
        .filter(|u| state.controllers.iter().any(|c| c == *u))
        .collect();
    if !intersection.is_empty() {
        return (intersection.iter().any(|u| **u == hash), true);
    }
    (false, false)
}

/// Phase-gated drift detector.
pub struct DriftDetector {
    source: Arc<dyn ParentSource>,
    cfg: PhaseConfig,
}

impl DriftDetector {
    pub fn new(source: Arc<dyn ParentSource>, cfg: PhaseConfig) -> Self {
        Self { source, cfg }
    }

    /// Resolve the child's parent and run the state-based decision.
    pub async fn detect(&self, child: &DynamicObject) -> DriftResult {
        match self.source.resolve(child).await {
            Err(err) => self.resolution_failure(&err),
            Ok(None) => self.no_parent(),
            Ok(Some(state)) => self.detect_from_state(Some(&state)),
        }
    }

    /// A resolution failure fails the decision closed.
    pub fn resolution_failure(&self, err: &ResolveError) -> DriftResult {
        self.result(false, false, format!("failed to resolve parent: {err}"), None)
    }

    /// No controller owner reference: the object is not under causal
    /// management and the mutation is always allowed.
    pub fn no_parent(&self) -> DriftResult {
        self.result(true, false, "no controller owner reference".to_string(), None)
    }

    /// Phase-gated generation comparison. Drift is only meaningful once the
    /// parent is initialized and its reconciler has caught up.
    pub fn detect_from_state(&self, state: Option<&ParentState>) -> DriftResult {
        let Some(s) = state else {
            return self.result(true, false, "no parent state".to_string(), None);
        };
        match detect_phase(state, &self.cfg) {
            LifecyclePhase::Deleting => {
                self.result(true, false, "parent is being deleted".to_string(), state)
            }
            LifecyclePhase::Initializing => {
                self.result(true, false, "parent is initializing".to_string(), state)
            }
            LifecyclePhase::Initialized => {
                if !s.has_observed_generation {
                    return self.result(
                        true,
                        false,
                        "no observed generation recorded on parent".to_string(),
                        state,
                    );
                }
                if s.generation != s.observed_generation {
                    let reason = format!(
                        "expected change: generation {} != observedGeneration {}",
                        s.generation, s.observed_generation
                    );
                    debug!(parent = %s.reference, %reason, "mutation attributed to reconciliation");
                    return self.result(true, false, reason, state);
                }
                counter!("kausality_drift_detected_total", 1u64);
                let reason = format!(
                    "drift detected: generation {} == observedGeneration {}",
                    s.generation, s.observed_generation
                );
                info!(parent = %s.reference, %reason, "unexpected mutation");
                // Logging-only rollout: allowed stays true, drift_detected is
                // carried independently so policy layers above can block.
                self.result(true, true, reason, state)
            }
        }
    }

    /// Refine the equal-generation case with field-manager attribution: a
    /// non-empty field manager that differs from a *known* controller
    /// manager is a distinguishable causal origin, not reconciler drift.
    pub fn detect_from_state_with_field_manager(
        &self,
        state: Option<&ParentState>,
        field_manager: &str,
    ) -> DriftResult {
        if let Some(s) = state {
            let controller = s.controller_manager.as_str();
            if !field_manager.is_empty() && !controller.is_empty() && field_manager != controller {
                let reason = format!(
                    "different actor: field manager {field_manager:?} is not controller manager {controller:?}"
                );
                return self.result(true, false, reason, state);
            }
        }
        self.detect_from_state(state)
    }

    /// Refine with fingerprint attribution when no field manager is present.
    /// Indeterminate attribution falls through to the plain comparison.
    pub fn detect_from_state_with_actor(
        &self,
        state: Option<&ParentState>,
        actor: &str,
        child_updaters: &[String],
    ) -> DriftResult {
        if let Some(s) = state {
            let (is_controller, can_determine) = is_controller_by_hash(s, actor, child_updaters);
            if can_determine && !is_controller {
                let reason = format!(
                    "different actor: {} is not a known controller of this object",
                    actor_hash(actor)
                );
                return self.result(true, false, reason, state);
            }
        }
        self.detect_from_state(state)
    }

    fn result(
        &self,
        allowed: bool,
        drift_detected: bool,
        reason: String,
        state: Option<&ParentState>,
    ) -> DriftResult {
        DriftResult {
            allowed,
            reason,
            drift_detected,
            parent_ref: state.map(|s| s.reference.clone()),
            parent_state: state.cloned(),
            lifecycle_phase: detect_phase(state, &self.cfg),
        }
    }
}
