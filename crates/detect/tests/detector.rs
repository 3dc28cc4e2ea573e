#![forbid(unsafe_code)]

use std::sync::Arc;

use kube::{api::ObjectMeta, core::DynamicObject};
use serde_json::json;

use kausality_core::{HashList, LifecyclePhase, ParentRef, ParentState};
use kausality_detect::{DriftDetector, PhaseConfig};
use kausality_resolve::{ParentSource, ResolveError};

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn child() -> DynamicObject {
    DynamicObject {
        types: None,
        metadata: ObjectMeta {
            name: Some("db-credentials".into()),
            namespace: Some("prod".into()),
            ..Default::default()
        },
        data: json!({}),
    }
}

struct NoParent;

#[async_trait::async_trait]
impl ParentSource for NoParent {
    async fn resolve(&self, _child: &DynamicObject) -> Result<Option<ParentState>, ResolveError> {
        Ok(None)
    }
}

struct Failing;

#[async_trait::async_trait]
impl ParentSource for Failing {
    async fn resolve(&self, _child: &DynamicObject) -> Result<Option<ParentState>, ResolveError> {
        Err(ResolveError::MalformedApiVersion("a/b/c".into()))
    }
}

struct Canned(ParentState);

#[async_trait::async_trait]
impl ParentSource for Canned {
    async fn resolve(&self, _child: &DynamicObject) -> Result<Option<ParentState>, ResolveError> {
        Ok(Some(self.0.clone()))
    }
}

fn parent(generation: i64, observed: i64) -> ParentState {
    ParentState {
        reference: ParentRef {
            api_version: "database.example.org/v1".into(),
            kind: "PostgresCluster".into(),
            namespace: Some("prod".into()),
            name: "main-db".into(),
        },
        generation,
        observed_generation: observed,
        has_observed_generation: true,
        controller_manager: String::new(),
        controllers: HashList::new(),
        deletion_timestamp: None,
        conditions: vec![kausality_core::Condition {
            type_: "Ready".into(),
            status: "True".into(),
            ..Default::default()
        }],
        is_initialized: false,
        phase_from_annotation: String::new(),
    }
}

#[tokio::test]
async fn child_without_controller_owner_is_always_allowed() {
    init_logs();
    let d = DriftDetector::new(Arc::new(NoParent), PhaseConfig::default());
    let r = d.detect(&child()).await;
    assert!(r.allowed);
    assert!(!r.drift_detected);
    assert_eq!(r.reason, "no controller owner reference");
    assert!(r.parent_ref.is_none());
    assert!(r.parent_state.is_none());
}

#[tokio::test]
async fn resolution_failure_fails_closed() {
    init_logs();
    let d = DriftDetector::new(Arc::new(Failing), PhaseConfig::default());
    let r = d.detect(&child()).await;
    assert!(!r.allowed);
    assert!(!r.drift_detected);
    assert!(r.reason.contains("failed to resolve parent"), "reason: {}", r.reason);
}

#[tokio::test]
async fn caught_up_parent_flags_drift() {
    init_logs();
    let d = DriftDetector::new(Arc::new(Canned(parent(5, 5))), PhaseConfig::default());
    let r = d.detect(&child()).await;
    assert!(r.allowed);
    assert!(r.drift_detected);
    assert_eq!(r.lifecycle_phase, LifecyclePhase::Initialized);
    assert_eq!(r.parent_ref.as_ref().unwrap().name, "main-db");
}

#[tokio::test]
async fn in_flight_reconciliation_is_expected() {
    init_logs();
    let d = DriftDetector::new(Arc::new(Canned(parent(5, 4))), PhaseConfig::default());
    let r = d.detect(&child()).await;
    assert!(r.allowed);
    assert!(!r.drift_detected);
    assert!(r.reason.contains("expected change"), "reason: {}", r.reason);
}
