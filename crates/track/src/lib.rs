//! Kausality actor ledger: records which actor fingerprints have written an
//! object's spec (updaters, on children) or status (controllers, on
//! parents), plus the lifecycle phase annotation.
//!
//! Updater recording is synchronous and returns the annotation map for the
//! admission response patch. Controller and phase recording go through a
//! detached, coalesced flush: annotation changes cannot ride along on a
//! status-subresource admission response, so they need a separate write
//! that must land before the next request for the same object observes it.

#![forbid(unsafe_code)]

use std::collections::hash_map::Entry;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::{api::PostParams, core::DynamicObject, Client};
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use kausality_core::{
    actor_hash, join_hash_list, parse_hash_list, push_hash, LifecyclePhase, ParentRef,
    CONTROLLERS_ANNOTATION, PHASE_ANNOTATION, UPDATERS_ANNOTATION,
};

fn env_flush_delay_ms() -> u64 {
    std::env::var("KAUSALITY_FLUSH_DELAY_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0)
}

fn env_flush_max_attempts() -> u32 {
    std::env::var("KAUSALITY_FLUSH_MAX_ATTEMPTS")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(3)
}

/// Flush behavior. Defaults come from the environment where set.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Delay before a pending write is flushed; zero flushes immediately.
    pub flush_delay: Duration,
    /// Optimistic-concurrency attempts per flush before giving up.
    pub max_attempts: u32,
    /// Base backoff between conflicted attempts (scaled linearly).
    pub retry_backoff: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            flush_delay: Duration::from_millis(env_flush_delay_ms()),
            max_attempts: env_flush_max_attempts().max(1),
            retry_backoff: Duration::from_millis(200),
        }
    }
}

/// Record the acting user's fingerprint in the child's updaters annotation.
/// Returns the child's full annotation map so the caller can fold it into
/// the admission response patch directly; no separate write happens here.
pub fn record_updater(child: &DynamicObject, actor: &str) -> BTreeMap<String, String> {
    let mut annotations = child.metadata.annotations.clone().unwrap_or_default();
    let mut list = annotations
        .get(UPDATERS_ANNOTATION)
        .map(|v| parse_hash_list(v))
        .unwrap_or_default();
    push_hash(&mut list, &actor_hash(actor));
    annotations.insert(UPDATERS_ANNOTATION.to_string(), join_hash_list(&list));
    annotations
}

/// Compute the next value for a ledger annotation, or None when the write
/// would be a no-op. Phase never downgrades away from "initialized".
fn merge_annotation(key: &str, current: Option<&str>, value: &str) -> Option<String> {
    if key == PHASE_ANNOTATION {
        if current == Some(value) || current == Some("initialized") {
            return None;
        }
        return Some(value.to_string());
    }
    let mut list = current.map(parse_hash_list).unwrap_or_default();
    if !push_hash(&mut list, value) {
        return None;
    }
    Some(join_hash_list(&list))
}

/// One queued ledger mutation for an object.
#[derive(Debug, Clone)]
enum LedgerOp {
    /// Add a controller fingerprint.
    Controller(String),
    /// Record a phase annotation value.
    Phase(String),
}

/// Accumulated mutations for one object, merged into a single write.
#[derive(Debug, Clone, Default)]
struct PendingWrite {
    controllers: Vec<String>,
    phase: Option<String>,
}

impl PendingWrite {
    fn absorb(&mut self, op: LedgerOp) {
        match op {
            LedgerOp::Controller(hash) => {
                if !self.controllers.contains(&hash) {
                    self.controllers.push(hash);
                }
            }
            LedgerOp::Phase(value) => {
                if self.phase.as_deref() != Some("initialized") {
                    self.phase = Some(value);
                }
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.controllers.is_empty() && self.phase.is_none()
    }

    /// Merge everything queued into a fresh annotation map; false means the
    /// object already carries it all and the write would be a no-op.
    fn apply(&self, annotations: &mut BTreeMap<String, String>) -> bool {
        let mut changed = false;
        for hash in &self.controllers {
            let current = annotations.get(CONTROLLERS_ANNOTATION).map(String::as_str);
            if let Some(next) = merge_annotation(CONTROLLERS_ANNOTATION, current, hash) {
                annotations.insert(CONTROLLERS_ANNOTATION.to_string(), next);
                changed = true;
            }
        }
        if let Some(phase) = self.phase.as_deref() {
            let current = annotations.get(PHASE_ANNOTATION).map(String::as_str);
            if let Some(next) = merge_annotation(PHASE_ANNOTATION, current, phase) {
                annotations.insert(PHASE_ANNOTATION.to_string(), next);
                changed = true;
            }
        }
        changed
    }
}

/// Coalesces concurrent requests per object key: at most one write is in
/// flight per object, and anything arriving meanwhile is merged into the
/// pending entry that write will drain. Instance-scoped, never
/// process-global.
#[derive(Default)]
struct PendingTable {
    entries: Mutex<FxHashMap<String, PendingWrite>>,
}

impl PendingTable {
    /// Queue an op; returns true when the object had no in-flight write and
    /// the caller must start one.
    fn absorb(&self, object: &str, op: LedgerOp) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match entries.entry(object.to_string()) {
            Entry::Occupied(mut e) => {
                e.get_mut().absorb(op);
                false
            }
            Entry::Vacant(v) => {
                let mut write = PendingWrite::default();
                write.absorb(op);
                v.insert(write);
                true
            }
        }
    }

    /// Take the accumulated ops, leaving the entry as an in-flight marker so
    /// later arrivals keep merging instead of spawning a second write.
    fn drain(&self, object: &str) -> PendingWrite {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get_mut(object).map(std::mem::take).unwrap_or_default()
    }

    /// Drop the marker if nothing new arrived; false means another round is
    /// needed.
    fn try_finish(&self, object: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match entries.get(object) {
            Some(write) if !write.is_empty() => false,
            _ => {
                entries.remove(object);
                true
            }
        }
    }
}

/// Best-effort ledger writer for parent-side annotations.
pub struct ControllerTracker {
    client: Client,
    cfg: TrackerConfig,
    pending: Arc<PendingTable>,
}

impl ControllerTracker {
    pub fn new(client: Client, cfg: TrackerConfig) -> Self {
        Self { client, cfg, pending: Arc::new(PendingTable::default()) }
    }

    /// Record the acting user as a status controller of `target`. `current`
    /// is the controllers annotation from the request snapshot, used as the
    /// no-op fast path; the flush re-checks against fresh data.
    pub fn record_controller_async(&self, target: &ParentRef, current: Option<&str>, actor: &str) {
        let hash = actor_hash(actor);
        if merge_annotation(CONTROLLERS_ANNOTATION, current, &hash).is_none() {
            return;
        }
        self.enqueue(target, LedgerOp::Controller(hash));
    }

    /// Record the observed lifecycle phase on `target`. Deleting is never
    /// recorded and the phase never downgrades away from "initialized".
    pub fn record_phase_async(&self, target: &ParentRef, current: Option<&str>, phase: LifecyclePhase) {
        let Some(value) = phase.annotation_value() else { return };
        if merge_annotation(PHASE_ANNOTATION, current, value).is_none() {
            return;
        }
        self.enqueue(target, LedgerOp::Phase(value.to_string()));
    }

    fn enqueue(&self, target: &ParentRef, op: LedgerOp) {
        let object = target.to_string();
        if !self.pending.absorb(&object, op) {
            return; // merged into the write already in flight for this object
        }
        let client = self.client.clone();
        let cfg = self.cfg.clone();
        let pending = Arc::clone(&self.pending);
        let target = target.clone();
        // Detached task: the originating request's context is canceled once
        // its response is sent, but this write must still complete.
        tokio::spawn(async move {
            if !cfg.flush_delay.is_zero() {
                tokio::time::sleep(cfg.flush_delay).await;
            }
            loop {
                let batch = pending.drain(&object);
                if !batch.is_empty() {
                    flush(client.clone(), &target, &batch, &cfg).await;
                }
                if pending.try_finish(&object) {
                    break;
                }
            }
        });
    }
}

async fn flush(client: Client, target: &ParentRef, batch: &PendingWrite, cfg: &TrackerConfig) {
    let api = match kausality_kubehub::dynamic_api(
        client,
        &target.api_version,
        &target.kind,
        target.namespace.as_deref(),
    )
    .await
    {
        Ok(api) => api,
        Err(err) => {
            warn!(object = %target, error = %err, "ledger flush skipped: bad target");
            return;
        }
    };
    for attempt in 1..=cfg.max_attempts {
        let mut obj = match api.get(&target.name).await {
            Ok(obj) => obj,
            Err(err) => {
                counter!("kausality_flush_failures_total", 1u64);
                warn!(object = %target, error = %err, "ledger flush fetch failed");
                return;
            }
        };
        let annotations = obj.metadata.annotations.get_or_insert_with(BTreeMap::new);
        if !batch.apply(annotations) {
            return; // fresh object already carries everything queued
        }
        // Replace with the fetched resourceVersion intact so the apiserver
        // rejects the write if anyone else got there first.
        match api.replace(&target.name, &PostParams::default(), &obj).await {
            Ok(_) => {
                counter!("kausality_flush_ok_total", 1u64);
                debug!(object = %target, "ledger annotations recorded");
                return;
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                counter!("kausality_flush_conflicts_total", 1u64);
                debug!(object = %target, attempt, "ledger flush conflict; retrying");
                tokio::time::sleep(cfg.retry_backoff * attempt).await;
            }
            Err(err) => {
                counter!("kausality_flush_failures_total", 1u64);
                warn!(object = %target, error = %err, "ledger flush write failed");
                return;
            }
        }
    }
    counter!("kausality_flush_failures_total", 1u64);
    warn!(object = %target, attempts = cfg.max_attempts, "ledger flush retries exhausted");
}
