//! The serve pipeline: one logical call from the host recommender.
//!
//! Per request: pick the governing experiment for the surface, assign the
//! user via the deterministic router, fetch the pinned arm catalog, load a
//! bounded-stale policy-state view, select under a deadline, and append one
//! serve event per returned slot.
//!
//! Degradation rules (the serve path never surfaces an internal failure it
//! can route around):
//! - Policy deadline exceeded → remaining slots fall back to the control
//!   policy with `policy_timeout = true`, and events are still appended.
//! - Policy logic error → that slot falls back to control with
//!   `error = true` (the guardrail monitor counts it).
//! - Experiment paused/ended/killed → serve the experiment's default policy,
//!   record nothing (terminal experiments take no further serves).
//!
//! Reads are bounded-stale: state views are cached per (experiment, policy,
//! context) with a TTL and invalidated whenever experiment config changes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    assign, select, select_control, stable_hash64, AssignOutcome, AssignmentRow, Clock,
    ControlParams, Context, Error, EventId, Experiment, ExperimentId, ExperimentStatus, PolicyId,
    PolicySpec, Result, Selection, ServeEvent, StateView, Store, UserId,
};

/// Serve-path tuning.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServeConfig {
    /// Budget for policy selection plus state reads, per request.
    pub select_deadline_ms: u64,
    /// End-to-end budget; exceeding it also falls back to control.
    pub total_deadline_ms: u64,
    /// State-view cache TTL. Reads may be this stale at most.
    pub state_cache_ttl_ms: i64,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            select_deadline_ms: 50,
            total_deadline_ms: 120,
            state_cache_ttl_ms: 60_000,
        }
    }
}

/// One returned recommendation slot.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServeSlot {
    pub arm_id: String,
    pub position: u32,
    pub propensity: f64,
    pub score: f64,
    pub experiment_id: ExperimentId,
    pub policy_id: PolicyId,
    pub event_id: EventId,
}

struct CachedView {
    view: StateView,
    loaded_at_ms: i64,
    generation: u64,
}

/// The request-path service.
pub struct ServePipeline {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    cfg: ServeConfig,
    cache: Mutex<BTreeMap<(ExperimentId, PolicyId, String), CachedView>>,
    serve_seq: AtomicU64,
}

impl ServePipeline {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(store, clock, ServeConfig::default())
    }

    pub fn with_config(store: Arc<Store>, clock: Arc<dyn Clock>, cfg: ServeConfig) -> Self {
        Self {
            store,
            clock,
            cfg,
            cache: Mutex::new(BTreeMap::new()),
            serve_seq: AtomicU64::new(0),
        }
    }

    /// Serve up to `k` ranked arms for a user on a surface.
    ///
    /// Fails only when there is nothing to serve at all:
    /// [`Error::NoActiveExperiment`] when no experiment (of any status)
    /// governs the surface, [`Error::UnavailableArmCatalog`] /
    /// [`Error::NoEligibleArm`] when the pinned catalog cannot produce a
    /// candidate set.
    pub fn recommend(
        &self,
        user_id: UserId,
        surface: &str,
        context: &Context,
        k: usize,
    ) -> Result<Vec<ServeSlot>> {
        let t0 = self.clock.now_ms();
        let experiment = self.governing_experiment(surface)?;
        let recording = experiment.status == ExperimentStatus::Active;

        // Assignment: hash is truth, storage is cache. Non-active
        // experiments always serve their default policy.
        let policy_id = if recording {
            match assign(
                &experiment.config.salt,
                user_id,
                experiment.config.traffic_fraction,
                &experiment.config.plan,
            ) {
                AssignOutcome::Assigned { policy_id, bucket } => {
                    self.store.record_assignment(AssignmentRow {
                        user_id,
                        experiment_id: experiment.id.clone(),
                        policy_id: policy_id.clone(),
                        bucket,
                        assigned_at_ms: t0,
                        sticky: true,
                    });
                    policy_id
                }
                // Out-of-experiment traffic serves the default policy but is
                // still logged for comparability.
                AssignOutcome::NotInExperiment { .. } => experiment.default_policy_id.clone(),
            }
        } else {
            experiment.default_policy_id.clone()
        };

        let policy = self
            .store
            .policy(&policy_id)
            .ok_or_else(|| Error::NotFound {
                kind: "policy",
                id: policy_id.to_string(),
            })?;

        let catalog = self
            .store
            .catalog(&experiment.id, experiment.catalog_version)
            .ok_or_else(|| Error::UnavailableArmCatalog(experiment.id.to_string()))?;
        let mut remaining = catalog.eligible_ids(t0);
        if remaining.is_empty() {
            return Err(Error::NoEligibleArm);
        }

        let context_key = policy.context_key(context);
        let mut view = self.state_view(&experiment, &policy, &context_key, &remaining);

        let mut slots = Vec::with_capacity(k.min(remaining.len()));
        let mut events = Vec::new();
        let control = ControlParams::default();

        for position in 0..k.min(catalog.arms.len()) as u32 {
            if remaining.is_empty() {
                break;
            }
            let elapsed = (self.clock.now_ms() - t0).max(0) as u64;
            let timed_out = elapsed > self.cfg.select_deadline_ms
                || elapsed > self.cfg.total_deadline_ms;

            let seq = self.serve_seq.fetch_add(1, Ordering::Relaxed);
            let seed = stable_hash64(
                seq,
                &format!("{}:{user_id}:{position}", experiment.config.salt),
            );

            let (selection, timeout_flag, error_flag) = if timed_out {
                debug!(experiment = %experiment.id, elapsed, "policy deadline exceeded; control fallback");
                match select_control(&control, &remaining) {
                    Ok(sel) => (sel, true, false),
                    Err(e) => return Err(e),
                }
            } else {
                match select(&policy.params, &remaining, &view, seed) {
                    Ok(sel) => (sel, false, false),
                    Err(e) => {
                        // Logic errors fail the policy loudly but not the
                        // request: degrade this slot to control and let the
                        // guardrail monitor see the error counter.
                        warn!(experiment = %experiment.id, policy = %policy_id, error = %e, "policy selection failed; control fallback");
                        match select_control(&control, &remaining) {
                            Ok(sel) => (sel, false, true),
                            Err(e) => return Err(e),
                        }
                    }
                }
            };

            let Selection {
                arm_id,
                propensity,
                score,
                ..
            } = selection;

            let event_id = EventId::new(uuid::Uuid::new_v4().to_string());
            let latency_ms = (self.clock.now_ms() - t0).max(0) as u64;
            slots.push(ServeSlot {
                arm_id: arm_id.clone(),
                position,
                propensity,
                score,
                experiment_id: experiment.id.clone(),
                policy_id: policy_id.clone(),
                event_id: event_id.clone(),
            });
            if recording {
                let mut event = ServeEvent::open(
                    event_id,
                    experiment.id.clone(),
                    user_id,
                    policy_id.clone(),
                    arm_id.clone(),
                    position,
                    context.clone(),
                    propensity,
                    score,
                    latency_ms,
                    t0,
                );
                event.policy_timeout = timeout_flag;
                event.error = error_flag;
                events.push(event);
            }

            remaining.retain(|a| a != &arm_id);
            view.remove(&arm_id);
        }

        for event in events {
            // Exactly-once per event id; a retried append is a no-op.
            self.store.append_event(event)?;
        }
        Ok(slots)
    }

    /// The experiment governing a surface: the active one with the highest
    /// (priority, recency); failing that, the most recent non-draft one
    /// (whose default policy still serves traffic without recording).
    fn governing_experiment(&self, surface: &str) -> Result<Experiment> {
        let mut on_surface: Vec<Experiment> = self
            .store
            .experiments()
            .into_iter()
            .filter(|e| e.config.surface == surface && e.status != ExperimentStatus::Draft)
            .collect();
        if on_surface.is_empty() {
            return Err(Error::NoActiveExperiment(surface.to_string()));
        }
        on_surface.sort_by(|a, b| {
            b.config
                .priority
                .cmp(&a.config.priority)
                .then_with(|| b.start_at_ms.unwrap_or(0).cmp(&a.start_at_ms.unwrap_or(0)))
                .then_with(|| a.id.cmp(&b.id))
        });
        let active = on_surface
            .iter()
            .find(|e| e.status == ExperimentStatus::Active);
        Ok(active.unwrap_or(&on_surface[0]).clone())
    }

    /// Cached bounded-stale state view. Entries expire on TTL or whenever
    /// experiment configuration changes (generation bump).
    fn state_view(
        &self,
        experiment: &Experiment,
        policy: &PolicySpec,
        context_key: &str,
        arms: &[String],
    ) -> StateView {
        let now = self.clock.now_ms();
        let generation = self.store.config_generation();
        let cache_key = (
            experiment.id.clone(),
            policy.id.clone(),
            context_key.to_string(),
        );

        let mut cache = self.cache.lock();
        if let Some(cached) = cache.get(&cache_key) {
            let fresh = now - cached.loaded_at_ms <= self.cfg.state_cache_ttl_ms
                && cached.generation == generation
                && arms.iter().all(|a| cached.view.contains_key(a));
            if fresh {
                return cached.view.clone();
            }
        }
        let view = self
            .store
            .state_view(&experiment.id, &policy.id, context_key, arms);
        cache.insert(
            cache_key,
            CachedView {
                view: view.clone(),
                loaded_at_ms: now,
                generation,
            },
        );
        view
    }

    /// Drop every cached state view (used by tests and admin tooling).
    pub fn invalidate_cache(&self) {
        self.cache.lock().clear();
    }
}
