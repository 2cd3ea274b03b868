//! Storage and schema layer.
//!
//! A durable-model store for the runtime's tables: experiments, policies,
//! arm catalogs, assignments, policy-arm state, serve events, reward events,
//! guardrail checks, decisions, plus the `reward_updates` queue that carries
//! attributed rewards to the state updater.
//!
//! Concurrency model (the part that matters):
//! - Policy state is **rows, not blobs**: one row per (experiment, policy,
//!   arm, context_key), each owned by its own mutex. Updates to one row are
//!   linearizable; updates across rows may interleave freely.
//! - Serve events are append-only and exactly-once per `event_id`; reward
//!   writes are a CAS on `attribution_version`, so last-writer-wins is
//!   impossible and retries are no-ops.
//! - Assignment rows are first-write-wins per (user, experiment).
//! - Secondary orderings maintained for the read paths the monitor, the
//!   attributor, and analytics need: (experiment, served_at) and
//!   (user, served_at) over events, (user, arm, at) over reward signals.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::{
    ArmCatalog, ArmState, AssignmentRow, Context, DecisionRow, Error, EventId, Experiment,
    ExperimentId, GuardrailCheckRow, PolicyId, PolicySpec, Result, RewardEventRow, RewardKind,
    StateKey, StateView, UserId, SERVE_EVENT_SCHEMA_VERSION,
};

/// One logged serve. Append-only; the reward fields are written at most once
/// within the attribution window, after which the row is frozen.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServeEvent {
    pub schema_version: u32,
    pub event_id: EventId,
    pub experiment_id: ExperimentId,
    pub user_id: UserId,
    pub policy_id: PolicyId,
    pub arm_id: String,
    /// Slot position for ranked lists (0-based).
    pub position: u32,
    pub context: Context,
    /// Probability the policy would have emitted `arm_id` at serve time.
    pub propensity: f64,
    /// Policy-specific score of the chosen arm.
    pub score: f64,
    pub latency_ms: u64,
    pub served_at_ms: i64,
    pub reward: Option<f64>,
    pub reward_at_ms: Option<i64>,
    /// CAS guard for reward writes: 0 = open, 1 = finalized.
    pub attribution_version: u32,
    /// The policy missed its deadline and the serve fell back to control.
    pub policy_timeout: bool,
    /// A storage or policy error occurred while producing this serve.
    pub error: bool,
    /// The event row could not be persisted synchronously and went through
    /// the best-effort path.
    pub dropped: bool,
}

impl ServeEvent {
    /// A fresh open event with the current schema version.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        event_id: EventId,
        experiment_id: ExperimentId,
        user_id: UserId,
        policy_id: PolicyId,
        arm_id: String,
        position: u32,
        context: Context,
        propensity: f64,
        score: f64,
        latency_ms: u64,
        served_at_ms: i64,
    ) -> Self {
        Self {
            schema_version: SERVE_EVENT_SCHEMA_VERSION,
            event_id,
            experiment_id,
            user_id,
            policy_id,
            arm_id,
            position,
            context,
            propensity,
            score,
            latency_ms,
            served_at_ms,
            reward: None,
            reward_at_ms: None,
            attribution_version: 0,
            policy_timeout: false,
            error: false,
            dropped: false,
        }
    }
}

/// Payload of the `reward_updates` queue: one attributed reward bound for a
/// policy-state row.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RewardUpdate {
    pub key: StateKey,
    pub event_id: EventId,
    pub reward: f64,
    /// Delivery attempts so far (bounded by the attributor's retry budget).
    pub attempts: u32,
}

type SignalKey = (UserId, String, i64, RewardKind);

/// In-process implementation of the storage schema.
///
/// The store is the only shared mutable state in the runtime; services hold
/// an `Arc<Store>` and communicate through it.
#[derive(Default)]
pub struct Store {
    experiments: RwLock<BTreeMap<ExperimentId, Experiment>>,
    policies: RwLock<BTreeMap<PolicyId, PolicySpec>>,
    catalogs: RwLock<BTreeMap<(ExperimentId, u64), ArmCatalog>>,
    assignments: RwLock<BTreeMap<(UserId, ExperimentId), AssignmentRow>>,
    states: RwLock<BTreeMap<StateKey, Arc<Mutex<ArmState>>>>,
    events: RwLock<BTreeMap<EventId, ServeEvent>>,
    events_by_experiment: RwLock<BTreeMap<(ExperimentId, i64, EventId), ()>>,
    events_by_user: RwLock<BTreeMap<(UserId, i64, EventId), ()>>,
    signals: RwLock<BTreeMap<SignalKey, RewardEventRow>>,
    guardrail_checks: RwLock<Vec<GuardrailCheckRow>>,
    decisions: RwLock<Vec<DecisionRow>>,
    reward_updates: Mutex<VecDeque<RewardUpdate>>,
    /// Bumped on every experiment mutation; read-mostly caches key on it.
    config_generation: AtomicU64,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // --- experiments -------------------------------------------------------

    pub fn insert_experiment(&self, experiment: Experiment) -> Result<()> {
        let mut experiments = self.experiments.write();
        if experiments.contains_key(&experiment.id) {
            return Err(Error::Configuration(format!(
                "experiment {} already exists",
                experiment.id
            )));
        }
        experiments.insert(experiment.id.clone(), experiment);
        self.config_generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn experiment(&self, id: &ExperimentId) -> Option<Experiment> {
        self.experiments.read().get(id).cloned()
    }

    pub fn experiments(&self) -> Vec<Experiment> {
        self.experiments.read().values().cloned().collect()
    }

    /// Atomically mutate one experiment. The closure runs under the write
    /// lock, so transitions are never observable half-applied.
    pub fn update_experiment(
        &self,
        id: &ExperimentId,
        f: impl FnOnce(&mut Experiment) -> Result<()>,
    ) -> Result<Experiment> {
        let mut experiments = self.experiments.write();
        let experiment = experiments.get_mut(id).ok_or_else(|| Error::NotFound {
            kind: "experiment",
            id: id.to_string(),
        })?;
        f(experiment)?;
        let updated = experiment.clone();
        drop(experiments);
        self.config_generation.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    /// Monotonic counter for cache invalidation on experiment mutations.
    pub fn config_generation(&self) -> u64 {
        self.config_generation.load(Ordering::SeqCst)
    }

    // --- policies ----------------------------------------------------------

    pub fn insert_policy(&self, policy: PolicySpec) -> Result<()> {
        let mut policies = self.policies.write();
        if policies.contains_key(&policy.id) {
            return Err(Error::Configuration(format!(
                "policy {} already exists",
                policy.id
            )));
        }
        policies.insert(policy.id.clone(), policy);
        Ok(())
    }

    pub fn policy(&self, id: &PolicyId) -> Option<PolicySpec> {
        self.policies.read().get(id).cloned()
    }

    /// Policies attached to an experiment, in stable id order.
    pub fn policies_of(&self, experiment_id: &ExperimentId) -> Vec<PolicySpec> {
        self.policies
            .read()
            .values()
            .filter(|p| &p.experiment_id == experiment_id)
            .cloned()
            .collect()
    }

    // --- catalogs ----------------------------------------------------------

    pub fn insert_catalog(&self, catalog: ArmCatalog) -> Result<()> {
        let key = (catalog.experiment_id.clone(), catalog.version);
        let mut catalogs = self.catalogs.write();
        if catalogs.contains_key(&key) {
            return Err(Error::Configuration(format!(
                "catalog v{} for {} already exists",
                catalog.version, catalog.experiment_id
            )));
        }
        catalogs.insert(key, catalog);
        Ok(())
    }

    pub fn catalog(&self, experiment_id: &ExperimentId, version: u64) -> Option<ArmCatalog> {
        self.catalogs
            .read()
            .get(&(experiment_id.clone(), version))
            .cloned()
    }

    // --- assignments -------------------------------------------------------

    pub fn assignment(
        &self,
        user_id: UserId,
        experiment_id: &ExperimentId,
    ) -> Option<AssignmentRow> {
        self.assignments
            .read()
            .get(&(user_id, experiment_id.clone()))
            .cloned()
    }

    /// First-write-wins memoization: if a row already exists for the key, it
    /// is returned unchanged and the candidate row is discarded.
    pub fn record_assignment(&self, row: AssignmentRow) -> AssignmentRow {
        let key = (row.user_id, row.experiment_id.clone());
        let mut assignments = self.assignments.write();
        assignments.entry(key).or_insert(row).clone()
    }

    /// Drop every memoized assignment for an experiment (salt change).
    pub fn clear_assignments(&self, experiment_id: &ExperimentId) -> usize {
        let mut assignments = self.assignments.write();
        let before = assignments.len();
        assignments.retain(|(_, exp), _| exp != experiment_id);
        before - assignments.len()
    }

    pub fn assignment_count(&self, experiment_id: &ExperimentId) -> usize {
        self.assignments
            .read()
            .keys()
            .filter(|(_, exp)| exp == experiment_id)
            .count()
    }

    // --- policy-arm state --------------------------------------------------

    /// Materialize a state row with the given priors if absent. Idempotent.
    pub fn seed_state(&self, key: &StateKey, priors: (f64, f64), now_ms: i64) -> Result<()> {
        if !(priors.0.is_finite() && priors.0 > 0.0 && priors.1.is_finite() && priors.1 > 0.0) {
            return Err(Error::InvalidState(format!(
                "non-positive priors ({}, {}) for {key}",
                priors.0, priors.1
            )));
        }
        let mut states = self.states.write();
        states.entry(key.clone()).or_insert_with(|| {
            let mut row = ArmState::seeded(priors.0, priors.1);
            row.updated_at_ms = now_ms;
            Arc::new(Mutex::new(row))
        });
        Ok(())
    }

    /// Current value of one state row.
    pub fn state_row(&self, key: &StateKey) -> Option<ArmState> {
        let states = self.states.read();
        states.get(key).map(|row| *row.lock())
    }

    /// Bounded-stale per-arm view for one (experiment, policy, context) slice.
    pub fn state_view(
        &self,
        experiment_id: &ExperimentId,
        policy_id: &PolicyId,
        context_key: &str,
        arms: &[String],
    ) -> StateView {
        let states = self.states.read();
        let mut view = StateView::new();
        for arm in arms {
            let key = StateKey::new(
                experiment_id.clone(),
                policy_id.clone(),
                arm.clone(),
                context_key,
            );
            if let Some(row) = states.get(&key) {
                view.insert(arm.clone(), *row.lock());
            }
        }
        view
    }

    /// Apply a serialized mutation to one state row.
    ///
    /// The row mutex is the single-writer lane: two concurrent updates to the
    /// same key are both reflected, in some order, with no lost update. A row
    /// absent at update time is created from `priors` first (contextual keys
    /// materialize lazily).
    pub fn update_state(
        &self,
        key: &StateKey,
        priors: (f64, f64),
        f: impl FnOnce(&mut ArmState) -> Result<()>,
    ) -> Result<ArmState> {
        let row = {
            let states = self.states.read();
            states.get(key).cloned()
        };
        let row = match row {
            Some(row) => row,
            None => {
                self.seed_state(key, priors, 0)?;
                let states = self.states.read();
                states
                    .get(key)
                    .cloned()
                    .ok_or_else(|| Error::Transient(format!("state row {key} vanished")))?
            }
        };
        let mut guard = row.lock();
        f(&mut guard)?;
        Ok(*guard)
    }

    /// Every state row of an experiment, in key order.
    pub fn states_of(&self, experiment_id: &ExperimentId) -> Vec<(StateKey, ArmState)> {
        self.states
            .read()
            .iter()
            .filter(|(key, _)| &key.experiment_id == experiment_id)
            .map(|(key, row)| (key.clone(), *row.lock()))
            .collect()
    }

    // --- serve events ------------------------------------------------------

    /// Append a serve event. Exactly-once per `event_id`: a retry with an
    /// already-appended id is a no-op returning `false`.
    pub fn append_event(&self, event: ServeEvent) -> Result<bool> {
        let mut events = self.events.write();
        if events.contains_key(&event.event_id) {
            return Ok(false);
        }
        self.events_by_experiment.write().insert(
            (
                event.experiment_id.clone(),
                event.served_at_ms,
                event.event_id.clone(),
            ),
            (),
        );
        self.events_by_user.write().insert(
            (event.user_id, event.served_at_ms, event.event_id.clone()),
            (),
        );
        events.insert(event.event_id.clone(), event);
        Ok(true)
    }

    pub fn event(&self, event_id: &EventId) -> Option<ServeEvent> {
        self.events.read().get(event_id).cloned()
    }

    /// Write the reward for an event, once.
    ///
    /// CAS on `attribution_version`: the transition 0 → 1 carries the value;
    /// any later call observes version 1 and returns `Ok(false)` without
    /// touching the row.
    pub fn finalize_reward(&self, event_id: &EventId, reward: f64, now_ms: i64) -> Result<bool> {
        let mut events = self.events.write();
        let event = events.get_mut(event_id).ok_or_else(|| Error::NotFound {
            kind: "serve event",
            id: event_id.to_string(),
        })?;
        if event.attribution_version != 0 {
            return Ok(false);
        }
        event.reward = Some(reward);
        event.reward_at_ms = Some(now_ms);
        event.attribution_version = 1;
        Ok(true)
    }

    /// Events of an experiment served in `[from_ms, to_ms)`, ordered by
    /// serve time.
    pub fn events_in_window(
        &self,
        experiment_id: &ExperimentId,
        from_ms: i64,
        to_ms: i64,
    ) -> Vec<ServeEvent> {
        let index = self.events_by_experiment.read();
        let events = self.events.read();
        index
            .range(
                (experiment_id.clone(), from_ms, EventId::new(""))
                    ..(experiment_id.clone(), to_ms, EventId::new("")),
            )
            .filter_map(|((_, _, event_id), _)| events.get(event_id).cloned())
            .collect()
    }

    /// Events served to a user in `[from_ms, to_ms)`, ordered by serve time.
    pub fn events_of_user(&self, user_id: UserId, from_ms: i64, to_ms: i64) -> Vec<ServeEvent> {
        let index = self.events_by_user.read();
        let events = self.events.read();
        index
            .range((user_id, from_ms, EventId::new(""))..(user_id, to_ms, EventId::new("")))
            .filter_map(|((_, _, event_id), _)| events.get(event_id).cloned())
            .collect()
    }

    /// Open (unattributed) events of an experiment served before `before_ms`.
    pub fn events_pending_attribution(
        &self,
        experiment_id: &ExperimentId,
        before_ms: i64,
    ) -> Vec<ServeEvent> {
        self.events_in_window(experiment_id, i64::MIN, before_ms)
            .into_iter()
            .filter(|e| e.attribution_version == 0 && !e.dropped)
            .collect()
    }

    pub fn event_count(&self, experiment_id: &ExperimentId) -> usize {
        self.events_by_experiment
            .read()
            .range(
                (experiment_id.clone(), i64::MIN, EventId::new(""))
                    ..(experiment_id.clone(), i64::MAX, EventId::new("")),
            )
            .count()
    }

    // --- reward signals ----------------------------------------------------

    /// Record one downstream signal. Idempotent on (user, arm, at, kind):
    /// the first recorded value wins and repeats return `false`.
    pub fn record_signal(&self, row: RewardEventRow) -> bool {
        let key = (row.user_id, row.arm_id.clone(), row.at_ms, row.kind);
        let mut signals = self.signals.write();
        if signals.contains_key(&key) {
            return false;
        }
        signals.insert(key, row);
        true
    }

    /// Signals on (user, arm) within `[from_ms, to_ms]`, ordered by time.
    pub fn signals_for(
        &self,
        user_id: UserId,
        arm_id: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Vec<RewardEventRow> {
        let signals = self.signals.read();
        signals
            .range(
                (user_id, arm_id.to_string(), from_ms, RewardKind::MIN)
                    ..=(user_id, arm_id.to_string(), to_ms, RewardKind::MAX),
            )
            .map(|(_, row)| row.clone())
            .collect()
    }

    // --- guardrail checks / decisions (append-only) ------------------------

    pub fn append_guardrail_check(&self, row: GuardrailCheckRow) {
        self.guardrail_checks.write().push(row);
    }

    pub fn guardrail_checks_of(&self, experiment_id: &ExperimentId) -> Vec<GuardrailCheckRow> {
        self.guardrail_checks
            .read()
            .iter()
            .filter(|c| &c.experiment_id == experiment_id)
            .cloned()
            .collect()
    }

    pub fn append_decision(&self, row: DecisionRow) {
        self.decisions.write().push(row);
    }

    pub fn decisions_of(&self, experiment_id: &ExperimentId) -> Vec<DecisionRow> {
        self.decisions
            .read()
            .iter()
            .filter(|d| &d.experiment_id == experiment_id)
            .cloned()
            .collect()
    }

    // --- reward_updates queue ----------------------------------------------

    pub fn enqueue_reward_update(&self, update: RewardUpdate) {
        self.reward_updates.lock().push_back(update);
    }

    pub fn dequeue_reward_update(&self) -> Option<RewardUpdate> {
        self.reward_updates.lock().pop_front()
    }

    /// Put a failed delivery back at the end of the queue.
    pub fn requeue_reward_update(&self, update: RewardUpdate) {
        self.reward_updates.lock().push_back(update);
    }

    pub fn reward_queue_len(&self) -> usize {
        self.reward_updates.lock().len()
    }
}
