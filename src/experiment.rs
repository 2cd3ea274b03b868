//! Experiment lifecycle and admin surface.
//!
//! Experiments own the traffic plan, the salt, the pinned catalog version,
//! and the guardrail/decision configuration. The status machine is:
//!
//! ```text
//! draft ──start──▶ active ──pause──▶ paused ──resume──▶ active
//!                          │                              │
//!                          └─end─▶ ended        kill──────▶ killed
//! ```
//!
//! Transitions are admin-initiated except `kill`, which the guardrail monitor
//! may trigger. All transitions are atomic (a single write under the store's
//! experiment lock); partial states are never observable. Starting an
//! experiment seeds prior state rows for every (policy, arm); killing one
//! records a final decision and immediately routes new serves to the default
//! policy.

use std::sync::Arc;

use tracing::info;

use crate::{
    ArmCatalog, Clock, DecisionConfig, Error, ExperimentId, GuardrailConfig, PolicyId, PolicySpec,
    Result, RewardMapping, StateKey, Store, TrafficPlan, Verdict,
};

/// Lifecycle status of an experiment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Active,
    Paused,
    Ended,
    Killed,
}

impl ExperimentStatus {
    /// Terminal states admit no further transitions or serves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentStatus::Ended | ExperimentStatus::Killed)
    }

    fn allows(&self, to: ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        matches!(
            (self, to),
            (Draft, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Active, Ended)
                | (Paused, Ended)
                | (Active, Killed)
                | (Paused, Killed)
        )
    }
}

/// Mutable configuration surface of an experiment.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExperimentConfig {
    /// Share of global traffic admitted into the experiment, in `[0,1]`.
    pub traffic_fraction: f64,
    /// Ordered policy → share plan (shares sum to 1).
    pub plan: TrafficPlan,
    /// Assignment salt. Changing it reshuffles every user.
    pub salt: String,
    /// Reward attribution window after `served_at` (epoch ms delta).
    pub attribution_window_ms: i64,
    /// How downstream signals compose into a reward.
    pub reward_mapping: RewardMapping,
    pub guardrails: GuardrailConfig,
    pub decision: DecisionConfig,
    /// Which host surface this experiment governs (e.g. "home_feed").
    pub surface: String,
    /// Serve-time precedence among experiments on the same surface.
    pub priority: i32,
}

impl ExperimentConfig {
    pub fn new(salt: impl Into<String>, traffic_fraction: f64, plan: TrafficPlan) -> Self {
        Self {
            traffic_fraction,
            plan,
            salt: salt.into(),
            attribution_window_ms: 24 * 60 * 60 * 1000,
            reward_mapping: RewardMapping::Composite,
            guardrails: GuardrailConfig::default(),
            decision: DecisionConfig::default(),
            surface: "default".to_string(),
            priority: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.salt.is_empty() {
            return Err(Error::Configuration("salt must be non-empty".to_string()));
        }
        if !(self.traffic_fraction.is_finite() && (0.0..=1.0).contains(&self.traffic_fraction)) {
            return Err(Error::Configuration(format!(
                "traffic_fraction must be in [0,1], got {}",
                self.traffic_fraction
            )));
        }
        if self.attribution_window_ms <= 0 {
            return Err(Error::Configuration(
                "attribution_window_ms must be positive".to_string(),
            ));
        }
        self.plan.validate()?;
        self.guardrails.validate()?;
        self.decision.validate()
    }
}

/// One experiment.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub name: String,
    pub status: ExperimentStatus,
    /// Set when the experiment first becomes active.
    pub start_at_ms: Option<i64>,
    /// Set when the experiment reaches a terminal state.
    pub end_at_ms: Option<i64>,
    pub config: ExperimentConfig,
    /// Policy served to users outside the experiment (and after a kill).
    pub default_policy_id: PolicyId,
    /// Pinned arm-catalog version.
    pub catalog_version: u64,
    pub notes: String,
    pub created_at_ms: i64,
}

impl Experiment {
    pub fn is_active(&self) -> bool {
        self.status == ExperimentStatus::Active
    }
}

/// Health report from [`ExperimentManager::validate`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub assignment_count: usize,
    pub status: ExperimentStatus,
}

/// Admin service owning the experiment state machine.
pub struct ExperimentManager {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl ExperimentManager {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create a draft experiment with its policies and pinned catalog.
    ///
    /// Validates the whole bundle up front: config invariants, policy
    /// parameters, plan/policy consistency, and catalog uniqueness.
    pub fn create(
        &self,
        id: impl Into<ExperimentId>,
        name: impl Into<String>,
        config: ExperimentConfig,
        policies: Vec<PolicySpec>,
        default_policy_id: impl Into<PolicyId>,
        catalog: ArmCatalog,
    ) -> Result<Experiment> {
        let id = id.into();
        let default_policy_id = default_policy_id.into();
        config.validate()?;
        catalog.validate()?;
        if catalog.experiment_id != id {
            return Err(Error::Configuration(format!(
                "catalog belongs to {}, not {}",
                catalog.experiment_id, id
            )));
        }
        if policies.is_empty() {
            return Err(Error::Configuration(
                "experiment needs at least one policy".to_string(),
            ));
        }
        for policy in &policies {
            policy.params.validate()?;
            if policy.experiment_id != id {
                return Err(Error::Configuration(format!(
                    "policy {} belongs to {}, not {}",
                    policy.id, policy.experiment_id, id
                )));
            }
        }
        let known = |pid: &PolicyId| policies.iter().any(|p| &p.id == pid);
        for pid in config.plan.policies() {
            if !known(pid) {
                return Err(Error::Configuration(format!(
                    "traffic plan references unknown policy {pid}"
                )));
            }
        }
        if !known(&default_policy_id) {
            return Err(Error::Configuration(format!(
                "default policy {default_policy_id} is not attached to the experiment"
            )));
        }

        let experiment = Experiment {
            id: id.clone(),
            name: name.into(),
            status: ExperimentStatus::Draft,
            start_at_ms: None,
            end_at_ms: None,
            catalog_version: catalog.version,
            config,
            default_policy_id,
            notes: String::new(),
            created_at_ms: self.clock.now_ms(),
        };
        self.store.insert_experiment(experiment.clone())?;
        for policy in policies {
            self.store.insert_policy(policy)?;
        }
        self.store.insert_catalog(catalog)?;
        info!(experiment = %id, "created experiment");
        Ok(experiment)
    }

    fn transition(
        &self,
        id: &ExperimentId,
        to: ExperimentStatus,
        on_apply: impl FnOnce(&mut Experiment, i64),
    ) -> Result<Experiment> {
        let now = self.clock.now_ms();
        let updated = self.store.update_experiment(id, |exp| {
            if !exp.status.allows(to) {
                return Err(Error::InvalidTransition {
                    from: exp.status,
                    to,
                });
            }
            exp.status = to;
            on_apply(exp, now);
            Ok(())
        })?;
        info!(experiment = %id, status = ?to, "experiment transition");
        Ok(updated)
    }

    /// Draft → Active. Seeds prior state rows for every (policy, arm).
    pub fn start(&self, id: &ExperimentId) -> Result<Experiment> {
        let experiment = self.transition(id, ExperimentStatus::Active, |exp, now| {
            exp.start_at_ms.get_or_insert(now);
        })?;
        let catalog = self
            .store
            .catalog(id, experiment.catalog_version)
            .ok_or_else(|| Error::UnavailableArmCatalog(id.to_string()))?;
        let now = self.clock.now_ms();
        for policy in self.store.policies_of(id) {
            let priors = policy.params.priors();
            for arm in catalog.arm_ids() {
                self.store.seed_state(
                    &StateKey::new(id.clone(), policy.id.clone(), arm, ""),
                    priors,
                    now,
                )?;
            }
        }
        Ok(experiment)
    }

    /// Active → Paused.
    pub fn pause(&self, id: &ExperimentId) -> Result<Experiment> {
        self.transition(id, ExperimentStatus::Paused, |_, _| {})
    }

    /// Paused → Active.
    pub fn resume(&self, id: &ExperimentId) -> Result<Experiment> {
        self.transition(id, ExperimentStatus::Active, |_, _| {})
    }

    /// Active/Paused → Ended (graceful stop).
    pub fn end(&self, id: &ExperimentId) -> Result<Experiment> {
        self.transition(id, ExperimentStatus::Ended, |exp, now| {
            exp.end_at_ms = Some(now);
        })
    }

    /// Active/Paused → Killed. Records a final kill decision; new serves
    /// bypass the experiment immediately.
    pub fn kill(&self, id: &ExperimentId, reason: &str) -> Result<Experiment> {
        let experiment = self.transition(id, ExperimentStatus::Killed, |exp, now| {
            exp.end_at_ms = Some(now);
        })?;
        self.store.append_decision(crate::DecisionRow {
            experiment_id: id.clone(),
            evaluated_at_ms: self.clock.now_ms(),
            verdict: Verdict::Kill,
            winner_policy_id: None,
            uplift: 0.0,
            confidence: 1.0,
            estimators: Default::default(),
            notes: format!("killed: {reason}"),
        });
        info!(experiment = %id, reason, "experiment killed");
        Ok(experiment)
    }

    /// Update traffic settings. While active, `traffic_fraction` may only
    /// grow (ramp); plans are re-validated against the attached policies.
    pub fn set_traffic(
        &self,
        id: &ExperimentId,
        traffic_fraction: Option<f64>,
        plan: Option<TrafficPlan>,
    ) -> Result<Experiment> {
        let policies: Vec<PolicyId> = self
            .store
            .policies_of(id)
            .into_iter()
            .map(|p| p.id)
            .collect();
        self.store.update_experiment(id, |exp| {
            if let Some(fraction) = traffic_fraction {
                if !(fraction.is_finite() && (0.0..=1.0).contains(&fraction)) {
                    return Err(Error::Configuration(format!(
                        "traffic_fraction must be in [0,1], got {fraction}"
                    )));
                }
                if exp.status == ExperimentStatus::Active && fraction < exp.config.traffic_fraction
                {
                    return Err(Error::Configuration(format!(
                        "traffic_fraction may only grow while active ({} -> {fraction})",
                        exp.config.traffic_fraction
                    )));
                }
                exp.config.traffic_fraction = fraction;
            }
            if let Some(plan) = plan {
                plan.validate()?;
                for pid in plan.policies() {
                    if !policies.contains(pid) {
                        return Err(Error::Configuration(format!(
                            "traffic plan references unknown policy {pid}"
                        )));
                    }
                }
                exp.config.plan = plan;
            }
            Ok(())
        })
    }

    /// Change the assignment salt. Clears every memoized assignment: the
    /// hash function is the source of truth and it just changed.
    pub fn set_salt(&self, id: &ExperimentId, salt: impl Into<String>) -> Result<Experiment> {
        let salt = salt.into();
        if salt.is_empty() {
            return Err(Error::Configuration("salt must be non-empty".to_string()));
        }
        let updated = self.store.update_experiment(id, |exp| {
            exp.config.salt = salt.clone();
            Ok(())
        })?;
        let cleared = self.store.clear_assignments(id);
        info!(experiment = %id, cleared, "salt changed; assignments reset");
        Ok(updated)
    }

    pub fn set_guardrails(&self, id: &ExperimentId, cfg: GuardrailConfig) -> Result<Experiment> {
        cfg.validate()?;
        self.store.update_experiment(id, |exp| {
            exp.config.guardrails = cfg.clone();
            Ok(())
        })
    }

    pub fn set_decision(&self, id: &ExperimentId, cfg: DecisionConfig) -> Result<Experiment> {
        cfg.validate()?;
        self.store.update_experiment(id, |exp| {
            exp.config.decision = cfg.clone();
            Ok(())
        })
    }

    /// Read-only configuration health check.
    pub fn validate(&self, id: &ExperimentId) -> Result<ValidationReport> {
        let experiment = self
            .store
            .experiment(id)
            .ok_or_else(|| Error::NotFound {
                kind: "experiment",
                id: id.to_string(),
            })?;
        let mut issues = Vec::new();
        let mut warnings = Vec::new();

        if let Err(e) = experiment.config.validate() {
            issues.push(e.to_string());
        }
        if let (Some(start), Some(end)) = (experiment.start_at_ms, experiment.end_at_ms) {
            if end < start {
                issues.push("end instant precedes start instant".to_string());
            }
        }
        if experiment.config.traffic_fraction == 0.0 {
            warnings.push("traffic_fraction is 0; nobody enters the experiment".to_string());
        }
        if self
            .store
            .catalog(id, experiment.catalog_version)
            .is_none()
        {
            issues.push(format!(
                "pinned catalog v{} is missing",
                experiment.catalog_version
            ));
        }
        let assignment_count = self.store.assignment_count(id);
        if experiment.is_active() && assignment_count == 0 {
            warnings.push("active experiment has no assignments yet".to_string());
        }

        Ok(ValidationReport {
            valid: issues.is_empty(),
            issues,
            warnings,
            assignment_count,
            status: experiment.status,
        })
    }
}
