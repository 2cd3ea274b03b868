//! Guardrail monitor: periodic safety checks with auto-rollback.
//!
//! Five checks run over a trailing window of serve events:
//!
//! | name              | fails when                                   | action            |
//! |-------------------|----------------------------------------------|-------------------|
//! | error_rate        | erroring serves / total > threshold          | alert + rollback  |
//! | latency_p95       | p95 latency above threshold                  | alert + rollback  |
//! | arm_concentration | one arm takes more than the threshold share  | alert, rollback after 2 consecutive windows |
//! | reward_drop       | treatment mean below control by threshold    | rollback          |
//! | sample_ratio      | observed split vs plan (χ² p below threshold)| alert             |
//!
//! Rollback kills the experiment: new users stop being assigned and existing
//! assignments revert to the default policy on their next serve. Rollbacks
//! are rate-limited to one per experiment per cooldown unless a critical
//! check (error rate, latency) failed. Every evaluation appends its check
//! rows, pass or fail, so the audit trail shows what was looked at.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::{
    chi_square_p, percentile, Clock, Error, ExperimentId, ExperimentManager, PolicyId, PolicyKind,
    Result, ServeEvent, Store,
};

/// Guardrail thresholds and cadence.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GuardrailConfig {
    /// How often the host scheduler should call `evaluate`.
    pub eval_every_ms: i64,
    /// Trailing window the checks aggregate over.
    pub window_ms: i64,
    pub max_error_rate: f64,
    pub max_latency_p95_ms: f64,
    pub max_arm_concentration: f64,
    /// Relative drop of treatment mean reward vs control that triggers
    /// rollback (0.05 = −5%).
    pub max_reward_drop: f64,
    /// χ² p-value below which the observed split is flagged.
    pub sample_ratio_p: f64,
    /// Minimum rollback spacing for non-critical checks.
    pub rollback_cooldown_ms: i64,
    /// Serves required in the window before the distributional checks
    /// (concentration, sample ratio) are meaningful.
    pub min_serves: u64,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            eval_every_ms: 5 * 60 * 1000,
            window_ms: 60 * 60 * 1000,
            max_error_rate: 0.01,
            max_latency_p95_ms: 120.0,
            max_arm_concentration: 0.50,
            max_reward_drop: 0.05,
            sample_ratio_p: 0.001,
            rollback_cooldown_ms: 60 * 60 * 1000,
            min_serves: 50,
        }
    }
}

impl GuardrailConfig {
    pub fn validate(&self) -> Result<()> {
        if self.eval_every_ms <= 0 || self.window_ms <= 0 || self.rollback_cooldown_ms < 0 {
            return Err(Error::Configuration(
                "guardrail cadence values must be positive".to_string(),
            ));
        }
        for (name, v, lo, hi) in [
            ("max_error_rate", self.max_error_rate, 0.0, 1.0),
            ("max_arm_concentration", self.max_arm_concentration, 0.0, 1.0),
            ("max_reward_drop", self.max_reward_drop, 0.0, 10.0),
            ("sample_ratio_p", self.sample_ratio_p, 0.0, 1.0),
        ] {
            if !(v.is_finite() && v > lo && v <= hi) {
                return Err(Error::Configuration(format!(
                    "guardrail threshold {name}={v} outside ({lo}, {hi}]"
                )));
            }
        }
        if !(self.max_latency_p95_ms.is_finite() && self.max_latency_p95_ms > 0.0) {
            return Err(Error::Configuration(
                "max_latency_p95_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of one check.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

/// What a check asked the runtime to do.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CheckAction {
    None,
    Alert,
    Rollback,
}

/// Append-only audit row for one check evaluation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GuardrailCheckRow {
    pub experiment_id: ExperimentId,
    pub at_ms: i64,
    pub name: String,
    pub value: f64,
    pub threshold: f64,
    pub status: CheckStatus,
    pub action: CheckAction,
}

/// Result of one `evaluate` call.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardrailReport {
    pub checks: Vec<GuardrailCheckRow>,
    pub rolled_back: bool,
}

/// The periodic safety monitor.
#[derive(Debug, Clone, Copy, Default)]
struct ConcentrationState {
    streak: u32,
    last_breach_at_ms: i64,
}

pub struct GuardrailMonitor {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    manager: ExperimentManager,
    /// Consecutive breaching windows per experiment for arm concentration.
    /// Re-evaluations inside one cadence interval do not advance the streak,
    /// so re-running over an identical window yields the same verdict.
    concentration: Mutex<BTreeMap<ExperimentId, ConcentrationState>>,
    last_rollback_ms: Mutex<BTreeMap<ExperimentId, i64>>,
}

impl GuardrailMonitor {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        let manager = ExperimentManager::new(Arc::clone(&store), Arc::clone(&clock));
        Self {
            store,
            clock,
            manager,
            concentration: Mutex::new(BTreeMap::new()),
            last_rollback_ms: Mutex::new(BTreeMap::new()),
        }
    }

    /// Run every check for one experiment and apply the rollback policy.
    ///
    /// Deterministic in the window contents: re-evaluating over identical
    /// events yields identical rows.
    pub fn evaluate(&self, experiment_id: &ExperimentId) -> Result<GuardrailReport> {
        let experiment = self
            .store
            .experiment(experiment_id)
            .ok_or_else(|| Error::NotFound {
                kind: "experiment",
                id: experiment_id.to_string(),
            })?;
        if !experiment.is_active() {
            return Ok(GuardrailReport {
                checks: Vec::new(),
                rolled_back: false,
            });
        }
        let cfg = experiment.config.guardrails.clone();
        let now = self.clock.now_ms();
        let events = self
            .store
            .events_in_window(experiment_id, now - cfg.window_ms, now + 1);

        let mut checks = Vec::new();
        checks.push(self.check_error_rate(experiment_id, &cfg, &events, now));
        checks.push(self.check_latency_p95(experiment_id, &cfg, &events, now));
        checks.push(self.check_arm_concentration(experiment_id, &cfg, &events, now));
        checks.push(self.check_reward_drop(experiment_id, &cfg, &events, now));
        checks.push(self.check_sample_ratio(
            experiment_id,
            &cfg,
            &experiment.config.plan.entries().to_vec(),
            &events,
            now,
        ));

        for check in &checks {
            self.store.append_guardrail_check(check.clone());
        }

        let critical_fail = checks.iter().any(|c| {
            c.status == CheckStatus::Fail
                && matches!(c.name.as_str(), "error_rate" | "latency_p95")
        });
        let wants_rollback = checks
            .iter()
            .any(|c| c.status == CheckStatus::Fail && c.action == CheckAction::Rollback);

        let mut rolled_back = false;
        if wants_rollback {
            let allowed = critical_fail || {
                let last = self.last_rollback_ms.lock();
                last.get(experiment_id)
                    .map(|&at| now - at >= cfg.rollback_cooldown_ms)
                    .unwrap_or(true)
            };
            if allowed {
                let reasons: Vec<&str> = checks
                    .iter()
                    .filter(|c| c.status == CheckStatus::Fail)
                    .map(|c| c.name.as_str())
                    .collect();
                warn!(experiment = %experiment_id, ?reasons, "guardrail rollback");
                self.manager
                    .kill(experiment_id, &format!("guardrail: {}", reasons.join(", ")))?;
                self.last_rollback_ms
                    .lock()
                    .insert(experiment_id.clone(), now);
                rolled_back = true;
            }
        }

        Ok(GuardrailReport {
            checks,
            rolled_back,
        })
    }

    fn row(
        &self,
        experiment_id: &ExperimentId,
        at_ms: i64,
        name: &str,
        value: f64,
        threshold: f64,
        status: CheckStatus,
        action: CheckAction,
    ) -> GuardrailCheckRow {
        GuardrailCheckRow {
            experiment_id: experiment_id.clone(),
            at_ms,
            name: name.to_string(),
            value,
            threshold,
            status,
            action,
        }
    }

    fn check_error_rate(
        &self,
        id: &ExperimentId,
        cfg: &GuardrailConfig,
        events: &[ServeEvent],
        now: i64,
    ) -> GuardrailCheckRow {
        let total = events.len();
        let rate = if total == 0 {
            0.0
        } else {
            events.iter().filter(|e| e.error || e.dropped).count() as f64 / total as f64
        };
        let (status, action) = if total > 0 && rate > cfg.max_error_rate {
            (CheckStatus::Fail, CheckAction::Rollback)
        } else {
            (CheckStatus::Pass, CheckAction::None)
        };
        self.row(id, now, "error_rate", rate, cfg.max_error_rate, status, action)
    }

    fn check_latency_p95(
        &self,
        id: &ExperimentId,
        cfg: &GuardrailConfig,
        events: &[ServeEvent],
        now: i64,
    ) -> GuardrailCheckRow {
        let latencies: Vec<f64> = events.iter().map(|e| e.latency_ms as f64).collect();
        let p95 = percentile(&latencies, 0.95);
        let (status, action) = if !latencies.is_empty() && p95 > cfg.max_latency_p95_ms {
            (CheckStatus::Fail, CheckAction::Rollback)
        } else {
            (CheckStatus::Pass, CheckAction::None)
        };
        self.row(
            id,
            now,
            "latency_p95",
            p95,
            cfg.max_latency_p95_ms,
            status,
            action,
        )
    }

    fn check_arm_concentration(
        &self,
        id: &ExperimentId,
        cfg: &GuardrailConfig,
        events: &[ServeEvent],
        now: i64,
    ) -> GuardrailCheckRow {
        let total = events.len() as f64;
        let mut per_arm: BTreeMap<&str, u64> = BTreeMap::new();
        for e in events {
            *per_arm.entry(e.arm_id.as_str()).or_insert(0) += 1;
        }
        let top_share = per_arm
            .values()
            .map(|&c| c as f64 / total.max(1.0))
            .fold(0.0, f64::max);

        let mut states = self.concentration.lock();
        let breaching =
            events.len() as u64 >= cfg.min_serves && top_share > cfg.max_arm_concentration;
        let streak = if breaching {
            let s = states.entry(id.clone()).or_default();
            // Only a breach observed a full cadence interval after the last
            // one advances the streak; same-window re-runs are idempotent.
            if s.streak == 0 || now - s.last_breach_at_ms >= cfg.eval_every_ms {
                s.streak += 1;
                s.last_breach_at_ms = now;
            }
            s.streak
        } else {
            states.remove(id);
            0
        };

        // A single breaching window alerts; persistence across two rolls back.
        let (status, action) = if streak >= 2 {
            (CheckStatus::Fail, CheckAction::Rollback)
        } else if streak == 1 {
            (CheckStatus::Warn, CheckAction::Alert)
        } else {
            (CheckStatus::Pass, CheckAction::None)
        };
        self.row(
            id,
            now,
            "arm_concentration",
            top_share,
            cfg.max_arm_concentration,
            status,
            action,
        )
    }

    fn check_reward_drop(
        &self,
        id: &ExperimentId,
        cfg: &GuardrailConfig,
        events: &[ServeEvent],
        now: i64,
    ) -> GuardrailCheckRow {
        let control_ids: Vec<PolicyId> = self
            .store
            .policies_of(id)
            .into_iter()
            .filter(|p| p.kind() == PolicyKind::Control)
            .map(|p| p.id)
            .collect();

        let mut treat = (0u64, 0.0f64);
        let mut control = (0u64, 0.0f64);
        for e in events {
            let Some(r) = e.reward else { continue };
            if control_ids.contains(&e.policy_id) {
                control = (control.0 + 1, control.1 + r);
            } else {
                treat = (treat.0 + 1, treat.1 + r);
            }
        }

        // The comparison needs both sides populated and a meaningful baseline.
        let min_rewarded = 10;
        if treat.0 < min_rewarded || control.0 < min_rewarded {
            return self.row(
                id,
                now,
                "reward_drop",
                0.0,
                -cfg.max_reward_drop,
                CheckStatus::Pass,
                CheckAction::None,
            );
        }
        let treat_mean = treat.1 / treat.0 as f64;
        let control_mean = control.1 / control.0 as f64;
        let rel = if control_mean.abs() < 1e-12 {
            0.0
        } else {
            (treat_mean - control_mean) / control_mean.abs()
        };
        let (status, action) = if rel < -cfg.max_reward_drop {
            (CheckStatus::Fail, CheckAction::Rollback)
        } else {
            (CheckStatus::Pass, CheckAction::None)
        };
        self.row(
            id,
            now,
            "reward_drop",
            rel,
            -cfg.max_reward_drop,
            status,
            action,
        )
    }

    fn check_sample_ratio(
        &self,
        id: &ExperimentId,
        cfg: &GuardrailConfig,
        plan: &[(PolicyId, f64)],
        events: &[ServeEvent],
        now: i64,
    ) -> GuardrailCheckRow {
        // Only in-plan serves participate (default-policy traffic from
        // out-of-experiment users is expected to be off-plan).
        let positive: Vec<&(PolicyId, f64)> = plan.iter().filter(|(_, s)| *s > 0.0).collect();
        let mut observed = vec![0.0f64; positive.len()];
        let mut total = 0.0f64;
        for e in events {
            if let Some(i) = positive.iter().position(|(p, _)| p == &e.policy_id) {
                observed[i] += 1.0;
                total += 1.0;
            }
        }

        let p_value = if (total as u64) < cfg.min_serves || positive.len() < 2 {
            1.0
        } else {
            let expected: Vec<f64> = positive.iter().map(|(_, s)| s * total).collect();
            chi_square_p(&observed, &expected).unwrap_or(1.0)
        };
        let (status, action) = if p_value < cfg.sample_ratio_p {
            (CheckStatus::Warn, CheckAction::Alert)
        } else {
            (CheckStatus::Pass, CheckAction::None)
        };
        self.row(
            id,
            now,
            "sample_ratio",
            p_value,
            cfg.sample_ratio_p,
            status,
            action,
        )
    }
}
