//! Ship / iterate / kill decisions from off-policy estimates.
//!
//! Per candidate policy the engine computes, against the experiment's control:
//!
//! - **IPS**: `V̂(π) = (1/N) Σ r_i · π(a_i|x_i) / p_i` over the finalized
//!   events of the window, with logged propensities clipped at `p_min` to
//!   bound variance.
//! - **DR**: `V̂_DR(π) = V̂_IPS(π) − (1/N) Σ (π(a_i|x_i)/p_i − 1) · q̂(a_i)`,
//!   with `q̂` the per-arm mean reward over the same window.
//! - **SNIPS**: the self-normalized variant `Σ r·w / Σ w`, which stays
//!   usable when part of the log comes from deterministic policies whose
//!   support the candidate has left. The verdict's uplift is computed on it;
//!   all three estimates are recorded.
//! - A seeded bootstrap percentile interval on the uplift vs control, and a
//!   one-sided Welch t-test on observed rewards.
//!
//! `π(a|x)` comes from the same `action_probabilities` code path that the
//! serve pipeline and the replayer use, evaluated at the policy's current
//! state. Verdicts are advisory unless `auto_apply` is set, in which case a
//! kill is applied immediately and a ship gracefully ends the experiment.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::{
    action_probabilities, bootstrap_ci, stable_hash64, welch_one_sided_p, Clock, Error,
    ExperimentId, ExperimentManager, PolicyId, PolicyKind, Result, ServeEvent, Store, Welford,
};

/// Decision criteria and cadence.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DecisionConfig {
    /// How often the host scheduler should call `evaluate`.
    pub eval_every_ms: i64,
    /// Minimum relative uplift vs control to ship (0.03 = +3%).
    pub min_uplift: f64,
    /// One-sided confidence required to ship (and to kill).
    pub confidence: f64,
    /// Experiment must have run at least this long to ship.
    pub min_window_ms: i64,
    /// Past this duration an inconclusive experiment is told to iterate.
    pub max_window_ms: i64,
    /// Finalized events each compared policy needs.
    pub min_events_per_policy: u64,
    /// Propensity clip floor for the IPS weights.
    pub p_min: f64,
    /// Relative drop whose confident lower bound triggers a kill verdict.
    pub kill_drop: f64,
    /// Bootstrap replicates for the uplift interval.
    pub bootstrap_resamples: usize,
    /// Apply kill/ship verdicts to the experiment instead of only recording.
    pub auto_apply: bool,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            eval_every_ms: 24 * 60 * 60 * 1000,
            min_uplift: 0.03,
            confidence: 0.95,
            min_window_ms: 7 * 24 * 60 * 60 * 1000,
            max_window_ms: 14 * 24 * 60 * 60 * 1000,
            min_events_per_policy: 1000,
            p_min: 0.01,
            kill_drop: 0.05,
            bootstrap_resamples: 1000,
            auto_apply: false,
        }
    }
}

impl DecisionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.eval_every_ms <= 0 || self.min_window_ms <= 0 || self.max_window_ms <= 0 {
            return Err(Error::Configuration(
                "decision cadence values must be positive".to_string(),
            ));
        }
        if self.min_window_ms > self.max_window_ms {
            return Err(Error::Configuration(
                "min_window_ms exceeds max_window_ms".to_string(),
            ));
        }
        if !(self.confidence > 0.0 && self.confidence < 1.0) {
            return Err(Error::Configuration(format!(
                "confidence must be in (0,1), got {}",
                self.confidence
            )));
        }
        if !(self.p_min > 0.0 && self.p_min <= 1.0) {
            return Err(Error::Configuration(format!(
                "p_min must be in (0,1], got {}",
                self.p_min
            )));
        }
        if self.min_uplift < 0.0 || self.kill_drop <= 0.0 || self.bootstrap_resamples == 0 {
            return Err(Error::Configuration(
                "invalid decision thresholds".to_string(),
            ));
        }
        Ok(())
    }
}

/// Terminal advice for an experiment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Ship,
    Iterate,
    Kill,
    Continue,
}

/// Append-only decision record.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DecisionRow {
    pub experiment_id: ExperimentId,
    pub evaluated_at_ms: i64,
    pub verdict: Verdict,
    pub winner_policy_id: Option<PolicyId>,
    /// Relative uplift of the winner vs control.
    pub uplift: f64,
    /// One-sided confidence that the winner beats control.
    pub confidence: f64,
    /// Named estimator values (`ips:<policy>`, `dr:<policy>`, bounds, ...).
    pub estimators: BTreeMap<String, f64>,
    pub notes: String,
}

/// The periodic decision service.
pub struct DecisionEngine {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    manager: ExperimentManager,
}

impl DecisionEngine {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        let manager = ExperimentManager::new(Arc::clone(&store), Arc::clone(&clock));
        Self {
            store,
            clock,
            manager,
        }
    }

    /// Evaluate one experiment and append the decision row.
    ///
    /// `seed` drives the bootstrap and the Monte-Carlo `π(a|x)` weights, so
    /// re-evaluating over an identical window reproduces the same verdict
    /// bit for bit.
    pub fn evaluate(&self, experiment_id: &ExperimentId, seed: u64) -> Result<DecisionRow> {
        let experiment = self
            .store
            .experiment(experiment_id)
            .ok_or_else(|| Error::NotFound {
                kind: "experiment",
                id: experiment_id.to_string(),
            })?;
        let cfg = experiment.config.decision.clone();
        let now = self.clock.now_ms();
        let start = experiment.start_at_ms.unwrap_or(now);
        let duration_ms = (now - start).max(0);

        let catalog = self
            .store
            .catalog(experiment_id, experiment.catalog_version)
            .ok_or_else(|| Error::UnavailableArmCatalog(experiment_id.to_string()))?;
        let arms = catalog.arm_ids();

        let events: Vec<ServeEvent> = self
            .store
            .events_in_window(experiment_id, start, now + 1)
            .into_iter()
            .filter(|e| e.reward.is_some())
            .collect();

        let policies = self.store.policies_of(experiment_id);
        let control = policies.iter().find(|p| p.kind() == PolicyKind::Control);

        // q̂: per-arm mean reward over the window (the DR reward model).
        let mut q_hat: BTreeMap<String, Welford> = BTreeMap::new();
        for e in &events {
            q_hat
                .entry(e.arm_id.clone())
                .or_default()
                .push(e.reward.unwrap_or(0.0));
        }
        let q = |arm: &str| q_hat.get(arm).map(|w| w.mean()).unwrap_or(0.0);

        // Off-policy estimates per policy, one shared code path.
        let mut estimates = Vec::new();
        let mut estimators = BTreeMap::new();
        for policy in &policies {
            let probs_seed = stable_hash64(seed, policy.id.as_str());
            // The probability table is a function of the policy's *current*
            // state per context slice; cache it per context key.
            let mut probs_by_ctx: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
            let mut ips_sum = 0.0;
            let mut weight_sum = 0.0;
            let mut correction_sum = 0.0;
            let mut observed = Welford::new();
            let mut n = 0u64;
            for e in &events {
                let ctx_key = policy.context_key(&e.context);
                if !probs_by_ctx.contains_key(&ctx_key) {
                    let view = self
                        .store
                        .state_view(experiment_id, &policy.id, &ctx_key, &arms);
                    let p = action_probabilities(&policy.params, &arms, &view, probs_seed)?;
                    probs_by_ctx.insert(ctx_key.clone(), p);
                }
                let probs = &probs_by_ctx[&ctx_key];
                let Some(&pi) = probs.get(&e.arm_id) else {
                    continue;
                };
                let weight = pi / e.propensity.max(cfg.p_min);
                let reward = e.reward.unwrap_or(0.0);
                ips_sum += reward * weight;
                weight_sum += weight;
                correction_sum += (weight - 1.0) * q(&e.arm_id);
                if e.policy_id == policy.id {
                    observed.push(reward);
                }
                n += 1;
            }
            let nf = (n.max(1)) as f64;
            let ips = ips_sum / nf;
            // Self-normalized IPS: robust when parts of the log come from
            // deterministic policies whose support the candidate leaves.
            let snips = if weight_sum > 0.0 {
                ips_sum / weight_sum
            } else {
                0.0
            };
            let dr = ips - correction_sum / nf;
            estimators.insert(format!("ips:{}", policy.id), ips);
            estimators.insert(format!("snips:{}", policy.id), snips);
            estimators.insert(format!("dr:{}", policy.id), dr);
            estimates.push((policy.clone(), ips, snips, dr, observed));
        }

        let finalized_per_policy: BTreeMap<PolicyId, u64> = policies
            .iter()
            .map(|p| {
                let count = events.iter().filter(|e| e.policy_id == p.id).count() as u64;
                (p.id.clone(), count)
            })
            .collect();

        // Without a control there is nothing to compare against.
        let Some(control) = control else {
            let row = self.record(
                experiment_id,
                now,
                Verdict::Continue,
                None,
                0.0,
                0.0,
                estimators,
                "no control policy attached; estimates recorded only".to_string(),
            );
            return Ok(row);
        };

        let control_obs: Welford = events
            .iter()
            .filter(|e| e.policy_id == control.id)
            .filter_map(|e| e.reward)
            .collect();
        let control_value = control_obs.mean();

        // Winner: best self-normalized estimate among non-control policies.
        let best = estimates
            .iter()
            .filter(|(p, _, _, _, _)| p.id != control.id)
            .max_by(|a, b| a.2.total_cmp(&b.2).then_with(|| b.0.id.cmp(&a.0.id)));
        let Some((best_policy, _best_ips, best_snips, _best_dr, best_obs)) = best else {
            let row = self.record(
                experiment_id,
                now,
                Verdict::Continue,
                None,
                0.0,
                0.0,
                estimators,
                "no treatment policy attached".to_string(),
            );
            return Ok(row);
        };

        let uplift = relative_uplift(*best_snips, control_value);

        // Bootstrap the uplift: resample the event window, recompute the
        // best policy's self-normalized estimate and the control's on-policy
        // mean.
        let best_terms: Vec<(f64, f64, bool, f64)> = {
            // (ips numerator term, weight, is_control_event, reward)
            let mut probs_by_ctx: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
            let ctx_probs: Result<Vec<Option<f64>>> = events
                .iter()
                .map(|e| {
                    let ctx_key = best_policy.context_key(&e.context);
                    if !probs_by_ctx.contains_key(&ctx_key) {
                        let view = self.store.state_view(
                            experiment_id,
                            &best_policy.id,
                            &ctx_key,
                            &arms,
                        );
                        let probs = action_probabilities(
                            &best_policy.params,
                            &arms,
                            &view,
                            stable_hash64(seed, best_policy.id.as_str()),
                        )?;
                        probs_by_ctx.insert(ctx_key.clone(), probs);
                    }
                    Ok(probs_by_ctx[&ctx_key].get(&e.arm_id).copied())
                })
                .collect();
            let ctx_probs = ctx_probs?;
            events
                .iter()
                .zip(ctx_probs)
                .filter_map(|(e, pi)| {
                    let pi = pi?;
                    let reward = e.reward?;
                    let weight = pi / e.propensity.max(cfg.p_min);
                    Some((reward * weight, weight, e.policy_id == control.id, reward))
                })
                .collect()
        };
        let ci = bootstrap_ci(
            best_terms.len(),
            cfg.bootstrap_resamples,
            stable_hash64(seed, "bootstrap"),
            2.0 * (1.0 - cfg.confidence),
            |idx| {
                let mut num = 0.0;
                let mut den = 0.0;
                let mut control_sum = 0.0;
                let mut control_n = 0u64;
                for &i in idx {
                    let (term, weight, is_control, reward) = best_terms[i];
                    num += term;
                    den += weight;
                    if is_control {
                        control_sum += reward;
                        control_n += 1;
                    }
                }
                let value = if den > 0.0 { num / den } else { 0.0 };
                let control = if control_n == 0 {
                    control_value
                } else {
                    control_sum / control_n as f64
                };
                relative_uplift(value, control)
            },
        );
        let (ci_lo, ci_hi) = ci.unwrap_or((uplift, uplift));
        estimators.insert("uplift_ci_lo".to_string(), ci_lo);
        estimators.insert("uplift_ci_hi".to_string(), ci_hi);
        estimators.insert("control_mean".to_string(), control_value);

        let welch_p = welch_one_sided_p(
            best_obs.count(),
            best_obs.mean(),
            best_obs.variance(),
            control_obs.count(),
            control_obs.mean(),
            control_obs.variance(),
        );
        let confidence = welch_p.map(|p| 1.0 - p).unwrap_or(0.0);

        let events_ok = finalized_per_policy.get(&best_policy.id).copied().unwrap_or(0)
            >= cfg.min_events_per_policy
            && finalized_per_policy.get(&control.id).copied().unwrap_or(0)
                >= cfg.min_events_per_policy;

        let (verdict, notes) = if uplift >= cfg.min_uplift
            && confidence >= cfg.confidence
            && duration_ms >= cfg.min_window_ms
            && events_ok
        {
            (
                Verdict::Ship,
                format!(
                    "{} beats control by {:.1}% at {:.1}% confidence",
                    best_policy.id,
                    uplift * 100.0,
                    confidence * 100.0
                ),
            )
        } else if ci_lo < -cfg.kill_drop && confidence_against(welch_p) >= cfg.confidence {
            (
                Verdict::Kill,
                format!(
                    "uplift lower bound {:.1}% below -{:.0}%",
                    ci_lo * 100.0,
                    cfg.kill_drop * 100.0
                ),
            )
        } else if duration_ms >= cfg.max_window_ms {
            (
                Verdict::Iterate,
                "window exhausted without a ship/kill signal".to_string(),
            )
        } else {
            (Verdict::Continue, "insufficient evidence".to_string())
        };

        let winner = matches!(verdict, Verdict::Ship).then(|| best_policy.id.clone());
        let row = self.record(
            experiment_id,
            now,
            verdict,
            winner,
            uplift,
            confidence,
            estimators,
            notes,
        );

        if cfg.auto_apply {
            match verdict {
                Verdict::Kill => {
                    self.manager.kill(experiment_id, "decision engine verdict")?;
                }
                Verdict::Ship => {
                    self.manager.end(experiment_id)?;
                }
                _ => {}
            }
        }
        Ok(row)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        experiment_id: &ExperimentId,
        evaluated_at_ms: i64,
        verdict: Verdict,
        winner_policy_id: Option<PolicyId>,
        uplift: f64,
        confidence: f64,
        estimators: BTreeMap<String, f64>,
        notes: String,
    ) -> DecisionRow {
        let row = DecisionRow {
            experiment_id: experiment_id.clone(),
            evaluated_at_ms,
            verdict,
            winner_policy_id,
            uplift,
            confidence,
            estimators,
            notes,
        };
        info!(experiment = %experiment_id, verdict = ?verdict, uplift, "decision recorded");
        self.store.append_decision(row.clone());
        row
    }
}

fn relative_uplift(value: f64, control: f64) -> f64 {
    if control.abs() < 1e-12 {
        0.0
    } else {
        (value - control) / control.abs()
    }
}

/// One-sided confidence that the treatment is *worse* than control.
///
/// The Welch p-value tests H₁: treatment > control, so by symmetry of the t
/// distribution it is itself the confidence in the reverse direction.
fn confidence_against(welch_p: Option<f64>) -> f64 {
    welch_p.unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation() {
        assert!(DecisionConfig::default().validate().is_ok());
        let mut bad = DecisionConfig::default();
        bad.min_window_ms = bad.max_window_ms + 1;
        assert!(bad.validate().is_err());
        let mut bad = DecisionConfig::default();
        bad.p_min = 0.0;
        assert!(bad.validate().is_err());
        let mut bad = DecisionConfig::default();
        bad.confidence = 1.0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn relative_uplift_guards_zero_control() {
        assert_eq!(relative_uplift(0.4, 0.0), 0.0);
        assert!((relative_uplift(0.33, 0.30) - 0.1).abs() < 1e-9);
        assert!((relative_uplift(0.27, 0.30) + 0.1).abs() < 1e-9);
    }
}
