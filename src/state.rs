//! Per-(experiment, policy, arm, context) sufficient statistics.
//!
//! Policy state is stored as one row per key with atomic per-row updates, so
//! the engine stays correct across process restarts and horizontal scale-out.
//! Rows are plain serializable data; `snapshot`/`restore` for a whole policy
//! is serde over the row map.
//!
//! Success/failure accounting is **fractional**: an update with reward
//! `r ∈ [0,1]` adds `r` to the success mass and `1−r` to the failure mass, so
//! binary rewards produce integer counts and the Thompson posterior identity
//! `α = α₀ + successes`, `β = β₀ + failures` holds exactly for fractional
//! updates too. A reward outside `[0,1]` is a *neutral* pull: it counts in
//! `pulls` and the reward sums but moves neither mass.

use std::collections::BTreeMap;

use crate::{Error, ExperimentId, PolicyId, Result};

/// Composite key of one policy-state row.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct StateKey {
    pub experiment_id: ExperimentId,
    pub policy_id: PolicyId,
    pub arm_id: String,
    /// Empty for non-contextual policies.
    pub context_key: String,
}

impl StateKey {
    pub fn new(
        experiment_id: impl Into<ExperimentId>,
        policy_id: impl Into<PolicyId>,
        arm_id: impl Into<String>,
        context_key: impl Into<String>,
    ) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            policy_id: policy_id.into(),
            arm_id: arm_id.into(),
            context_key: context_key.into(),
        }
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.experiment_id, self.policy_id, self.arm_id, self.context_key
        )
    }
}

/// Sufficient statistics for one arm under one policy (and context slice).
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ArmState {
    /// Number of attributed serves. Monotonic.
    pub pulls: u64,
    /// Fractional success mass; `successes ≤ pulls`. Monotonic.
    pub successes: f64,
    /// Fractional failure mass; `failures ≤ pulls`. Monotonic.
    pub failures: f64,
    /// Sum of raw rewards (may include out-of-band values).
    pub sum_reward: f64,
    /// Sum of squared raw rewards (for variance estimates).
    pub sum_reward_sq: f64,
    /// Beta posterior alpha; `alpha = alpha0 + successes`.
    pub alpha: f64,
    /// Beta posterior beta; `beta = beta0 + failures`.
    pub beta: f64,
    /// Last update instant (epoch ms).
    pub updated_at_ms: i64,
}

impl ArmState {
    /// A fresh row seeded with the given Beta priors.
    pub fn seeded(alpha0: f64, beta0: f64) -> Self {
        Self {
            pulls: 0,
            successes: 0.0,
            failures: 0.0,
            sum_reward: 0.0,
            sum_reward_sq: 0.0,
            alpha: alpha0,
            beta: beta0,
            updated_at_ms: 0,
        }
    }

    /// Mean of raw rewards over all pulls (0 when unpulled).
    pub fn mean_reward(&self) -> f64 {
        if self.pulls == 0 {
            0.0
        } else {
            self.sum_reward / (self.pulls as f64)
        }
    }

    /// Sample variance of raw rewards (0 for fewer than two pulls).
    pub fn reward_variance(&self) -> f64 {
        if self.pulls < 2 {
            return 0.0;
        }
        let n = self.pulls as f64;
        let mean = self.sum_reward / n;
        let var = (self.sum_reward_sq - n * mean * mean) / (n - 1.0);
        var.max(0.0)
    }

    /// Beta posterior mean `α / (α + β)`.
    pub fn posterior_mean(&self) -> f64 {
        let denom = self.alpha + self.beta;
        if denom <= 0.0 {
            0.5
        } else {
            self.alpha / denom
        }
    }

    /// Beta posterior variance.
    pub fn posterior_variance(&self) -> f64 {
        let (a, b) = (self.alpha, self.beta);
        let denom = (a + b).powi(2) * (a + b + 1.0);
        if denom <= 0.0 {
            0.0
        } else {
            (a * b) / denom
        }
    }

    /// Normal-approximation 95% interval for the posterior mean, clamped to `[0,1]`.
    pub fn posterior_interval95(&self) -> (f64, f64) {
        let mean = self.posterior_mean();
        let sd = self.posterior_variance().sqrt();
        ((mean - 1.96 * sd).max(0.0), (mean + 1.96 * sd).min(1.0))
    }

    /// Apply one attributed reward.
    ///
    /// Counters only ever increase. Rewards in `[0,1]` move the fractional
    /// success/failure masses and the Beta posterior; values outside that
    /// band are neutral pulls.
    pub fn apply_reward(&mut self, reward: f64, now_ms: i64) -> Result<()> {
        if !reward.is_finite() {
            return Err(Error::InvalidState(format!(
                "non-finite reward {reward}"
            )));
        }
        self.pulls = self.pulls.saturating_add(1);
        self.sum_reward += reward;
        self.sum_reward_sq += reward * reward;
        if (0.0..=1.0).contains(&reward) {
            self.successes += reward;
            self.failures += 1.0 - reward;
            self.alpha += reward;
            self.beta += 1.0 - reward;
        }
        self.updated_at_ms = self.updated_at_ms.max(now_ms);
        Ok(())
    }

    /// Check the row invariants: positive finite Beta parameters and
    /// success/failure masses bounded by pulls.
    pub fn validate(&self) -> Result<()> {
        if !(self.alpha.is_finite() && self.alpha > 0.0)
            || !(self.beta.is_finite() && self.beta > 0.0)
        {
            return Err(Error::InvalidState(format!(
                "non-positive beta parameters alpha={} beta={}",
                self.alpha, self.beta
            )));
        }
        let pulls = self.pulls as f64;
        if self.successes > pulls + 1e-9 || self.failures > pulls + 1e-9 {
            return Err(Error::InvalidState(format!(
                "mass exceeds pulls: pulls={} successes={} failures={}",
                self.pulls, self.successes, self.failures
            )));
        }
        if self.successes < 0.0 || self.failures < 0.0 {
            return Err(Error::InvalidState(
                "negative success/failure mass".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ArmState {
    fn default() -> Self {
        Self::seeded(1.0, 1.0)
    }
}

/// A per-arm view of policy state for one (experiment, policy, context) slice.
///
/// This is what `select` consumes; it is a bounded-stale clone of the stored
/// rows, never a live reference.
pub type StateView = BTreeMap<String, ArmState>;

/// Serialize a state view for persistence or replay.
pub fn snapshot_view(view: &StateView) -> String {
    // Row maps are plain data; serialization cannot fail.
    serde_json::to_string(view).unwrap_or_else(|_| "{}".to_string())
}

/// Restore a state view previously produced by [`snapshot_view`].
pub fn restore_view(snapshot: &str) -> Result<StateView> {
    serde_json::from_str(snapshot)
        .map_err(|e| Error::InvalidState(format!("undecodable state snapshot: {e}")))
}
