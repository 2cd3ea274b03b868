//! Deterministic (user, experiment) → policy assignment.
//!
//! Assignment is a pure function of `(salt, user_id, traffic_fraction,
//! traffic_plan)`: hash the salted user to a bucket in `[0,1)`, gate on the
//! traffic fraction, then walk the ordered plan cumulatively. Because the
//! bucket is fixed per (salt, user), growing `traffic_fraction` can only add
//! users to the experiment — nobody already inside ever falls out during a
//! ramp, and the within-experiment split is untouched.
//!
//! Memoized assignment rows exist for audit; the hash is the source of truth
//! and the stored row is a cache of it.

use crate::{assignment_bucket, Error, ExperimentId, PolicyId, Result, UserId};

/// Ordered policy → share plan. Shares must sum to 1 (±1e-9).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TrafficPlan {
    entries: Vec<(PolicyId, f64)>,
}

impl TrafficPlan {
    /// Build and validate a plan from ordered (policy, share) pairs.
    pub fn new<I, P>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (P, f64)>,
        P: Into<PolicyId>,
    {
        let entries: Vec<(PolicyId, f64)> = entries
            .into_iter()
            .map(|(p, s)| (p.into(), s))
            .collect();
        let plan = Self { entries };
        plan.validate()?;
        Ok(plan)
    }

    /// An even split over the given policies.
    pub fn even<I, P>(policies: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PolicyId>,
    {
        let ids: Vec<PolicyId> = policies.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            return Err(Error::Configuration("traffic plan is empty".to_string()));
        }
        let share = 1.0 / ids.len() as f64;
        Self::new(ids.into_iter().map(|p| (p, share)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.entries.is_empty() {
            return Err(Error::Configuration("traffic plan is empty".to_string()));
        }
        let mut total = 0.0;
        for (policy, share) in &self.entries {
            if !(share.is_finite() && *share >= 0.0) {
                return Err(Error::Configuration(format!(
                    "plan share for {policy} must be a non-negative number, got {share}"
                )));
            }
            total += share;
        }
        if (total - 1.0).abs() > 1e-9 {
            return Err(Error::Configuration(format!(
                "plan shares must sum to 1, got {total}"
            )));
        }
        Ok(())
    }

    pub fn entries(&self) -> &[(PolicyId, f64)] {
        &self.entries
    }

    pub fn share_of(&self, policy: &PolicyId) -> f64 {
        self.entries
            .iter()
            .find(|(p, _)| p == policy)
            .map(|(_, s)| *s)
            .unwrap_or(0.0)
    }

    pub fn policies(&self) -> impl Iterator<Item = &PolicyId> {
        self.entries.iter().map(|(p, _)| p)
    }

    /// The policy owning `position ∈ [0,1)`: first entry whose cumulative
    /// share exceeds it. The final entry absorbs floating-point residue.
    fn policy_at(&self, position: f64) -> &PolicyId {
        let mut cumulative = 0.0;
        for (policy, share) in &self.entries {
            cumulative += share;
            if cumulative > position {
                return policy;
            }
        }
        // Residue from summation error lands on the last entry.
        &self.entries[self.entries.len() - 1].0
    }
}

/// Where a (salt, user) pair landed.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum AssignOutcome {
    /// In the experiment, bucketed into a policy.
    Assigned { policy_id: PolicyId, bucket: f64 },
    /// Outside the experiment's traffic fraction; serve the default policy.
    NotInExperiment { bucket: f64 },
}

/// Assign a user. Pure and restart-stable; see the module docs for the
/// stickiness-under-ramp argument.
pub fn assign(
    salt: &str,
    user_id: UserId,
    traffic_fraction: f64,
    plan: &TrafficPlan,
) -> AssignOutcome {
    let bucket = assignment_bucket(salt, user_id);
    if bucket >= traffic_fraction {
        return AssignOutcome::NotInExperiment { bucket };
    }
    // Rescale the in-experiment bucket back to [0,1) before walking the plan,
    // so the within-experiment split is independent of the fraction.
    let position = if traffic_fraction > 0.0 {
        bucket / traffic_fraction
    } else {
        0.0
    };
    AssignOutcome::Assigned {
        policy_id: plan.policy_at(position).clone(),
        bucket,
    }
}

/// Memoized assignment row (first-write-wins; audit cache of the hash).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AssignmentRow {
    pub user_id: UserId,
    pub experiment_id: ExperimentId,
    pub policy_id: PolicyId,
    pub bucket: f64,
    pub assigned_at_ms: i64,
    /// Sticky rows survive traffic-plan edits; only a salt change clears them.
    pub sticky: bool,
}
