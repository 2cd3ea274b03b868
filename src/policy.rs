//! Uniform policy contract: select an arm with an exact propensity, update
//! sufficient statistics, validate parameters.
//!
//! Policies are a closed sum type (`thompson`, `egreedy`, `ucb`, `control`)
//! with kind-specific parameter records. Selection is a pure function of
//! `(params, candidates, state view, seed)`; updates are pure functions on a
//! single state row. The same code path serves online traffic, the decision
//! engine's off-policy weights, and offline replay.
//!
//! Candidate sets are taken in the caller's stable order (the catalog emits
//! arms sorted by `arm_id`); all tie-breaks are lexicographic on `arm_id`, so
//! a selection is reproducible from its inputs alone.

use std::collections::BTreeMap;

use crate::{
    control_probabilities, egreedy_probabilities, select_control, select_egreedy, select_thompson,
    select_ucb, thompson_probabilities, ucb_probabilities, ArmState, Context, ControlParams,
    EGreedyParams, Error, ExperimentId, PolicyId, Result, StateView, ThompsonParams, UcbParams,
};

/// Which algorithm a policy runs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Thompson,
    EGreedy,
    Ucb,
    Control,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Thompson => "thompson",
            PolicyKind::EGreedy => "egreedy",
            PolicyKind::Ucb => "ucb",
            PolicyKind::Control => "control",
        }
    }

    /// Parse a policy kind, accepting the aliases the admin surface has
    /// historically seen.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "thompson" => Ok(PolicyKind::Thompson),
            "egreedy" | "epsilon_greedy" => Ok(PolicyKind::EGreedy),
            "ucb" | "ucb1" => Ok(PolicyKind::Ucb),
            "control" => Ok(PolicyKind::Control),
            other => Err(Error::UnknownPolicy(other.to_string())),
        }
    }
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-tagged policy parameters.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyParams {
    Thompson(ThompsonParams),
    EGreedy(EGreedyParams),
    Ucb(UcbParams),
    Control(ControlParams),
}

impl PolicyParams {
    pub fn kind(&self) -> PolicyKind {
        match self {
            PolicyParams::Thompson(_) => PolicyKind::Thompson,
            PolicyParams::EGreedy(_) => PolicyKind::EGreedy,
            PolicyParams::Ucb(_) => PolicyKind::Ucb,
            PolicyParams::Control(_) => PolicyKind::Control,
        }
    }

    /// Admin-time parameter validation.
    pub fn validate(&self) -> Result<()> {
        match self {
            PolicyParams::Thompson(p) => p.validate(),
            PolicyParams::EGreedy(p) => p.validate(),
            PolicyParams::Ucb(p) => p.validate(),
            PolicyParams::Control(p) => p.validate(),
        }
    }

    /// Beta priors used to seed state rows for this policy.
    ///
    /// Non-Thompson policies keep the uninformative `(1,1)` prior so their
    /// rows stay valid if an experiment later swaps algorithms.
    pub fn priors(&self) -> (f64, f64) {
        match self {
            PolicyParams::Thompson(p) => (p.alpha0, p.beta0),
            _ => (1.0, 1.0),
        }
    }
}

/// One policy attached to an experiment.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PolicySpec {
    pub id: PolicyId,
    pub experiment_id: ExperimentId,
    pub params: PolicyParams,
    /// Context keys this policy partitions state on; empty means
    /// non-contextual (single state row per arm).
    #[serde(default)]
    pub context_keys: Vec<String>,
}

impl PolicySpec {
    pub fn new(
        id: impl Into<PolicyId>,
        experiment_id: impl Into<ExperimentId>,
        params: PolicyParams,
    ) -> Self {
        Self {
            id: id.into(),
            experiment_id: experiment_id.into(),
            params,
            context_keys: Vec::new(),
        }
    }

    pub fn kind(&self) -> PolicyKind {
        self.params.kind()
    }

    /// State-partition key for a request context under this policy.
    pub fn context_key(&self, context: &Context) -> String {
        if self.context_keys.is_empty() {
            return String::new();
        }
        let keys: Vec<&str> = self.context_keys.iter().map(String::as_str).collect();
        context.context_key(&keys)
    }
}

/// Output of one selection: the chosen arm, the exact probability the policy
/// would have emitted it over this candidate set at this state, and the full
/// per-arm distribution for audit/off-policy use.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Selection {
    pub arm_id: String,
    /// Probability of `arm_id` over the candidate set; `Σ` over the
    /// distribution is 1 and every mass is in `(0,1]` or exactly 0.
    pub propensity: f64,
    /// Policy-specific score of the chosen arm (posterior draw, mean, UCB
    /// value); for logging only.
    pub score: f64,
    /// Full distribution over the candidate set.
    pub probs: BTreeMap<String, f64>,
    /// True when the policy chose an untried arm in its cold-start phase.
    pub explore_first: bool,
}

/// Choose an arm over `candidates` given the state view.
///
/// `seed` drives every stochastic draw; equal inputs give equal outputs.
/// Fails with [`Error::NoEligibleArm`] on an empty candidate set,
/// [`Error::InvalidState`] on corrupt state rows.
pub fn select(
    params: &PolicyParams,
    candidates: &[String],
    states: &StateView,
    seed: u64,
) -> Result<Selection> {
    if candidates.is_empty() {
        return Err(Error::NoEligibleArm);
    }
    match params {
        PolicyParams::Thompson(p) => select_thompson(p, candidates, states, seed),
        PolicyParams::EGreedy(p) => select_egreedy(p, candidates, states, seed),
        PolicyParams::Ucb(p) => select_ucb(p, candidates, states, seed),
        PolicyParams::Control(p) => select_control(p, candidates),
    }
}

/// The distribution `π(a | state)` over `candidates`, without choosing.
///
/// This is the off-policy evaluation entry point: the decision engine and the
/// replayer weight logged events by these probabilities. For stochastic
/// policies the distribution is estimated with the same Monte-Carlo scheme
/// used for logged propensities, seeded by `seed`.
pub fn action_probabilities(
    params: &PolicyParams,
    candidates: &[String],
    states: &StateView,
    seed: u64,
) -> Result<BTreeMap<String, f64>> {
    if candidates.is_empty() {
        return Err(Error::NoEligibleArm);
    }
    match params {
        PolicyParams::Thompson(p) => thompson_probabilities(p, candidates, states, seed),
        PolicyParams::EGreedy(p) => egreedy_probabilities(p, candidates, states),
        PolicyParams::Ucb(p) => ucb_probabilities(p, candidates, states),
        PolicyParams::Control(p) => control_probabilities(p, candidates),
    }
}

/// Apply one attributed reward to a state row.
///
/// Pure on the row: counters only grow. Thompson rejects rewards outside
/// `[0,1]`; the other policies accept any finite value into their running
/// means (the row still records it as a neutral pull).
pub fn update(
    params: &PolicyParams,
    state: &mut ArmState,
    reward: f64,
    now_ms: i64,
) -> Result<()> {
    if let PolicyParams::Thompson(_) = params {
        if !(0.0..=1.0).contains(&reward) {
            return Err(Error::InvalidState(format!(
                "thompson update requires reward in [0,1], got {reward}"
            )));
        }
    }
    state.apply_reward(reward, now_ms)
}

/// Resolve a state row for selection, falling back to the policy's priors
/// when the row has not been materialized yet.
pub(crate) fn state_or_prior(states: &StateView, arm: &str, priors: (f64, f64)) -> ArmState {
    states
        .get(arm)
        .copied()
        .unwrap_or_else(|| ArmState::seeded(priors.0, priors.1))
}
