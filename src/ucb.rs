//! UCB1 with deterministic cold start.
//!
//! Any arm with zero pulls is served first, in stable `arm_id` order, so the
//! first `K` calls visit each arm exactly once. After that the policy picks
//! `argmax μ + c·√(2 ln N / n)` with `N = Σn`, tie-break lowest `arm_id`.
//!
//! The formally correct propensity for a deterministic policy is 1 on the
//! chosen arm and 0 elsewhere, and that is what gets recorded by default.
//! Off-policy estimators that need strictly positive logging propensities can
//! set `exploration_floor > 0`, which mixes in uniform exploration and records
//! the mixed distribution exactly.

use std::collections::BTreeMap;

use crate::{
    stable_hash64_u64, state_or_prior, u01_from_seed, Error, Result, Selection, StateView,
};

/// Parameters for the UCB1 policy.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UcbParams {
    /// Exploration coefficient on the confidence radius.
    pub c: f64,
    /// Optional uniform-exploration mass in `[0,1)`. 0 keeps UCB1 fully
    /// deterministic (degenerate propensities).
    pub exploration_floor: f64,
}

impl Default for UcbParams {
    fn default() -> Self {
        Self {
            c: 1.0,
            exploration_floor: 0.0,
        }
    }
}

impl UcbParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.c.is_finite() && self.c >= 0.0) {
            return Err(Error::Configuration(format!(
                "ucb exploration coefficient must be >= 0, got {}",
                self.c
            )));
        }
        if !(self.exploration_floor.is_finite() && (0.0..1.0).contains(&self.exploration_floor)) {
            return Err(Error::Configuration(format!(
                "exploration_floor must be in [0,1), got {}",
                self.exploration_floor
            )));
        }
        Ok(())
    }
}

/// First untried arm in stable order, if any.
fn first_untried(candidates: &[String], states: &StateView) -> Option<usize> {
    candidates
        .iter()
        .position(|arm| state_or_prior(states, arm, (1.0, 1.0)).pulls == 0)
}

/// Index and value of the UCB1 argmax (all arms pulled at least once).
fn ucb_argmax(p: &UcbParams, candidates: &[String], states: &StateView) -> (usize, f64) {
    let total: u64 = candidates
        .iter()
        .map(|arm| state_or_prior(states, arm, (1.0, 1.0)).pulls)
        .sum();
    let ln_total = (total.max(1) as f64).ln();

    let mut best_idx = 0usize;
    let mut best_val = f64::NEG_INFINITY;
    for (i, arm) in candidates.iter().enumerate() {
        let s = state_or_prior(states, arm, (1.0, 1.0));
        let n = (s.pulls.max(1)) as f64;
        let val = s.mean_reward() + p.c * (2.0 * ln_total / n).sqrt();
        let better = val > best_val || (val == best_val && arm < &candidates[best_idx]);
        if better {
            best_val = val;
            best_idx = i;
        }
    }
    (best_idx, best_val)
}

fn degenerate(candidates: &[String], chosen: usize) -> BTreeMap<String, f64> {
    candidates
        .iter()
        .enumerate()
        .map(|(i, arm)| (arm.clone(), if i == chosen { 1.0 } else { 0.0 }))
        .collect()
}

/// Selection probabilities at this state.
pub fn ucb_probabilities(
    p: &UcbParams,
    candidates: &[String],
    states: &StateView,
) -> Result<BTreeMap<String, f64>> {
    if candidates.is_empty() {
        return Err(Error::NoEligibleArm);
    }
    if let Some(idx) = first_untried(candidates, states) {
        return Ok(degenerate(candidates, idx));
    }
    let (best, _) = ucb_argmax(p, candidates, states);
    if p.exploration_floor <= 0.0 {
        return Ok(degenerate(candidates, best));
    }
    let k = candidates.len() as f64;
    let f = p.exploration_floor;
    Ok(candidates
        .iter()
        .enumerate()
        .map(|(i, arm)| {
            let mass = if i == best { (1.0 - f) + f / k } else { f / k };
            (arm.clone(), mass)
        })
        .collect())
}

/// Select an arm under UCB1.
pub fn select_ucb(
    p: &UcbParams,
    candidates: &[String],
    states: &StateView,
    seed: u64,
) -> Result<Selection> {
    if candidates.is_empty() {
        return Err(Error::NoEligibleArm);
    }

    // Cold start: deterministic, recorded with propensity exactly 1.
    if let Some(idx) = first_untried(candidates, states) {
        let probs = degenerate(candidates, idx);
        return Ok(Selection {
            arm_id: candidates[idx].clone(),
            propensity: 1.0,
            score: f64::INFINITY,
            probs,
            explore_first: true,
        });
    }

    let (best, best_val) = ucb_argmax(p, candidates, states);
    let k = candidates.len();

    let idx = if p.exploration_floor > 0.0 {
        let u = u01_from_seed(stable_hash64_u64(seed, 0x5543_4231)); // "UCB1"
        if u < p.exploration_floor {
            (stable_hash64_u64(seed, 0x464C_4F52) % (k as u64)) as usize // "FLOR"
        } else {
            best
        }
    } else {
        best
    };

    let probs = ucb_probabilities(p, candidates, states)?;
    let chosen = candidates[idx].clone();
    let propensity = probs.get(&chosen).copied().unwrap_or(0.0);
    let score = if idx == best {
        best_val
    } else {
        state_or_prior(states, &chosen, (1.0, 1.0)).mean_reward()
    };

    Ok(Selection {
        arm_id: chosen,
        propensity,
        score,
        probs,
        explore_first: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ArmState;

    fn arms(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn pulled(mean: f64, pulls: u64) -> ArmState {
        let mut s = ArmState::default();
        for _ in 0..pulls {
            s.apply_reward(mean, 0).unwrap();
        }
        s
    }

    #[test]
    fn cold_start_visits_each_arm_exactly_once() {
        let p = UcbParams::default();
        let a = arms(&["a", "b", "c"]);
        let mut states = StateView::new();
        let mut visited = Vec::new();
        for _ in 0..3 {
            let sel = select_ucb(&p, &a, &states, 0).unwrap();
            assert!(sel.explore_first);
            assert_eq!(sel.propensity, 1.0);
            visited.push(sel.arm_id.clone());
            states
                .entry(sel.arm_id)
                .or_insert_with(ArmState::default)
                .apply_reward(0.5, 0)
                .unwrap();
        }
        visited.sort();
        assert_eq!(visited, a);
    }

    #[test]
    fn deterministic_propensity_is_one_zero() {
        let p = UcbParams::default();
        let a = arms(&["a", "b"]);
        let mut states = StateView::new();
        states.insert("a".to_string(), pulled(0.9, 20));
        states.insert("b".to_string(), pulled(0.1, 20));
        let sel = select_ucb(&p, &a, &states, 5).unwrap();
        assert_eq!(sel.arm_id, "a");
        assert_eq!(sel.propensity, 1.0);
        assert_eq!(sel.probs["b"], 0.0);
        let total: f64 = sel.probs.values().sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn confidence_radius_prefers_under_pulled_arm() {
        let p = UcbParams::default();
        let a = arms(&["fresh", "stale"]);
        let mut states = StateView::new();
        // Equal means, but "fresh" has far fewer pulls -> larger radius.
        states.insert("fresh".to_string(), pulled(0.5, 2));
        states.insert("stale".to_string(), pulled(0.5, 500));
        let sel = select_ucb(&p, &a, &states, 0).unwrap();
        assert_eq!(sel.arm_id, "fresh");
    }

    #[test]
    fn exploration_floor_mixes_uniform_mass() {
        let p = UcbParams {
            c: 1.0,
            exploration_floor: 0.2,
        };
        let a = arms(&["a", "b"]);
        let mut states = StateView::new();
        states.insert("a".to_string(), pulled(0.9, 50));
        states.insert("b".to_string(), pulled(0.1, 50));
        let probs = ucb_probabilities(&p, &a, &states).unwrap();
        assert!((probs["a"] - 0.9).abs() < 1e-12);
        assert!((probs["b"] - 0.1).abs() < 1e-12);

        let mut explored = 0u64;
        let n = 10_000u64;
        for seed in 0..n {
            let sel = select_ucb(&p, &a, &states, seed).unwrap();
            assert_eq!(sel.propensity, probs[&sel.arm_id]);
            if sel.arm_id == "b" {
                explored += 1;
            }
        }
        let share = explored as f64 / n as f64;
        assert!((share - 0.1).abs() < 0.015, "floor share {share}");
    }

    #[test]
    fn params_validate_bounds() {
        assert!(UcbParams::default().validate().is_ok());
        assert!(UcbParams {
            c: -1.0,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(UcbParams {
            exploration_floor: 1.0,
            ..Default::default()
        }
        .validate()
        .is_err());
    }
}
