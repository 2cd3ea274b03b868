//! Thompson sampling over Beta–Bernoulli posteriors.
//!
//! Selection draws one θ per arm from `Beta(α, β)` and returns the argmax.
//! The logged propensity is a Monte-Carlo estimate of the selection
//! probability at this exact state: repeat the draw-and-argmax experiment
//! `propensity_draws` times, floor the empirical frequencies so every arm
//! keeps strictly positive mass, and renormalize. The same estimator backs
//! the off-policy `π(a|x)` weights, so logged and replayed propensities are
//! one code path.
//!
//! Seedable end to end: equal `(params, candidates, states, seed)` give the
//! same choice and the same propensities.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Beta, Distribution};
use std::collections::BTreeMap;

use crate::{
    stable_hash64_u64, state_or_prior, Error, Result, Selection, StateView,
};

/// Parameters for the Thompson policy.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ThompsonParams {
    /// Prior alpha (must be > 0).
    pub alpha0: f64,
    /// Prior beta (must be > 0).
    pub beta0: f64,
    /// Monte-Carlo draws for the propensity estimate (≥ 500).
    pub propensity_draws: u32,
}

impl Default for ThompsonParams {
    fn default() -> Self {
        Self {
            alpha0: 1.0,
            beta0: 1.0,
            propensity_draws: 1000,
        }
    }
}

impl ThompsonParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.alpha0.is_finite() && self.alpha0 > 0.0)
            || !(self.beta0.is_finite() && self.beta0 > 0.0)
        {
            return Err(Error::Configuration(format!(
                "thompson priors must be positive, got ({}, {})",
                self.alpha0, self.beta0
            )));
        }
        if self.propensity_draws < 500 {
            return Err(Error::Configuration(format!(
                "propensity_draws must be >= 500, got {}",
                self.propensity_draws
            )));
        }
        Ok(())
    }
}

fn sample_beta(rng: &mut StdRng, alpha: f64, beta: f64) -> Result<f64> {
    Beta::new(alpha, beta)
        .map_err(|e| Error::InvalidState(format!("beta({alpha}, {beta}): {e}")))
        .map(|d| d.sample(rng))
}

/// One draw-and-argmax round over the candidate set, tie-break lexicographic.
fn argmax_round(
    rng: &mut StdRng,
    p: &ThompsonParams,
    candidates: &[String],
    states: &StateView,
) -> Result<(usize, f64)> {
    let mut best_idx = 0usize;
    let mut best_sample = f64::NEG_INFINITY;
    for (i, arm) in candidates.iter().enumerate() {
        let s = state_or_prior(states, arm, (p.alpha0, p.beta0));
        s.validate()?;
        let x = sample_beta(rng, s.alpha, s.beta)?;
        let better = x > best_sample
            || ((x - best_sample).abs() <= 1e-12 && arm < &candidates[best_idx]);
        if better {
            best_sample = x;
            best_idx = i;
        }
    }
    Ok((best_idx, best_sample))
}

/// Monte-Carlo selection probabilities over the candidate set.
///
/// Frequencies are floored at `1 / (N + K·N)` and renormalized so the
/// distribution sums to 1 with every mass strictly positive.
pub fn thompson_probabilities(
    p: &ThompsonParams,
    candidates: &[String],
    states: &StateView,
    seed: u64,
) -> Result<BTreeMap<String, f64>> {
    if candidates.is_empty() {
        return Err(Error::NoEligibleArm);
    }
    let n = p.propensity_draws.max(500) as usize;
    let k = candidates.len();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut counts = vec![0u32; k];
    for _ in 0..n {
        let (idx, _) = argmax_round(&mut rng, p, candidates, states)?;
        counts[idx] += 1;
    }

    let floor = 1.0 / ((n + k * n) as f64);
    let mut probs: Vec<f64> = counts
        .iter()
        .map(|&c| ((c as f64) / (n as f64)).max(floor))
        .collect();
    let total: f64 = probs.iter().sum();
    for v in probs.iter_mut() {
        *v /= total;
    }
    Ok(candidates
        .iter()
        .cloned()
        .zip(probs)
        .collect::<BTreeMap<_, _>>())
}

/// Select an arm by posterior sampling.
pub fn select_thompson(
    p: &ThompsonParams,
    candidates: &[String],
    states: &StateView,
    seed: u64,
) -> Result<Selection> {
    if candidates.is_empty() {
        return Err(Error::NoEligibleArm);
    }
    // The selection draw and the propensity estimate use decorrelated streams
    // derived from the same seed, so neither biases the other.
    let mut rng = StdRng::seed_from_u64(stable_hash64_u64(seed, 0x5448_4F4D)); // "THOM"
    let (idx, sample) = argmax_round(&mut rng, p, candidates, states)?;
    let chosen = candidates[idx].clone();

    let probs = thompson_probabilities(
        p,
        candidates,
        states,
        stable_hash64_u64(seed, 0x5052_4F50), // "PROP"
    )?;
    let propensity = probs.get(&chosen).copied().unwrap_or(0.0);

    Ok(Selection {
        arm_id: chosen,
        propensity,
        score: sample,
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

    #[test]
    fn deterministic_given_same_seed_and_state() {
        let p = ThompsonParams::default();
        let a = arms(&["x", "y", "z"]);
        let states = StateView::new();
        let s1 = select_thompson(&p, &a, &states, 42).unwrap();
        let s2 = select_thompson(&p, &a, &states, 42).unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn propensities_sum_to_one_and_stay_positive() {
        let p = ThompsonParams::default();
        let a = arms(&["a", "b", "c", "d"]);
        let mut states = StateView::new();
        // Strongly favor "a" so the others sit at the floor.
        let mut hot = ArmState::seeded(1.0, 1.0);
        for _ in 0..200 {
            hot.apply_reward(1.0, 0).unwrap();
        }
        states.insert("a".to_string(), hot);
        let probs = thompson_probabilities(&p, &a, &states, 7).unwrap();
        let total: f64 = probs.values().sum();
        assert!((total - 1.0).abs() < 1e-6, "sum={total}");
        for (arm, &pr) in &probs {
            assert!(pr > 0.0 && pr <= 1.0, "{arm}: {pr}");
        }
        assert!(probs["a"] > 0.9);
    }

    #[test]
    fn equal_priors_select_uniformly_at_chi_square_level() {
        // 10^5 draw-and-argmax rounds over equal posteriors: the selection
        // frequencies must be uniform at the chi-square p > 0.01 level.
        let p = ThompsonParams {
            propensity_draws: 100_000,
            ..Default::default()
        };
        let a = arms(&["a", "b", "c", "d"]);
        let states = StateView::new();
        let probs = thompson_probabilities(&p, &a, &states, 123).unwrap();
        let observed: Vec<f64> = probs.values().map(|&v| v * 100_000.0).collect();
        let expected = vec![25_000.0; 4];
        let p_value = crate::chi_square_p(&observed, &expected).unwrap();
        assert!(p_value > 0.01, "uniformity rejected: p={p_value}");

        // And the actual selection draw agrees over a short run.
        let mut counts = BTreeMap::new();
        let quick = ThompsonParams {
            propensity_draws: 500,
            ..Default::default()
        };
        let n = 400u64;
        for seed in 0..n {
            let sel = select_thompson(&quick, &a, &states, seed).unwrap();
            *counts.entry(sel.arm_id).or_insert(0u64) += 1;
        }
        for (arm, &c) in &counts {
            let share = c as f64 / n as f64;
            assert!(
                (share - 0.25).abs() < 0.1,
                "{arm} share {share} far from uniform"
            );
        }
    }

    #[test]
    fn converges_to_better_arm() {
        let p = ThompsonParams::default();
        let a = arms(&["good", "meh"]);
        let mut states = StateView::new();
        let mut good = ArmState::seeded(1.0, 1.0);
        let mut meh = ArmState::seeded(1.0, 1.0);
        for i in 0..500 {
            good.apply_reward(if i % 10 < 3 { 1.0 } else { 0.0 }, 0).unwrap(); // ~0.3
            meh.apply_reward(if i % 10 < 1 { 1.0 } else { 0.0 }, 0).unwrap(); // ~0.1
        }
        states.insert("good".to_string(), good);
        states.insert("meh".to_string(), meh);
        let probs = thompson_probabilities(&p, &a, &states, 3).unwrap();
        assert!(probs["good"] > 0.95, "p(good)={}", probs["good"]);
    }

    #[test]
    fn corrupt_state_fails_loudly() {
        let p = ThompsonParams::default();
        let a = arms(&["a"]);
        let mut states = StateView::new();
        states.insert("a".to_string(), ArmState::seeded(0.0, 0.0));
        assert!(matches!(
            select_thompson(&p, &a, &states, 0),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn params_validate_bounds() {
        assert!(ThompsonParams::default().validate().is_ok());
        assert!(ThompsonParams {
            alpha0: 0.0,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(ThompsonParams {
            propensity_draws: 100,
            ..Default::default()
        }
        .validate()
        .is_err());
    }
}
