//! Offline replay: evaluate candidate policies on logged history.
//!
//! A replay store holds historical records (logged arm, logged propensity,
//! logged reward). `select_window` picks the contiguous stretch that
//! maximizes event density × arm coverage subject to a minimum length, and
//! `replay` runs a candidate policy over that window with a fresh state:
//!
//! 1. compute `π_new(a|x)` over the logged candidate set (the exact
//!    `action_probabilities` code path the online engine uses),
//! 2. score the event with IPS (and DR against the per-arm mean reward
//!    model),
//! 3. update the policy's state with the logged outcome as if it had served,
//!    so regret and temporal-stability curves reflect what the policy would
//!    have learned.
//!
//! Fully deterministic: per-event seeds derive from the configured seed and
//! the event id, so identical inputs give bit-identical estimates.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::{
    action_probabilities, stable_hash64, update as policy_update, Context, Error, PolicyParams,
    Result, StateView, UserId,
};

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// One logged historical event.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReplayRecord {
    pub event_id: String,
    pub user_id: UserId,
    pub at_ms: i64,
    #[serde(default)]
    pub context: Context,
    /// Candidate arms available at log time.
    pub candidates: Vec<String>,
    pub logged_arm: String,
    /// Propensity the logging policy recorded; must be in `(0,1]`.
    pub logged_propensity: f64,
    pub logged_reward: f64,
}

impl ReplayRecord {
    fn validate(&self) -> Result<()> {
        if !(self.logged_propensity > 0.0 && self.logged_propensity <= 1.0) {
            return Err(Error::Configuration(format!(
                "record {}: logged_propensity {} outside (0,1]",
                self.event_id, self.logged_propensity
            )));
        }
        if self.candidates.is_empty() {
            return Err(Error::Configuration(format!(
                "record {}: empty candidate set",
                self.event_id
            )));
        }
        Ok(())
    }
}

/// A contiguous day-aligned replay window.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReplayWindow {
    pub start_ms: i64,
    /// Exclusive end.
    pub end_ms: i64,
    pub events: usize,
    pub density_per_day: f64,
    /// Share of the store's distinct logged arms seen inside the window.
    pub arm_coverage: f64,
}

impl ReplayWindow {
    pub fn days(&self) -> i64 {
        (self.end_ms - self.start_ms) / MS_PER_DAY
    }
}

/// Replay tuning.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReplayConfig {
    /// Propensity clip floor for IPS weights.
    pub p_min: f64,
    /// Seed for the per-event probability estimates.
    pub seed: u64,
    /// Context keys the candidate policy partitions state on (empty =
    /// non-contextual).
    pub context_keys: Vec<String>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            p_min: 0.01,
            seed: 0,
            context_keys: Vec::new(),
        }
    }
}

/// Metrics from one replay run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReplayMetrics {
    /// Events scored.
    pub events: usize,
    /// Events skipped (logged arm missing from its candidate set).
    pub skipped: usize,
    /// State updates the policy rejected (e.g. out-of-band rewards).
    pub update_errors: usize,
    pub ips: f64,
    /// Self-normalized IPS (`Σ r·w / Σ w`).
    pub snips: f64,
    pub dr: f64,
    /// Cumulative regret against the best-in-hindsight arm, one point per
    /// scored event.
    pub cumulative_regret: Vec<f64>,
    /// Mean IPS term per day, in window order.
    pub daily_ips: Vec<(i64, f64)>,
}

/// Append-only store of historical events for replay.
#[derive(Debug, Default, Clone)]
pub struct ReplayStore {
    records: Vec<ReplayRecord>,
}

impl ReplayStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append one record (validated).
    pub fn push(&mut self, record: ReplayRecord) -> Result<()> {
        record.validate()?;
        self.records.push(record);
        Ok(())
    }

    /// Append historical serve+reward records from a JSONL file.
    pub fn load_logs(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let file = File::open(path.as_ref())
            .map_err(|e| Error::Transient(format!("open {}: {e}", path.as_ref().display())))?;
        let mut loaded = 0usize;
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| Error::Transient(format!("read line {lineno}: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: ReplayRecord = serde_json::from_str(&line).map_err(|e| {
                Error::Configuration(format!("replay log line {}: {e}", lineno + 1))
            })?;
            self.push(record)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    fn sorted_records(&self) -> Vec<&ReplayRecord> {
        let mut records: Vec<&ReplayRecord> = self.records.iter().collect();
        records.sort_by(|a, b| a.at_ms.cmp(&b.at_ms).then_with(|| a.event_id.cmp(&b.event_id)));
        records
    }

    /// Pick the day-aligned contiguous window of at least `min_days` that
    /// maximizes event density × arm coverage. Ties prefer the earlier,
    /// shorter window. `None` when the store spans fewer than `min_days`.
    pub fn select_window(&self, min_days: i64) -> Option<ReplayWindow> {
        if self.records.is_empty() || min_days <= 0 {
            return None;
        }
        let records = self.sorted_records();
        let first_day = records.first()?.at_ms.div_euclid(MS_PER_DAY);
        let last_day = records.last()?.at_ms.div_euclid(MS_PER_DAY);
        let total_days = last_day - first_day + 1;
        if total_days < min_days {
            return None;
        }

        let mut all_arms: std::collections::BTreeSet<&str> = Default::default();
        for r in &records {
            all_arms.insert(r.logged_arm.as_str());
        }
        let total_arms = all_arms.len() as f64;

        let mut best: Option<(f64, ReplayWindow)> = None;
        for start_day in first_day..=(last_day - min_days + 1) {
            for end_day in (start_day + min_days)..=(last_day + 1) {
                let start_ms = start_day * MS_PER_DAY;
                let end_ms = end_day * MS_PER_DAY;
                let mut events = 0usize;
                let mut arms: std::collections::BTreeSet<&str> = Default::default();
                for r in &records {
                    if r.at_ms >= start_ms && r.at_ms < end_ms {
                        events += 1;
                        arms.insert(r.logged_arm.as_str());
                    }
                }
                if events == 0 {
                    continue;
                }
                let days = (end_day - start_day) as f64;
                let density = events as f64 / days;
                let coverage = arms.len() as f64 / total_arms;
                let score = density * coverage;
                let window = ReplayWindow {
                    start_ms,
                    end_ms,
                    events,
                    density_per_day: density,
                    arm_coverage: coverage,
                };
                let better = match &best {
                    None => true,
                    Some((best_score, _)) => score > *best_score + 1e-12,
                };
                if better {
                    best = Some((score, window));
                }
            }
        }
        best.map(|(_, w)| w)
    }

    /// Replay a candidate policy over a window with a fresh state.
    pub fn replay(
        &self,
        params: &PolicyParams,
        window: &ReplayWindow,
        cfg: &ReplayConfig,
    ) -> Result<ReplayMetrics> {
        params.validate()?;
        let records: Vec<&ReplayRecord> = self
            .sorted_records()
            .into_iter()
            .filter(|r| r.at_ms >= window.start_ms && r.at_ms < window.end_ms)
            .collect();

        // Reward model for DR and the regret baseline: per-arm mean of the
        // logged rewards in the window.
        let mut q_hat: BTreeMap<&str, (u64, f64)> = BTreeMap::new();
        for r in &records {
            let entry = q_hat.entry(r.logged_arm.as_str()).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += r.logged_reward;
        }
        let q = |arm: &str| -> f64 {
            q_hat
                .get(arm)
                .map(|(n, sum)| sum / (*n).max(1) as f64)
                .unwrap_or(0.0)
        };
        let best_mean = q_hat
            .values()
            .map(|(n, sum)| sum / (*n).max(1) as f64)
            .fold(0.0, f64::max);

        let recognized: Vec<&str> = cfg.context_keys.iter().map(String::as_str).collect();
        let priors = params.priors();
        let mut states: BTreeMap<String, StateView> = BTreeMap::new();

        let mut ips_sum = 0.0;
        let mut weight_sum = 0.0;
        let mut dr_sum = 0.0;
        let mut scored = 0usize;
        let mut skipped = 0usize;
        let mut update_errors = 0usize;
        let mut cumulative_regret = Vec::new();
        let mut regret = 0.0;
        let mut daily: BTreeMap<i64, (u64, f64)> = BTreeMap::new();

        for record in records {
            let mut candidates = record.candidates.clone();
            candidates.sort();
            candidates.dedup();
            if !candidates.iter().any(|c| c == &record.logged_arm) {
                skipped += 1;
                continue;
            }

            let ctx_key = if recognized.is_empty() {
                String::new()
            } else {
                record.context.context_key(&recognized)
            };
            let view = states.entry(ctx_key).or_default();

            let probs = action_probabilities(
                params,
                &candidates,
                view,
                stable_hash64(cfg.seed, &record.event_id),
            )?;
            let pi = probs.get(&record.logged_arm).copied().unwrap_or(0.0);
            let weight = pi / record.logged_propensity.max(cfg.p_min);
            let ips_term = record.logged_reward * weight;
            let dr_term = ips_term - (weight - 1.0) * q(&record.logged_arm);
            ips_sum += ips_term;
            weight_sum += weight;
            dr_sum += dr_term;
            scored += 1;

            // Learn from the logged outcome as if this policy had served it.
            let row = view
                .entry(record.logged_arm.clone())
                .or_insert_with(|| crate::ArmState::seeded(priors.0, priors.1));
            if policy_update(params, row, record.logged_reward, record.at_ms).is_err() {
                update_errors += 1;
            }

            // Regret of the policy's action distribution at this state
            // against the best-in-hindsight arm.
            let expected_quality: f64 = probs.iter().map(|(arm, p)| p * q(arm)).sum();
            regret += (best_mean - expected_quality).max(0.0);
            cumulative_regret.push(regret);

            let day = record.at_ms.div_euclid(MS_PER_DAY) * MS_PER_DAY;
            let entry = daily.entry(day).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += ips_term;
        }

        let n = scored.max(1) as f64;
        Ok(ReplayMetrics {
            events: scored,
            skipped,
            update_errors,
            ips: ips_sum / n,
            snips: if weight_sum > 0.0 {
                ips_sum / weight_sum
            } else {
                0.0
            },
            dr: dr_sum / n,
            cumulative_regret,
            daily_ips: daily
                .into_iter()
                .map(|(day, (count, sum))| (day, sum / count.max(1) as f64))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EGreedyParams, ThompsonParams};

    fn record(id: &str, day: i64, arm: &str, propensity: f64, reward: f64) -> ReplayRecord {
        ReplayRecord {
            event_id: id.to_string(),
            user_id: 1,
            at_ms: day * MS_PER_DAY + 1000,
            context: Context::new(),
            candidates: vec!["a".to_string(), "b".to_string()],
            logged_arm: arm.to_string(),
            logged_propensity: propensity,
            logged_reward: reward,
        }
    }

    fn seeded_store(days: i64, per_day: usize) -> ReplayStore {
        let mut store = ReplayStore::new();
        let mut i = 0usize;
        for day in 0..days {
            for _ in 0..per_day {
                // Arm "a" pays 1.0 a third of the time; arm "b" never does.
                let arm = if i % 2 == 0 { "a" } else { "b" };
                let reward = if arm == "a" && i % 3 == 0 { 1.0 } else { 0.0 };
                store
                    .push(record(&format!("e{i}"), day, arm, 0.5, reward))
                    .unwrap();
                i += 1;
            }
        }
        store
    }

    #[test]
    fn push_validates_records() {
        let mut store = ReplayStore::new();
        let mut bad = record("x", 0, "a", 0.0, 1.0);
        assert!(store.push(bad.clone()).is_err());
        bad.logged_propensity = 0.5;
        bad.candidates.clear();
        assert!(store.push(bad).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn select_window_requires_min_days() {
        let store = seeded_store(5, 10);
        assert!(store.select_window(14).is_none());
        let window = store.select_window(3).unwrap();
        assert!(window.days() >= 3);
        assert!(window.events > 0);
        assert!(window.arm_coverage > 0.0);
    }

    #[test]
    fn select_window_prefers_density() {
        let mut store = ReplayStore::new();
        // Sparse early days, dense late days.
        for day in 0..20i64 {
            let per_day = if day >= 14 { 30 } else { 2 };
            for j in 0..per_day {
                store
                    .push(record(&format!("e{day}-{j}"), day, "a", 0.5, 0.0))
                    .unwrap();
            }
        }
        let window = store.select_window(5).unwrap();
        assert!(
            window.start_ms >= 14 * MS_PER_DAY,
            "window should sit in the dense region, got start {}",
            window.start_ms
        );
    }

    #[test]
    fn replay_is_bit_reproducible() {
        let store = seeded_store(14, 20);
        let window = store.select_window(14).unwrap();
        let params = PolicyParams::Thompson(ThompsonParams::default());
        let cfg = ReplayConfig {
            seed: 9,
            ..Default::default()
        };
        let a = store.replay(&params, &window, &cfg).unwrap();
        let b = store.replay(&params, &window, &cfg).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.events, 14 * 20);
        assert_eq!(a.skipped, 0);
    }

    #[test]
    fn replay_favors_policy_that_finds_the_paying_arm() {
        let store = seeded_store(14, 30);
        let window = store.select_window(14).unwrap();
        let greedy = PolicyParams::EGreedy(EGreedyParams { epsilon: 0.05 });
        let cfg = ReplayConfig::default();
        let metrics = store.replay(&greedy, &window, &cfg).unwrap();
        // Logged value is the mixed mean; a learner that concentrates on "a"
        // should look better than the logger.
        let logged_mean: f64 = 1.0 / 6.0; // half the events on "a", a third of those pay
        assert!(
            metrics.ips > logged_mean,
            "ips {} not above logged mean {logged_mean}",
            metrics.ips
        );
        assert!(metrics.cumulative_regret.len() == metrics.events);
        // Regret is non-decreasing.
        for pair in metrics.cumulative_regret.windows(2) {
            assert!(pair[1] >= pair[0] - 1e-12);
        }
    }

    #[test]
    fn daily_curve_covers_window_days() {
        let store = seeded_store(7, 10);
        let window = store.select_window(7).unwrap();
        let params = PolicyParams::EGreedy(EGreedyParams::default());
        let metrics = store
            .replay(&params, &window, &ReplayConfig::default())
            .unwrap();
        assert_eq!(metrics.daily_ips.len(), 7);
        for pair in metrics.daily_ips.windows(2) {
            assert!(pair[1].0 > pair[0].0);
        }
    }
}
