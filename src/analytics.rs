//! Read-only analytics over the store: summaries, timeseries, arm and cohort
//! breakdowns, filtered event pages, guardrail history, and CSV/JSONL export.
//!
//! Everything here is a pure read of the storage tables; the functions take a
//! `&Store` rather than owning a service handle.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use crate::{
    percentile, ArmState, Error, EventId, ExperimentId, ExperimentStatus, PolicyId, PolicyKind,
    Result, ServeEvent, StateKey, Store,
};

/// Metrics the timeseries endpoint can aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Reward,
    LatencyP95,
    Serves,
    Ctr,
}

/// Bucket width for timeseries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hour,
    Day,
}

impl Granularity {
    fn bucket_ms(&self) -> i64 {
        match self {
            Granularity::Hour => 60 * 60 * 1000,
            Granularity::Day => 24 * 60 * 60 * 1000,
        }
    }
}

/// Per-policy slice of an experiment summary.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PolicySummary {
    pub policy_id: PolicyId,
    pub kind: PolicyKind,
    pub serves: u64,
    pub finalized: u64,
    pub mean_reward: f64,
    /// Share of finalized serves with a strictly positive reward.
    pub ctr: f64,
}

/// Aggregate view of one experiment.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExperimentSummary {
    pub experiment_id: ExperimentId,
    pub name: String,
    pub status: ExperimentStatus,
    pub start_at_ms: Option<i64>,
    pub serves: u64,
    pub distinct_users: u64,
    pub assignments: u64,
    pub policies: Vec<PolicySummary>,
}

fn experiment_events(store: &Store, id: &ExperimentId) -> Result<Vec<ServeEvent>> {
    if store.experiment(id).is_none() {
        return Err(Error::NotFound {
            kind: "experiment",
            id: id.to_string(),
        });
    }
    Ok(store.events_in_window(id, i64::MIN, i64::MAX))
}

/// `Summary(experiment_id)`.
pub fn summary(store: &Store, id: &ExperimentId) -> Result<ExperimentSummary> {
    let experiment = store.experiment(id).ok_or_else(|| Error::NotFound {
        kind: "experiment",
        id: id.to_string(),
    })?;
    let events = store.events_in_window(id, i64::MIN, i64::MAX);
    let users: BTreeSet<u64> = events.iter().map(|e| e.user_id).collect();

    let mut policies = Vec::new();
    for policy in store.policies_of(id) {
        let mine: Vec<&ServeEvent> = events.iter().filter(|e| e.policy_id == policy.id).collect();
        let finalized: Vec<f64> = mine.iter().filter_map(|e| e.reward).collect();
        let mean = if finalized.is_empty() {
            0.0
        } else {
            finalized.iter().sum::<f64>() / finalized.len() as f64
        };
        let positive = finalized.iter().filter(|&&r| r > 0.0).count();
        policies.push(PolicySummary {
            policy_id: policy.id.clone(),
            kind: policy.kind(),
            serves: mine.len() as u64,
            finalized: finalized.len() as u64,
            mean_reward: mean,
            ctr: if finalized.is_empty() {
                0.0
            } else {
                positive as f64 / finalized.len() as f64
            },
        });
    }

    Ok(ExperimentSummary {
        experiment_id: id.clone(),
        name: experiment.name,
        status: experiment.status,
        start_at_ms: experiment.start_at_ms,
        serves: events.len() as u64,
        distinct_users: users.len() as u64,
        assignments: store.assignment_count(id) as u64,
        policies,
    })
}

/// `Timeseries(experiment_id, metric, granularity)`: (bucket start, value)
/// pairs in time order. Buckets with no serves are omitted.
pub fn timeseries(
    store: &Store,
    id: &ExperimentId,
    metric: Metric,
    granularity: Granularity,
) -> Result<Vec<(i64, f64)>> {
    let events = experiment_events(store, id)?;
    let width = granularity.bucket_ms();
    let mut buckets: BTreeMap<i64, Vec<&ServeEvent>> = BTreeMap::new();
    for e in &events {
        buckets
            .entry(e.served_at_ms.div_euclid(width) * width)
            .or_default()
            .push(e);
    }
    Ok(buckets
        .into_iter()
        .map(|(start, bucket)| {
            let value = match metric {
                Metric::Serves => bucket.len() as f64,
                Metric::LatencyP95 => {
                    let lat: Vec<f64> = bucket.iter().map(|e| e.latency_ms as f64).collect();
                    percentile(&lat, 0.95)
                }
                Metric::Reward => {
                    let rewards: Vec<f64> = bucket.iter().filter_map(|e| e.reward).collect();
                    if rewards.is_empty() {
                        0.0
                    } else {
                        rewards.iter().sum::<f64>() / rewards.len() as f64
                    }
                }
                Metric::Ctr => {
                    let rewards: Vec<f64> = bucket.iter().filter_map(|e| e.reward).collect();
                    if rewards.is_empty() {
                        0.0
                    } else {
                        rewards.iter().filter(|&&r| r > 0.0).count() as f64
                            / rewards.len() as f64
                    }
                }
            };
            (start, value)
        })
        .collect())
}

/// Sort order for the arms endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmSort {
    Serves,
    MeanReward,
    ArmId,
}

/// Posterior statistics surfaced for Thompson states.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PosteriorStats {
    pub mean: f64,
    pub variance: f64,
    pub interval95: (f64, f64),
}

/// One row of the arms endpoint.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ArmRow {
    pub arm_id: String,
    pub serves: u64,
    pub finalized: u64,
    pub mean_reward: f64,
    /// Present when a Thompson policy holds state for this arm.
    pub posterior: Option<PosteriorStats>,
}

/// `Arms(experiment_id, sort, limit)`.
pub fn arms(
    store: &Store,
    id: &ExperimentId,
    sort: ArmSort,
    limit: usize,
) -> Result<Vec<ArmRow>> {
    let events = experiment_events(store, id)?;
    let thompson_policy = store
        .policies_of(id)
        .into_iter()
        .find(|p| p.kind() == PolicyKind::Thompson);

    let mut per_arm: BTreeMap<String, (u64, u64, f64)> = BTreeMap::new();
    for e in &events {
        let entry = per_arm.entry(e.arm_id.clone()).or_insert((0, 0, 0.0));
        entry.0 += 1;
        if let Some(r) = e.reward {
            entry.1 += 1;
            entry.2 += r;
        }
    }

    let posterior_of = |arm: &str| -> Option<PosteriorStats> {
        let policy = thompson_policy.as_ref()?;
        let row: ArmState =
            store.state_row(&StateKey::new(id.clone(), policy.id.clone(), arm, ""))?;
        Some(PosteriorStats {
            mean: row.posterior_mean(),
            variance: row.posterior_variance(),
            interval95: row.posterior_interval95(),
        })
    };

    let mut rows: Vec<ArmRow> = per_arm
        .into_iter()
        .map(|(arm_id, (serves, finalized, reward_sum))| ArmRow {
            posterior: posterior_of(&arm_id),
            mean_reward: if finalized == 0 {
                0.0
            } else {
                reward_sum / finalized as f64
            },
            arm_id,
            serves,
            finalized,
        })
        .collect();

    match sort {
        ArmSort::Serves => rows.sort_by(|a, b| {
            b.serves
                .cmp(&a.serves)
                .then_with(|| a.arm_id.cmp(&b.arm_id))
        }),
        ArmSort::MeanReward => rows.sort_by(|a, b| {
            b.mean_reward
                .total_cmp(&a.mean_reward)
                .then_with(|| a.arm_id.cmp(&b.arm_id))
        }),
        ArmSort::ArmId => rows.sort_by(|a, b| a.arm_id.cmp(&b.arm_id)),
    }
    rows.truncate(limit.max(1));
    Ok(rows)
}

/// One cohort of the breakdown endpoint.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CohortRow {
    /// Context value of the breakdown key ("unknown" when absent).
    pub value: String,
    pub serves: u64,
    pub finalized: u64,
    pub mean_reward: f64,
}

/// `Cohorts(experiment_id, breakdown)`: events grouped by a context key.
pub fn cohorts(store: &Store, id: &ExperimentId, breakdown: &str) -> Result<Vec<CohortRow>> {
    let events = experiment_events(store, id)?;
    let mut groups: BTreeMap<String, (u64, u64, f64)> = BTreeMap::new();
    for e in &events {
        let value = e
            .context
            .get(breakdown)
            .unwrap_or("unknown")
            .to_string();
        let entry = groups.entry(value).or_insert((0, 0, 0.0));
        entry.0 += 1;
        if let Some(r) = e.reward {
            entry.1 += 1;
            entry.2 += r;
        }
    }
    Ok(groups
        .into_iter()
        .map(|(value, (serves, finalized, reward_sum))| CohortRow {
            value,
            serves,
            finalized,
            mean_reward: if finalized == 0 {
                0.0
            } else {
                reward_sum / finalized as f64
            },
        })
        .collect())
}

/// Event filter for the paged events endpoint.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EventFilter {
    pub policy_id: Option<PolicyId>,
    pub arm_id: Option<String>,
    /// `Some(true)` keeps only finalized events, `Some(false)` only open ones.
    pub rewarded: Option<bool>,
    pub from_ms: Option<i64>,
    pub to_ms: Option<i64>,
}

impl EventFilter {
    fn matches(&self, e: &ServeEvent) -> bool {
        if let Some(policy) = &self.policy_id {
            if &e.policy_id != policy {
                return false;
            }
        }
        if let Some(arm) = &self.arm_id {
            if &e.arm_id != arm {
                return false;
            }
        }
        if let Some(rewarded) = self.rewarded {
            if e.reward.is_some() != rewarded {
                return false;
            }
        }
        if let Some(from) = self.from_ms {
            if e.served_at_ms < from {
                return false;
            }
        }
        if let Some(to) = self.to_ms {
            if e.served_at_ms >= to {
                return false;
            }
        }
        true
    }
}

/// A page request (offset/limit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// `Events(experiment_id, filter, page)`, in serve-time order.
pub fn events(
    store: &Store,
    id: &ExperimentId,
    filter: &EventFilter,
    page: Page,
) -> Result<Vec<ServeEvent>> {
    let events = experiment_events(store, id)?;
    Ok(events
        .into_iter()
        .filter(|e| filter.matches(e))
        .skip(page.offset)
        .take(page.limit.max(1))
        .collect())
}

/// `Guardrails(experiment_id)`: the append-only check history.
pub fn guardrails(store: &Store, id: &ExperimentId) -> Result<Vec<crate::GuardrailCheckRow>> {
    if store.experiment(id).is_none() {
        return Err(Error::NotFound {
            kind: "experiment",
            id: id.to_string(),
        });
    }
    Ok(store.guardrail_checks_of(id))
}

/// Export format for the events dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Csv,
    Jsonl,
}

/// `Export(experiment_id, format)`: stream every serve event to `out`.
/// Returns the number of rows written.
pub fn export(
    store: &Store,
    id: &ExperimentId,
    format: ExportFormat,
    out: &mut impl Write,
) -> Result<usize> {
    let events = experiment_events(store, id)?;
    let io_err = |e: std::io::Error| Error::Transient(format!("export write: {e}"));
    match format {
        ExportFormat::Jsonl => {
            for event in &events {
                let line = serde_json::to_string(event)
                    .map_err(|e| Error::Transient(format!("export encode: {e}")))?;
                writeln!(out, "{line}").map_err(io_err)?;
            }
        }
        ExportFormat::Csv => {
            writeln!(
                out,
                "schema_version,event_id,experiment_id,user_id,policy_id,arm_id,position,\
                 propensity,score,latency_ms,served_at_ms,reward,reward_at_ms,\
                 attribution_version,policy_timeout,error,dropped"
            )
            .map_err(io_err)?;
            for e in &events {
                writeln!(
                    out,
                    "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
                    e.schema_version,
                    e.event_id,
                    e.experiment_id,
                    e.user_id,
                    e.policy_id,
                    e.arm_id,
                    e.position,
                    e.propensity,
                    e.score,
                    e.latency_ms,
                    e.served_at_ms,
                    e.reward.map(|r| r.to_string()).unwrap_or_default(),
                    e.reward_at_ms.map(|t| t.to_string()).unwrap_or_default(),
                    e.attribution_version,
                    e.policy_timeout,
                    e.error,
                    e.dropped,
                )
                .map_err(io_err)?;
            }
        }
    }
    Ok(events.len())
}

/// Reward distribution statistics with optional policy/arm filters.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RewardStats {
    pub count: u64,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    /// Share of rewards strictly above zero.
    pub positive_rate: f64,
}

/// Reward statistics over finalized events.
pub fn reward_stats(
    store: &Store,
    id: &ExperimentId,
    policy_id: Option<&PolicyId>,
    arm_id: Option<&str>,
) -> Result<RewardStats> {
    let events = experiment_events(store, id)?;
    let rewards: Vec<f64> = events
        .iter()
        .filter(|e| policy_id.map(|p| &e.policy_id == p).unwrap_or(true))
        .filter(|e| arm_id.map(|a| e.arm_id == a).unwrap_or(true))
        .filter_map(|e| e.reward)
        .collect();
    if rewards.is_empty() {
        return Ok(RewardStats {
            count: 0,
            mean: 0.0,
            std_dev: 0.0,
            min: 0.0,
            max: 0.0,
            positive_rate: 0.0,
        });
    }
    let w: crate::Welford = rewards.iter().copied().collect();
    Ok(RewardStats {
        count: w.count(),
        mean: w.mean(),
        std_dev: w.std_dev(),
        min: rewards.iter().copied().fold(f64::INFINITY, f64::min),
        max: rewards.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        positive_rate: rewards.iter().filter(|&&r| r > 0.0).count() as f64
            / rewards.len() as f64,
    })
}

/// Resolve an event by id (host-facing convenience for reward ingestion).
pub fn event(store: &Store, event_id: &EventId) -> Option<ServeEvent> {
    store.event(event_id)
}
