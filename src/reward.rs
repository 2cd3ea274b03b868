//! Reward ingestion and windowed attribution.
//!
//! Downstream user signals (clicks, ratings, thumbs, custom) are ingested as
//! append-only reward events, then attributed to open serves within each
//! experiment's attribution window. Attribution **finalizes once**: the first
//! pass that finds a qualifying signal (or the pass that observes the window
//! closing) writes the reward through the store's CAS and enqueues exactly
//! one policy update on the `reward_updates` queue. Everything after that is
//! a no-op, and ingestion after the window close is rejected.
//!
//! Signal composition follows the experiment's `reward_mapping`, with the
//! priority explicit rating > thumbs > click. Within a kind, the latest
//! signal in the window wins.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    update as policy_update, Clock, Error, EventId, Result, RewardUpdate, ServeEvent, Store,
    UserId,
};

/// Kind of a downstream user signal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    Click,
    Rating,
    ThumbsUp,
    ThumbsDown,
    Custom,
}

impl RewardKind {
    /// Smallest variant in `Ord` order (for index range scans).
    pub const MIN: RewardKind = RewardKind::Click;
    /// Largest variant in `Ord` order (for index range scans).
    pub const MAX: RewardKind = RewardKind::Custom;

    /// Per-kind value range check, rejected at ingestion time.
    fn check_value(&self, value: f64) -> Result<()> {
        let ok = match self {
            RewardKind::Click => value == 0.0 || value == 1.0,
            RewardKind::Rating => value.is_finite() && (1.0..=5.0).contains(&value),
            RewardKind::ThumbsUp => value == 1.0,
            RewardKind::ThumbsDown => value == -1.0,
            RewardKind::Custom => value.is_finite(),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::SignalOutOfRange { kind: *self, value })
        }
    }
}

/// One ingested signal (append-only row).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RewardEventRow {
    /// Serve event this signal was ingested against, when known.
    pub event_ref: Option<EventId>,
    pub user_id: UserId,
    pub arm_id: String,
    pub kind: RewardKind,
    pub value: f64,
    pub at_ms: i64,
}

/// How signals compose into a scalar reward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RewardMapping {
    /// 1 if a click happened, else 0 at window close.
    BinaryClick,
    /// `clip((rating − 2.5) / 2.5, −1, 1)`; 0 at window close without one.
    ScaledRating,
    /// Priority rating > thumbs > click; 0 at window close without any.
    #[default]
    Composite,
}

/// Map a 1–5 rating onto `[−1, 1]` centered at 2.5.
pub fn scaled_rating(rating: f64) -> f64 {
    ((rating - 2.5) / 2.5).clamp(-1.0, 1.0)
}

/// Compose a reward from the signals inside one event's window.
///
/// `None` means no qualifying signal yet (the event stays open until the
/// window closes it to 0).
pub fn compose_reward(mapping: RewardMapping, signals: &[RewardEventRow]) -> Option<f64> {
    let latest = |kind: RewardKind| {
        signals
            .iter()
            .filter(|s| s.kind == kind)
            .max_by_key(|s| s.at_ms)
    };
    let latest_thumbs = || {
        signals
            .iter()
            .filter(|s| matches!(s.kind, RewardKind::ThumbsUp | RewardKind::ThumbsDown))
            .max_by_key(|s| s.at_ms)
    };

    match mapping {
        RewardMapping::BinaryClick => latest(RewardKind::Click).map(|s| s.value),
        RewardMapping::ScaledRating => latest(RewardKind::Rating).map(|s| scaled_rating(s.value)),
        RewardMapping::Composite => {
            if let Some(rating) = latest(RewardKind::Rating) {
                return Some(scaled_rating(rating.value));
            }
            if let Some(thumbs) = latest_thumbs() {
                return Some(if thumbs.kind == RewardKind::ThumbsUp {
                    1.0
                } else {
                    0.0
                });
            }
            if let Some(click) = latest(RewardKind::Click) {
                return Some(click.value);
            }
            latest(RewardKind::Custom).map(|s| s.value)
        }
    }
}

/// What an ingested signal is addressed to.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestTarget {
    /// A specific serve event (window-checked at ingestion).
    Event(EventId),
    /// A (user, arm) pair at a given instant; attribution matches it to any
    /// open serve whose window contains it.
    UserArm {
        user_id: UserId,
        arm_id: String,
        at_ms: i64,
    },
}

/// Attributor tuning.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AttributorConfig {
    /// Delivery attempts per queued policy update before it is dropped.
    pub max_attempts: u32,
}

impl Default for AttributorConfig {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

/// Outcome of one attribution pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttributionReport {
    /// Events finalized from a qualifying signal.
    pub finalized: usize,
    /// Events finalized to 0 because their window closed without a signal.
    pub closed_zero: usize,
    /// Policy updates pushed onto the `reward_updates` queue.
    pub updates_enqueued: usize,
}

/// Windowed, idempotent reward attribution service.
pub struct RewardAttributor {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    cfg: AttributorConfig,
}

impl RewardAttributor {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(store, clock, AttributorConfig::default())
    }

    pub fn with_config(store: Arc<Store>, clock: Arc<dyn Clock>, cfg: AttributorConfig) -> Self {
        Self { store, clock, cfg }
    }

    /// Ingest one signal. Returns whether a new row was recorded (repeats of
    /// an identical signal are no-ops). Event-addressed signals are rejected
    /// once the event's attribution window has closed.
    pub fn ingest(&self, target: IngestTarget, kind: RewardKind, value: f64) -> Result<bool> {
        kind.check_value(value)?;
        let now = self.clock.now_ms();
        let row = match target {
            IngestTarget::Event(event_id) => {
                let event = self.store.event(&event_id).ok_or_else(|| Error::NotFound {
                    kind: "serve event",
                    id: event_id.to_string(),
                })?;
                let window_ms = self.window_for(&event);
                if now > event.served_at_ms + window_ms {
                    return Err(Error::AttributionClosed(event_id));
                }
                RewardEventRow {
                    event_ref: Some(event_id),
                    user_id: event.user_id,
                    arm_id: event.arm_id,
                    kind,
                    value,
                    at_ms: now,
                }
            }
            IngestTarget::UserArm {
                user_id,
                arm_id,
                at_ms,
            } => RewardEventRow {
                event_ref: None,
                user_id,
                arm_id,
                kind,
                value,
                at_ms,
            },
        };
        Ok(self.store.record_signal(row))
    }

    fn window_for(&self, event: &ServeEvent) -> i64 {
        self.store
            .experiment(&event.experiment_id)
            .map(|e| e.config.attribution_window_ms)
            .unwrap_or(24 * 60 * 60 * 1000)
    }

    /// One attribution pass over every experiment's open events.
    ///
    /// Driven entirely by `(event_id)`, so re-running is idempotent: events
    /// already finalized are skipped by the CAS, and an event whose composed
    /// value would not change produces no new write.
    pub fn run_once(&self) -> AttributionReport {
        let now = self.clock.now_ms();
        let mut report = AttributionReport::default();

        for experiment in self.store.experiments() {
            let window_ms = experiment.config.attribution_window_ms;
            let mapping = experiment.config.reward_mapping;
            for event in self
                .store
                .events_pending_attribution(&experiment.id, now + 1)
            {
                let window_end = event.served_at_ms + window_ms;
                let signals = self.store.signals_for(
                    event.user_id,
                    &event.arm_id,
                    event.served_at_ms,
                    window_end.min(now),
                );
                if let Some(reward) = compose_reward(mapping, &signals) {
                    if self.finalize(&event, reward, now) {
                        report.finalized += 1;
                        report.updates_enqueued += 1;
                    }
                } else if now > window_end {
                    // Window closed with nothing qualifying: freeze at 0.
                    if self.finalize(&event, 0.0, now) {
                        report.closed_zero += 1;
                        report.updates_enqueued += 1;
                    }
                }
            }
        }
        report
    }

    fn finalize(&self, event: &ServeEvent, reward: f64, now_ms: i64) -> bool {
        match self.store.finalize_reward(&event.event_id, reward, now_ms) {
            Ok(true) => {
                let context_key = self
                    .store
                    .policy(&event.policy_id)
                    .map(|p| p.context_key(&event.context))
                    .unwrap_or_default();
                self.store.enqueue_reward_update(RewardUpdate {
                    key: crate::StateKey::new(
                        event.experiment_id.clone(),
                        event.policy_id.clone(),
                        event.arm_id.clone(),
                        context_key,
                    ),
                    event_id: event.event_id.clone(),
                    reward,
                    attempts: 0,
                });
                debug!(event = %event.event_id, reward, "reward finalized");
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(event = %event.event_id, error = %e, "reward finalize failed");
                false
            }
        }
    }

    /// Drain up to `max` queued policy updates into state rows.
    ///
    /// Updates for one key apply through that row's single-writer lane;
    /// failed deliveries are requeued up to the retry budget, then dropped
    /// with a warning (the guardrail monitor sees the error counter through
    /// the event rows).
    pub fn drain_updates(&self, max: usize) -> usize {
        let now = self.clock.now_ms();
        let mut applied = 0usize;
        for _ in 0..max {
            let Some(mut update) = self.store.dequeue_reward_update() else {
                break;
            };
            let Some(policy) = self.store.policy(&update.key.policy_id) else {
                warn!(key = %update.key, "dropping update for unknown policy");
                continue;
            };
            let priors = policy.params.priors();
            let result = self.store.update_state(&update.key, priors, |row| {
                policy_update(&policy.params, row, update.reward, now)
            });
            match result {
                Ok(_) => applied += 1,
                Err(e) => {
                    update.attempts += 1;
                    if update.attempts < self.cfg.max_attempts {
                        self.store.requeue_reward_update(update);
                    } else {
                        warn!(
                            key = %update.key,
                            event = %update.event_id,
                            attempts = update.attempts,
                            error = %e,
                            "dropping reward update after retry budget"
                        );
                    }
                }
            }
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(kind: RewardKind, value: f64, at_ms: i64) -> RewardEventRow {
        RewardEventRow {
            event_ref: None,
            user_id: 1,
            arm_id: "a".to_string(),
            kind,
            value,
            at_ms,
        }
    }

    #[test]
    fn rating_boundaries_map_as_specified() {
        assert_eq!(scaled_rating(2.5), 0.0);
        assert_eq!(scaled_rating(5.0), 1.0);
        assert_eq!(scaled_rating(1.0), -0.6);
        // Values past the scale clip.
        assert_eq!(scaled_rating(0.0), -1.0);
    }

    #[test]
    fn composite_priority_rating_over_thumbs_over_click() {
        let all = vec![
            signal(RewardKind::Click, 1.0, 10),
            signal(RewardKind::ThumbsDown, -1.0, 20),
            signal(RewardKind::Rating, 5.0, 30),
        ];
        assert_eq!(compose_reward(RewardMapping::Composite, &all), Some(1.0));

        let thumbs_click = vec![
            signal(RewardKind::Click, 1.0, 10),
            signal(RewardKind::ThumbsUp, 1.0, 20),
        ];
        assert_eq!(
            compose_reward(RewardMapping::Composite, &thumbs_click),
            Some(1.0)
        );

        let click_only = vec![signal(RewardKind::Click, 1.0, 10)];
        assert_eq!(
            compose_reward(RewardMapping::Composite, &click_only),
            Some(1.0)
        );

        let down_only = vec![signal(RewardKind::ThumbsDown, -1.0, 10)];
        assert_eq!(
            compose_reward(RewardMapping::Composite, &down_only),
            Some(0.0)
        );
    }

    #[test]
    fn latest_signal_wins_within_a_kind() {
        let ratings = vec![
            signal(RewardKind::Rating, 5.0, 10),
            signal(RewardKind::Rating, 1.0, 20),
        ];
        assert_eq!(
            compose_reward(RewardMapping::Composite, &ratings),
            Some(scaled_rating(1.0))
        );
    }

    #[test]
    fn binary_click_ignores_other_kinds() {
        let signals = vec![signal(RewardKind::Rating, 5.0, 10)];
        assert_eq!(compose_reward(RewardMapping::BinaryClick, &signals), None);
        let with_click = vec![
            signal(RewardKind::Rating, 1.0, 10),
            signal(RewardKind::Click, 1.0, 20),
        ];
        assert_eq!(
            compose_reward(RewardMapping::BinaryClick, &with_click),
            Some(1.0)
        );
    }

    #[test]
    fn no_signals_compose_to_none() {
        assert_eq!(compose_reward(RewardMapping::Composite, &[]), None);
        assert_eq!(compose_reward(RewardMapping::ScaledRating, &[]), None);
    }

    #[test]
    fn value_ranges_enforced_per_kind() {
        assert!(RewardKind::Click.check_value(1.0).is_ok());
        assert!(RewardKind::Click.check_value(0.5).is_err());
        assert!(RewardKind::Rating.check_value(3.5).is_ok());
        assert!(RewardKind::Rating.check_value(0.5).is_err());
        assert!(RewardKind::Rating.check_value(5.5).is_err());
        assert!(RewardKind::ThumbsUp.check_value(1.0).is_ok());
        assert!(RewardKind::ThumbsUp.check_value(-1.0).is_err());
        assert!(RewardKind::ThumbsDown.check_value(-1.0).is_ok());
        assert!(RewardKind::Custom.check_value(f64::NAN).is_err());
    }
}
