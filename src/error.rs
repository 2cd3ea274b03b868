//! Crate error taxonomy.
//!
//! Errors fall into the classes the runtime treats differently:
//! configuration errors are rejected at admin time, transient errors are
//! retried locally, logic errors fail the affected call loudly, and the
//! attribution/state-conflict variants drive the idempotence rules of the
//! reward path. The serve pipeline itself never surfaces an error to the
//! caller for anything it can degrade around (it falls back to control).

use crate::experiment::ExperimentStatus;
use crate::reward::RewardKind;
use crate::EventId;

/// Any error produced by the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid traffic plan, salt, thresholds, or policy parameters.
    /// Rejected at admin time; never produced on the hot path.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Storage or queue I/O failure. Retried with backoff up to the call
    /// deadline before being surfaced.
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// The candidate arm set was empty after eligibility filtering.
    #[error("no eligible arm in candidate set")]
    NoEligibleArm,

    /// A policy kind that the engine does not recognize.
    #[error("unknown policy kind `{0}`")]
    UnknownPolicy(String),

    /// Corrupt sufficient statistics (e.g. non-positive Beta parameters).
    #[error("invalid policy state: {0}")]
    InvalidState(String),

    /// A reward write arrived after the attribution window froze the event.
    #[error("attribution window closed for event {0}")]
    AttributionClosed(EventId),

    /// Optimistic-concurrency conflict on a state row that persisted past
    /// the retry budget.
    #[error("state conflict on `{key}` after {attempts} attempts")]
    StateConflict { key: String, attempts: u32 },

    /// A referenced entity does not exist.
    #[error("{kind} `{id}` not found")]
    NotFound { kind: &'static str, id: String },

    /// No active experiment matched the requested surface.
    #[error("no active experiment for surface `{0}`")]
    NoActiveExperiment(String),

    /// The pinned arm catalog version is missing or empty.
    #[error("arm catalog unavailable for experiment `{0}`")]
    UnavailableArmCatalog(String),

    /// An experiment lifecycle transition that the state machine forbids.
    #[error("invalid experiment transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ExperimentStatus,
        to: ExperimentStatus,
    },

    /// A reward signal whose value is outside the per-kind range.
    #[error("signal value {value} out of range for {kind:?}")]
    SignalOutOfRange { kind: RewardKind, value: f64 },
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error should increment the guardrail error counters
    /// when it occurs on the serve path.
    pub fn is_serve_error(&self) -> bool {
        !matches!(self, Error::NoActiveExperiment(_))
    }
}
