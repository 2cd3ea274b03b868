//! `bandix`: a multi-armed bandit experimentation runtime for online recommenders.
//!
//! Given a stream of recommendation requests tagged with a user identity and a
//! context, the runtime:
//!
//! - assigns each request to a policy according to an experiment's traffic plan
//!   (deterministic, sticky under ramp-up),
//! - has that policy choose an **arm** under an exploration/exploitation
//!   strategy, emitting an exact **propensity** for off-policy evaluation,
//! - logs the serve with latency and propensity,
//! - attributes a **reward** to the serve from downstream user signals within a
//!   bounded attribution window (idempotent, write-once),
//! - updates per-(experiment, policy, arm, context) sufficient statistics
//!   online through a single-writer lane per key,
//! - enforces safety **guardrails** that can auto-rollback, and
//! - periodically emits a **ship / iterate / kill** decision from IPS/DR
//!   off-policy estimates and significance tests.
//!
//! An offline **replay** path reuses the same policy code on logged historical
//! events so policies can be compared before an online launch.
//!
//! Goals:
//! - **Deterministic by default**: every stochastic path is seedable; same
//!   state + config + seed → same choice.
//! - **Honest propensities**: each logged propensity is the probability the
//!   policy would have emitted that arm over the candidate set at that state.
//! - **Restart-safe**: policy state lives in storage rows, not process memory;
//!   assignment is a pure function of (salt, user).
//!
//! Non-goals:
//! - No recommendation model training, no HTTP surface, no dashboards. Arms
//!   are opaque identifiers behind a uniform interface.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

mod error;
pub use error::*;

mod stable_hash;
pub use stable_hash::*;

mod state;
pub use state::*;

mod policy;
pub use policy::*;

mod thompson;
pub use thompson::*;

mod egreedy;
pub use egreedy::*;

mod ucb;
pub use ucb::*;

mod control;
pub use control::*;

mod assign;
pub use assign::*;

mod catalog;
pub use catalog::*;

mod experiment;
pub use experiment::*;

mod store;
pub use store::*;

mod serve;
pub use serve::*;

mod reward;
pub use reward::*;

mod stats;
pub use stats::*;

mod guardrail;
pub use guardrail::*;

mod decision;
pub use decision::*;

mod replay;
pub use replay::*;

mod analytics;
pub use analytics::*;

pub const BANDIX_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Schema version stamped on every appended serve event row.
pub const SERVE_EVENT_SCHEMA_VERSION: u32 = 1;

/// Stable user identity. Anonymous users must be given a persisted opaque id
/// by the host before entering experiments; requests without one bypass
/// experimentation entirely.
pub type UserId = u64;

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

opaque_id!(
    /// Opaque experiment identifier.
    ExperimentId
);
opaque_id!(
    /// Opaque policy identifier (unique across experiments).
    PolicyId
);
opaque_id!(
    /// Opaque serve-event identifier; minted once per returned slot.
    EventId
);

/// Request context: a small key/value map with a declared recognized-key list.
///
/// Unknown keys are carried through for logging but ignored when deriving the
/// state `context_key`, so adding instrumentation keys never fragments policy
/// state.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Context {
    entries: BTreeMap<String, String>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from key/value pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Derive the state-partitioning key from the recognized keys present.
    ///
    /// Returns the empty string when no recognized key is present (the
    /// non-contextual state row). The key is a stable 16-hex-digit hash of the
    /// sorted recognized entries, so equal contexts map to equal rows across
    /// restarts and hosts.
    pub fn context_key(&self, recognized: &[&str]) -> String {
        let mut material = String::new();
        for k in recognized {
            if let Some(v) = self.entries.get(*k) {
                material.push_str(k);
                material.push('=');
                material.push_str(v);
                material.push(';');
            }
        }
        if material.is_empty() {
            return String::new();
        }
        format!("{:016x}", stable_hash64(0, &material))
    }
}

/// Wall-clock service. Passed explicitly so tests and replay can drive time;
/// there is no ambient global.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for tests and deterministic harnesses.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn at(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_key_ignores_unrecognized_keys() {
        let mut a = Context::new();
        a.insert("hour", "20");
        a.insert("trace_id", "abc123");
        let mut b = Context::new();
        b.insert("hour", "20");
        b.insert("trace_id", "zzz999");
        assert_eq!(a.context_key(&["hour"]), b.context_key(&["hour"]));
    }

    #[test]
    fn context_key_empty_when_no_recognized_key_present() {
        let mut c = Context::new();
        c.insert("trace_id", "abc");
        assert_eq!(c.context_key(&["hour"]), "");
        assert_eq!(Context::new().context_key(&["hour"]), "");
    }

    #[test]
    fn context_key_distinguishes_values() {
        let a = Context::from_pairs([("hour", "20")]);
        let b = Context::from_pairs([("hour", "21")]);
        assert_ne!(a.context_key(&["hour"]), b.context_key(&["hour"]));
    }

    #[test]
    fn manual_clock_advances() {
        let c = ManualClock::at(100);
        c.advance(50);
        assert_eq!(c.now_ms(), 150);
        c.set(7);
        assert_eq!(c.now_ms(), 7);
    }
}
