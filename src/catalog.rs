//! Versioned arm catalogs.
//!
//! An experiment pins one catalog version for its whole life, so every serve
//! and every replayed event agrees on the candidate universe. Arms carry
//! opaque metadata and optional eligibility windows; the eligible set at a
//! given instant is emitted in stable `arm_id` order, which is the order every
//! policy's tie-breaking assumes.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::{Error, ExperimentId, Result};

/// One arm in a catalog version.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ArmEntry {
    /// Stable identifier, unique within the catalog version.
    pub arm_id: String,
    /// Opaque host metadata (model name, variant tag, ...).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Earliest instant this arm may be served (epoch ms).
    #[serde(default)]
    pub eligible_from_ms: Option<i64>,
    /// Latest instant this arm may be served (epoch ms, exclusive).
    #[serde(default)]
    pub eligible_until_ms: Option<i64>,
}

impl ArmEntry {
    pub fn new(arm_id: impl Into<String>) -> Self {
        Self {
            arm_id: arm_id.into(),
            metadata: BTreeMap::new(),
            eligible_from_ms: None,
            eligible_until_ms: None,
        }
    }

    fn eligible_at(&self, now_ms: i64) -> bool {
        if let Some(from) = self.eligible_from_ms {
            if now_ms < from {
                return false;
            }
        }
        if let Some(until) = self.eligible_until_ms {
            if now_ms >= until {
                return false;
            }
        }
        true
    }
}

/// One immutable catalog version for an experiment.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ArmCatalog {
    pub experiment_id: ExperimentId,
    pub version: u64,
    pub arms: Vec<ArmEntry>,
}

impl ArmCatalog {
    /// Build and validate a catalog (non-empty, unique arm ids).
    pub fn new(
        experiment_id: impl Into<ExperimentId>,
        version: u64,
        arms: Vec<ArmEntry>,
    ) -> Result<Self> {
        let catalog = Self {
            experiment_id: experiment_id.into(),
            version,
            arms,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Convenience constructor for plain arm-id lists.
    pub fn from_ids<I, S>(
        experiment_id: impl Into<ExperimentId>,
        version: u64,
        ids: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            experiment_id,
            version,
            ids.into_iter().map(|s| ArmEntry::new(s.into())).collect(),
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.arms.is_empty() {
            return Err(Error::Configuration(format!(
                "catalog v{} for {} has no arms",
                self.version, self.experiment_id
            )));
        }
        let mut seen = BTreeSet::new();
        for arm in &self.arms {
            if arm.arm_id.is_empty() {
                return Err(Error::Configuration("empty arm_id in catalog".to_string()));
            }
            if !seen.insert(arm.arm_id.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate arm_id `{}` in catalog v{}",
                    arm.arm_id, self.version
                )));
            }
        }
        Ok(())
    }

    /// All arm ids in stable order.
    pub fn arm_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.arms.iter().map(|a| a.arm_id.clone()).collect();
        ids.sort();
        ids
    }

    /// Arm ids eligible at `now_ms`, in stable order.
    pub fn eligible_ids(&self, now_ms: i64) -> Vec<String> {
        let mut ids: Vec<String> = self
            .arms
            .iter()
            .filter(|a| a.eligible_at(now_ms))
            .map(|a| a.arm_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, arm_id: &str) -> bool {
        self.arms.iter().any(|a| a.arm_id == arm_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_and_empty_ids() {
        assert!(ArmCatalog::from_ids("e1", 1, ["a", "a"]).is_err());
        assert!(ArmCatalog::from_ids("e1", 1, [""]).is_err());
        assert!(ArmCatalog::from_ids("e1", 1, Vec::<String>::new()).is_err());
    }

    #[test]
    fn eligible_ids_sorted_and_windowed() {
        let mut late = ArmEntry::new("b-late");
        late.eligible_from_ms = Some(1000);
        let mut expired = ArmEntry::new("c-expired");
        expired.eligible_until_ms = Some(500);
        let catalog = ArmCatalog::new(
            "e1",
            1,
            vec![ArmEntry::new("z"), ArmEntry::new("a"), late, expired],
        )
        .unwrap();

        assert_eq!(catalog.eligible_ids(600), vec!["a", "z"]);
        assert_eq!(catalog.eligible_ids(1500), vec!["a", "b-late", "z"]);
        assert_eq!(catalog.eligible_ids(0), vec!["a", "c-expired", "z"]);
    }

    #[test]
    fn until_bound_is_exclusive() {
        let mut arm = ArmEntry::new("a");
        arm.eligible_until_ms = Some(100);
        let catalog = ArmCatalog::new("e1", 1, vec![arm]).unwrap();
        assert_eq!(catalog.eligible_ids(99).len(), 1);
        assert!(catalog.eligible_ids(100).is_empty());
    }
}
