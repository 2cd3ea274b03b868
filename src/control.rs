//! Deterministic control policy.
//!
//! The control arm anchors every comparison in the runtime: guardrails
//! measure reward drop against it, and the decision engine reports uplift
//! relative to it. It is a stateless delegate to whatever the host treats as
//! the incumbent ranker: either a pinned `arm_id`, or the first candidate in
//! stable order.
//!
//! Its propensity is exactly 1 on the arm it returns.

use std::collections::BTreeMap;

use crate::{Error, Result, Selection};

/// Parameters for the control policy.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ControlParams {
    /// Arm to always serve. When `None`, or when the pinned arm is not in the
    /// candidate set, the first candidate in stable order is served instead.
    pub arm_id: Option<String>,
}

impl ControlParams {
    pub fn validate(&self) -> Result<()> {
        if let Some(arm) = &self.arm_id {
            if arm.is_empty() {
                return Err(Error::Configuration(
                    "control arm_id must be non-empty when set".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn resolve(&self, candidates: &[String]) -> Result<String> {
        if candidates.is_empty() {
            return Err(Error::NoEligibleArm);
        }
        if let Some(arm) = &self.arm_id {
            if candidates.iter().any(|c| c == arm) {
                return Ok(arm.clone());
            }
        }
        Ok(candidates[0].clone())
    }
}

/// Selection probabilities: all mass on the resolved arm.
pub fn control_probabilities(
    p: &ControlParams,
    candidates: &[String],
) -> Result<BTreeMap<String, f64>> {
    let chosen = p.resolve(candidates)?;
    Ok(candidates
        .iter()
        .map(|arm| (arm.clone(), if *arm == chosen { 1.0 } else { 0.0 }))
        .collect())
}

/// Serve the control arm.
pub fn select_control(p: &ControlParams, candidates: &[String]) -> Result<Selection> {
    let chosen = p.resolve(candidates)?;
    let probs = control_probabilities(p, candidates)?;
    Ok(Selection {
        arm_id: chosen,
        propensity: 1.0,
        score: 0.0,
        probs,
        explore_first: false,
    })
}
