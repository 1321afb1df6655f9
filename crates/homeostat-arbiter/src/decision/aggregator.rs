//! Weighted aggregation of core results

use homeostat_common::{CoreKind, CoreWeights};
use serde::{Deserialize, Serialize};

use crate::cores::CoreResult;

/// Weighted and raw core scores for one beat
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionVector {
    /// raw_threat × w_E
    pub threat: f64,
    /// raw_conserve × w_B
    pub stability: f64,
    /// raw_urgency × w_R
    pub repair_score: f64,
    /// raw_gain × w_O
    pub opt_gain: f64,
    pub raw_threat: f64,
    pub raw_urgency: f64,
    pub raw_conserve: f64,
    pub raw_gain: f64,
}

impl DecisionVector {
    /// Build from raw scores and weights
    pub fn from_raw(
        weights: &CoreWeights,
        raw_urgency: f64,
        raw_conserve: f64,
        raw_threat: f64,
        raw_gain: f64,
    ) -> Self {
        Self {
            threat: raw_threat * weights.entropy,
            stability: raw_conserve * weights.balance,
            repair_score: raw_urgency * weights.regen,
            opt_gain: raw_gain * weights.optimize,
            raw_threat,
            raw_urgency,
            raw_conserve,
            raw_gain,
        }
    }
}

/// Combine core results using the genome weights.
/// Missing or failed cores contribute 0.
pub fn aggregate(weights: &CoreWeights, results: &[CoreResult]) -> DecisionVector {
    let raw = |kind: CoreKind| {
        results
            .iter()
            .find(|r| r.core == kind)
            .and_then(CoreResult::primary_score)
            .unwrap_or(0.0)
    };

    DecisionVector::from_raw(
        weights,
        raw(CoreKind::Regen),
        raw(CoreKind::Balance),
        raw(CoreKind::Entropy),
        raw(CoreKind::Optimize),
    )
}
