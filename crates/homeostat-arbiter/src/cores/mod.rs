//! Scoring cores
//!
//! Four independent scoring functions run once per beat against the same
//! genome snapshot:
//!
//! | Core | Output | Rule |
//! |------|--------|------|
//! | R (Regen) | urgency, cost | `min(0.9, total/100)` if total > 0 else 0.4; cost = urgency/2 |
//! | B (Balance) | conserve, PID gains | `clamp(0.3 + (1 − |v − 0.02|)·0.2, 0, 1)` |
//! | E (Entropy) | threat_score | pluggable scorer, logistic fallback |
//! | O (Optimize) | expected_gain | `min(0.5, w_O · 0.12)` |
//!
//! `total` is the beat's anomaly count plus the genome's risk counter.

pub mod runner;
pub mod scorer;

use std::fmt;
use std::sync::Arc;

use homeostat_common::{
    unix_seconds, CoreError, CoreKind, Genome, Result, PID_KD, PID_KI, PID_KP, PULSE_SETPOINT,
};
use serde::{Deserialize, Serialize};

pub use runner::CoreSet;
pub use scorer::{LogisticScorer, ThreatScorer};

/// Regen urgency used when no anomalies are present
pub const BASELINE_URGENCY: f64 = 0.4;

/// Upper bound on Regen urgency
pub const MAX_URGENCY: f64 = 0.9;

/// Upper bound on Optimize expected gain
pub const MAX_EXPECTED_GAIN: f64 = 0.5;

/// O-weight multiplier for expected gain
pub const GAIN_FACTOR: f64 = 0.12;

/// Per-beat inputs shared by all cores
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Features {
    pub pulse_value: f64,
    pub beat: u64,
    /// Anomalies observed during this beat
    pub anomalies: u64,
}

impl Features {
    /// Beat anomalies plus the genome's accumulated risk counter
    pub fn total_anomalies(&self, genome: &Genome) -> u64 {
        self.anomalies.saturating_add(genome.risk.anoms)
    }
}

/// Core-specific output
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoreOutput {
    Regen { urgency: f64, cost: f64, anomalies: u64 },
    Balance { conserve: f64, kp: f64, ki: f64, kd: f64 },
    Entropy { threat_score: f64, anomalies: u64 },
    Optimize { expected_gain: f64 },
}

/// One core's result for one beat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreResult {
    pub core: CoreKind,
    pub iteration: u64,
    pub timestamp: f64,
    /// Absent when the core failed
    pub output: Option<CoreOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CoreResult {
    pub fn success(core: CoreKind, iteration: u64, output: CoreOutput) -> Self {
        Self {
            core,
            iteration,
            timestamp: unix_seconds(),
            output: Some(output),
            error: None,
        }
    }

    pub fn failure(core: CoreKind, iteration: u64, error: impl fmt::Display) -> Self {
        Self {
            core,
            iteration,
            timestamp: unix_seconds(),
            output: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.output.is_none()
    }

    /// The value this core contributes to the decision vector
    pub fn primary_score(&self) -> Option<f64> {
        if self.error.is_some() {
            return None;
        }
        self.output.map(|output| match output {
            CoreOutput::Regen { urgency, .. } => urgency,
            CoreOutput::Balance { conserve, .. } => conserve,
            CoreOutput::Entropy { threat_score, .. } => threat_score,
            CoreOutput::Optimize { expected_gain } => expected_gain,
        })
    }

    /// PID gains suggested by a successful Balance result
    pub fn suggested_gains(&self) -> Option<(f64, f64, f64)> {
        match (self.output, &self.error) {
            (Some(CoreOutput::Balance { kp, ki, kd, .. }), None) => Some((kp, ki, kd)),
            _ => None,
        }
    }
}

/// The four scoring cores
#[derive(Clone)]
pub enum ScoringCore {
    Regen,
    Balance,
    Entropy(Arc<dyn ThreatScorer>),
    Optimize,
}

impl fmt::Debug for ScoringCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoringCore::Entropy(scorer) => write!(f, "Entropy({})", scorer.name()),
            other => write!(f, "{}", other.kind()),
        }
    }
}

impl ScoringCore {
    /// Entropy core with the logistic fallback scorer
    pub fn entropy() -> Self {
        ScoringCore::Entropy(Arc::new(LogisticScorer))
    }

    pub fn kind(&self) -> CoreKind {
        match self {
            ScoringCore::Regen => CoreKind::Regen,
            ScoringCore::Balance => CoreKind::Balance,
            ScoringCore::Entropy(_) => CoreKind::Entropy,
            ScoringCore::Optimize => CoreKind::Optimize,
        }
    }

    /// Compute this core's output
    pub fn score(&self, genome: &Genome, features: &Features) -> Result<CoreOutput> {
        let total = features.total_anomalies(genome);
        let output = match self {
            ScoringCore::Regen => {
                let urgency = if total > 0 {
                    (total as f64 / 100.0).min(MAX_URGENCY)
                } else {
                    BASELINE_URGENCY
                };
                CoreOutput::Regen {
                    urgency,
                    cost: urgency * 0.5,
                    anomalies: total,
                }
            }
            ScoringCore::Balance => {
                let deviation = (features.pulse_value - PULSE_SETPOINT).abs();
                let conserve = (0.3 + (1.0 - deviation) * 0.2).clamp(0.0, 1.0);
                if !conserve.is_finite() {
                    return Err(CoreError::Execution {
                        core: self.kind().to_string(),
                        reason: format!("pulse value {} is not finite", features.pulse_value),
                    }
                    .into());
                }
                CoreOutput::Balance {
                    conserve,
                    kp: PID_KP,
                    ki: PID_KI,
                    kd: PID_KD,
                }
            }
            ScoringCore::Entropy(scorer) => {
                let threat_score = scorer.score(total);
                if !threat_score.is_finite() || !(0.0..=1.0).contains(&threat_score) {
                    return Err(CoreError::ScoreOutOfRange {
                        score: threat_score,
                    }
                    .into());
                }
                CoreOutput::Entropy {
                    threat_score,
                    anomalies: total,
                }
            }
            ScoringCore::Optimize => CoreOutput::Optimize {
                expected_gain: (genome.weights.optimize * GAIN_FACTOR).min(MAX_EXPECTED_GAIN),
            },
        };
        Ok(output)
    }

    /// Run the core; failures become an error result instead of propagating
    pub fn execute(&self, iteration: u64, genome: &Genome, features: &Features) -> CoreResult {
        match self.score(genome, features) {
            Ok(output) => CoreResult::success(self.kind(), iteration, output),
            Err(e) => CoreResult::failure(self.kind(), iteration, e),
        }
    }
}
