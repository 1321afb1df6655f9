//! Genome - the weighting state steering every beat
//!
//! The genome holds one weight per scoring core, the accumulated anomaly
//! counter and the scalar ML weight. Weights stay normalized (sum = 1.0)
//! after every mutation.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::{MAX_WEIGHT_DELTA, WEIGHT_TOLERANCE};

/// Lower bound for the O weight after a PID adjustment
pub const OPTIMIZE_WEIGHT_MIN: f64 = 0.1;

/// Upper bound for the O weight after a PID adjustment
pub const OPTIMIZE_WEIGHT_MAX: f64 = 0.9;

/// Lower bound for the E weight under hybrid feedback
pub const ENTROPY_WEIGHT_MIN: f64 = 0.05;

/// Upper bound for the E weight under hybrid feedback
pub const ENTROPY_WEIGHT_MAX: f64 = 0.30;

/// The four scoring cores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CoreKind {
    /// Regen (R) - repair urgency
    #[serde(rename = "R")]
    Regen,
    /// Balance (B) - conservation
    #[serde(rename = "B")]
    Balance,
    /// Entropy (E) - threat scoring
    #[serde(rename = "E")]
    Entropy,
    /// Optimize (O) - expected gain
    #[serde(rename = "O")]
    Optimize,
}

impl CoreKind {
    /// All cores in canonical order
    pub const ALL: [CoreKind; 4] = [
        CoreKind::Regen,
        CoreKind::Balance,
        CoreKind::Entropy,
        CoreKind::Optimize,
    ];

    /// Single-letter code used in the genome and the ledger
    pub fn code(&self) -> &'static str {
        match self {
            CoreKind::Regen => "R",
            CoreKind::Balance => "B",
            CoreKind::Entropy => "E",
            CoreKind::Optimize => "O",
        }
    }
}

impl fmt::Display for CoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreKind::Regen => write!(f, "regen"),
            CoreKind::Balance => write!(f, "balance"),
            CoreKind::Entropy => write!(f, "entropy"),
            CoreKind::Optimize => write!(f, "optimize"),
        }
    }
}

/// Per-core weights
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoreWeights {
    #[serde(rename = "R")]
    pub regen: f64,
    #[serde(rename = "B")]
    pub balance: f64,
    #[serde(rename = "E")]
    pub entropy: f64,
    #[serde(rename = "O")]
    pub optimize: f64,
}

impl Default for CoreWeights {
    fn default() -> Self {
        Self {
            regen: 0.25,
            balance: 0.25,
            entropy: 0.15,
            optimize: 0.35,
        }
    }
}

impl CoreWeights {
    /// Weight for a core
    pub fn get(&self, kind: CoreKind) -> f64 {
        match kind {
            CoreKind::Regen => self.regen,
            CoreKind::Balance => self.balance,
            CoreKind::Entropy => self.entropy,
            CoreKind::Optimize => self.optimize,
        }
    }

    /// Overwrite the weight for a core (no normalization)
    pub fn set(&mut self, kind: CoreKind, value: f64) {
        match kind {
            CoreKind::Regen => self.regen = value,
            CoreKind::Balance => self.balance = value,
            CoreKind::Entropy => self.entropy = value,
            CoreKind::Optimize => self.optimize = value,
        }
    }

    /// Sum of all four weights
    pub fn sum(&self) -> f64 {
        self.regen + self.balance + self.entropy + self.optimize
    }

    /// Rescale so the weights sum to 1.0.
    ///
    /// Negative or non-finite weights are zeroed first; a degenerate total
    /// falls back to the default weighting.
    pub fn normalize(&mut self) {
        for kind in CoreKind::ALL {
            let w = self.get(kind);
            if !w.is_finite() || w < 0.0 {
                self.set(kind, 0.0);
            }
        }

        let total = self.sum();
        if total <= f64::EPSILON {
            *self = Self::default();
            return;
        }

        for kind in CoreKind::ALL {
            self.set(kind, self.get(kind) / total);
        }
    }

    /// Whether the weights currently sum to 1.0 within tolerance
    pub fn is_normalized(&self) -> bool {
        (self.sum() - 1.0).abs() <= WEIGHT_TOLERANCE
    }
}

/// Risk section of the genome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskState {
    /// Accumulated anomaly count
    pub anoms: u64,
}

/// ML section of the genome
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MlState {
    /// Scalar ML weight in [0, 1]
    pub ml_weight: f64,
}

impl Default for MlState {
    fn default() -> Self {
        Self { ml_weight: 0.12 }
    }
}

/// Genome state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Genome {
    pub weights: CoreWeights,
    pub risk: RiskState,
    pub ml: MlState,
}

impl Genome {
    /// Create a genome with custom weights (normalized on entry)
    pub fn with_weights(mut weights: CoreWeights) -> Self {
        weights.normalize();
        Self {
            weights,
            ..Self::default()
        }
    }

    /// Apply a PID weight adjustment to the O weight.
    ///
    /// The delta is limited to ±[`MAX_WEIGHT_DELTA`], the resulting O weight
    /// is held in [0.1, 0.9], then all weights are renormalized. Returns the
    /// O weight before normalization.
    pub fn apply_optimize_adjustment(&mut self, delta: f64) -> f64 {
        let delta = if delta.is_finite() {
            delta.clamp(-MAX_WEIGHT_DELTA, MAX_WEIGHT_DELTA)
        } else {
            0.0
        };
        let new_o =
            (self.weights.optimize + delta).clamp(OPTIMIZE_WEIGHT_MIN, OPTIMIZE_WEIGHT_MAX);
        self.weights.optimize = new_o;
        self.weights.normalize();
        new_o
    }

    /// Hybrid feedback for the E weight.
    ///
    /// Above a raw threat of 0.5 the E weight follows
    /// `0.15 · threat · e^(−beat/50) · max(0, 1 − O/0.3)`, otherwise it rests
    /// at 0.10. The result is clamped to [0.05, 0.30] and renormalized.
    pub fn apply_entropy_feedback(&mut self, raw_threat: f64, beat: u64) -> f64 {
        let e_weight = if raw_threat > 0.5 {
            let decay = (-(beat as f64) / 50.0).exp();
            let o_factor = (1.0 - self.weights.optimize / 0.3).max(0.0);
            0.15 * raw_threat * decay * o_factor
        } else {
            0.10
        };
        let e_weight = e_weight.clamp(ENTROPY_WEIGHT_MIN, ENTROPY_WEIGHT_MAX);
        self.weights.entropy = e_weight;
        self.weights.normalize();
        e_weight
    }

    /// Overwrite the risk counter and/or ML weight
    pub fn inject(&mut self, anomalies: Option<u64>, ml_weight: Option<f64>) -> Result<()> {
        if let Some(w) = ml_weight {
            if !w.is_finite() {
                return Err(ConfigError::InvalidParameter {
                    name: "ml_weight".to_string(),
                    reason: format!("{} is not finite", w),
                }
                .into());
            }
            self.ml.ml_weight = w.clamp(0.0, 1.0);
        }
        if let Some(a) = anomalies {
            self.risk.anoms = a;
        }
        Ok(())
    }
}

/// Shared, lock-guarded genome handle.
///
/// The arbiter takes snapshots before each beat and applies its single
/// post-beat mutation under the write lock; the mesh only touches it through
/// [`SharedGenome::inject`].
#[derive(Debug, Clone, Default)]
pub struct SharedGenome {
    inner: Arc<RwLock<Genome>>,
}

impl SharedGenome {
    pub fn new(genome: Genome) -> Self {
        Self {
            inner: Arc::new(RwLock::new(genome)),
        }
    }

    /// Copy of the current genome
    pub fn snapshot(&self) -> Genome {
        self.inner.read().clone()
    }

    /// Run a mutation under the write lock
    pub fn update<R>(&self, f: impl FnOnce(&mut Genome) -> R) -> R {
        let mut guard = self.inner.write();
        f(&mut guard)
    }

    /// Externally-originated risk signal, applied as one critical section
    pub fn inject(&self, anomalies: Option<u64>, ml_weight: Option<f64>) -> Result<()> {
        self.inner.write().inject(anomalies, ml_weight)
    }
}

/// Read-only genome view exposed to observability collaborators
pub type GenomeSnapshot = Genome;
