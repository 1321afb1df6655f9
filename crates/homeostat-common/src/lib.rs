//! # Homeostat Common
//!
//! Shared types, errors, and hashing primitives for the Homeostat control loop.
//!
//! ## Core Types
//!
//! - [`Genome`]: core weights, risk counter and ML weight steering every beat
//! - [`SharedGenome`]: lock-guarded handle used by the arbiter and the mesh
//! - [`GenomeSnapshot`]: read-only view exposed after every beat
//! - [`CoreKind`]: the four scoring cores (R, B, E, O)
//!
//! ## Crypto
//!
//! - [`crypto::merkle`]: BLAKE3 Merkle tree for ledger manifests and proofs
//! - [`crypto::chain_digest`]: chained digest used by the ledger

pub mod crypto;
pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{ConfigError, CoreError, HomeostatError, LedgerError, PeerError, Result};
pub use types::genome::{
    CoreKind, CoreWeights, Genome, GenomeSnapshot, MlState, RiskState, SharedGenome,
};

/// Homeostat version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum pulse value for numerical stability
pub const PULSE_EPSILON: f64 = 1e-6;

/// Pulse value the stability controller steers towards
pub const PULSE_SETPOINT: f64 = 0.02;

/// Error magnitude below which the PID integral is reset
pub const EPSILON_RESET: f64 = 1e-4;

/// Raw threat at or above which the organism quarantines
pub const THREAT_QUARANTINE: f64 = 0.85;

/// Raw threat at or above which the organism raises an alert
pub const THREAT_ALERT: f64 = 0.60;

/// Weighted stability above which balance may be applied
pub const STABILITY_THRESHOLD: f64 = 0.25;

/// Weighted repair score below which balance may be applied
pub const REPAIR_THRESHOLD: f64 = 0.1;

/// Weighted optimization gain above which optimization is applied
pub const OPT_GAIN_THRESHOLD: f64 = 0.1;

/// Maximum O-weight change per beat
pub const MAX_WEIGHT_DELTA: f64 = 0.05;

/// Anti-windup lower bound
pub const INTEGRAL_CLAMP_MIN: f64 = -1.0;

/// Anti-windup upper bound
pub const INTEGRAL_CLAMP_MAX: f64 = 1.0;

/// Default proportional gain (suggested by the Balance core)
pub const PID_KP: f64 = 0.6;

/// Default integral gain
pub const PID_KI: f64 = 0.1;

/// Default derivative gain
pub const PID_KD: f64 = 0.05;

/// Tolerance used when checking weight normalization
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Current wall-clock time as fractional Unix seconds
pub fn unix_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
