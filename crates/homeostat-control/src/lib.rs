//! # Homeostat Control
//!
//! Temporal pulse and PID stability controller for the Homeostat beat loop.
//!
//! ## Pulse Formula
//!
//! ```text
//! T = (T1 × ln(U)) / (1 − 1/(k·p)),   k·p > 1
//! ```
//!
//! Where:
//! - T1: base time in seconds
//! - U: base value (default e⁴, so ln(U) = 4)
//! - k: parallelism factor
//! - p: node factor
//!
//! ## Stability
//!
//! The PID controller steers the pulse value towards a setpoint and emits a
//! bounded adjustment for the O weight. A beat is stable when the change in
//! error (ΔV) is negative.

pub mod controller;
pub mod pulse;

pub use controller::{PidOutput, StabilityController, StabilitySample};
pub use pulse::{Pulse, PulseConfig, PulseRecord, MAX_PULSE_SECONDS};

use serde::{Deserialize, Serialize};

/// Stability controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Pulse value the controller steers towards
    pub setpoint: f64,
    /// PID Kp coefficient
    pub pid_kp: f64,
    /// PID Ki coefficient
    pub pid_ki: f64,
    /// PID Kd coefficient
    pub pid_kd: f64,
    /// Stability window used by status reporting
    pub stability_window: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            setpoint: homeostat_common::PULSE_SETPOINT,
            pid_kp: homeostat_common::PID_KP,
            pid_ki: homeostat_common::PID_KI,
            pid_kd: homeostat_common::PID_KD,
            stability_window: 10,
        }
    }
}
