//! Pulse generator
//!
//! Produces the logical time value that paces beats and feeds the stability
//! controller. The value depends only on the configuration, so every pulse of
//! a given generator carries the same value; the sequence id and timestamps
//! advance.

use std::time::{Duration, Instant};

use homeostat_common::{unix_seconds, ConfigError, Result, PULSE_EPSILON};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// e⁴, the default base value (ln(U) = 4)
pub const DEFAULT_U: f64 = 54.598150033144236;

/// Longest pulse value (seconds) a configuration may produce
pub const MAX_PULSE_SECONDS: f64 = 1.0;

/// Pulse parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseConfig {
    /// Parallelism factor
    pub k: u32,
    /// Node factor
    pub p: u32,
    /// Base time in seconds
    pub t1: f64,
    /// Base value
    pub u: f64,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            k: 4,
            p: 5,
            t1: 0.001,
            u: DEFAULT_U,
        }
    }
}

impl PulseConfig {
    /// Check the stability precondition and parameter domains. The derived
    /// value must not exceed [`MAX_PULSE_SECONDS`].
    pub fn validate(&self) -> Result<()> {
        let kp = self.k as u64 * self.p as u64;
        if kp <= 1 {
            return Err(ConfigError::StabilityViolated {
                k: self.k,
                p: self.p,
                kp,
            }
            .into());
        }
        if !self.t1.is_finite() {
            return Err(ConfigError::InvalidParameter {
                name: "t1".to_string(),
                reason: format!("{} is not finite", self.t1),
            }
            .into());
        }
        if !self.u.is_finite() || self.u <= 0.0 {
            return Err(ConfigError::InvalidParameter {
                name: "u".to_string(),
                reason: format!("{} must be finite and positive", self.u),
            }
            .into());
        }
        let value = self.raw_value();
        if !value.is_finite() || value > MAX_PULSE_SECONDS {
            return Err(ConfigError::InvalidParameter {
                name: "t1".to_string(),
                reason: format!(
                    "pulse value {:.3}s exceeds the {}s limit",
                    value, MAX_PULSE_SECONDS
                ),
            }
            .into());
        }
        Ok(())
    }

    /// `(t1 · ln(u)) / (1 − 1/(k·p))`, floored at [`PULSE_EPSILON`]
    pub fn compute_value(&self) -> f64 {
        let value = self.raw_value();
        if value.is_finite() {
            value.max(PULSE_EPSILON)
        } else {
            PULSE_EPSILON
        }
    }

    fn raw_value(&self) -> f64 {
        let kp = (self.k as u64 * self.p as u64) as f64;
        (self.t1 * self.u.ln()) / (1.0 - 1.0 / kp)
    }
}

/// One generated pulse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseRecord {
    /// Sequence id, starting at 1
    pub sequence: u64,
    /// Wall-clock timestamp (Unix seconds)
    pub timestamp: f64,
    /// Seconds since construction or last reset
    pub elapsed: f64,
    /// Derived time value
    pub value: f64,
    /// Generating parameters
    pub params: PulseConfig,
}

/// Pulse generator
#[derive(Debug)]
pub struct Pulse {
    config: PulseConfig,
    sequence: u64,
    started: Instant,
    last_value: f64,
}

impl Pulse {
    /// Create a pulse generator; fails fast when k·p ≤ 1
    pub fn new(config: PulseConfig) -> Result<Self> {
        config.validate()?;
        let last_value = config.compute_value();
        debug!(k = config.k, p = config.p, value = last_value, "Pulse configured");
        Ok(Self {
            config,
            sequence: 0,
            started: Instant::now(),
            last_value,
        })
    }

    /// Generating parameters
    pub fn config(&self) -> &PulseConfig {
        &self.config
    }

    /// Number of pulses generated since construction or reset
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Most recently computed value
    pub fn value(&self) -> f64 {
        self.last_value
    }

    /// Generate the next pulse
    pub fn generate(&mut self) -> PulseRecord {
        self.sequence += 1;
        self.last_value = self.config.compute_value();

        PulseRecord {
            sequence: self.sequence,
            timestamp: unix_seconds(),
            elapsed: self.started.elapsed().as_secs_f64(),
            value: self.last_value,
            params: self.config,
        }
    }

    /// Delay before the next beat (the most recently computed value)
    pub fn delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.last_value).unwrap_or(Duration::MAX)
    }

    /// Restart the sequence without altering the parameters
    pub fn reset(&mut self) {
        self.sequence = 0;
        self.started = Instant::now();
    }
}
