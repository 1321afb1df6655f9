//! PID controller for genome stability

use std::collections::VecDeque;

use homeostat_common::{
    unix_seconds, EPSILON_RESET, INTEGRAL_CLAMP_MAX, INTEGRAL_CLAMP_MIN, MAX_WEIGHT_DELTA,
};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::ControlConfig;

/// Maximum retained stability samples
pub const HISTORY_CAPACITY: usize = 1000;

/// Result of one controller step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidOutput {
    /// kp·error + ki·integral + kd·derivative
    pub output: f64,
    /// setpoint − current value
    pub error: f64,
    /// error − previous error
    pub delta_v: f64,
    /// ΔV < 0
    pub stable: bool,
    /// −output limited to ±0.05, destined for the O weight
    pub weight_adjustment: f64,
    pub p_term: f64,
    pub i_term: f64,
    pub d_term: f64,
    /// Integral after clamping and ε-reset
    pub integral: f64,
}

/// One entry of the stability history
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StabilitySample {
    pub timestamp: f64,
    pub error: f64,
    pub delta_v: f64,
    pub stable: bool,
}

pub struct StabilityController {
    setpoint: f64,
    kp: f64,
    ki: f64,
    kd: f64,
    integral: f64,
    previous_error: f64,
    previous_time: Option<f64>,
    history: VecDeque<StabilitySample>,
}

impl StabilityController {
    pub fn new(setpoint: f64, kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            setpoint,
            kp,
            ki,
            kd,
            integral: 0.0,
            previous_error: 0.0,
            previous_time: None,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    pub fn from_config(config: &ControlConfig) -> Self {
        Self::new(config.setpoint, config.pid_kp, config.pid_ki, config.pid_kd)
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    pub fn gains(&self) -> (f64, f64, f64) {
        (self.kp, self.ki, self.kd)
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn history(&self) -> impl Iterator<Item = &StabilitySample> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Adopt new gains (typically those suggested by the Balance core)
    pub fn update_gains(&mut self, kp: f64, ki: f64, kd: f64) {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }

    /// Run one controller step.
    ///
    /// `timestamp` defaults to the current wall clock in Unix seconds.
    pub fn compute(&mut self, current_value: f64, timestamp: Option<f64>) -> PidOutput {
        let timestamp = timestamp.unwrap_or_else(unix_seconds);
        let error = self.setpoint - current_value;

        let dt = match self.previous_time {
            Some(previous) => timestamp - previous,
            None => 0.0,
        };

        // Anti-windup
        if dt > 0.0 {
            self.integral += error * dt;
        }
        self.integral = self.integral.clamp(INTEGRAL_CLAMP_MIN, INTEGRAL_CLAMP_MAX);
        if !self.integral.is_finite() {
            self.integral = 0.0;
        }

        // ε-reset
        if error.abs() < EPSILON_RESET {
            self.integral = 0.0;
        }

        let derivative = if dt > 0.0 {
            (error - self.previous_error) / dt
        } else {
            0.0
        };

        let p_term = self.kp * error;
        let i_term = self.ki * self.integral;
        let d_term = self.kd * derivative;
        let output = p_term + i_term + d_term;

        let weight_adjustment = if output.is_finite() {
            (-output).clamp(-MAX_WEIGHT_DELTA, MAX_WEIGHT_DELTA)
        } else {
            0.0
        };

        let delta_v = error - self.previous_error;
        let stable = delta_v < 0.0;

        self.previous_error = error;
        self.previous_time = Some(timestamp);
        self.record(StabilitySample {
            timestamp,
            error,
            delta_v,
            stable,
        });

        trace!(error, delta_v, output, weight_adjustment, "PID step");

        PidOutput {
            output,
            error,
            delta_v,
            stable,
            weight_adjustment,
            p_term,
            i_term,
            d_term,
            integral: self.integral,
        }
    }

    fn record(&mut self, sample: StabilitySample) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(sample);
    }

    /// True only if the last `window` samples were all stable
    pub fn is_stable(&self, window: usize) -> bool {
        if self.history.len() < window {
            return false;
        }
        self.history
            .iter()
            .rev()
            .take(window)
            .all(|sample| sample.stable)
    }

    /// Clear integral, previous error/time and history
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.previous_error = 0.0;
        self.previous_time = None;
        self.history.clear();
    }
}

impl Default for StabilityController {
    fn default() -> Self {
        Self::from_config(&ControlConfig::default())
    }
}
