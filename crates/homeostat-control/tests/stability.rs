//! Closed-loop tests: pulse → PID → genome weight adjustment

use homeostat_common::{Genome, INTEGRAL_CLAMP_MAX, INTEGRAL_CLAMP_MIN};
use homeostat_control::{ControlConfig, Pulse, PulseConfig, StabilityController};

#[test]
fn test_weights_stay_normalized_over_many_beats() {
    let mut pulse = Pulse::new(PulseConfig::default()).unwrap();
    let mut pid = StabilityController::from_config(&ControlConfig::default());
    let mut genome = Genome::default();

    for beat in 0..250u64 {
        let record = pulse.generate();
        let out = pid.compute(record.value, Some(beat as f64 * 0.005));
        genome.apply_optimize_adjustment(out.weight_adjustment);

        let sum = genome.weights.sum();
        assert!((sum - 1.0).abs() <= 1e-6, "beat {}: sum {}", beat, sum);
        assert!(out.integral >= INTEGRAL_CLAMP_MIN && out.integral <= INTEGRAL_CLAMP_MAX);
    }
}

#[test]
fn test_constant_pulse_is_not_reported_stable() {
    // A constant value gives ΔV = 0 after the first beat, which is not < 0
    let mut pulse = Pulse::new(PulseConfig::default()).unwrap();
    let mut pid = StabilityController::default();
    for beat in 0..20 {
        let record = pulse.generate();
        pid.compute(record.value, Some(beat as f64));
    }
    assert!(!pid.is_stable(10));
}

#[test]
fn test_converging_measurements_become_stable() {
    let mut pid = StabilityController::default();
    let window = 8;
    let mut value = -1.0;
    for beat in 0..=window {
        pid.compute(value, Some(beat as f64));
        value += 0.1;
        if beat < window {
            assert!(!pid.is_stable(window));
        }
    }
    assert!(pid.is_stable(window));
}
