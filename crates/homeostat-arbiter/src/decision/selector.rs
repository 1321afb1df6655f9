//! Action selection
//!
//! First matching rule wins:
//!
//! 1. raw_threat ≥ 0.85 → QUARANTINE
//! 2. raw_threat ≥ 0.60 → ALERT
//! 3. stability > 0.25 and repair_score < 0.1 → APPLY_BALANCE
//! 4. opt_gain > 0.1 → APPLY_OPTIMIZE
//! 5. NOOP

use std::fmt;

use homeostat_common::{
    OPT_GAIN_THRESHOLD, REPAIR_THRESHOLD, STABILITY_THRESHOLD, THREAT_ALERT, THREAT_QUARANTINE,
};
use serde::{Deserialize, Serialize};

use super::aggregator::DecisionVector;

/// Discrete action chosen each beat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Quarantine,
    Alert,
    ApplyBalance,
    ApplyOptimize,
    Noop,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Quarantine,
        Action::Alert,
        Action::ApplyBalance,
        Action::ApplyOptimize,
        Action::Noop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Quarantine => "QUARANTINE",
            Action::Alert => "ALERT",
            Action::ApplyBalance => "APPLY_BALANCE",
            Action::ApplyOptimize => "APPLY_OPTIMIZE",
            Action::Noop => "NOOP",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick the action for a decision vector
pub fn select(v: &DecisionVector) -> Action {
    if v.raw_threat >= THREAT_QUARANTINE {
        Action::Quarantine
    } else if v.raw_threat >= THREAT_ALERT {
        Action::Alert
    } else if v.stability > STABILITY_THRESHOLD && v.repair_score < REPAIR_THRESHOLD {
        Action::ApplyBalance
    } else if v.opt_gain > OPT_GAIN_THRESHOLD {
        Action::ApplyOptimize
    } else {
        Action::Noop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_threat_precedence() {
        let v = DecisionVector {
            raw_threat: 0.85,
            stability: 0.9,
            opt_gain: 0.9,
            ..Default::default()
        };
        assert_eq!(select(&v), Action::Quarantine);

        let v = DecisionVector {
            raw_threat: 0.6,
            ..v
        };
        assert_eq!(select(&v), Action::Alert);
    }

    #[test]
    fn test_balance_requires_low_repair() {
        let v = DecisionVector {
            stability: 0.3,
            repair_score: 0.05,
            ..Default::default()
        };
        assert_eq!(select(&v), Action::ApplyBalance);

        let v = DecisionVector {
            repair_score: 0.1,
            ..v
        };
        assert_eq!(select(&v), Action::Noop);
    }

    #[test]
    fn test_optimize_and_default() {
        let v = DecisionVector {
            opt_gain: 0.11,
            ..Default::default()
        };
        assert_eq!(select(&v), Action::ApplyOptimize);
        assert_eq!(select(&DecisionVector::default()), Action::Noop);
    }

    #[test]
    fn test_serialized_names() {
        assert_eq!(serde_json::to_value(Action::ApplyBalance).unwrap(), "APPLY_BALANCE");
        for action in Action::ALL {
            assert_eq!(serde_json::to_value(action).unwrap(), action.as_str());
        }
    }

    proptest! {
        #[test]
        fn prop_selection_is_total(
            raw_threat in -1.0f64..2.0,
            stability in -1.0f64..2.0,
            repair_score in -1.0f64..2.0,
            opt_gain in -1.0f64..2.0,
        ) {
            let v = DecisionVector { raw_threat, stability, repair_score, opt_gain, ..Default::default() };
            let action = select(&v);
            prop_assert!(Action::ALL.contains(&action));
            if raw_threat >= 0.85 {
                prop_assert_eq!(action, Action::Quarantine);
            }
        }
    }
}
