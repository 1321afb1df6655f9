//! PID controller module
pub mod pid;

pub use self::pid::{PidOutput, StabilityController, StabilitySample};
