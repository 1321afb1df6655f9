//! Decision aggregation and action selection
pub mod aggregator;
pub mod selector;

pub use aggregator::{aggregate, DecisionVector};
pub use selector::{select, Action};
