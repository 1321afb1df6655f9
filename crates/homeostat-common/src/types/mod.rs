//! Core types for Homeostat

pub mod genome;

pub use genome::{CoreKind, CoreWeights, Genome, GenomeSnapshot, MlState, RiskState, SharedGenome};
