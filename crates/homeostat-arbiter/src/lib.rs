//! # Homeostat Arbiter
//!
//! The orchestrator that drives a node's beat:
//!
//! ```text
//! Pulse → cores (parallel) → aggregate → select → ledger → PID → gossip
//! ```
//!
//! ## Components
//!
//! - **cores**: the Regen, Balance, Entropy and Optimize scoring cores
//! - **decision**: weighted aggregation and action selection
//! - **arbiter**: the beat loop and its context object
//! - **config**: environment-driven configuration
//! - **telemetry**: Prometheus metrics

pub mod arbiter;
pub mod config;
pub mod cores;
pub mod decision;
pub mod telemetry;

pub use arbiter::{Arbiter, ArbiterStatus, BeatSummary, StopHandle, GENOME_UPDATE};
pub use config::{
    ArbiterSettings, ControlSettings, HomeostatConfig, LedgerSettings, MeshSettings, PulseSettings,
};
pub use cores::{CoreOutput, CoreResult, CoreSet, Features, LogisticScorer, ScoringCore, ThreatScorer};
pub use decision::{aggregate, select, Action, DecisionVector};
pub use telemetry::{export_metrics, BeatMetrics};
