//! Error types for the Homeostat system
//!
//! Provides a unified error type and domain-specific error variants

use thiserror::Error;

/// Result type alias using HomeostatError
pub type Result<T> = std::result::Result<T, HomeostatError>;

/// Unified error type for Homeostat operations
#[derive(Debug, Error)]
pub enum HomeostatError {
    // Construction-time configuration errors (fatal)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // Scoring core errors (contained per core)
    #[error("Core execution error: {0}")]
    Core(#[from] CoreError),

    // Ledger errors
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    // Peer errors (contained per peer)
    #[error("Peer communication error: {0}")]
    Peer(#[from] PeerError),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Metrics registration errors
    #[error("Metrics error: {0}")]
    Metrics(String),

    // Runtime resources the process could not obtain (threads)
    #[error("Internal error: {0}")]
    Internal(String),

    // Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Configuration errors raised at construction
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Stability condition violated: k*p = {kp} must be > 1 (k={k}, p={p})")]
    StabilityViolated { k: u32, p: u32, kp: u64 },

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },
}

/// Scoring core failures
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Core {core} failed: {reason}")]
    Execution { core: String, reason: String },

    #[error("Threat score {score} outside [0, 1]")]
    ScoreOutOfRange { score: f64 },

    #[error("Core {core} panicked")]
    Panicked { core: String },
}

/// Ledger failures
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger integrity violated at entry {index}: {reason}")]
    Integrity { index: u64, reason: String },

    #[error("Entry {index} out of range (chain length {len})")]
    IndexOutOfRange { index: u64, len: u64 },

    #[error("Ledger store failure: {0}")]
    Store(String),
}

/// Peer transport failures
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Peer {peer_id} unreachable: {reason}")]
    Communication { peer_id: String, reason: String },

    #[error("Peer not found: {0}")]
    UnknownPeer(String),

    #[error("Malformed message: {0}")]
    Decode(String),

    #[error("Sender {0} is rate limited")]
    RateLimited(String),

    #[error("Inbound queue full ({depth} pending)")]
    QueueFull { depth: usize },

    #[error("Mesh node is not running")]
    NotRunning,

    #[error("Mesh node is already running")]
    AlreadyRunning,

    #[error("Failed to bind listener: {0}")]
    Bind(String),

    #[error("Handler for {msg_type} failed: {reason}")]
    Handler { msg_type: String, reason: String },
}

// Implement From for common external error types
impl From<serde_json::Error> for HomeostatError {
    fn from(err: serde_json::Error) -> Self {
        HomeostatError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for HomeostatError {
    fn from(err: std::io::Error) -> Self {
        HomeostatError::Storage(err.to_string())
    }
}

impl From<prometheus::Error> for HomeostatError {
    fn from(err: prometheus::Error) -> Self {
        HomeostatError::Metrics(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HomeostatError::Config(ConfigError::StabilityViolated { k: 1, p: 1, kp: 1 });
        assert!(err.to_string().contains("k*p = 1"));
    }

    #[test]
    fn test_ledger_error() {
        let err = LedgerError::Integrity {
            index: 7,
            reason: "hash mismatch".to_string(),
        };
        assert!(err.to_string().contains("entry 7"));
    }

    #[test]
    fn test_peer_error_conversion() {
        let err: HomeostatError = PeerError::UnknownPeer("node-b".to_string()).into();
        assert!(matches!(err, HomeostatError::Peer(PeerError::UnknownPeer(_))));
    }
}
