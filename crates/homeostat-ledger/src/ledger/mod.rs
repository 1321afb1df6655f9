//! Ledger module
pub mod chain;
pub mod entry;
pub mod store;
