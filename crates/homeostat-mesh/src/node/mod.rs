//! Mesh node, peer table and rate limiting
pub mod mesh;
pub mod peers;
pub mod rate_limit;
