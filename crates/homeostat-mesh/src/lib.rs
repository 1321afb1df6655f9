//! # Homeostat Mesh
//!
//! Lightweight gossip transport between Homeostat nodes.
//!
//! ## Wire protocol
//!
//! One newline-delimited JSON message per TCP connection, answered by one
//! ack line:
//!
//! ```text
//! → {"type":"peer_discovery","node_id":"n1","data":{"addr":"10.0.0.1:7000"}}
//! ← {"status":"ok","node_id":"n2"}
//! → {"type":"genome_update","sender_id":"n1","anoms":3}
//! ← {"status":"error","node_id":"n2","reason":"Sender n1 is rate limited"}
//! ```
//!
//! ## Components
//!
//! - **MeshNode**: listener, bounded inbound queue and dispatching consumer
//! - **PeerTable**: known peers keyed by node id
//! - **RateLimiter**: per-sender token buckets

pub mod node;
pub mod protocol;

pub use node::mesh::{
    consumer_delay, BroadcastReport, MeshNode, MeshStats, MessageHandler, CONSUMER_DELAY,
    FAST_CONSUMER_DELAY, HIGH_DEPTH_THRESHOLD,
};
pub use node::peers::{PeerRecord, PeerTable};
pub use node::rate_limit::{RateLimiter, RateLimiterStats};
pub use protocol::message::{Ack, Message, PEER_DISCOVERY};

use serde::{Deserialize, Serialize};

/// Mesh node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Identifier announced to peers
    pub node_id: String,
    /// Listen host
    pub host: String,
    /// Listen port (0 picks a free port)
    pub port: u16,
    /// Inbound queue capacity
    pub queue_capacity: usize,
    /// Sustained messages per second allowed per sender
    pub rate_per_sec: f64,
    /// Burst allowance per sender
    pub burst: u32,
    /// Connect/read/write timeout for peer exchanges (ms)
    pub io_timeout_ms: u64,
    /// Longest accepted message line (bytes)
    pub max_frame_bytes: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: "homeostat-node".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            queue_capacity: 1024,
            rate_per_sec: 100.0,
            burst: 200,
            io_timeout_ms: 5000,
            max_frame_bytes: 64 * 1024,
        }
    }
}

impl MeshConfig {
    /// Default configuration for `node_id`
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Listen address as `host:port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
