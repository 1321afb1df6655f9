//! Prometheus metrics for the beat loop

use homeostat_common::{HomeostatError, Result};
use homeostat_mesh::MeshStats;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::decision::Action;

/// Per-beat counters and gauges
#[derive(Clone)]
pub struct BeatMetrics {
    pub beats_total: IntCounter,
    pub actions_total: IntCounterVec,
    pub core_failures_total: IntCounterVec,
    pub beat_duration_seconds: Histogram,
    pub ledger_length: IntGauge,
    pub mesh_queue_depth: IntGauge,
    pub mesh_messages_received: IntGauge,
    pub mesh_messages_dropped: IntGauge,
}

impl BeatMetrics {
    pub fn new() -> Result<Self> {
        Ok(Self {
            beats_total: IntCounter::new("homeostat_beats_total", "Completed beats")?,
            actions_total: IntCounterVec::new(
                Opts::new("homeostat_actions_total", "Selected actions"),
                &["action"],
            )?,
            core_failures_total: IntCounterVec::new(
                Opts::new("homeostat_core_failures_total", "Scoring core failures"),
                &["core"],
            )?,
            beat_duration_seconds: Histogram::with_opts(
                HistogramOpts::new("homeostat_beat_duration_seconds", "Beat processing duration")
                    .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25]),
            )?,
            ledger_length: IntGauge::new("homeostat_ledger_length", "Entries in the ledger")?,
            mesh_queue_depth: IntGauge::new("homeostat_mesh_queue_depth", "Inbound queue depth")?,
            mesh_messages_received: IntGauge::new(
                "homeostat_mesh_messages_received",
                "Messages accepted by the mesh listener",
            )?,
            mesh_messages_dropped: IntGauge::new(
                "homeostat_mesh_messages_dropped",
                "Messages rejected by the mesh listener",
            )?,
        })
    }

    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.beats_total.clone()))?;
        registry.register(Box::new(self.actions_total.clone()))?;
        registry.register(Box::new(self.core_failures_total.clone()))?;
        registry.register(Box::new(self.beat_duration_seconds.clone()))?;
        registry.register(Box::new(self.ledger_length.clone()))?;
        registry.register(Box::new(self.mesh_queue_depth.clone()))?;
        registry.register(Box::new(self.mesh_messages_received.clone()))?;
        registry.register(Box::new(self.mesh_messages_dropped.clone()))?;
        Ok(())
    }

    pub(crate) fn observe_action(&self, action: Action) {
        self.actions_total.with_label_values(&[action.as_str()]).inc();
    }

    pub(crate) fn observe_core_failure(&self, core: &str) {
        self.core_failures_total.with_label_values(&[core]).inc();
    }

    pub(crate) fn observe_mesh(&self, stats: &MeshStats) {
        self.mesh_queue_depth.set(stats.queue_depth as i64);
        self.mesh_messages_received.set(stats.received as i64);
        self.mesh_messages_dropped.set(stats.dropped as i64);
    }
}

/// Render every metric in `registry` in the Prometheus text format
pub fn export_metrics(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| HomeostatError::Metrics(e.to_string()))
}
