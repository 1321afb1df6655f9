//! The orchestrator
//!
//! One [`Arbiter`] owns the genome, pulse, PID controller, cores and ledger
//! of a node and drives them one beat at a time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use homeostat_common::{CoreKind, Genome, PeerError, Result, SharedGenome};
use homeostat_control::{PidOutput, Pulse, PulseRecord, StabilityController};
use homeostat_ledger::{EntryKind, Ledger, SharedLedger};
use homeostat_mesh::{BroadcastReport, MeshNode, Message};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ArbiterSettings, HomeostatConfig};
use crate::cores::{CoreResult, CoreSet, Features, ThreatScorer};
use crate::decision::{aggregate, select, Action, DecisionVector};
use crate::telemetry::BeatMetrics;

/// Message type used for genome gossip
pub const GENOME_UPDATE: &str = "genome_update";

/// Everything that happened during one beat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeatSummary {
    pub beat: u64,
    pub pulse: PulseRecord,
    /// Core results in R, B, E, O order
    pub results: Vec<CoreResult>,
    pub decision: DecisionVector,
    pub action: Action,
    pub pid: PidOutput,
    /// Genome after the post-beat update
    pub genome: Genome,
    /// Index of the beat's action entry
    pub ledger_index: u64,
    /// At least one core failed
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<BroadcastReport>,
}

/// Point-in-time view of the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterStatus {
    pub node_id: String,
    pub beat: u64,
    pub running: bool,
    pub genome: Genome,
    pub pid_stable: bool,
    pub ledger_length: u64,
    pub ledger_verified: bool,
}

/// Stops a running beat loop from another task
#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Orchestrator context for one node
pub struct Arbiter {
    node_id: String,
    settings: ArbiterSettings,
    broadcast_genome: bool,
    stability_window: usize,
    pulse: Pulse,
    pid: StabilityController,
    cores: Arc<CoreSet>,
    genome: SharedGenome,
    ledger: SharedLedger,
    mesh: Option<Arc<MeshNode>>,
    metrics: Option<BeatMetrics>,
    beat: u64,
    running: Arc<AtomicBool>,
    pending_anomalies: Arc<AtomicU64>,
}

impl Arbiter {
    /// Build an arbiter from configuration.
    ///
    /// Fails on invalid configuration or when a persisted ledger cannot be
    /// opened or does not verify.
    pub fn new(config: &HomeostatConfig) -> Result<Self> {
        config.validate()?;
        let pulse = Pulse::new(config.pulse.to_pulse_config())?;
        let pid = StabilityController::from_config(&config.control.to_control_config());
        let ledger = SharedLedger::new(Ledger::open(&config.ledger_config())?);

        info!(
            node_id = %config.node_id,
            k = config.pulse.k,
            p = config.pulse.p,
            ledger_length = ledger.chain_length(),
            "Arbiter created"
        );

        Ok(Self {
            node_id: config.node_id.clone(),
            settings: config.arbiter.clone(),
            broadcast_genome: config.mesh.broadcast_genome,
            stability_window: config.control.stability_window,
            pulse,
            pid,
            cores: Arc::new(CoreSet::default()),
            genome: SharedGenome::default(),
            ledger,
            mesh: None,
            metrics: None,
            beat: 0,
            running: Arc::new(AtomicBool::new(false)),
            pending_anomalies: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Use `scorer` for the Entropy core
    pub fn with_scorer(mut self, scorer: Arc<dyn ThreatScorer>) -> Self {
        self.cores = Arc::new(CoreSet::with_scorer(scorer));
        self
    }

    /// Attach a mesh node and install the genome gossip handler
    pub fn with_mesh(mut self, mesh: Arc<MeshNode>) -> Self {
        self.mesh = Some(mesh);
        self.wire_mesh();
        self
    }

    pub fn with_metrics(mut self, metrics: BeatMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_ledger(mut self, ledger: SharedLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_genome(mut self, genome: SharedGenome) -> Self {
        self.genome = genome;
        self.wire_mesh();
        self
    }

    fn wire_mesh(&self) {
        let Some(mesh) = &self.mesh else {
            return;
        };
        // Weak: the node owns its handlers
        let node: Weak<MeshNode> = Arc::downgrade(mesh);
        let genome = self.genome.clone();
        mesh.register_handler(GENOME_UPDATE, move |message: &Message| {
            let anomalies = message.get("anoms").and_then(|v| v.as_u64());
            let ml_weight = message.get("ml_weight").and_then(|v| v.as_f64());
            if anomalies.is_none() && ml_weight.is_none() {
                return Err(PeerError::Handler {
                    msg_type: GENOME_UPDATE.to_string(),
                    reason: "neither anoms nor ml_weight present".to_string(),
                }
                .into());
            }
            match node.upgrade() {
                Some(node) => node.inject(&genome, anomalies, ml_weight),
                None => genome.inject(anomalies, ml_weight),
            }
        });
    }

    /// Add externally observed anomalies to the next beat's features
    pub fn report_anomalies(&self, count: u64) {
        self.pending_anomalies.fetch_add(count, Ordering::Relaxed);
    }

    /// Run one beat.
    ///
    /// Core failures degrade the beat but still produce a summary. Ledger
    /// write failures are returned and halt the caller.
    #[instrument(skip(self), fields(node_id = %self.node_id, beat = self.beat + 1))]
    pub async fn beat(&mut self) -> Result<BeatSummary> {
        let started = Instant::now();
        self.beat += 1;
        let beat = self.beat;

        let pulse = self.pulse.generate();
        self.ledger.record(EntryKind::Pulse, &pulse)?;

        let snapshot = Arc::new(self.genome.snapshot());
        let features = Features {
            pulse_value: pulse.value,
            beat,
            anomalies: self.pending_anomalies.swap(0, Ordering::Relaxed),
        };

        let results = self.cores.run_all(Arc::clone(&snapshot), features).await;
        for result in &results {
            self.ledger.record(EntryKind::CoreResult, result)?;
        }
        let degraded = results.iter().any(CoreResult::is_error);

        let decision = aggregate(&snapshot.weights, &results);
        let action = select(&decision);
        let action_entry = self.ledger.append(
            EntryKind::Action,
            json!({ "beat": beat, "action": action, "decision": decision }),
        )?;

        if self.settings.adopt_balance_gains {
            let gains = results
                .iter()
                .find(|r| r.core == CoreKind::Balance)
                .and_then(CoreResult::suggested_gains);
            if let Some((kp, ki, kd)) = gains {
                self.pid.update_gains(kp, ki, kd);
            }
        }
        let pid = self.pid.compute(pulse.value, Some(pulse.timestamp));

        let hybrid = self.settings.hybrid_entropy_feedback;
        let genome = self.genome.update(|g| {
            g.apply_optimize_adjustment(pid.weight_adjustment);
            if hybrid {
                g.apply_entropy_feedback(decision.raw_threat, beat);
            }
            g.clone()
        });

        let broadcast = self.gossip(&genome).await;

        if let Some(metrics) = &self.metrics {
            metrics.beats_total.inc();
            metrics.observe_action(action);
            for failed in results.iter().filter(|r| r.is_error()) {
                metrics.observe_core_failure(&failed.core.to_string());
            }
            metrics.ledger_length.set(self.ledger.chain_length() as i64);
            if let Some(mesh) = &self.mesh {
                metrics.observe_mesh(&mesh.stats());
            }
            metrics
                .beat_duration_seconds
                .observe(started.elapsed().as_secs_f64());
        }

        if degraded {
            warn!(%action, "Beat degraded by core failure");
        }
        debug!(
            %action,
            raw_threat = decision.raw_threat,
            weight_adjustment = pid.weight_adjustment,
            stable = pid.stable,
            "Beat complete"
        );

        Ok(BeatSummary {
            beat,
            pulse,
            results,
            decision,
            action,
            pid,
            genome,
            ledger_index: action_entry.index,
            degraded,
            broadcast,
        })
    }

    async fn gossip(&self, genome: &Genome) -> Option<BroadcastReport> {
        let mesh = self.mesh.as_ref()?;
        if !self.broadcast_genome || mesh.peer_count() == 0 {
            return None;
        }
        let message = Message::new(GENOME_UPDATE)
            .with_field("anoms", json!(genome.risk.anoms))
            .with_field("ml_weight", json!(genome.ml.ml_weight));
        let report = mesh.broadcast(message).await;
        for (peer_id, reason) in &report.failed {
            warn!(%peer_id, %reason, "Genome gossip failed");
        }
        Some(report)
    }

    /// Run beats until `beats` is reached (unbounded when `None`) or the
    /// loop is stopped. Returns the number of beats completed.
    ///
    /// The ledger store is flushed on exit, including after a failed beat.
    pub async fn run(&mut self, beats: Option<u64>) -> Result<u64> {
        self.running.store(true, Ordering::SeqCst);
        info!(node_id = %self.node_id, ?beats, "Beat loop started");

        let mut completed = 0u64;
        let outcome = loop {
            if !self.is_running() || beats.is_some_and(|limit| completed >= limit) {
                break Ok(());
            }
            if let Err(e) = self.beat().await {
                error!(error = %e, beat = self.beat, "Beat failed, halting");
                break Err(e);
            }
            completed += 1;

            if !self.is_running() {
                break Ok(());
            }
            if self.settings.pace_beats {
                tokio::time::sleep(self.pulse.delay()).await;
            }
        };

        self.running.store(false, Ordering::SeqCst);
        let flushed = self.ledger.flush();
        info!(completed, ledger_length = self.ledger.chain_length(), "Beat loop stopped");
        outcome?;
        flushed?;
        Ok(completed)
    }

    /// Stop the beat loop after the current beat
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Stop the loop, flush the ledger and stop the mesh node
    pub async fn shutdown(&self) -> Result<()> {
        self.stop();
        self.ledger.flush()?;
        if let Some(mesh) = &self.mesh {
            if mesh.is_running() {
                mesh.stop().await?;
            }
        }
        Ok(())
    }

    /// [`run`](Self::run), then [`shutdown`](Self::shutdown) whatever the
    /// outcome. A beat-loop error is returned ahead of a shutdown error.
    pub async fn run_then_shutdown(&mut self, beats: Option<u64>) -> Result<u64> {
        let outcome = self.run(beats).await;
        let shutdown = self.shutdown().await;
        match (outcome, shutdown) {
            (Ok(completed), Ok(())) => Ok(completed),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(shutdown_err)) => {
                warn!(error = %shutdown_err, "Shutdown after a failed run also failed");
                Err(e)
            }
        }
    }

    pub fn status(&self) -> ArbiterStatus {
        ArbiterStatus {
            node_id: self.node_id.clone(),
            beat: self.beat,
            running: self.is_running(),
            genome: self.genome.snapshot(),
            pid_stable: self.pid.is_stable(self.stability_window),
            ledger_length: self.ledger.chain_length(),
            ledger_verified: self.ledger.verify_chain(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Beats completed so far
    pub fn beat_count(&self) -> u64 {
        self.beat
    }

    pub fn genome(&self) -> &SharedGenome {
        &self.genome
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    pub fn mesh(&self) -> Option<&Arc<MeshNode>> {
        self.mesh.as_ref()
    }

    pub fn pulse(&self) -> &Pulse {
        &self.pulse
    }

    pub fn pid(&self) -> &StabilityController {
        &self.pid
    }

    pub fn cores(&self) -> &Arc<CoreSet> {
        &self.cores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arbiter() -> Arbiter {
        let mut config = HomeostatConfig::default();
        config.arbiter.pace_beats = false;
        Arbiter::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_beat_writes_six_entries() {
        let mut arbiter = arbiter();
        let summary = arbiter.beat().await.unwrap();

        assert_eq!(summary.beat, 1);
        assert_eq!(summary.results.len(), 4);
        // genesis + pulse + 4 core results + action
        assert_eq!(arbiter.ledger().chain_length(), 7);
        assert_eq!(summary.ledger_index, 6);
        assert_eq!(
            arbiter.ledger().get(6).map(|e| e.kind),
            Some(EntryKind::Action)
        );
        assert!(!summary.degraded);
    }

    #[tokio::test]
    async fn test_default_beat_selects_noop() {
        let mut arbiter = arbiter();
        let summary = arbiter.beat().await.unwrap();
        // logistic(0) = 0.5 threat, B contributes 0.25 × ~0.5
        assert_eq!(summary.action, Action::Noop);
        assert!(summary.genome.weights.is_normalized());
    }

    #[tokio::test]
    async fn test_reported_anomalies_consumed_once() {
        let mut arbiter = arbiter();
        arbiter.report_anomalies(30);
        let first = arbiter.beat().await.unwrap();
        let second = arbiter.beat().await.unwrap();
        assert!((first.decision.raw_urgency - 0.3).abs() < 1e-12);
        assert!((second.decision.raw_urgency - 0.4).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_run_stops_at_beat_limit() {
        let mut arbiter = arbiter();
        arbiter.stop();
        assert_eq!(arbiter.run(Some(3)).await.unwrap(), 3);
        assert!(!arbiter.is_running());
    }

    #[tokio::test]
    async fn test_status() {
        let mut arbiter = arbiter();
        arbiter.run(Some(2)).await.unwrap();
        let status = arbiter.status();
        assert_eq!(status.beat, 2);
        assert!(!status.running);
        assert!(status.ledger_verified);
        assert_eq!(status.ledger_length, 13);
    }
}
