//! Homeostat configuration
//!
//! Defaults, then `.env`, then `HOMEOSTAT_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use homeostat_common::{ConfigError, Result};
use homeostat_control::{ControlConfig, PulseConfig};
use homeostat_ledger::LedgerConfig;
use homeostat_mesh::MeshConfig;
use serde::{Deserialize, Serialize};

/// Complete node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeostatConfig {
    /// Identifier used in the mesh
    pub node_id: String,
    pub pulse: PulseSettings,
    pub control: ControlSettings,
    pub ledger: LedgerSettings,
    pub mesh: MeshSettings,
    pub arbiter: ArbiterSettings,
}

impl Default for HomeostatConfig {
    fn default() -> Self {
        Self {
            node_id: format!("homeostat-{}", uuid::Uuid::now_v7().simple()),
            pulse: PulseSettings::default(),
            control: ControlSettings::default(),
            ledger: LedgerSettings::default(),
            mesh: MeshSettings::default(),
            arbiter: ArbiterSettings::default(),
        }
    }
}

impl HomeostatConfig {
    /// Load configuration from `.env` and the process environment
    pub fn load() -> Result<Self> {
        // A missing .env file is fine
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from defaults plus whatever `lookup` returns
    /// for the `HOMEOSTAT_*` keys
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(node_id) = lookup("HOMEOSTAT_NODE_ID") {
            cfg.node_id = node_id;
        }
        if let Some(k) = parse_var(&lookup, "HOMEOSTAT_K")? {
            cfg.pulse.k = k;
        }
        if let Some(p) = parse_var(&lookup, "HOMEOSTAT_P")? {
            cfg.pulse.p = p;
        }
        if let Some(t1) = parse_var(&lookup, "HOMEOSTAT_T1")? {
            cfg.pulse.t1 = t1;
        }
        if let Some(beats) = parse_var(&lookup, "HOMEOSTAT_BEATS")? {
            cfg.arbiter.beats = Some(beats);
        }
        if let Some(path) = lookup("HOMEOSTAT_LEDGER_PATH") {
            cfg.ledger.path = (!path.is_empty()).then(|| PathBuf::from(path));
        }
        if let Some(enabled) = parse_var(&lookup, "HOMEOSTAT_MESH_ENABLED")? {
            cfg.mesh.enabled = enabled;
        }
        if let Some(host) = lookup("HOMEOSTAT_MESH_HOST") {
            cfg.mesh.host = host;
        }
        if let Some(port) = parse_var(&lookup, "HOMEOSTAT_MESH_PORT")? {
            cfg.mesh.port = port;
        }
        if let Some(peers) = lookup("HOMEOSTAT_MESH_PEERS") {
            cfg.mesh.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the organism cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(invalid("node_id", "must not be empty"));
        }
        self.pulse.to_pulse_config().validate()?;
        if self.control.stability_window == 0 {
            return Err(invalid("control.stability_window", "must be at least 1"));
        }
        if self.ledger.flush_every == 0 {
            return Err(invalid("ledger.flush_every", "must be at least 1"));
        }
        if self.mesh.queue_capacity == 0 {
            return Err(invalid("mesh.queue_capacity", "must be at least 1"));
        }
        Ok(())
    }

    pub fn mesh_config(&self) -> MeshConfig {
        MeshConfig {
            node_id: self.node_id.clone(),
            host: self.mesh.host.clone(),
            port: self.mesh.port,
            queue_capacity: self.mesh.queue_capacity,
            rate_per_sec: self.mesh.rate_per_sec,
            burst: self.mesh.burst,
            ..MeshConfig::default()
        }
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            path: self.ledger.path.clone(),
            flush_every: self.ledger.flush_every,
        }
    }
}

fn invalid(name: &str, reason: &str) -> homeostat_common::HomeostatError {
    ConfigError::InvalidParameter {
        name: name.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn parse_var<T, F>(lookup: &F, var: &str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value.trim().parse().map(Some).map_err(|_| {
            ConfigError::InvalidEnv {
                var: var.to_string(),
                value,
            }
            .into()
        }),
    }
}

/// Pulse parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulseSettings {
    pub k: u32,
    pub p: u32,
    pub t1: f64,
    pub u: f64,
}

impl Default for PulseSettings {
    fn default() -> Self {
        let defaults = PulseConfig::default();
        Self {
            k: defaults.k,
            p: defaults.p,
            t1: defaults.t1,
            u: defaults.u,
        }
    }
}

impl PulseSettings {
    pub fn to_pulse_config(&self) -> PulseConfig {
        PulseConfig {
            k: self.k,
            p: self.p,
            t1: self.t1,
            u: self.u,
        }
    }
}

/// PID settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSettings {
    pub setpoint: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Samples that must all be stable for `pid_stable`
    pub stability_window: usize,
}

impl Default for ControlSettings {
    fn default() -> Self {
        let defaults = ControlConfig::default();
        Self {
            setpoint: defaults.setpoint,
            kp: defaults.pid_kp,
            ki: defaults.pid_ki,
            kd: defaults.pid_kd,
            stability_window: defaults.stability_window,
        }
    }
}

impl ControlSettings {
    pub fn to_control_config(&self) -> ControlConfig {
        ControlConfig {
            setpoint: self.setpoint,
            pid_kp: self.kp,
            pid_ki: self.ki,
            pid_kd: self.kd,
            stability_window: self.stability_window,
        }
    }
}

/// Ledger durability settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSettings {
    /// JSON-lines file (in-memory ledger when unset)
    pub path: Option<PathBuf>,
    pub flush_every: usize,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        let defaults = LedgerConfig::default();
        Self {
            path: defaults.path,
            flush_every: defaults.flush_every,
        }
    }
}

/// Mesh settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// `host:port` addresses dialed at startup
    pub peers: Vec<String>,
    pub queue_capacity: usize,
    pub rate_per_sec: f64,
    pub burst: u32,
    /// Broadcast risk/ML state after every beat
    pub broadcast_genome: bool,
}

impl Default for MeshSettings {
    fn default() -> Self {
        let defaults = MeshConfig::default();
        Self {
            enabled: false,
            host: defaults.host,
            port: 7070,
            peers: Vec::new(),
            queue_capacity: defaults.queue_capacity,
            rate_per_sec: defaults.rate_per_sec,
            burst: defaults.burst,
            broadcast_genome: true,
        }
    }
}

/// Beat loop behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterSettings {
    /// Beats to run (unbounded when unset)
    pub beats: Option<u64>,
    /// Let the Balance core's gain suggestions retune the PID
    pub adopt_balance_gains: bool,
    /// Apply hybrid entropy feedback to the E weight
    pub hybrid_entropy_feedback: bool,
    /// Sleep for the pulse delay between beats
    pub pace_beats: bool,
}

impl Default for ArbiterSettings {
    fn default() -> Self {
        Self {
            beats: None,
            adopt_balance_gains: true,
            hybrid_entropy_feedback: true,
            pace_beats: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homeostat_common::HomeostatError;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = HomeostatConfig::from_lookup(lookup(&[])).unwrap();
        assert!(cfg.node_id.starts_with("homeostat-"));
        assert_eq!((cfg.pulse.k, cfg.pulse.p), (4, 5));
        assert!(!cfg.mesh.enabled);
        assert!(cfg.ledger.path.is_none());
        assert!(cfg.arbiter.beats.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let cfg = HomeostatConfig::from_lookup(lookup(&[
            ("HOMEOSTAT_NODE_ID", "alpha"),
            ("HOMEOSTAT_K", "8"),
            ("HOMEOSTAT_BEATS", "25"),
            ("HOMEOSTAT_LEDGER_PATH", "/tmp/alpha.jsonl"),
            ("HOMEOSTAT_MESH_ENABLED", "true"),
            ("HOMEOSTAT_MESH_PORT", "9100"),
            ("HOMEOSTAT_MESH_PEERS", "10.0.0.2:9100, 10.0.0.3:9100,"),
        ]))
        .unwrap();

        assert_eq!(cfg.node_id, "alpha");
        assert_eq!(cfg.pulse.k, 8);
        assert_eq!(cfg.arbiter.beats, Some(25));
        assert_eq!(cfg.ledger.path, Some(PathBuf::from("/tmp/alpha.jsonl")));
        assert!(cfg.mesh.enabled);
        assert_eq!(cfg.mesh.port, 9100);
        assert_eq!(cfg.mesh.peers, vec!["10.0.0.2:9100", "10.0.0.3:9100"]);
        assert_eq!(cfg.mesh_config().node_id, "alpha");
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let err = HomeostatConfig::from_lookup(lookup(&[("HOMEOSTAT_MESH_PORT", "seventy")]))
            .unwrap_err();
        assert!(matches!(
            err,
            HomeostatError::Config(ConfigError::InvalidEnv { ref var, .. }) if var == "HOMEOSTAT_MESH_PORT"
        ));
    }

    #[test]
    fn test_unstable_pulse_rejected() {
        let err = HomeostatConfig::from_lookup(lookup(&[("HOMEOSTAT_K", "1"), ("HOMEOSTAT_P", "1")]))
            .unwrap_err();
        assert!(matches!(
            err,
            HomeostatError::Config(ConfigError::StabilityViolated { .. })
        ));
    }

    #[test]
    fn test_huge_base_time_rejected() {
        let err = HomeostatConfig::from_lookup(lookup(&[("HOMEOSTAT_T1", "1e12")])).unwrap_err();
        assert!(matches!(
            err,
            HomeostatError::Config(ConfigError::InvalidParameter { ref name, .. }) if name == "t1"
        ));
    }
}
