//! Threat scoring for the Entropy core

/// Maps a total anomaly count to a threat score in [0, 1].
///
/// Implementations may be learned models; the Entropy core rejects scores
/// that are not finite or fall outside [0, 1].
pub trait ThreatScorer: Send + Sync {
    fn score(&self, total_anomalies: u64) -> f64;

    /// Name recorded with entropy results
    fn name(&self) -> &str {
        "custom"
    }
}

/// Logistic fallback: `1 / (1 + e^(−total/10))`
#[derive(Debug, Clone, Copy, Default)]
pub struct LogisticScorer;

impl ThreatScorer for LogisticScorer {
    fn score(&self, total_anomalies: u64) -> f64 {
        1.0 / (1.0 + (-(total_anomalies as f64) / 10.0).exp())
    }

    fn name(&self) -> &str {
        "logistic"
    }
}

impl<F> ThreatScorer for F
where
    F: Fn(u64) -> f64 + Send + Sync,
{
    fn score(&self, total_anomalies: u64) -> f64 {
        self(total_anomalies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logistic_midpoint() {
        assert!((LogisticScorer.score(0) - 0.5).abs() < 1e-12);
        assert!(LogisticScorer.score(100) > 0.9999);
    }

    #[test]
    fn test_closure_scorer() {
        let scorer = |n: u64| if n > 3 { 0.9 } else { 0.1 };
        assert_eq!(scorer.score(5), 0.9);
        assert_eq!(ThreatScorer::name(&scorer), "custom");
    }
}
