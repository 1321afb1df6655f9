//! Parallel execution of the four cores

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use homeostat_common::{CoreError, CoreKind, Genome};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::{CoreResult, Features, ScoringCore, ThreatScorer};

struct CoreSlot {
    core: ScoringCore,
    iterations: AtomicU64,
}

/// The four cores with their iteration counters
pub struct CoreSet {
    slots: Vec<CoreSlot>,
}

impl Default for CoreSet {
    fn default() -> Self {
        Self::new(ScoringCore::entropy())
    }
}

impl CoreSet {
    /// Regen, Balance, the given Entropy core and Optimize
    pub fn new(entropy: ScoringCore) -> Self {
        let slots = [ScoringCore::Regen, ScoringCore::Balance, entropy, ScoringCore::Optimize]
            .into_iter()
            .map(|core| CoreSlot {
                core,
                iterations: AtomicU64::new(0),
            })
            .collect();
        Self { slots }
    }

    /// Core set whose Entropy core uses `scorer`
    pub fn with_scorer(scorer: Arc<dyn ThreatScorer>) -> Self {
        Self::new(ScoringCore::Entropy(scorer))
    }

    /// Completed iterations of one core
    pub fn iterations(&self, kind: CoreKind) -> u64 {
        self.slots
            .iter()
            .find(|s| s.core.kind() == kind)
            .map(|s| s.iterations.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Run every core once on the blocking pool and wait for all of them.
    ///
    /// Results come back in R, B, E, O order. A core that panics yields an
    /// error result.
    pub async fn run_all(
        self: &Arc<Self>,
        genome: Arc<Genome>,
        features: Features,
    ) -> Vec<CoreResult> {
        let mut tasks = JoinSet::new();
        for index in 0..self.slots.len() {
            let cores = Arc::clone(self);
            let genome = Arc::clone(&genome);
            tasks.spawn_blocking(move || {
                let slot = &cores.slots[index];
                let iteration = slot.iterations.fetch_add(1, Ordering::Relaxed) + 1;
                (index, slot.core.execute(iteration, &genome, &features))
            });
        }

        let mut results: Vec<Option<CoreResult>> = vec![None; self.slots.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => {
                    if let Some(e) = &result.error {
                        warn!(core = %result.core, error = %e, "Core failed");
                    }
                    results[index] = Some(result);
                }
                Err(e) => error!(error = %e, "Core task aborted"),
            }
        }

        let results: Vec<CoreResult> = results
            .into_iter()
            .zip(&self.slots)
            .map(|(result, slot)| {
                result.unwrap_or_else(|| {
                    let kind = slot.core.kind();
                    CoreResult::failure(
                        kind,
                        slot.iterations.load(Ordering::Relaxed),
                        CoreError::Panicked {
                            core: kind.to_string(),
                        },
                    )
                })
            })
            .collect();

        debug!(beat = features.beat, "Cores complete");
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features() -> Features {
        Features {
            pulse_value: 0.0042,
            beat: 1,
            anomalies: 0,
        }
    }

    #[tokio::test]
    async fn test_run_all_in_core_order() {
        let cores = Arc::new(CoreSet::default());
        let results = cores.run_all(Arc::new(Genome::default()), features()).await;
        let kinds: Vec<CoreKind> = results.iter().map(|r| r.core).collect();
        assert_eq!(kinds, CoreKind::ALL.to_vec());
        assert!(results.iter().all(|r| !r.is_error()));
        assert!(results.iter().all(|r| r.iteration == 1));
    }

    #[tokio::test]
    async fn test_panicking_scorer_is_contained() {
        let cores = Arc::new(CoreSet::with_scorer(Arc::new(|_: u64| -> f64 {
            panic!("model crashed")
        })));
        let results = cores.run_all(Arc::new(Genome::default()), features()).await;

        assert_eq!(results.len(), 4);
        assert!(results[2].is_error());
        assert_eq!(results[2].core, CoreKind::Entropy);
        assert!(results.iter().filter(|r| r.is_error()).count() == 1);
    }

    #[tokio::test]
    async fn test_iterations_advance() {
        let cores = Arc::new(CoreSet::default());
        for _ in 0..3 {
            cores.run_all(Arc::new(Genome::default()), features()).await;
        }
        assert_eq!(cores.iterations(CoreKind::Balance), 3);
    }
}
