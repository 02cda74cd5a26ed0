//! Per-job relay pool.
//!
//! ```text
//! refresh():  providers --(concurrent)--> merge/dedup --> sort by score desc
//! acquire():  walk ranked list, skip failed, probe each
//!               probe ok   -> return candidate
//!               probe fail -> mark failed, advance
//!             exhausted -> one lazy refresh -> walk again
//!             still empty -> None (direct allowed) | PoolExhausted
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;

use super::RelayCandidate;
use crate::error::AppError;
use crate::traits::{RelayProbe, RelayProvider};

#[derive(Debug, Default)]
struct PoolState {
    /// Ordered by descending score, provider-arrival order on ties.
    candidates: Vec<RelayCandidate>,
    /// Addresses that failed in this generation.
    failed: HashSet<String>,
    generation: u64,
}

/// Point-in-time view of a pool for monitoring.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub generation: u64,
    pub candidates: Vec<RelayCandidate>,
    pub failed: usize,
}

/// Ranked relay pool owned by a single job.
pub struct RelayPool<R: RelayProbe> {
    providers: Vec<Arc<dyn RelayProvider>>,
    probe: R,
    state: Mutex<PoolState>,
}

impl<R: RelayProbe> RelayPool<R> {
    pub fn new(providers: Vec<Arc<dyn RelayProvider>>, probe: R) -> Self {
        Self {
            providers,
            probe,
            state: Mutex::new(PoolState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Relay pool recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Query every provider concurrently and replace the pool.
    ///
    /// Clears the failure set and starts a new generation. Returns the number
    /// of candidates in the new pool.
    pub async fn refresh(&self) -> usize {
        let fetches = self.providers.iter().map(|provider| async move {
            let candidates = provider.fetch_candidates().await;
            tracing::debug!(
                source = %provider.source_id(),
                count = candidates.len(),
                "Relay provider answered"
            );
            candidates
        });
        let batches = join_all(fetches).await;
        let merged = merge_candidates(batches);

        let mut state = self.lock_state();
        state.candidates = merged;
        state.failed.clear();
        state.generation += 1;

        tracing::info!(
            generation = state.generation,
            candidates = state.candidates.len(),
            "Relay pool refreshed"
        );
        state.candidates.len()
    }

    /// Return the best reachable candidate.
    ///
    /// Performs at most one lazy refresh when the pool runs dry. With
    /// `allow_direct`, an exhausted pool yields `Ok(None)` (direct mode);
    /// otherwise it is [`AppError::PoolExhausted`].
    pub async fn acquire(&self, allow_direct: bool) -> Result<Option<RelayCandidate>, AppError> {
        let mut refreshed = false;

        loop {
            while let Some((candidate, generation)) = self.next_untried() {
                if !self.probe.probe(&candidate).await {
                    tracing::debug!(relay = %candidate.address, "Relay failed reachability probe");
                    self.mark_failed(&candidate);
                    continue;
                }

                // Another lane may have failed this relay while we probed it.
                let state = self.lock_state();
                if state.generation == generation && state.failed.contains(&candidate.address) {
                    continue;
                }
                drop(state);

                tracing::info!(relay = %candidate, "Relay acquired");
                return Ok(Some(candidate));
            }

            if refreshed {
                break;
            }
            self.refresh().await;
            refreshed = true;
        }

        if allow_direct {
            tracing::warn!("Relay pool exhausted, falling back to direct mode");
            Ok(None)
        } else {
            Err(AppError::PoolExhausted)
        }
    }

    fn next_untried(&self) -> Option<(RelayCandidate, u64)> {
        let state = self.lock_state();
        state
            .candidates
            .iter()
            .find(|c| !state.failed.contains(&c.address))
            .map(|c| (c.clone(), state.generation))
    }

    /// Add the candidate to the failure set. Idempotent.
    pub fn mark_failed(&self, candidate: &RelayCandidate) {
        let mut state = self.lock_state();
        if state.failed.insert(candidate.address.clone()) {
            tracing::debug!(relay = %candidate.address, "Relay marked failed");
        }
    }

    pub fn is_failed(&self, candidate: &RelayCandidate) -> bool {
        self.lock_state().failed.contains(&candidate.address)
    }

    /// Clear the failure set without re-querying providers.
    pub fn reset(&self) {
        let mut state = self.lock_state();
        state.failed.clear();
        tracing::info!(generation = state.generation, "Relay failure set reset");
    }

    pub fn len(&self) -> usize {
        self.lock_state().candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self) -> u64 {
        self.lock_state().generation
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.lock_state();
        PoolSnapshot {
            generation: state.generation,
            candidates: state.candidates.clone(),
            failed: state.failed.len(),
        }
    }
}

/// Flatten provider batches, keep the first occurrence of each address and
/// sort by descending score. The sort is stable, so ties keep arrival order.
fn merge_candidates(batches: Vec<Vec<RelayCandidate>>) -> Vec<RelayCandidate> {
    let mut seen = HashSet::new();
    let mut merged: Vec<RelayCandidate> = batches
        .into_iter()
        .flatten()
        .filter(|c| seen.insert(c.address.clone()))
        .collect();
    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockProbe, MockProvider, candidate};

    fn pool_with(
        providers: Vec<MockProvider>,
        probe: MockProbe,
    ) -> RelayPool<MockProbe> {
        let providers = providers
            .into_iter()
            .map(|p| Arc::new(p) as Arc<dyn RelayProvider>)
            .collect();
        RelayPool::new(providers, probe)
    }

    #[tokio::test]
    async fn acquire_skips_unreachable_in_score_order() {
        let provider = MockProvider::new(
            "free",
            vec![
                candidate("10.0.0.2:80", 70.0),
                candidate("10.0.0.1:80", 90.0),
                candidate("10.0.0.3:80", 50.0),
            ],
        );
        let probe = MockProbe::reachable(&["10.0.0.3:80"]);
        let pool = pool_with(vec![provider], probe.clone());

        let relay = pool.acquire(false).await.unwrap().unwrap();

        assert_eq!(relay.address, "10.0.0.3:80");
        assert_eq!(
            probe.probed(),
            vec!["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]
        );
        assert!(pool.is_failed(&candidate("10.0.0.1:80", 90.0)));
        assert!(pool.is_failed(&candidate("10.0.0.2:80", 70.0)));
    }

    #[tokio::test]
    async fn acquire_never_returns_failed_candidate_within_generation() {
        let provider = MockProvider::new(
            "free",
            vec![candidate("10.0.0.1:80", 90.0), candidate("10.0.0.2:80", 80.0)],
        );
        let pool = pool_with(vec![provider], MockProbe::all_reachable());
        pool.refresh().await;

        let first = pool.acquire(false).await.unwrap().unwrap();
        assert_eq!(first.address, "10.0.0.1:80");
        pool.mark_failed(&first);

        let second = pool.acquire(false).await.unwrap().unwrap();
        assert_eq!(second.address, "10.0.0.2:80");
        assert_eq!(pool.generation(), 1);
    }

    #[tokio::test]
    async fn exhausted_pool_refreshes_once_then_goes_direct() {
        let provider = MockProvider::new("free", vec![candidate("10.0.0.1:80", 90.0)]);
        let pool = pool_with(vec![provider.clone()], MockProbe::none_reachable());

        let relay = pool.acquire(true).await.unwrap();

        assert!(relay.is_none());
        // Initial empty pool -> one lazy refresh, nothing more.
        assert_eq!(provider.fetch_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_pool_without_direct_is_pool_exhausted() {
        let pool = pool_with(
            vec![MockProvider::new("free", vec![])],
            MockProbe::all_reachable(),
        );
        let err = pool.acquire(false).await.unwrap_err();
        assert!(matches!(err, AppError::PoolExhausted));
    }

    #[tokio::test]
    async fn refresh_clears_failures_and_bumps_generation() {
        let provider = MockProvider::new("free", vec![candidate("10.0.0.1:80", 90.0)]);
        let pool = pool_with(vec![provider], MockProbe::all_reachable());
        pool.refresh().await;
        let c = candidate("10.0.0.1:80", 90.0);
        pool.mark_failed(&c);
        pool.mark_failed(&c);
        assert_eq!(pool.snapshot().failed, 1);

        pool.refresh().await;

        assert!(!pool.is_failed(&c));
        assert_eq!(pool.generation(), 2);
        assert_eq!(pool.acquire(false).await.unwrap().unwrap().address, "10.0.0.1:80");
    }

    #[tokio::test]
    async fn failing_provider_contributes_nothing() {
        let good = MockProvider::new("good", vec![candidate("10.0.0.1:80", 40.0)]);
        let broken = MockProvider::new("broken", vec![]);
        let pool = pool_with(vec![broken, good], MockProbe::all_reachable());

        assert_eq!(pool.refresh().await, 1);
    }

    #[test]
    fn merge_dedups_and_keeps_arrival_order_on_ties() {
        let merged = merge_candidates(vec![
            vec![candidate("a:1", 50.0), candidate("b:1", 80.0)],
            vec![candidate("c:1", 50.0), candidate("a:1", 99.0)],
        ]);
        let addrs: Vec<_> = merged.iter().map(|c| c.address.as_str()).collect();
        assert_eq!(addrs, vec!["b:1", "a:1", "c:1"]);
        assert!((merged[1].score - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn reset_clears_failures_without_fetching() {
        let provider = MockProvider::new("free", vec![candidate("10.0.0.1:80", 90.0)]);
        let pool = pool_with(vec![provider.clone()], MockProbe::all_reachable());
        pool.refresh().await;
        pool.mark_failed(&candidate("10.0.0.1:80", 90.0));

        pool.reset();

        assert_eq!(pool.snapshot().failed, 0);
        assert_eq!(provider.fetch_count(), 1);
    }
}
