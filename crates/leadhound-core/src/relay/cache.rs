use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use moka::future::Cache;

use super::RelayCandidate;
use crate::traits::RelayProvider;

/// Provider wrapper that caches a successful candidate list for a TTL.
///
/// Clones share the cache, so one wrapper can back the pools of several
/// concurrently running jobs. Empty answers are not cached.
#[derive(Clone)]
pub struct CachedProvider {
    inner: Arc<dyn RelayProvider>,
    cache: Cache<(), Arc<Vec<RelayCandidate>>>,
}

impl CachedProvider {
    pub fn new(inner: Arc<dyn RelayProvider>, ttl: Duration) -> Self {
        let cache = Cache::builder().max_capacity(1).time_to_live(ttl).build();
        Self { inner, cache }
    }

    /// Drop the cached list so the next fetch hits the provider.
    pub async fn invalidate(&self) {
        self.cache.invalidate(&()).await;
    }
}

impl RelayProvider for CachedProvider {
    fn source_id(&self) -> &str {
        self.inner.source_id()
    }

    fn fetch_candidates(&self) -> BoxFuture<'_, Vec<RelayCandidate>> {
        Box::pin(async move {
            let inner = Arc::clone(&self.inner);
            let batch = self
                .cache
                .try_get_with((), async move {
                    let batch = inner.fetch_candidates().await;
                    if batch.is_empty() {
                        Err(())
                    } else {
                        Ok(Arc::new(batch))
                    }
                })
                .await;

            match batch {
                Ok(batch) => batch.as_ref().clone(),
                Err(_) => Vec::new(),
            }
        })
    }
}
