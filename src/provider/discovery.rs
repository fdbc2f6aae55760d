//! Discovery resolver with per-signature caching and retry.
//!
//! Discovery queries are read-only inventory lookups. Within one engine run
//! each distinct query signature is resolved at most once; the cached result
//! is shared by every unit that references the query. Caches never outlive a
//! run. Each signature has its own cell, so units resolving unrelated
//! queries never contend on a shared lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use crate::catalog::DiscoveryQuery;
use crate::error::{ProviderError, Result, StackforgeError};

use super::api::{CloudProvider, DiscoveredItem};

/// Maximum resolution attempts per query.
const MAX_ATTEMPTS: u32 = 5;

/// Base backoff delay in seconds.
const BACKOFF_BASE_SECS: u64 = 1;

/// Backoff delay cap in seconds.
const BACKOFF_CAP_SECS: u64 = 30;

/// The cached result of one discovery query.
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    /// Signature of the query that produced this result.
    pub signature: String,
    /// Discovered items, in provider order.
    pub items: Vec<DiscoveredItem>,
    /// Number of provider attempts it took to resolve.
    pub attempts: u32,
}

/// Resolver for discovery queries.
pub struct DiscoveryResolver {
    /// Provider to query.
    provider: Arc<dyn CloudProvider>,
    /// Result cells keyed by query signature.
    cells: Mutex<HashMap<String, Arc<OnceCell<Arc<DiscoveryResult>>>>>,
}

impl DiscoveryResolver {
    /// Creates a new resolver over the given provider.
    #[must_use]
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self {
            provider,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves a discovery query, returning the cached result if the
    /// signature was already resolved in this run.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Unavailable`] once transient failures exhaust
    /// the retry budget; terminal provider errors surface unchanged.
    pub async fn resolve(&self, query: &DiscoveryQuery) -> Result<Arc<DiscoveryResult>> {
        let signature = query.signature();

        let cell = {
            let mut cells = self.cells.lock().await;
            Arc::clone(cells.entry(signature.clone()).or_default())
        };

        let result = cell
            .get_or_try_init(|| self.fetch_with_backoff(query, &signature))
            .await?;

        Ok(Arc::clone(result))
    }

    /// Fetches one query with exponential backoff over transient errors.
    async fn fetch_with_backoff(
        &self,
        query: &DiscoveryQuery,
        signature: &str,
    ) -> Result<Arc<DiscoveryResult>> {
        let mut last_error: Option<StackforgeError> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                let delay = Self::backoff_delay(attempt, last_error.as_ref());
                debug!(
                    "Retrying discovery {signature} (attempt {attempt} of {MAX_ATTEMPTS}) after {}s",
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
            }

            match self.provider.list(query).await {
                Ok(items) => {
                    debug!("Discovery {signature} resolved {} items", items.len());
                    return Ok(Arc::new(DiscoveryResult {
                        signature: signature.to_string(),
                        items,
                        attempts: attempt,
                    }));
                }
                Err(e) if e.is_transient() => {
                    warn!("Transient discovery failure for {signature}: {e}");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let message = last_error.map_or_else(String::new, |e| e.to_string());
        Err(StackforgeError::Provider(ProviderError::Unavailable {
            attempts: MAX_ATTEMPTS,
            message,
        }))
    }

    /// Computes the backoff delay before the given attempt.
    ///
    /// Exponential from the base, capped, but never shorter than a
    /// provider-suggested Retry-After.
    fn backoff_delay(attempt: u32, last_error: Option<&StackforgeError>) -> Duration {
        let exponential = BACKOFF_BASE_SECS << (attempt - 2).min(63);
        let suggested = last_error.and_then(StackforgeError::retry_delay_secs).unwrap_or(0);
        Duration::from_secs(exponential.max(suggested).min(BACKOFF_CAP_SECS))
    }
}

impl std::fmt::Debug for DiscoveryResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryResolver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::catalog::ResourceKind;
    use crate::provider::api::{CreatedResource, ResourceAttrs};

    /// Provider that fails a scripted number of times before succeeding.
    struct FlakyProvider {
        calls: AtomicU32,
        failures_before_success: u32,
    }

    impl FlakyProvider {
        fn new(failures_before_success: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures_before_success,
            }
        }
    }

    #[async_trait]
    impl CloudProvider for FlakyProvider {
        async fn create(
            &self,
            _kind: ResourceKind,
            _attributes: &ResourceAttrs,
        ) -> Result<CreatedResource> {
            unreachable!("discovery never creates")
        }

        async fn read(&self, _provider_id: &str) -> Result<ResourceAttrs> {
            unreachable!("discovery never reads resources")
        }

        async fn update(
            &self,
            _provider_id: &str,
            _attributes: &ResourceAttrs,
        ) -> Result<CreatedResource> {
            unreachable!("discovery never updates")
        }

        async fn delete(&self, _provider_id: &str) -> Result<()> {
            unreachable!("discovery never deletes")
        }

        async fn list(&self, _query: &DiscoveryQuery) -> Result<Vec<DiscoveredItem>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                return Err(StackforgeError::Provider(ProviderError::network(
                    "connection reset",
                )));
            }
            Ok(vec![
                DiscoveredItem::new("subnet-1", "eu-west-1a"),
                DiscoveredItem::new("subnet-2", "eu-west-1b"),
            ])
        }
    }

    fn subnet_query() -> DiscoveryQuery {
        DiscoveryQuery::SubnetsByVpc {
            vpc_id: String::from("vpc-1"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_retries_transient_failures() {
        let provider = Arc::new(FlakyProvider::new(2));
        let resolver = DiscoveryResolver::new(Arc::clone(&provider) as Arc<dyn CloudProvider>);

        let result = resolver.resolve(&subnet_query()).await.unwrap();

        assert_eq!(result.items.len(), 2);
        assert_eq!(result.attempts, 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_caches_by_signature() {
        let provider = Arc::new(FlakyProvider::new(0));
        let resolver = DiscoveryResolver::new(Arc::clone(&provider) as Arc<dyn CloudProvider>);

        let first = resolver.resolve(&subnet_query()).await.unwrap();
        let second = resolver.resolve(&subnet_query()).await.unwrap();

        assert_eq!(first.items, second.items);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_exhausts_retries() {
        let provider = Arc::new(FlakyProvider::new(u32::MAX));
        let resolver = DiscoveryResolver::new(Arc::clone(&provider) as Arc<dyn CloudProvider>);

        let err = resolver.resolve(&subnet_query()).await.unwrap_err();

        assert!(matches!(
            err,
            StackforgeError::Provider(ProviderError::Unavailable { attempts: 5, .. })
        ));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_signatures_resolve_independently() {
        let provider = Arc::new(FlakyProvider::new(0));
        let resolver = DiscoveryResolver::new(Arc::clone(&provider) as Arc<dyn CloudProvider>);

        resolver.resolve(&subnet_query()).await.unwrap();
        resolver
            .resolve(&DiscoveryQuery::SubnetsByVpc {
                vpc_id: String::from("vpc-2"),
            })
            .await
            .unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }
}
