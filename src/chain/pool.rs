//! RPC endpoint pool with health probes and shuffled failover
//!
//! The endpoint list and its health flags are replaced wholesale on refresh.
//! Callers clone the current snapshot before iterating, so a refresh never
//! mutates a list that a call is walking.

use super::{ChainClient, ClientFactory, EndpointDiscovery};
use crate::error::{ChainError, ChainResult};
use crate::events::{ObservedBlock, TxReceipt};

use futures::future::join_all;
use rand::seq::SliceRandom;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One RPC connection and its last probe result
pub struct Endpoint {
    pub url: String,
    pub client: Arc<dyn ChainClient>,
    pub healthy: bool,
}

type Snapshot = Arc<Vec<Endpoint>>;

pub struct EndpointPool {
    chain: String,
    urls: Vec<String>,
    factory: Arc<dyn ClientFactory>,
    discovery: Option<Arc<dyn EndpointDiscovery>>,
    snapshot: RwLock<Snapshot>,
    probe_timeout: Duration,
}

impl EndpointPool {
    /// Resolve and probe the endpoints once. Fails if no endpoint could be created.
    pub async fn connect(
        chain: &str,
        urls: Vec<String>,
        factory: Arc<dyn ClientFactory>,
        discovery: Option<Arc<dyn EndpointDiscovery>>,
        probe_timeout: Duration,
    ) -> ChainResult<Self> {
        let pool = Self {
            chain: chain.to_string(),
            urls,
            factory,
            discovery,
            snapshot: RwLock::new(Arc::new(Vec::new())),
            probe_timeout,
        };
        pool.refresh().await?;
        Ok(pool)
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    async fn snapshot(&self) -> Snapshot {
        self.snapshot.read().await.clone()
    }

    /// First healthy endpoint of the current snapshot
    pub async fn healthy_endpoint(&self) -> Option<Arc<dyn ChainClient>> {
        self.snapshot()
            .await
            .iter()
            .find(|e| e.healthy)
            .map(|e| e.client.clone())
    }

    pub async fn healthy_count(&self) -> usize {
        self.snapshot().await.iter().filter(|e| e.healthy).count()
    }

    pub async fn endpoint_count(&self) -> usize {
        self.snapshot().await.len()
    }

    /// Run `op` against the healthy endpoints in random order until one succeeds.
    ///
    /// Transport failures move on to the next endpoint; answers such as `NotFound`
    /// are returned as-is. When every endpoint fails the last error is wrapped in
    /// `NoHealthyEndpoint`.
    pub async fn call<T, F, Fut>(&self, timeout: Duration, op: F) -> ChainResult<T>
    where
        F: Fn(Arc<dyn ChainClient>) -> Fut,
        Fut: Future<Output = ChainResult<T>>,
    {
        let mut candidates: Vec<(String, Arc<dyn ChainClient>)> = self
            .snapshot()
            .await
            .iter()
            .filter(|e| e.healthy)
            .map(|e| (e.url.clone(), e.client.clone()))
            .collect();
        candidates.shuffle(&mut rand::thread_rng());

        let mut last = None;
        for (url, client) in candidates {
            let result = match tokio::time::timeout(timeout, op(client)).await {
                Ok(result) => result,
                Err(_) => Err(ChainError::Timeout {
                    endpoint: url.clone(),
                    after: timeout,
                }),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_failover() => {
                    debug!(chain = %self.chain, endpoint = %url, error = %e, "Endpoint call failed, trying next");
                    last = Some(Box::new(e));
                }
                Err(e) => return Err(e),
            }
        }

        Err(ChainError::NoHealthyEndpoint {
            chain: self.chain.clone(),
            last,
        })
    }

    /// Re-resolve, reconnect and probe every endpoint, then swap the snapshot in.
    /// Returns the number of healthy endpoints.
    pub async fn refresh(&self) -> ChainResult<usize> {
        let urls = self.resolve_urls().await;

        let connects = urls.iter().map(|url| async move {
            match self.factory.connect(url).await {
                Ok(client) => {
                    let healthy = self.probe(url, client.as_ref()).await;
                    Some(Endpoint {
                        url: url.clone(),
                        client,
                        healthy,
                    })
                }
                Err(e) => {
                    warn!(chain = %self.chain, endpoint = %url, error = %e, "Failed to connect endpoint");
                    None
                }
            }
        });
        let endpoints: Vec<Endpoint> = join_all(connects).await.into_iter().flatten().collect();

        if endpoints.is_empty() {
            return Err(ChainError::NoHealthyEndpoint {
                chain: self.chain.clone(),
                last: None,
            });
        }

        let healthy = endpoints.iter().filter(|e| e.healthy).count();
        let total = endpoints.len();

        let stale = {
            let mut guard = self.snapshot.write().await;
            std::mem::replace(&mut *guard, Arc::new(endpoints))
        };
        // Old connections go away once in-flight callers release their snapshot
        drop(stale);

        crate::metrics::record_healthy_endpoints(&self.chain, healthy);
        info!(chain = %self.chain, healthy, total, "Endpoint pool refreshed");
        Ok(healthy)
    }

    /// Periodic refresh until cancelled. While no endpoint is healthy the pool is
    /// probed every `unhealthy_every` instead of every `every`.
    pub async fn run_refresh(
        self: Arc<Self>,
        every: Duration,
        unhealthy_every: Duration,
        cancel: CancellationToken,
    ) {
        let mut healthy = self.healthy_count().await;
        loop {
            let wait = if healthy == 0 { unhealthy_every } else { every };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            healthy = match self.refresh().await {
                Ok(healthy) => healthy,
                Err(e) => {
                    warn!(chain = %self.chain, error = %e, "Endpoint refresh failed, keeping previous endpoints");
                    self.healthy_count().await
                }
            };
            if healthy == 0 {
                warn!(chain = %self.chain, retry_ms = unhealthy_every.as_millis() as u64, "No healthy endpoint");
            }
        }
        debug!(chain = %self.chain, "Endpoint refresh loop stopped");
    }

    async fn resolve_urls(&self) -> Vec<String> {
        let mut urls = self.urls.clone();

        if let Some(discovery) = &self.discovery {
            match discovery.discover(&self.chain).await {
                Ok(found) => urls.extend(found),
                Err(e) => warn!(chain = %self.chain, error = %e, "Endpoint discovery failed"),
            }
        }

        let mut seen = std::collections::HashSet::new();
        urls.retain(|u| seen.insert(u.clone()));
        urls
    }

    async fn probe(&self, url: &str, client: &dyn ChainClient) -> bool {
        match tokio::time::timeout(self.probe_timeout, client.current_height()).await {
            Ok(Ok(height)) => {
                debug!(chain = %self.chain, endpoint = %url, height, "Endpoint healthy");
                true
            }
            Ok(Err(e)) => {
                warn!(chain = %self.chain, endpoint = %url, error = %e, "Endpoint probe failed");
                false
            }
            Err(_) => {
                warn!(chain = %self.chain, endpoint = %url, "Endpoint probe timed out");
                false
            }
        }
    }

    pub async fn current_height(&self, timeout: Duration) -> ChainResult<u64> {
        self.call(timeout, |c| async move { c.current_height().await })
            .await
    }

    pub async fn block_by_height(&self, height: u64, timeout: Duration) -> ChainResult<ObservedBlock> {
        self.call(timeout, |c| async move { c.block_by_height(height).await })
            .await
    }

    pub async fn receipt(&self, tx_hash: &str, timeout: Duration) -> ChainResult<TxReceipt> {
        self.call(timeout, |c| {
            let tx_hash = tx_hash.to_string();
            async move { c.receipt(&tx_hash).await }
        })
        .await
    }

    pub async fn suggest_gas_price(&self, timeout: Duration) -> ChainResult<u128> {
        self.call(timeout, |c| async move { c.suggest_gas_price().await })
            .await
    }

    pub async fn submit(&self, raw_tx: &[u8], timeout: Duration) -> ChainResult<String> {
        self.call(timeout, |c| {
            let raw_tx = raw_tx.to_vec();
            async move { c.submit(&raw_tx).await }
        })
        .await
    }

    pub async fn find_by_hash(&self, tx_hash: &str, timeout: Duration) -> ChainResult<bool> {
        self.call(timeout, |c| {
            let tx_hash = tx_hash.to_string();
            async move { c.find_by_hash(&tx_hash).await }
        })
        .await
    }

    pub async fn nonce(&self, address: &str, timeout: Duration) -> ChainResult<u64> {
        self.call(timeout, |c| {
            let address = address.to_string();
            async move { c.nonce(&address).await }
        })
        .await
    }

    pub async fn balance(&self, address: &str, timeout: Duration) -> ChainResult<u128> {
        self.call(timeout, |c| {
            let address = address.to_string();
            async move { c.balance(&address).await }
        })
        .await
    }
}
