//! In-process vault store, used without a database and in tests

use super::VaultStore;
use crate::error::EngineResult;
use crate::events::ObservedTx;

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    /// chain -> (height, tx) in arrival order
    observed: HashMap<String, Vec<(u64, ObservedTx)>>,
    /// chain -> (address, token), most recent last
    vaults: HashMap<String, Vec<(String, String)>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn observed(&self, chain: &str) -> Vec<(u64, ObservedTx)> {
        self.inner
            .read()
            .await
            .observed
            .get(chain)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl VaultStore for MemoryStore {
    async fn save_observed_txs(&self, chain: &str, height: u64, txs: &[ObservedTx]) -> EngineResult<()> {
        let mut inner = self.inner.write().await;
        let entries = inner.observed.entry(chain.to_string()).or_default();
        for tx in txs {
            entries.retain(|(_, existing)| existing.hash != tx.hash);
            entries.push((height, tx.clone()));
        }
        Ok(())
    }

    async fn get_vault_addresses(&self, chain: &str) -> EngineResult<Vec<String>> {
        let inner = self.inner.read().await;
        Ok(inner
            .vaults
            .get(chain)
            .map(|v| v.iter().rev().map(|(address, _)| address.clone()).collect())
            .unwrap_or_default())
    }

    async fn set_vault_address(&self, chain: &str, address: &str, token: &str) -> EngineResult<()> {
        let mut inner = self.inner.write().await;
        let vaults = inner.vaults.entry(chain.to_string()).or_default();
        vaults.retain(|(existing, _)| existing != address);
        vaults.push((address.to_string(), token.to_string()));
        Ok(())
    }

    async fn health_check(&self) -> EngineResult<()> {
        Ok(())
    }
}
