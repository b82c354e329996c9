//! Chain module - one observation pipeline per configured chain
//!
//! This module provides:
//! - The adapter contract a concrete chain implements (`ChainClient`, `ChainCodec`)
//! - Endpoint pooling with shuffled failover
//! - Adaptive block polling, receipt resolution and tracked-transaction matching
//! - `ChainManager`, the multi-chain front door used by the coordinator

pub mod evm;
pub mod fetcher;
pub mod pool;
pub mod receipts;
pub mod timing;
pub mod tracked;
pub mod watcher;

#[cfg(test)]
pub mod testing;

pub use watcher::{Watcher, WatcherStatus};

use crate::config::{ChainFamily, WatcherSettings};
use crate::error::{ChainResult, DecodeError, DispatchErrorKind, EngineError, EngineResult};
use crate::events::{
    DispatchRequest, DispatchResult, FeeEstimate, MatchedBlock, ObservedBlock, TrackUpdate, TxReceipt,
};
use crate::state::VaultStore;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One live connection to a chain node
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn current_height(&self) -> ChainResult<u64>;

    /// `ChainError::NotFound` when the block has not been produced yet
    async fn block_by_height(&self, height: u64) -> ChainResult<ObservedBlock>;

    /// `ChainError::NotFound` while the receipt is not available
    async fn receipt(&self, tx_hash: &str) -> ChainResult<TxReceipt>;

    async fn suggest_gas_price(&self) -> ChainResult<u128>;

    /// Broadcast a signed transaction, returning its hash
    async fn submit(&self, raw_tx: &[u8]) -> ChainResult<String>;

    async fn find_by_hash(&self, tx_hash: &str) -> ChainResult<bool>;

    async fn nonce(&self, address: &str) -> ChainResult<u64>;

    async fn balance(&self, address: &str) -> ChainResult<u128>;
}

/// Opens clients for endpoint URLs
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, url: &str) -> ChainResult<Arc<dyn ChainClient>>;
}

/// Extra endpoints merged into the configured list on every pool refresh
#[async_trait]
pub trait EndpointDiscovery: Send + Sync {
    async fn discover(&self, chain: &str) -> ChainResult<Vec<String>>;
}

/// Chain-specific decoding of signed transactions and keys
pub trait ChainCodec: Send + Sync {
    fn decode_signed(&self, raw: &[u8]) -> Result<SignedTx, DecodeError>;

    fn address_from_pubkey(&self, pubkey: &str) -> Result<String, DecodeError>;
}

/// A decoded signed transaction ready for submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub nonce: u64,
    pub value: u128,
    /// Upper bound of the fee the sender may pay
    pub max_fee_cost: u128,
    /// Set for contract creation
    pub deployed_address: Option<String>,
}

/// Everything chain-specific a watcher needs
#[derive(Clone)]
pub struct ChainAdapter {
    pub factory: Arc<dyn ClientFactory>,
    pub codec: Arc<dyn ChainCodec>,
    pub discovery: Option<Arc<dyn EndpointDiscovery>>,
}

impl ChainAdapter {
    pub fn for_family(family: ChainFamily) -> Self {
        match family {
            ChainFamily::Evm => Self {
                factory: Arc::new(evm::EvmFactory),
                codec: Arc::new(evm::EvmCodec),
                discovery: None,
            },
        }
    }
}

/// Receiving ends of the outbound streams, shared by all chains
pub struct OutboundStreams {
    pub matched: mpsc::Receiver<MatchedBlock>,
    pub updates: mpsc::Receiver<TrackUpdate>,
}

/// Manages the watchers of all configured chains
pub struct ChainManager {
    /// Watchers indexed by chain name
    watchers: DashMap<String, Arc<Watcher>>,
    /// Persistence collaborator
    store: Arc<dyn VaultStore>,
    matched_tx: mpsc::Sender<MatchedBlock>,
    updates_tx: mpsc::Sender<TrackUpdate>,
    outbound: Mutex<Option<OutboundStreams>>,
    /// Root shutdown token; each watcher runs on a child
    shutdown: CancellationToken,
}

impl ChainManager {
    pub fn new(store: Arc<dyn VaultStore>, channel_capacity: usize) -> Self {
        let (matched_tx, matched) = mpsc::channel(channel_capacity.max(1));
        let (updates_tx, updates) = mpsc::channel(channel_capacity.max(1));

        Self {
            watchers: DashMap::new(),
            store,
            matched_tx,
            updates_tx,
            outbound: Mutex::new(Some(OutboundStreams { matched, updates })),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build and start the watcher of one chain
    pub async fn add_chain(&self, settings: WatcherSettings, adapter: ChainAdapter) -> EngineResult<()> {
        let chain = settings.chain.clone();
        if self.watchers.contains_key(&chain) {
            return Err(EngineError::startup(
                &chain,
                EngineError::Config("chain already running".to_string()),
            ));
        }

        info!(chain = %chain, endpoints = settings.rpc_urls.len(), "Initializing chain");

        let watcher = Watcher::new(
            settings,
            adapter,
            self.store.clone(),
            self.matched_tx.clone(),
            self.updates_tx.clone(),
            self.shutdown.child_token(),
        )
        .await
        .map_err(|e| EngineError::startup(&chain, e))?;

        let watcher = Arc::new(watcher);
        watcher.start().await;
        self.watchers.insert(chain.clone(), watcher);

        info!(chain = %chain, "Chain initialized successfully");
        Ok(())
    }

    /// Hand out the outbound streams; `None` after the first call
    pub fn take_outbound(&self) -> Option<OutboundStreams> {
        self.outbound.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn watcher(&self, chain: &str) -> EngineResult<Arc<Watcher>> {
        self.watchers
            .get(chain)
            .map(|w| w.clone())
            .ok_or_else(|| EngineError::ChainNotFound(chain.to_string()))
    }

    pub async fn dispatch(&self, request: DispatchRequest) -> DispatchResult {
        match self.watcher(&request.chain) {
            Ok(watcher) => watcher.dispatch(&request).await,
            Err(_) => {
                warn!(chain = %request.chain, "Dispatch for unknown chain");
                crate::metrics::record_dispatch(&request.chain, DispatchErrorKind::ChainNotFound.as_str());
                DispatchResult::failed(None, DispatchErrorKind::ChainNotFound)
            }
        }
    }

    pub async fn set_vault(&self, chain: &str, address: &str, token: &str) -> EngineResult<()> {
        self.watcher(chain)?.set_vault(address, token).await
    }

    pub fn track_tx(&self, chain: &str, tx_hash: &str) -> EngineResult<()> {
        self.watcher(chain)?.track_tx(tx_hash);
        Ok(())
    }

    pub async fn get_nonce(&self, chain: &str, address: &str) -> EngineResult<u64> {
        Ok(self.watcher(chain)?.nonce(address).await?)
    }

    pub async fn get_fee_estimate(&self, chain: &str) -> EngineResult<FeeEstimate> {
        Ok(self.watcher(chain)?.fee_estimate().await?)
    }

    /// A chain is healthy while its pool has at least one healthy endpoint
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let watchers: Vec<_> = self.watchers.iter().map(|e| e.value().clone()).collect();
        let mut results = Vec::with_capacity(watchers.len());
        for watcher in watchers {
            results.push((watcher.chain().to_string(), watcher.is_healthy().await));
        }
        results
    }

    pub async fn statuses(&self) -> Vec<WatcherStatus> {
        let watchers: Vec<_> = self.watchers.iter().map(|e| e.value().clone()).collect();
        let mut statuses = Vec::with_capacity(watchers.len());
        for watcher in watchers {
            statuses.push(watcher.status().await);
        }
        statuses.sort_by(|a, b| a.chain.cmp(&b.chain));
        statuses
    }

    /// Get all running chain names
    pub fn connected_chains(&self) -> Vec<String> {
        let mut chains: Vec<String> = self.watchers.iter().map(|e| e.key().clone()).collect();
        chains.sort();
        chains
    }

    /// Cancel every watcher and wait for their tasks
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let watchers: Vec<_> = self.watchers.iter().map(|e| e.value().clone()).collect();
        for watcher in watchers {
            watcher.stop().await;
        }
        info!("Chain manager stopped");
    }
}
