//! Per-chain orchestrator
//!
//! Wires the endpoint pool, fetcher, fee estimator, receipt pipeline and tracked
//! cache of one chain together and produces the matched-transaction and
//! track-update streams.

use super::fetcher::BlockFetcher;
use super::pool::EndpointPool;
use super::receipts::ReceiptPipeline;
use super::timing::{BlockTimeTracker, RpcDeadline};
use super::tracked::TrackedTxCache;
use super::ChainAdapter;
use crate::config::WatcherSettings;
use crate::error::{ChainResult, EngineResult};
use crate::events::{
    DispatchRequest, DispatchResult, FeeEstimate, MatchedBlock, ObservedBlock, ObservedTx, RawTx,
    ReceiptBatch, TrackResult, TrackUpdate,
};
use crate::state::VaultStore;
use crate::tx::{Dispatcher, FeeEstimator};

use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Snapshot of a watcher for the status API
#[derive(Debug, Clone, Serialize)]
pub struct WatcherStatus {
    pub chain: String,
    pub cursor: u64,
    pub poll_interval_ms: u64,
    pub healthy_endpoints: usize,
    pub endpoints: usize,
    pub tracked: usize,
    pub vault: Option<String>,
}

pub struct Watcher {
    settings: WatcherSettings,
    pool: Arc<EndpointPool>,
    tracker: Arc<BlockTimeTracker>,
    fetcher: Arc<BlockFetcher>,
    fees: FeeEstimator,
    pipeline: Arc<ReceiptPipeline>,
    tracked: TrackedTxCache,
    dispatcher: Dispatcher,
    store: Arc<dyn VaultStore>,
    /// Current filter address; `None` until a vault is configured
    vault: RwLock<Option<String>>,
    matched_tx: mpsc::Sender<MatchedBlock>,
    updates_tx: mpsc::Sender<TrackUpdate>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Watcher {
    /// Connect the endpoint pool and load the persisted vault.
    /// Either failing means the chain does not start.
    pub async fn new(
        settings: WatcherSettings,
        adapter: ChainAdapter,
        store: Arc<dyn VaultStore>,
        matched_tx: mpsc::Sender<MatchedBlock>,
        updates_tx: mpsc::Sender<TrackUpdate>,
        cancel: CancellationToken,
    ) -> EngineResult<Self> {
        let chain = settings.chain.clone();

        let pool = Arc::new(
            EndpointPool::connect(
                &chain,
                settings.rpc_urls.clone(),
                adapter.factory,
                adapter.discovery,
                settings.min_rpc_timeout,
            )
            .await?,
        );
        if pool.healthy_count().await == 0 {
            warn!(chain = %chain, "No endpoint answered the first probe, probing again shortly");
        }

        let vault = store.get_vault_addresses(&chain).await?.into_iter().next();
        match &vault {
            Some(address) => info!(chain = %chain, vault = %address, "Loaded vault address"),
            None => info!(chain = %chain, "No vault address configured yet"),
        }

        let tracker = Arc::new(BlockTimeTracker::new(
            settings.initial_poll_interval,
            settings.min_poll_interval,
            settings.tuning,
        ));
        let deadline = RpcDeadline::new(tracker.clone(), settings.rpc_timeout_factor, settings.min_rpc_timeout);

        let fetcher = Arc::new(BlockFetcher::new(
            &chain,
            pool.clone(),
            tracker.clone(),
            deadline.clone(),
            settings.height_retry_delay,
        ));
        let pipeline = Arc::new(ReceiptPipeline::new(
            &chain,
            pool.clone(),
            deadline.clone(),
            settings.max_receipt_retry,
            settings.receipt_retry_delay,
            settings.channel_capacity,
        ));
        let fees = FeeEstimator::for_chain(&settings, pool.clone(), deadline.clone());
        let tracked = TrackedTxCache::new(settings.tracked_capacity, settings.case_insensitive_addresses);
        let dispatcher = Dispatcher::new(&chain, pool.clone(), adapter.codec, settings.check_balance, deadline);

        Ok(Self {
            settings,
            pool,
            tracker,
            fetcher,
            fees,
            pipeline,
            tracked,
            dispatcher,
            store,
            vault: RwLock::new(vault),
            matched_tx,
            updates_tx,
            cancel,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn chain(&self) -> &str {
        &self.settings.chain
    }

    /// Spawn the refresh loop, fetcher, receipt worker and both consumer loops
    pub async fn start(self: &Arc<Self>) {
        let (block_tx, block_rx) = mpsc::channel::<ObservedBlock>(1);
        let (batch_tx, batch_rx) = mpsc::channel::<ReceiptBatch>(self.settings.channel_capacity);

        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!(chain = %self.chain(), "Watcher already started");
            return;
        }

        tasks.push(tokio::spawn(
            self.pool
                .clone()
                .run_refresh(
                    self.settings.endpoint_refresh,
                    self.settings.unhealthy_refresh,
                    self.cancel.clone(),
                ),
        ));

        tasks.push(tokio::spawn({
            let fetcher = self.fetcher.clone();
            let cancel = self.cancel.clone();
            async move { fetcher.run(block_tx, cancel).await }
        }));

        tasks.push(tokio::spawn({
            let pipeline = self.pipeline.clone();
            let cancel = self.cancel.clone();
            async move { pipeline.run(batch_tx, cancel).await }
        }));

        tasks.push(tokio::spawn(self.clone().consume_blocks(block_rx)));
        tasks.push(tokio::spawn(self.clone().consume_batches(batch_rx)));

        info!(chain = %self.chain(), "Watcher started");
    }

    /// Cancel every task of this watcher and wait for them
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(chain = %self.chain(), error = %e, "Watcher task ended abnormally");
            }
        }
        info!(chain = %self.chain(), "Watcher stopped");
    }

    /// Persist the new vault, then switch the filter over to it
    pub async fn set_vault(&self, address: &str, token: &str) -> EngineResult<()> {
        self.store.set_vault_address(self.chain(), address, token).await?;
        *self.vault.write().unwrap_or_else(|e| e.into_inner()) = Some(address.to_string());
        info!(chain = %self.chain(), vault = %address, "Vault address updated");
        Ok(())
    }

    pub fn vault(&self) -> Option<String> {
        self.vault.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn track_tx(&self, tx_hash: &str) {
        debug!(chain = %self.chain(), tx_hash = %tx_hash, "Tracking transaction");
        self.tracked.track(tx_hash);
    }

    pub async fn dispatch(&self, request: &DispatchRequest) -> DispatchResult {
        self.dispatcher.dispatch(request).await
    }

    pub async fn nonce(&self, address: &str) -> ChainResult<u64> {
        self.dispatcher.nonce(address).await
    }

    pub async fn fee_estimate(&self) -> ChainResult<FeeEstimate> {
        self.fees.estimate().await
    }

    pub async fn is_healthy(&self) -> bool {
        self.pool.healthy_endpoint().await.is_some()
    }

    pub async fn status(&self) -> WatcherStatus {
        WatcherStatus {
            chain: self.chain().to_string(),
            cursor: self.fetcher.cursor(),
            poll_interval_ms: self.tracker.interval().as_millis() as u64,
            healthy_endpoints: self.pool.healthy_count().await,
            endpoints: self.pool.endpoint_count().await,
            tracked: self.tracked.len(),
            vault: self.vault(),
        }
    }

    fn same_address(&self, a: &str, b: &str) -> bool {
        if self.settings.case_insensitive_addresses {
            a.eq_ignore_ascii_case(b)
        } else {
            a == b
        }
    }

    /// True iff a vault is set and `to` is that vault
    fn is_vault(&self, to: Option<&str>) -> bool {
        let vault = self.vault.read().unwrap_or_else(|e| e.into_inner());
        match (vault.as_deref(), to) {
            (Some(vault), Some(to)) => self.same_address(vault, to),
            _ => false,
        }
    }

    /// Awaited by the tracker, or sent to the vault. Hashes already confirmed are
    /// never candidates again.
    fn is_candidate(&self, tx: &RawTx) -> bool {
        if self.tracked.is_confirmed(&tx.hash) {
            return false;
        }
        self.tracked.contains(&tx.hash) || self.is_vault(tx.to.as_deref())
    }

    async fn consume_blocks(self: Arc<Self>, mut blocks: mpsc::Receiver<ObservedBlock>) {
        loop {
            let block = tokio::select! {
                _ = self.cancel.cancelled() => break,
                block = blocks.recv() => match block {
                    Some(block) => block,
                    None => break,
                },
            };

            self.fees.observe(&block);

            let candidates: Vec<RawTx> = block.txs.into_iter().filter(|tx| self.is_candidate(tx)).collect();
            if candidates.is_empty() {
                continue;
            }

            debug!(chain = %self.chain(), height = block.height, candidates = candidates.len(), "Queueing receipts");
            let queued = tokio::select! {
                _ = self.cancel.cancelled() => break,
                queued = self.pipeline.fetch_receipts(block.height, block.hash, candidates) => queued,
            };
            if !queued {
                debug!(chain = %self.chain(), "Receipt worker gone, stopping block consumer");
                break;
            }
        }
        debug!(chain = %self.chain(), "Block consumer stopped");
    }

    async fn consume_batches(self: Arc<Self>, mut batches: mpsc::Receiver<ReceiptBatch>) {
        let sweep_every = self.settings.track_timeout.min(MAX_SWEEP_INTERVAL);
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                batch = batches.recv() => match batch {
                    Some(batch) => self.handle_batch(batch).await,
                    None => break,
                },
                _ = sweep.tick() => self.expire_tracked().await,
            }
        }
        debug!(chain = %self.chain(), "Result consumer stopped");
    }

    async fn handle_batch(&self, batch: ReceiptBatch) {
        let mut matched = Vec::new();

        for result in batch.results {
            let success = result.success();
            let tx = result.tx;

            if self.tracked.confirm(&tx.hash) {
                let outcome = if success {
                    TrackResult::Confirmed
                } else {
                    TrackResult::Failed
                };
                self.send_update(TrackUpdate {
                    chain: self.chain().to_string(),
                    tx_hash: tx.hash,
                    block_height: batch.height,
                    raw: tx.raw,
                    result: outcome,
                })
                .await;
                continue;
            }

            // Confirmed while this block's receipts were in flight
            if self.tracked.is_confirmed(&tx.hash) {
                debug!(chain = %self.chain(), tx_hash = %tx.hash, "Ignoring confirmed transaction");
                continue;
            }

            if let (true, Some(to)) = (self.is_vault(tx.to.as_deref()), tx.to) {
                matched.push(ObservedTx {
                    hash: tx.hash,
                    raw: tx.raw,
                    from: tx.from,
                    to,
                    success,
                });
            }
        }

        if matched.is_empty() {
            return;
        }

        if let Err(e) = self.store.save_observed_txs(self.chain(), batch.height, &matched).await {
            warn!(chain = %self.chain(), height = batch.height, error = %e, "Failed to persist observed transactions");
        }
        crate::metrics::record_matched_txs(self.chain(), matched.len());
        info!(chain = %self.chain(), height = batch.height, count = matched.len(), "Vault transactions observed");

        let block = MatchedBlock {
            chain: self.chain().to_string(),
            block_height: batch.height,
            block_hash: batch.block_hash,
            txs: matched,
        };
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            sent = self.matched_tx.send(block) => {
                if sent.is_err() {
                    debug!(chain = %self.chain(), "Matched stream closed");
                }
            }
        }
    }

    async fn expire_tracked(&self) {
        for tx_hash in self.tracked.expire(self.settings.track_timeout) {
            warn!(chain = %self.chain(), tx_hash = %tx_hash, "Tracked transaction timed out");
            self.send_update(TrackUpdate {
                chain: self.chain().to_string(),
                tx_hash,
                block_height: 0,
                raw: Vec::new(),
                result: TrackResult::Timeout,
            })
            .await;
        }
    }

    async fn send_update(&self, update: TrackUpdate) {
        crate::metrics::record_track_update(self.chain(), update.result.name());
        debug!(chain = %self.chain(), tx_hash = %update.tx_hash, result = update.result.name(), "Track update");
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            sent = self.updates_tx.send(update) => {
                if sent.is_err() {
                    debug!(chain = %self.chain(), "Track update stream closed");
                }
            }
        }
    }
}
