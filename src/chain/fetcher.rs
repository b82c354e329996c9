//! Sequential block poller with adaptive cadence

use super::pool::EndpointPool;
use super::timing::{BlockTimeTracker, RpcDeadline};
use crate::error::ChainError;
use crate::events::ObservedBlock;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Polls one chain block by block and hands each block to the watcher.
///
/// The cursor only advances after a block has been delivered, so blocks leave
/// in strictly increasing height order and never ahead of the chain head.
/// Every fetched block shortens the polling interval and every miss lengthens
/// it; with `slow_down_after_miss` a block that needed waiting for lengthens it
/// slightly instead.
pub struct BlockFetcher {
    chain: String,
    pool: Arc<EndpointPool>,
    tracker: Arc<BlockTimeTracker>,
    deadline: RpcDeadline,
    height_retry_delay: Duration,
    cursor: AtomicU64,
}

impl BlockFetcher {
    pub fn new(
        chain: &str,
        pool: Arc<EndpointPool>,
        tracker: Arc<BlockTimeTracker>,
        deadline: RpcDeadline,
        height_retry_delay: Duration,
    ) -> Self {
        Self {
            chain: chain.to_string(),
            pool,
            tracker,
            deadline,
            height_retry_delay,
            cursor: AtomicU64::new(0),
        }
    }

    /// Next height to fetch; zero until the initial height is known
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Relaxed)
    }

    /// Query the chain head, retrying with a fixed delay until it succeeds.
    /// Returns `None` only when cancelled.
    pub async fn initial_height(&self, cancel: &CancellationToken) -> Option<u64> {
        loop {
            match self.pool.current_height(self.deadline.get()).await {
                Ok(height) => return Some(height),
                Err(e) => {
                    warn!(chain = %self.chain, error = %e, "Cannot read chain height, retrying");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.height_retry_delay) => {}
            }
        }
    }

    /// Scan loop. Runs until cancelled or the receiving side goes away.
    pub async fn run(&self, out: mpsc::Sender<ObservedBlock>, cancel: CancellationToken) {
        let Some(start) = self.initial_height(&cancel).await else {
            return;
        };
        self.cursor.store(start, Ordering::Relaxed);
        info!(chain = %self.chain, height = start, "Block fetcher started");

        let mut cursor = start;
        let mut waited = false;

        loop {
            match self.pool.block_by_height(cursor, self.deadline.get()).await {
                Ok(block) => {
                    let interval = self.tracker.found(waited);
                    waited = false;

                    debug!(
                        chain = %self.chain,
                        height = cursor,
                        txs = block.txs.len(),
                        interval_ms = interval.as_millis() as u64,
                        "Fetched block"
                    );
                    crate::metrics::record_block_height(&self.chain, cursor);
                    crate::metrics::record_poll_interval(&self.chain, interval);

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = out.send(block) => {
                            if sent.is_err() {
                                debug!(chain = %self.chain, "Block consumer gone, stopping fetcher");
                                break;
                            }
                        }
                    }

                    cursor += 1;
                    self.cursor.store(cursor, Ordering::Relaxed);
                }
                Err(ChainError::NotFound) => {
                    // Ahead of the chain head, wait longer
                    let interval = self.tracker.miss();
                    waited = true;
                    debug!(chain = %self.chain, height = cursor, interval_ms = interval.as_millis() as u64, "Block not produced yet");
                    crate::metrics::record_poll_interval(&self.chain, interval);
                }
                Err(e) => {
                    let interval = self.tracker.miss();
                    waited = true;
                    warn!(chain = %self.chain, height = cursor, error = %e, "Failed to fetch block");
                    crate::metrics::record_poll_interval(&self.chain, interval);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.tracker.interval()) => {}
            }
        }

        info!(chain = %self.chain, cursor, "Block fetcher stopped");
    }
}
