//! Receipt resolution for candidate transactions
//!
//! One worker drains the queue block by block. Each candidate gets up to
//! `max_retry + 1` attempts; whatever resolves is emitted as a single batch
//! per block before the next block is started.

use super::pool::EndpointPool;
use super::timing::RpcDeadline;
use crate::error::ChainError;
use crate::events::{RawTx, ReceiptBatch, ReceiptResult, TxReceipt};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Candidates of one block waiting for receipts
#[derive(Debug)]
pub struct ReceiptJob {
    pub height: u64,
    pub block_hash: String,
    pub candidates: Vec<RawTx>,
}

pub struct ReceiptPipeline {
    chain: String,
    pool: Arc<EndpointPool>,
    deadline: RpcDeadline,
    max_retry: u32,
    retry_delay: Duration,
    queue_tx: mpsc::Sender<ReceiptJob>,
    queue_rx: Mutex<Option<mpsc::Receiver<ReceiptJob>>>,
}

impl ReceiptPipeline {
    pub fn new(
        chain: &str,
        pool: Arc<EndpointPool>,
        deadline: RpcDeadline,
        max_retry: u32,
        retry_delay: Duration,
        queue_capacity: usize,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            chain: chain.to_string(),
            pool,
            deadline,
            max_retry,
            retry_delay,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        }
    }

    /// Queue one block's candidates, waiting while the queue is full.
    /// Returns false once the worker has stopped.
    pub async fn fetch_receipts(&self, height: u64, block_hash: String, candidates: Vec<RawTx>) -> bool {
        self.queue_tx
            .send(ReceiptJob {
                height,
                block_hash,
                candidates,
            })
            .await
            .is_ok()
    }

    /// Worker loop; can only be started once.
    pub async fn run(&self, out: mpsc::Sender<ReceiptBatch>, cancel: CancellationToken) {
        let Some(mut queue) = self.queue_rx.lock().await.take() else {
            warn!(chain = %self.chain, "Receipt worker already started");
            return;
        };
        info!(chain = %self.chain, "Receipt worker started");

        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = queue.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let Some(batch) = self.process(job, &cancel).await else {
                break;
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = out.send(batch) => {
                    if sent.is_err() {
                        debug!(chain = %self.chain, "Receipt consumer gone, stopping worker");
                        break;
                    }
                }
            }
        }

        info!(chain = %self.chain, "Receipt worker stopped");
    }

    /// Resolve every candidate of a job. `None` if cancelled midway.
    async fn process(&self, job: ReceiptJob, cancel: &CancellationToken) -> Option<ReceiptBatch> {
        let mut results = Vec::with_capacity(job.candidates.len());

        for tx in job.candidates {
            match self.resolve(&tx, cancel).await? {
                Some(receipt) => {
                    crate::metrics::record_receipt_resolved(&self.chain);
                    results.push(ReceiptResult { tx, receipt });
                }
                None => crate::metrics::record_receipt_dropped(&self.chain),
            }
        }

        Some(ReceiptBatch {
            height: job.height,
            block_hash: job.block_hash,
            results,
        })
    }

    /// Outer `None` means cancelled; inner `None` means the tx was dropped.
    async fn resolve(&self, tx: &RawTx, cancel: &CancellationToken) -> Option<Option<TxReceipt>> {
        let mut attempt = 0;
        loop {
            match self.pool.receipt(&tx.hash, self.deadline.get()).await {
                Ok(receipt) => return Some(Some(receipt)),
                Err(ChainError::Decode(e)) => {
                    warn!(chain = %self.chain, tx_hash = %tx.hash, error = %e, "Skipping undecodable receipt");
                    return Some(None);
                }
                Err(e) => {
                    if attempt >= self.max_retry {
                        warn!(
                            chain = %self.chain,
                            tx_hash = %tx.hash,
                            attempts = attempt + 1,
                            error = %e,
                            "Giving up on receipt"
                        );
                        return Some(None);
                    }
                    debug!(chain = %self.chain, tx_hash = %tx.hash, attempt, error = %e, "Receipt not available yet");
                }
            }

            attempt += 1;
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{tx, FakeClient, FakeFactory};
    use crate::chain::timing::BlockTimeTracker;
    use crate::config::TrackerTuning;

    const MAX_RETRY: u32 = 3;

    async fn pipeline_for(client: Arc<FakeClient>) -> Arc<ReceiptPipeline> {
        let factory = Arc::new(FakeFactory::new(vec![("http://a", client)]));
        let pool = Arc::new(
            EndpointPool::connect("eth", vec!["http://a".into()], factory, None, Duration::from_secs(1))
                .await
                .unwrap(),
        );
        let tracker = Arc::new(BlockTimeTracker::new(
            Duration::from_secs(1),
            Duration::from_millis(100),
            TrackerTuning::default(),
        ));
        let deadline = RpcDeadline::new(tracker, 2, Duration::from_secs(1));
        Arc::new(ReceiptPipeline::new(
            "eth",
            pool,
            deadline,
            MAX_RETRY,
            Duration::from_millis(10),
            4,
        ))
    }

    fn spawn(
        pipeline: &Arc<ReceiptPipeline>,
    ) -> (mpsc::Receiver<ReceiptBatch>, CancellationToken, tokio::task::JoinHandle<()>) {
        let (out, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            async move { pipeline.run(out, cancel).await }
        });
        (rx, cancel, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolves_after_exactly_max_retry_failures() {
        let client = FakeClient::new(10);
        client.set_receipt("0xa", true);
        client.fail_receipt("0xa", MAX_RETRY);
        let pipeline = pipeline_for(client.clone()).await;
        let (mut rx, cancel, handle) = spawn(&pipeline);

        assert!(pipeline.fetch_receipts(10, "0xb10".into(), vec![tx("0xa", "x", Some("v"))]).await);
        let batch = rx.recv().await.unwrap();

        assert_eq!(batch.height, 10);
        assert_eq!(batch.results.len(), 1);
        assert!(batch.results[0].success());
        assert_eq!(client.receipt_calls("0xa"), MAX_RETRY + 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drops_after_retries_and_moves_on() {
        let client = FakeClient::new(10);
        client.set_receipt("0xgood", false);
        let pipeline = pipeline_for(client.clone()).await;
        let (mut rx, cancel, handle) = spawn(&pipeline);

        pipeline.fetch_receipts(
            10,
            "0xb10".into(),
            vec![tx("0xmissing", "x", Some("v")), tx("0xgood", "x", Some("v"))],
        )
        .await;
        let batch = rx.recv().await.unwrap();

        assert_eq!(client.receipt_calls("0xmissing"), MAX_RETRY + 1);
        assert_eq!(batch.results.len(), 1);
        assert_eq!(batch.results[0].tx.hash, "0xgood");
        assert!(!batch.results[0].success());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_follow_queue_order() {
        let client = FakeClient::new(10);
        client.set_receipt("0x1", true);
        client.set_receipt("0x2", true);
        let pipeline = pipeline_for(client).await;
        let (mut rx, cancel, handle) = spawn(&pipeline);

        pipeline.fetch_receipts(8, "0xb8".into(), vec![tx("0x1", "x", Some("v"))]).await;
        pipeline.fetch_receipts(9, "0xb9".into(), vec![tx("0x2", "x", Some("v"))]).await;

        assert_eq!(rx.recv().await.unwrap().height, 8);
        assert_eq!(rx.recv().await.unwrap().height, 9);

        cancel.cancel();
        handle.await.unwrap();
    }
}
