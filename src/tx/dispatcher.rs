//! Submission of coordinator-signed transactions

use crate::chain::pool::EndpointPool;
use crate::chain::timing::RpcDeadline;
use crate::chain::{ChainCodec, SignedTx};
use crate::error::{ChainResult, DispatchErrorKind};
use crate::events::{DispatchRequest, DispatchResult};

use std::sync::Arc;
use tracing::{debug, info, warn};

/// Decodes, checks and broadcasts signed transactions for one chain
pub struct Dispatcher {
    chain: String,
    pool: Arc<EndpointPool>,
    codec: Arc<dyn ChainCodec>,
    check_balance: bool,
    deadline: RpcDeadline,
}

impl Dispatcher {
    pub fn new(
        chain: &str,
        pool: Arc<EndpointPool>,
        codec: Arc<dyn ChainCodec>,
        check_balance: bool,
        deadline: RpcDeadline,
    ) -> Self {
        Self {
            chain: chain.to_string(),
            pool,
            codec,
            check_balance,
            deadline,
        }
    }

    pub async fn dispatch(&self, request: &DispatchRequest) -> DispatchResult {
        let result = self.submit(request).await;
        let outcome = match result.error {
            Some(kind) => kind.as_str(),
            None => "success",
        };
        crate::metrics::record_dispatch(&self.chain, outcome);
        result
    }

    async fn submit(&self, request: &DispatchRequest) -> DispatchResult {
        let signed = match self.codec.decode_signed(&request.raw_tx) {
            Ok(signed) => signed,
            Err(e) => {
                warn!(chain = %self.chain, error = %e, "Rejecting undecodable transaction");
                return DispatchResult::failed(None, DispatchErrorKind::Decode);
            }
        };

        if let Some(pubkey) = &request.sender_pub_key {
            if let Err(kind) = self.verify_sender(&signed, pubkey) {
                return DispatchResult::failed(Some(signed.hash), kind);
            }
        }

        if self.check_balance && !self.has_funds(&signed).await {
            return DispatchResult::failed(Some(signed.hash), DispatchErrorKind::InsufficientBalance);
        }

        match self.pool.submit(&request.raw_tx, self.deadline.get()).await {
            Ok(tx_hash) => {
                if !tx_hash.eq_ignore_ascii_case(&signed.hash) {
                    debug!(chain = %self.chain, node = %tx_hash, decoded = %signed.hash, "Node reported a different hash");
                }
                info!(chain = %self.chain, tx_hash = %tx_hash, nonce = signed.nonce, "Transaction sent");
                DispatchResult::ok(tx_hash, signed.deployed_address)
            }
            Err(e) => {
                // A previous or concurrent submission may already have landed
                if self.already_known(&signed.hash).await {
                    info!(
                        chain = %self.chain,
                        tx_hash = %signed.hash,
                        error = %e,
                        "Submission failed but transaction is already known"
                    );
                    return DispatchResult::ok(signed.hash, signed.deployed_address);
                }

                let kind = DispatchErrorKind::from_submit_error(&e);
                warn!(chain = %self.chain, tx_hash = %signed.hash, error = %e, kind = kind.as_str(), "Submission failed");
                DispatchResult::failed(Some(signed.hash), kind)
            }
        }
    }

    fn verify_sender(&self, signed: &SignedTx, pubkey: &str) -> Result<(), DispatchErrorKind> {
        let expected = self.codec.address_from_pubkey(pubkey).map_err(|e| {
            warn!(chain = %self.chain, error = %e, "Invalid sender public key");
            DispatchErrorKind::Decode
        })?;

        if expected.eq_ignore_ascii_case(&signed.from) {
            Ok(())
        } else {
            warn!(
                chain = %self.chain,
                expected = %expected,
                signer = %signed.from,
                "Signer does not match sender public key"
            );
            Err(DispatchErrorKind::Decode)
        }
    }

    /// A failing balance query does not block the dispatch
    async fn has_funds(&self, signed: &SignedTx) -> bool {
        let needed = signed.value.saturating_add(signed.max_fee_cost);
        match self.pool.balance(&signed.from, self.deadline.get()).await {
            Ok(balance) if balance < needed => {
                warn!(
                    chain = %self.chain,
                    from = %signed.from,
                    balance = %balance,
                    needed = %needed,
                    "Insufficient balance for dispatch"
                );
                false
            }
            Ok(_) => true,
            Err(e) => {
                warn!(chain = %self.chain, from = %signed.from, error = %e, "Balance check failed, submitting anyway");
                true
            }
        }
    }

    async fn already_known(&self, tx_hash: &str) -> bool {
        match self.pool.find_by_hash(tx_hash, self.deadline.get()).await {
            Ok(found) => found,
            Err(e) => {
                debug!(chain = %self.chain, tx_hash = %tx_hash, error = %e, "Lookup after failed submission failed");
                false
            }
        }
    }

    /// Next nonce of `address` as seen by the chain
    pub async fn nonce(&self, address: &str) -> ChainResult<u64> {
        self.pool.nonce(address, self.deadline.get()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{FakeClient, FakeCodec, FakeFactory};
    use crate::chain::timing::BlockTimeTracker;
    use crate::chain::{ChainClient, MockChainClient};
    use crate::config::TrackerTuning;
    use crate::error::ChainError;
    use std::time::Duration;

    fn raw(text: &str) -> Vec<u8> {
        text.as_bytes().to_vec()
    }

    fn hash_of(text: &str) -> String {
        format!("0x{}", hex::encode(text))
    }

    fn request(text: &str, pubkey: Option<&str>) -> DispatchRequest {
        DispatchRequest {
            chain: "eth".to_string(),
            raw_tx: raw(text),
            sender_pub_key: pubkey.map(str::to_string),
        }
    }

    async fn dispatcher_with(mut mock: MockChainClient, check_balance: bool) -> Dispatcher {
        mock.expect_current_height().returning(|| Ok(100));
        let client: Arc<dyn ChainClient> = Arc::new(mock);
        let factory = Arc::new(FakeFactory::single("http://a", client));
        dispatcher_over(factory, vec!["http://a".into()], check_balance).await
    }

    async fn dispatcher_over_nodes(nodes: Vec<(&str, Arc<FakeClient>)>, check_balance: bool) -> Dispatcher {
        let urls = nodes.iter().map(|(url, _)| url.to_string()).collect();
        dispatcher_over(Arc::new(FakeFactory::new(nodes)), urls, check_balance).await
    }

    async fn dispatcher_over(factory: Arc<FakeFactory>, urls: Vec<String>, check_balance: bool) -> Dispatcher {
        let pool = Arc::new(
            EndpointPool::connect("eth", urls, factory, None, Duration::from_secs(1))
                .await
                .unwrap(),
        );
        let tracker = Arc::new(BlockTimeTracker::new(
            Duration::from_secs(1),
            Duration::from_millis(100),
            TrackerTuning::default(),
        ));
        Dispatcher::new(
            "eth",
            pool,
            Arc::new(FakeCodec),
            check_balance,
            RpcDeadline::new(tracker, 2, Duration::from_secs(1)),
        )
    }

    #[tokio::test]
    async fn test_successful_submission() {
        let text = "alice|bob|3|10|5";
        let mut mock = MockChainClient::new();
        let expected = hash_of(text);
        mock.expect_submit()
            .times(1)
            .returning(move |_| Ok(expected.clone()));
        mock.expect_find_by_hash().never();

        let dispatcher = dispatcher_with(mock, false).await;
        let result = dispatcher.dispatch(&request(text, None)).await;

        assert!(result.success);
        assert_eq!(result.tx_hash, Some(hash_of(text)));
        assert_eq!(result.deployed_address, None);
        assert_eq!(result.error, None);
    }

    #[tokio::test]
    async fn test_failed_submission_found_on_chain_is_success() {
        let text = "alice|bob|3|10|5";
        let mut mock = MockChainClient::new();
        mock.expect_submit()
            .times(1)
            .returning(|_| Err(ChainError::Rejected("already known".into())));
        let expected = hash_of(text);
        mock.expect_find_by_hash()
            .withf(move |hash| hash == expected)
            .times(1)
            .returning(|_| Ok(true));

        let dispatcher = dispatcher_with(mock, false).await;
        let result = dispatcher.dispatch(&request(text, None)).await;

        assert!(result.success);
        assert_eq!(result.tx_hash, Some(hash_of(text)));
    }

    #[tokio::test]
    async fn test_failed_submission_is_categorised() {
        let text = "alice|bob|3|10|5";
        let mut mock = MockChainClient::new();
        mock.expect_submit()
            .returning(|_| Err(ChainError::Rejected("nonce too low".into())));
        mock.expect_find_by_hash().returning(|_| Ok(false));

        let dispatcher = dispatcher_with(mock, false).await;
        let result = dispatcher.dispatch(&request(text, None)).await;

        assert!(!result.success);
        assert_eq!(result.error, Some(DispatchErrorKind::NonceConflict));
        assert_eq!(result.tx_hash, Some(hash_of(text)));
    }

    #[tokio::test]
    async fn test_undecodable_transaction_is_not_submitted() {
        let mut mock = MockChainClient::new();
        mock.expect_submit().never();

        let dispatcher = dispatcher_with(mock, false).await;
        let result = dispatcher.dispatch(&request("garbage", None)).await;

        assert!(!result.success);
        assert_eq!(result.error, Some(DispatchErrorKind::Decode));
        assert_eq!(result.tx_hash, None);
    }

    #[tokio::test]
    async fn test_insufficient_balance_is_not_retried() {
        let mut mock = MockChainClient::new();
        mock.expect_balance()
            .withf(|address| address == "alice")
            .times(1)
            .returning(|_| Ok(14));
        mock.expect_submit().never();

        let dispatcher = dispatcher_with(mock, true).await;
        let result = dispatcher.dispatch(&request("alice|bob|3|10|5", None)).await;

        assert!(!result.success);
        assert_eq!(result.error, Some(DispatchErrorKind::InsufficientBalance));
    }

    #[tokio::test]
    async fn test_exact_balance_is_enough() {
        let text = "alice|bob|3|10|5";
        let mut mock = MockChainClient::new();
        mock.expect_balance().returning(|_| Ok(15));
        let expected = hash_of(text);
        mock.expect_submit().returning(move |_| Ok(expected.clone()));

        let dispatcher = dispatcher_with(mock, true).await;
        assert!(dispatcher.dispatch(&request(text, None)).await.success);
    }

    #[tokio::test]
    async fn test_sender_pubkey_must_match_signer() {
        let text = "alice|bob|3|10|5";
        let mut mock = MockChainClient::new();
        let expected = hash_of(text);
        mock.expect_submit()
            .times(1)
            .returning(move |_| Ok(expected.clone()));

        let dispatcher = dispatcher_with(mock, false).await;

        let mismatch = dispatcher.dispatch(&request(text, Some("pk:mallory"))).await;
        assert_eq!(mismatch.error, Some(DispatchErrorKind::Decode));

        let matching = dispatcher.dispatch(&request(text, Some("pk:alice"))).await;
        assert!(matching.success);
    }

    #[tokio::test]
    async fn test_contract_creation_reports_deployed_address() {
        let text = "alice||7|0|5";
        let mut mock = MockChainClient::new();
        let expected = hash_of(text);
        mock.expect_submit().returning(move |_| Ok(expected.clone()));

        let dispatcher = dispatcher_with(mock, false).await;
        let result = dispatcher.dispatch(&request(text, None)).await;

        assert!(result.success);
        assert_eq!(result.deployed_address, Some("alice-7".to_string()));
    }

    #[tokio::test]
    async fn test_nonce_query() {
        let mut mock = MockChainClient::new();
        mock.expect_nonce()
            .withf(|address| address == "alice")
            .returning(|_| Ok(42));

        let dispatcher = dispatcher_with(mock, false).await;
        assert_eq!(dispatcher.nonce("alice").await.unwrap(), 42);
    }

    fn refused() -> ChainError {
        ChainError::Rpc {
            endpoint: "fake".into(),
            message: "connection refused".into(),
        }
    }

    #[tokio::test]
    async fn test_transport_failure_on_every_node_but_tx_landed() {
        let text = "alice|bob|3|10|5";
        let a = FakeClient::new(100);
        let b = FakeClient::new(100);
        for node in [&a, &b] {
            node.reject_submissions(refused());
            // an earlier attempt already reached the mempool
            node.mark_known(&hash_of(text));
        }

        let dispatcher = dispatcher_over_nodes(vec![("http://a", a.clone()), ("http://b", b.clone())], false).await;
        let result = dispatcher.dispatch(&request(text, None)).await;

        assert!(result.success);
        assert_eq!(result.tx_hash, Some(hash_of(text)));
        assert_eq!(result.error, None);
        assert!(a.submitted().is_empty());
        assert!(b.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_on_every_node_is_submit_failed() {
        let text = "alice|bob|3|10|5";
        let a = FakeClient::new(100);
        let b = FakeClient::new(100);
        a.reject_submissions(refused());
        b.reject_submissions(refused());

        let dispatcher = dispatcher_over_nodes(vec![("http://a", a), ("http://b", b)], false).await;
        let result = dispatcher.dispatch(&request(text, None)).await;

        assert!(!result.success);
        assert_eq!(result.error, Some(DispatchErrorKind::SubmitFailed));
        assert_eq!(result.tx_hash, Some(hash_of(text)));
    }

    #[tokio::test]
    async fn test_submission_fails_over_to_second_node() {
        let text = "alice|bob|3|10|5";
        let refusing = FakeClient::new(100);
        let accepting = FakeClient::new(100);
        refusing.reject_submissions(refused());

        let dispatcher = dispatcher_over_nodes(
            vec![("http://a", refusing.clone()), ("http://b", accepting.clone())],
            false,
        )
        .await;
        let result = dispatcher.dispatch(&request(text, None)).await;

        assert!(result.success);
        assert!(refusing.submitted().is_empty());
        assert_eq!(accepting.submitted(), vec![raw(text)]);
    }

    #[tokio::test]
    async fn test_balance_checked_against_node() {
        let text = "alice|bob|3|10|5";
        let node = FakeClient::new(100);
        node.set_balance("alice", 14);

        let dispatcher = dispatcher_over_nodes(vec![("http://a", node.clone())], true).await;
        let short = dispatcher.dispatch(&request(text, None)).await;
        assert_eq!(short.error, Some(DispatchErrorKind::InsufficientBalance));
        assert!(node.submitted().is_empty());

        node.set_balance("alice", 15);
        let funded = dispatcher.dispatch(&request(text, None)).await;
        assert!(funded.success);
        assert_eq!(node.submitted(), vec![raw(text)]);
    }

    #[tokio::test]
    async fn test_nonce_from_node() {
        let node = FakeClient::new(100);
        node.set_nonce("alice", 9);

        let dispatcher = dispatcher_over_nodes(vec![("http://a", node)], false).await;
        assert_eq!(dispatcher.nonce("alice").await.unwrap(), 9);
        assert_eq!(dispatcher.nonce("bob").await.unwrap(), 0);
    }
}
