//! EVM adapter over JSON-RPC (HTTP)

use super::{ChainClient, ChainCodec, ClientFactory, SignedTx};
use crate::error::{ChainError, ChainResult, DecodeError};
use crate::events::{ObservedBlock, RawTx, TxFee, TxReceipt};

use async_trait::async_trait;
use ethers::core::k256::ecdsa::VerifyingKey;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::{get_contract_address, keccak256, public_key_to_address, rlp};
use std::sync::Arc;
use tracing::debug;

/// Saturating conversion; fees and balances above u128 do not occur in practice
fn to_u128(value: U256) -> u128 {
    if value > U256::from(u128::MAX) {
        u128::MAX
    } else {
        value.as_u128()
    }
}

fn hex_of<T: std::fmt::Debug>(value: T) -> String {
    format!("{:?}", value)
}

fn parse_hash(tx_hash: &str) -> ChainResult<H256> {
    tx_hash
        .parse::<H256>()
        .map_err(|e| DecodeError::Transaction(format!("bad hash {}: {}", tx_hash, e)).into())
}

fn parse_address(address: &str) -> ChainResult<Address> {
    address
        .parse::<Address>()
        .map_err(|_| DecodeError::Address(address.to_string()).into())
}

fn tx_fee(tx: &Transaction) -> TxFee {
    match tx.transaction_type.map(|t| t.as_u64()) {
        Some(2) => TxFee::FeeMarket {
            max_fee: tx.max_fee_per_gas.map(to_u128).unwrap_or_default(),
            tip: tx.max_priority_fee_per_gas.map(to_u128).unwrap_or_default(),
        },
        _ => TxFee::Legacy {
            gas_price: tx.gas_price.map(to_u128).unwrap_or_default(),
        },
    }
}

fn raw_tx(tx: &Transaction) -> RawTx {
    RawTx {
        hash: hex_of(tx.hash),
        raw: tx.rlp().to_vec(),
        from: hex_of(tx.from),
        to: tx.to.map(hex_of),
        fee: tx_fee(tx),
    }
}

pub struct EvmFactory;

#[async_trait]
impl ClientFactory for EvmFactory {
    async fn connect(&self, url: &str) -> ChainResult<Arc<dyn ChainClient>> {
        let provider = Provider::<Http>::try_from(url).map_err(|e| ChainError::Rpc {
            endpoint: url.to_string(),
            message: format!("invalid url: {}", e),
        })?;
        debug!(endpoint = %url, "Created HTTP provider");
        Ok(Arc::new(EvmClient {
            url: url.to_string(),
            provider,
        }))
    }
}

/// One HTTP provider
pub struct EvmClient {
    url: String,
    provider: Provider<Http>,
}

impl EvmClient {
    /// JSON-RPC error responses are answers from the node; everything else is transport
    fn map_err(&self, e: ProviderError) -> ChainError {
        match RpcError::as_error_response(&e) {
            Some(response) => ChainError::Rejected(response.message.clone()),
            None => ChainError::Rpc {
                endpoint: self.url.clone(),
                message: e.to_string(),
            },
        }
    }
}

#[async_trait]
impl ChainClient for EvmClient {
    async fn current_height(&self) -> ChainResult<u64> {
        let height = self.provider.get_block_number().await.map_err(|e| self.map_err(e))?;
        Ok(height.as_u64())
    }

    async fn block_by_height(&self, height: u64) -> ChainResult<ObservedBlock> {
        let block = self
            .provider
            .get_block_with_txs(height)
            .await
            .map_err(|e| self.map_err(e))?
            .ok_or(ChainError::NotFound)?;

        let hash = block
            .hash
            .ok_or_else(|| DecodeError::Block(format!("block {} has no hash", height)))?;

        Ok(ObservedBlock {
            height,
            hash: hex_of(hash),
            base_fee: block.base_fee_per_gas.map(to_u128),
            txs: block.transactions.iter().map(raw_tx).collect(),
        })
    }

    async fn receipt(&self, tx_hash: &str) -> ChainResult<TxReceipt> {
        let hash = parse_hash(tx_hash)?;
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| self.map_err(e))?
            .ok_or(ChainError::NotFound)?;

        // Pending receipts carry no block yet
        let block_height = receipt.block_number.map(|n| n.as_u64());
        if block_height.is_none() {
            return Err(ChainError::NotFound);
        }

        Ok(TxReceipt {
            tx_hash: hex_of(receipt.transaction_hash),
            block_height,
            success: receipt.status == Some(U64::from(1)),
        })
    }

    async fn suggest_gas_price(&self) -> ChainResult<u128> {
        let price = self.provider.get_gas_price().await.map_err(|e| self.map_err(e))?;
        Ok(to_u128(price))
    }

    async fn submit(&self, raw_tx: &[u8]) -> ChainResult<String> {
        let pending = self
            .provider
            .send_raw_transaction(Bytes::from(raw_tx.to_vec()))
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(hex_of(pending.tx_hash()))
    }

    async fn find_by_hash(&self, tx_hash: &str) -> ChainResult<bool> {
        let hash = parse_hash(tx_hash)?;
        let tx = self.provider.get_transaction(hash).await.map_err(|e| self.map_err(e))?;
        Ok(tx.is_some())
    }

    async fn nonce(&self, address: &str) -> ChainResult<u64> {
        let address = parse_address(address)?;
        let count = self
            .provider
            .get_transaction_count(address, None)
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(count.low_u64())
    }

    async fn balance(&self, address: &str) -> ChainResult<u128> {
        let address = parse_address(address)?;
        let balance = self
            .provider
            .get_balance(address, None)
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(to_u128(balance))
    }
}

/// RLP decoding of signed legacy and typed transactions
pub struct EvmCodec;

impl ChainCodec for EvmCodec {
    fn decode_signed(&self, raw: &[u8]) -> Result<SignedTx, DecodeError> {
        if raw.is_empty() {
            return Err(DecodeError::Empty);
        }

        let (tx, signature) = TypedTransaction::decode_signed(&rlp::Rlp::new(raw))
            .map_err(|e| DecodeError::Transaction(e.to_string()))?;
        let from = signature
            .recover(tx.sighash())
            .map_err(|e| DecodeError::Transaction(format!("cannot recover signer: {}", e)))?;

        let nonce = tx.nonce().copied().unwrap_or_default();
        let to = tx.to_addr().copied();
        let gas = tx.gas().copied().unwrap_or_default();
        let gas_price = tx.gas_price().unwrap_or_default();

        Ok(SignedTx {
            hash: hex_of(H256::from(keccak256(raw))),
            from: hex_of(from),
            to: to.map(hex_of),
            nonce: nonce.low_u64(),
            value: tx.value().copied().map(to_u128).unwrap_or_default(),
            max_fee_cost: to_u128(gas.saturating_mul(gas_price)),
            deployed_address: match to {
                Some(_) => None,
                None => Some(hex_of(get_contract_address(from, nonce))),
            },
        })
    }

    fn address_from_pubkey(&self, pubkey: &str) -> Result<String, DecodeError> {
        let bytes = hex::decode(pubkey.trim_start_matches("0x"))
            .map_err(|e| DecodeError::PublicKey(e.to_string()))?;
        let key = VerifyingKey::from_sec1_bytes(&bytes).map_err(|e| DecodeError::PublicKey(e.to_string()))?;
        Ok(hex_of(public_key_to_address(&key)))
    }
}
