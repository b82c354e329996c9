//! Scripted in-process chain used by unit tests

use super::{ChainClient, ChainCodec, ClientFactory, EndpointDiscovery, SignedTx};
use crate::error::{ChainError, ChainResult, DecodeError};
use crate::events::{ObservedBlock, RawTx, TxFee, TxReceipt};

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct FakeState {
    healthy: bool,
    height: u64,
    blocks: HashMap<u64, ObservedBlock>,
    block_failures: u32,
    receipts: HashMap<String, bool>,
    receipt_failures: HashMap<String, u32>,
    receipt_calls: HashMap<String, u32>,
    gas_price: u128,
    gas_price_calls: u32,
    submit_error: Option<ChainError>,
    submitted: Vec<Vec<u8>>,
    known: HashSet<String>,
    nonces: HashMap<String, u64>,
    balances: HashMap<String, u128>,
}

/// A single fake endpoint; every call fails with a transport error while unhealthy
pub struct FakeClient {
    state: Mutex<FakeState>,
}

impl FakeClient {
    pub fn new(height: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                healthy: true,
                height,
                gas_price: 1_000,
                ..Default::default()
            }),
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.with(|s| s.healthy = healthy);
    }

    pub fn set_height(&self, height: u64) {
        self.with(|s| s.height = height);
    }

    pub fn add_block(&self, block: ObservedBlock) {
        self.with(|s| {
            for tx in &block.txs {
                s.receipts.entry(tx.hash.clone()).or_insert(true);
            }
            s.blocks.insert(block.height, block);
        });
    }

    pub fn fail_next_blocks(&self, count: u32) {
        self.with(|s| s.block_failures = count);
    }

    pub fn set_receipt(&self, hash: &str, success: bool) {
        self.with(|s| s.receipts.insert(hash.to_string(), success));
    }

    pub fn fail_receipt(&self, hash: &str, times: u32) {
        self.with(|s| s.receipt_failures.insert(hash.to_string(), times));
    }

    pub fn receipt_calls(&self, hash: &str) -> u32 {
        self.with(|s| s.receipt_calls.get(hash).copied().unwrap_or(0))
    }

    pub fn set_gas_price(&self, price: u128) {
        self.with(|s| s.gas_price = price);
    }

    pub fn gas_price_calls(&self) -> u32 {
        self.with(|s| s.gas_price_calls)
    }

    pub fn reject_submissions(&self, error: ChainError) {
        self.with(|s| s.submit_error = Some(error));
    }

    pub fn mark_known(&self, hash: &str) {
        self.with(|s| s.known.insert(hash.to_string()));
    }

    pub fn submitted(&self) -> Vec<Vec<u8>> {
        self.with(|s| s.submitted.clone())
    }

    pub fn set_balance(&self, address: &str, balance: u128) {
        self.with(|s| s.balances.insert(address.to_string(), balance));
    }

    pub fn set_nonce(&self, address: &str, nonce: u64) {
        self.with(|s| s.nonces.insert(address.to_string(), nonce));
    }

    fn check(&self, s: &FakeState) -> ChainResult<()> {
        if s.healthy {
            Ok(())
        } else {
            Err(ChainError::Rpc {
                endpoint: "fake".to_string(),
                message: "connection refused".to_string(),
            })
        }
    }
}

#[async_trait]
impl ChainClient for FakeClient {
    async fn current_height(&self) -> ChainResult<u64> {
        let s = self.state.lock().unwrap();
        self.check(&s)?;
        Ok(s.height)
    }

    async fn block_by_height(&self, height: u64) -> ChainResult<ObservedBlock> {
        let mut s = self.state.lock().unwrap();
        self.check(&s)?;
        if s.block_failures > 0 {
            s.block_failures -= 1;
            return Err(ChainError::Rpc {
                endpoint: "fake".to_string(),
                message: "503 service unavailable".to_string(),
            });
        }
        if height > s.height {
            return Err(ChainError::NotFound);
        }
        Ok(s.blocks.get(&height).cloned().unwrap_or_else(|| ObservedBlock {
            height,
            hash: format!("0xblock{}", height),
            base_fee: None,
            txs: Vec::new(),
        }))
    }

    async fn receipt(&self, tx_hash: &str) -> ChainResult<TxReceipt> {
        let mut s = self.state.lock().unwrap();
        self.check(&s)?;
        *s.receipt_calls.entry(tx_hash.to_string()).or_insert(0) += 1;
        if let Some(remaining) = s.receipt_failures.get_mut(tx_hash) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ChainError::NotFound);
            }
        }
        match s.receipts.get(tx_hash) {
            Some(success) => Ok(TxReceipt {
                tx_hash: tx_hash.to_string(),
                block_height: Some(s.height),
                success: *success,
            }),
            None => Err(ChainError::NotFound),
        }
    }

    async fn suggest_gas_price(&self) -> ChainResult<u128> {
        let mut s = self.state.lock().unwrap();
        s.gas_price_calls += 1;
        self.check(&s)?;
        Ok(s.gas_price)
    }

    async fn submit(&self, raw_tx: &[u8]) -> ChainResult<String> {
        let mut s = self.state.lock().unwrap();
        self.check(&s)?;
        if let Some(e) = s.submit_error.take() {
            return Err(e);
        }
        s.submitted.push(raw_tx.to_vec());
        let hash = format!("0x{}", hex::encode(raw_tx));
        s.known.insert(hash.clone());
        Ok(hash)
    }

    async fn find_by_hash(&self, tx_hash: &str) -> ChainResult<bool> {
        let s = self.state.lock().unwrap();
        self.check(&s)?;
        Ok(s.known.contains(tx_hash))
    }

    async fn nonce(&self, address: &str) -> ChainResult<u64> {
        let s = self.state.lock().unwrap();
        self.check(&s)?;
        Ok(s.nonces.get(address).copied().unwrap_or(0))
    }

    async fn balance(&self, address: &str) -> ChainResult<u128> {
        let s = self.state.lock().unwrap();
        self.check(&s)?;
        Ok(s.balances.get(address).copied().unwrap_or(0))
    }
}

/// Hands out pre-built clients by URL; unknown URLs fail to connect
pub struct FakeFactory {
    clients: HashMap<String, Arc<dyn ChainClient>>,
}

impl FakeFactory {
    pub fn new(clients: Vec<(&str, Arc<FakeClient>)>) -> Self {
        Self {
            clients: clients
                .into_iter()
                .map(|(url, c)| (url.to_string(), c as Arc<dyn ChainClient>))
                .collect(),
        }
    }

    pub fn single(url: &str, client: Arc<dyn ChainClient>) -> Self {
        let mut clients = HashMap::new();
        clients.insert(url.to_string(), client);
        Self { clients }
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn connect(&self, url: &str) -> ChainResult<Arc<dyn ChainClient>> {
        self.clients.get(url).cloned().ok_or_else(|| ChainError::Rpc {
            endpoint: url.to_string(),
            message: "dns error".to_string(),
        })
    }
}

pub struct FakeDiscovery(pub Vec<String>);

#[async_trait]
impl EndpointDiscovery for FakeDiscovery {
    async fn discover(&self, _chain: &str) -> ChainResult<Vec<String>> {
        Ok(self.0.clone())
    }
}

/// Codec for a toy format: `from|to|nonce|value|fee`, hash is the hex of the bytes
pub struct FakeCodec;

impl ChainCodec for FakeCodec {
    fn decode_signed(&self, raw: &[u8]) -> Result<SignedTx, DecodeError> {
        if raw.is_empty() {
            return Err(DecodeError::Empty);
        }
        let text = std::str::from_utf8(raw).map_err(|e| DecodeError::Transaction(e.to_string()))?;
        let parts: Vec<&str> = text.split('|').collect();
        if parts.len() != 5 {
            return Err(DecodeError::Transaction(format!("expected 5 fields, got {}", parts.len())));
        }
        let num = |s: &str| -> Result<u128, DecodeError> {
            s.parse().map_err(|_| DecodeError::Transaction(format!("bad number {}", s)))
        };
        let to = (!parts[1].is_empty()).then(|| parts[1].to_string());
        let nonce = num(parts[2])? as u64;
        Ok(SignedTx {
            hash: format!("0x{}", hex::encode(raw)),
            from: parts[0].to_string(),
            deployed_address: to.is_none().then(|| format!("{}-{}", parts[0], nonce)),
            to,
            nonce,
            value: num(parts[3])?,
            max_fee_cost: num(parts[4])?,
        })
    }

    fn address_from_pubkey(&self, pubkey: &str) -> Result<String, DecodeError> {
        pubkey
            .strip_prefix("pk:")
            .map(str::to_string)
            .ok_or_else(|| DecodeError::PublicKey(pubkey.to_string()))
    }
}

pub fn tx(hash: &str, from: &str, to: Option<&str>) -> RawTx {
    RawTx {
        hash: hash.to_string(),
        raw: hash.as_bytes().to_vec(),
        from: from.to_string(),
        to: to.map(str::to_string),
        fee: TxFee::FeeMarket {
            max_fee: 100,
            tip: 2,
        },
    }
}

pub fn block(height: u64, txs: Vec<RawTx>) -> ObservedBlock {
    ObservedBlock {
        height,
        hash: format!("0xblock{}", height),
        base_fee: Some(50),
        txs,
    }
}
