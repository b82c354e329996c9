//! Records flowing through the observation pipeline
//!
//! Chain adapters normalise their payloads into `ObservedBlock`/`RawTx`/`TxReceipt`;
//! the watcher turns those into the two outbound streams (`MatchedBlock`,
//! `TrackUpdate`) consumed by the coordinator.

use crate::error::DispatchErrorKind;

use serde::{Deserialize, Serialize};

/// Fee fields decoded from one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TxFee {
    Legacy { gas_price: u128 },
    FeeMarket { max_fee: u128, tip: u128 },
}

/// A transaction as found in a polled block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTx {
    pub hash: String,
    #[serde(with = "hex_bytes")]
    pub raw: Vec<u8>,
    pub from: String,
    /// `None` for contract creation
    pub to: Option<String>,
    pub fee: TxFee,
}

/// One polled block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedBlock {
    pub height: u64,
    pub hash: String,
    pub base_fee: Option<u128>,
    pub txs: Vec<RawTx>,
}

/// Execution outcome of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub block_height: Option<u64>,
    pub success: bool,
}

/// Outcome of one candidate transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptResult {
    pub tx: RawTx,
    pub receipt: TxReceipt,
}

impl ReceiptResult {
    pub fn success(&self) -> bool {
        self.receipt.success
    }
}

/// All resolved receipts of one block, emitted as a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptBatch {
    pub height: u64,
    pub block_hash: String,
    pub results: Vec<ReceiptResult>,
}

/// Transaction sent to the vault, as reported to the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedTx {
    pub hash: String,
    #[serde(with = "hex_bytes")]
    pub raw: Vec<u8>,
    pub from: String,
    pub to: String,
    pub success: bool,
}

/// Matched-transaction stream item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedBlock {
    pub chain: String,
    pub block_height: u64,
    pub block_hash: String,
    pub txs: Vec<ObservedTx>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackResult {
    Confirmed,
    Failed,
    Timeout,
}

impl TrackResult {
    pub fn name(&self) -> &'static str {
        match self {
            TrackResult::Confirmed => "confirmed",
            TrackResult::Failed => "failed",
            TrackResult::Timeout => "timeout",
        }
    }
}

/// Confirmation-update stream item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackUpdate {
    pub chain: String,
    pub tx_hash: String,
    /// Zero when the update is a timeout
    pub block_height: u64,
    #[serde(with = "hex_bytes")]
    pub raw: Vec<u8>,
    pub result: TrackResult,
}

/// Fee estimate served to the coordinator (serialize only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FeeEstimate {
    Legacy { gas_price: u128 },
    FeeMarket { base_fee: u128, tip: u128 },
}

/// Signed transaction handed over by the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub chain: String,
    #[serde(with = "hex_bytes")]
    pub raw_tx: Vec<u8>,
    pub sender_pub_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub success: bool,
    pub tx_hash: Option<String>,
    pub deployed_address: Option<String>,
    pub error: Option<DispatchErrorKind>,
}

impl DispatchResult {
    pub fn ok(tx_hash: String, deployed_address: Option<String>) -> Self {
        Self {
            success: true,
            tx_hash: Some(tx_hash),
            deployed_address,
            error: None,
        }
    }

    pub fn failed(tx_hash: Option<String>, kind: DispatchErrorKind) -> Self {
        Self {
            success: false,
            tx_hash,
            deployed_address: None,
            error: Some(kind),
        }
    }
}

/// Hex (0x-prefixed) encoding for byte payloads
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
