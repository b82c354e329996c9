//! Persistence of observed transactions and vault addresses
//!
//! Handles:
//! - Matched transactions per chain and block
//! - Vault addresses (and their tokens) per chain
//!
//! `PgStore` is used when a database is configured, `MemoryStore` otherwise.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::EngineResult;
use crate::events::ObservedTx;

use async_trait::async_trait;

#[async_trait]
pub trait VaultStore: Send + Sync {
    async fn save_observed_txs(&self, chain: &str, height: u64, txs: &[ObservedTx]) -> EngineResult<()>;

    /// Vault addresses of a chain, most recently set first
    async fn get_vault_addresses(&self, chain: &str) -> EngineResult<Vec<String>>;

    async fn set_vault_address(&self, chain: &str, address: &str, token: &str) -> EngineResult<()>;

    async fn health_check(&self) -> EngineResult<()>;
}
