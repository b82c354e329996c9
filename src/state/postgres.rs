//! PostgreSQL vault store

use super::VaultStore;
use crate::config::DatabaseConfig;
use crate::error::EngineResult;
use crate::events::ObservedTx;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn new(config: &DatabaseConfig) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Create tables inline
    pub async fn run_migrations(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS observed_txs (
                chain VARCHAR(32) NOT NULL,
                tx_hash VARCHAR(130) NOT NULL,
                block_height BIGINT NOT NULL,
                from_address VARCHAR(130) NOT NULL,
                to_address VARCHAR(130) NOT NULL,
                raw BYTEA NOT NULL,
                success BOOLEAN NOT NULL,
                observed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (chain, tx_hash)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_observed_chain_height
            ON observed_txs (chain, block_height)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vault_addresses (
                chain VARCHAR(32) NOT NULL,
                address VARCHAR(130) NOT NULL,
                token TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (chain, address)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

#[async_trait]
impl VaultStore for PgStore {
    async fn save_observed_txs(&self, chain: &str, height: u64, txs: &[ObservedTx]) -> EngineResult<()> {
        let mut db_tx = self.pool.begin().await?;

        for tx in txs {
            sqlx::query(
                r#"
                INSERT INTO observed_txs
                    (chain, tx_hash, block_height, from_address, to_address, raw, success)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (chain, tx_hash)
                DO UPDATE SET block_height = $3, success = $7, observed_at = NOW()
                "#,
            )
            .bind(chain)
            .bind(&tx.hash)
            .bind(height as i64)
            .bind(&tx.from)
            .bind(&tx.to)
            .bind(&tx.raw)
            .bind(tx.success)
            .execute(&mut *db_tx)
            .await?;
        }

        db_tx.commit().await?;
        debug!("Saved {} observed txs for {} at block {}", txs.len(), chain, height);
        Ok(())
    }

    async fn get_vault_addresses(&self, chain: &str) -> EngineResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT address, updated_at
            FROM vault_addresses
            WHERE chain = $1
            ORDER BY updated_at DESC
            "#,
        )
        .bind(chain)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.get::<String, _>("address")).collect())
    }

    async fn set_vault_address(&self, chain: &str, address: &str, token: &str) -> EngineResult<()> {
        let now: DateTime<Utc> = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO vault_addresses (chain, address, token, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (chain, address)
            DO UPDATE SET token = $3, updated_at = $4
            "#,
        )
        .bind(chain)
        .bind(address)
        .bind(token)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!("Vault address for {} set to {}", chain, address);
        Ok(())
    }

    async fn health_check(&self) -> EngineResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
