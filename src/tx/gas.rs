//! Fee estimation for legacy and fee-market chains

use crate::chain::pool::EndpointPool;
use crate::chain::timing::RpcDeadline;
use crate::config::{FeeMode, WatcherSettings};
use crate::error::ChainResult;
use crate::events::{FeeEstimate, ObservedBlock, TxFee};

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Fee estimator selected by the chain's fee mode
pub enum FeeEstimator {
    Legacy(LegacyGasPrice),
    FeeMarket(FeeWindow),
}

impl FeeEstimator {
    pub fn for_chain(settings: &WatcherSettings, pool: Arc<EndpointPool>, deadline: RpcDeadline) -> Self {
        match settings.fee_mode {
            FeeMode::Legacy => FeeEstimator::Legacy(LegacyGasPrice::new(
                pool,
                deadline,
                settings.gas_price_refresh,
                settings.max_gas_price,
            )),
            FeeMode::FeeMarket => FeeEstimator::FeeMarket(FeeWindow::new(
                settings.fee_window,
                settings.default_base_fee,
                settings.default_tip,
            )),
        }
    }

    /// Feed a polled block; only the fee-market window uses it
    pub fn observe(&self, block: &ObservedBlock) {
        if let FeeEstimator::FeeMarket(window) = self {
            window.add_block(block);
        }
    }

    pub async fn estimate(&self) -> ChainResult<FeeEstimate> {
        match self {
            FeeEstimator::Legacy(legacy) => Ok(FeeEstimate::Legacy {
                gas_price: legacy.gas_price().await?,
            }),
            FeeEstimator::FeeMarket(window) => Ok(FeeEstimate::FeeMarket {
                base_fee: window.base_fee(),
                tip: window.tip(),
            }),
        }
    }
}

/// Cached `suggest gas price` with a refresh interval
pub struct LegacyGasPrice {
    pool: Arc<EndpointPool>,
    deadline: RpcDeadline,
    refresh: Duration,
    cap: Option<u128>,
    cached: Mutex<Option<(u128, Instant)>>,
}

impl LegacyGasPrice {
    pub fn new(pool: Arc<EndpointPool>, deadline: RpcDeadline, refresh: Duration, cap: Option<u128>) -> Self {
        Self {
            pool,
            deadline,
            refresh,
            cap,
            cached: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<(u128, Instant)>> {
        self.cached.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached price while fresh; otherwise query, falling back to the stale value
    pub async fn gas_price(&self) -> ChainResult<u128> {
        let cached = *self.lock();
        if let Some((price, at)) = cached {
            if at.elapsed() < self.refresh {
                return Ok(price);
            }
        }

        match self.pool.suggest_gas_price(self.deadline.get()).await {
            Ok(price) => {
                let price = match self.cap {
                    Some(cap) if price > cap => {
                        warn!(price, cap, chain = %self.pool.chain(), "Gas price above configured cap");
                        cap
                    }
                    _ => price,
                };
                *self.lock() = Some((price, Instant::now()));
                debug!(chain = %self.pool.chain(), price, "Gas price refreshed");
                Ok(price)
            }
            Err(e) => match cached {
                Some((price, _)) => {
                    warn!(chain = %self.pool.chain(), error = %e, "Gas price refresh failed, serving stale value");
                    Ok(price)
                }
                None => Err(e),
            },
        }
    }
}

/// Fixed-capacity ring of samples
struct Ring {
    samples: Vec<u128>,
    next: usize,
    filled: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0; capacity.max(1)],
            next: 0,
            filled: 0,
        }
    }

    fn push(&mut self, value: u128) {
        self.samples[self.next] = value;
        self.next = (self.next + 1) % self.samples.len();
        self.filled = (self.filled + 1).min(self.samples.len());
    }

    fn mean(&self) -> Option<u128> {
        if self.filled == 0 {
            return None;
        }
        // unfilled slots are still zero
        let sum: u128 = self.samples.iter().fold(0u128, |acc, v| acc.saturating_add(*v));
        Some(sum / self.filled as u128)
    }
}

struct WindowState {
    base_fees: Ring,
    tips: Ring,
}

/// Sliding window over recent base fees and tips
pub struct FeeWindow {
    state: Mutex<WindowState>,
    default_base_fee: u128,
    default_tip: u128,
}

impl FeeWindow {
    pub fn new(size: usize, default_base_fee: u128, default_tip: u128) -> Self {
        Self {
            state: Mutex::new(WindowState {
                base_fees: Ring::new(size),
                tips: Ring::new(size),
            }),
            default_base_fee,
            default_tip,
        }
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_block(&self, block: &ObservedBlock) {
        let mut state = self.lock();
        if let Some(base_fee) = block.base_fee {
            state.base_fees.push(base_fee);
        }
        for tx in &block.txs {
            if let TxFee::FeeMarket { tip, .. } = tx.fee {
                state.tips.push(tip);
            }
        }
    }

    pub fn base_fee(&self) -> u128 {
        self.lock().base_fees.mean().unwrap_or(self.default_base_fee)
    }

    pub fn tip(&self) -> u128 {
        self.lock().tips.mean().unwrap_or(self.default_tip)
    }
}
