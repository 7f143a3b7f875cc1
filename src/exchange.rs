//! Exchange collaborator seam.
//!
//! Everything the engine needs from the venue goes through [`Exchange`]; the
//! Bybit client is one implementation, [`DryRunExchange`] wraps any of them
//! to paper-trade against live market data.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::NETWORK_TIMEOUT;
use crate::error::ExchangeError;
use crate::types::{Balance, Candle, Direction, ExchangePosition, InstrumentSpec, OrderRequest};

#[async_trait]
pub trait Exchange: Send + Sync {
    /// Closed and forming candles, oldest first.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Open positions only (size > 0).
    async fn fetch_open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;

    async fn fetch_balance(&self) -> Result<Balance, ExchangeError>;

    async fn fetch_last_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// Market entry with the stop attached, and the target too when the plan
    /// has no partial split. Returns the order id.
    async fn place_order(&self, order: &OrderRequest) -> Result<String, ExchangeError>;

    /// Reduce-only partial exits for an entry that already filled.
    async fn place_take_profits(&self, _order: &OrderRequest) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn update_stop_loss(
        &self,
        symbol: &str,
        price: f64,
        price_decimals: u32,
    ) -> Result<(), ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    async fn fetch_linear_symbols(&self) -> Result<Vec<String>, ExchangeError>;

    async fn fetch_instrument(&self, symbol: &str) -> Result<InstrumentSpec, ExchangeError>;
}

/// Bounds any exchange call by the network timeout.
pub async fn with_timeout<T, F>(fut: F) -> Result<T, ExchangeError>
where
    F: Future<Output = Result<T, ExchangeError>>,
{
    with_deadline(NETWORK_TIMEOUT, fut).await
}

pub async fn with_deadline<T, F>(limit: Duration, fut: F) -> Result<T, ExchangeError>
where
    F: Future<Output = Result<T, ExchangeError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ExchangeError::Timeout(limit.as_secs())),
    }
}

// ─── Dry run ─────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct PaperPosition {
    position: ExchangePosition,
    take_profit: f64,
}

/// Reads pass through to the wrapped exchange; writes are simulated.
/// Paper positions close when the live price crosses their stop or target.
pub struct DryRunExchange {
    inner: Arc<dyn Exchange>,
    positions: Mutex<HashMap<String, PaperPosition>>,
    next_id: AtomicU64,
}

impl DryRunExchange {
    pub fn new(inner: Arc<dyn Exchange>) -> Self {
        DryRunExchange { inner, positions: Mutex::default(), next_id: AtomicU64::new(1) }
    }

    fn paper(&self) -> std::sync::MutexGuard<'_, HashMap<String, PaperPosition>> {
        self.positions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn crossed(p: &PaperPosition, price: f64) -> bool {
    let pos = &p.position;
    match pos.direction {
        Direction::Long => price <= pos.stop_loss || price >= p.take_profit,
        Direction::Short => price >= pos.stop_loss || price <= p.take_profit,
        Direction::Neutral => true,
    }
}

#[async_trait]
impl Exchange for DryRunExchange {
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.inner.fetch_ohlcv(symbol, interval, limit).await
    }

    async fn fetch_open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let symbols: Vec<String> = self.paper().keys().cloned().collect();
        let mut open = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let price = self.inner.fetch_last_price(&symbol).await?;
            let mut paper = self.paper();
            let Some(p) = paper.get_mut(&symbol) else { continue };
            if crossed(p, price) {
                log::info!("[{}] DRY-RUN position closed at {:.4}", symbol, price);
                paper.remove(&symbol);
                continue;
            }
            let pos = &mut p.position;
            pos.unrealized_pnl = (price - pos.entry_price) * pos.size * pos.direction.sign();
            open.push(pos.clone());
        }
        Ok(open)
    }

    async fn fetch_balance(&self) -> Result<Balance, ExchangeError> {
        self.inner.fetch_balance().await
    }

    async fn fetch_last_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.inner.fetch_last_price(symbol).await
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<String, ExchangeError> {
        let entry = self.inner.fetch_last_price(&order.symbol).await?;
        let id = format!("dry-run-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        log::info!(
            "[{}] DRY-RUN {} qty={:.4} entry≈{:.4} sl={:.4} tp={:.4} id={}",
            order.symbol,
            order.direction.side(),
            order.size,
            entry,
            order.stop_loss,
            order.take_profit,
            id
        );
        self.paper().insert(
            order.symbol.clone(),
            PaperPosition {
                position: ExchangePosition {
                    symbol: order.symbol.clone(),
                    direction: order.direction,
                    size: order.size,
                    entry_price: entry,
                    unrealized_pnl: 0.0,
                    stop_loss: order.stop_loss,
                },
                take_profit: order.take_profit,
            },
        );
        Ok(id)
    }

    async fn place_take_profits(&self, order: &OrderRequest) -> Result<(), ExchangeError> {
        for (price, qty) in order.partial_legs().into_iter().flatten() {
            log::info!("[{}] DRY-RUN TP {:.4} qty={:.4}", order.symbol, price, qty);
        }
        Ok(())
    }

    async fn update_stop_loss(
        &self,
        symbol: &str,
        price: f64,
        _price_decimals: u32,
    ) -> Result<(), ExchangeError> {
        match self.paper().get_mut(symbol) {
            Some(p) => {
                p.position.stop_loss = price;
                log::info!("[{}] DRY-RUN stop → {:.4}", symbol, price);
                Ok(())
            }
            None => Err(ExchangeError::Permanent(format!("{symbol}: no paper position"))),
        }
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        log::info!("[{}] DRY-RUN leverage {}x", symbol, leverage);
        Ok(())
    }

    async fn fetch_linear_symbols(&self) -> Result<Vec<String>, ExchangeError> {
        self.inner.fetch_linear_symbols().await
    }

    async fn fetch_instrument(&self, symbol: &str) -> Result<InstrumentSpec, ExchangeError> {
        self.inner.fetch_instrument(symbol).await
    }
}
