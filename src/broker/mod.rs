// =============================================================================
// Brokerage gateway — the seam between the engine and the outside world
// =============================================================================
//
// The engine trusts the brokerage as the source of truth for price, balance
// and execution results. Everything it needs is behind the `Brokerage` trait
// so the evaluator and the registration API can be exercised against an
// in-memory fake in tests.
// =============================================================================

pub mod rest;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use rest::RestBroker;

/// Side of a resting exchange order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Lifecycle state of a resting exchange order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Filled => write!(f, "FILLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Pricing style of a resting exchange order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceType {
    Limit,
    Market,
}

/// Balance snapshot for one held instrument. `free_qty` is the portion not
/// already committed to resting limit orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub ticker: String,
    #[serde(default)]
    pub free_qty: f64,
}

/// One resting order at the brokerage, as returned by the order list
/// endpoint. `order_no`/`origin_no` together identify the order for
/// cancel/modify calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestingOrder {
    pub order_no: String,
    pub origin_no: String,
    pub side: OrderSide,
    pub price_type: PriceType,
    pub status: OrderStatus,
    pub remaining_qty: f64,
    pub avg_price: f64,
}

/// Brokerage primitives consumed by the engine. Calls are synchronous from
/// the engine's point of view: a slow call simply extends the sweep.
#[async_trait]
pub trait Brokerage: Send + Sync {
    async fn is_market_open(&self) -> Result<bool>;

    async fn current_price(&self, ticker: &str) -> Result<f64>;

    /// Display name for notification text only.
    async fn stock_name(&self, ticker: &str) -> Result<String>;

    async fn holdings(&self) -> Result<Vec<Holding>>;

    /// Resting orders for one instrument, filtered by side and status,
    /// ordered oldest first.
    async fn open_orders(
        &self,
        ticker: &str,
        side: OrderSide,
        status: OrderStatus,
    ) -> Result<Vec<RestingOrder>>;

    /// Cancel one resting order.
    async fn cancel_order(&self, ticker: &str, order: &RestingOrder) -> Result<()>;

    /// Cancel every resting order for the instrument.
    async fn cancel_all_orders(&self, ticker: &str) -> Result<()>;

    async fn buy_market(&self, ticker: &str, qty: f64) -> Result<serde_json::Value>;

    async fn sell_market(&self, ticker: &str, qty: f64) -> Result<serde_json::Value>;

    /// Free (immediately sellable) quantity currently held for `ticker`.
    async fn free_quantity(&self, ticker: &str) -> Result<f64> {
        Ok(self
            .holdings()
            .await?
            .into_iter()
            .find(|h| h.ticker == ticker)
            .map(|h| h.free_qty)
            .unwrap_or(0.0))
    }
}

// =============================================================================
// Test fake
// =============================================================================

/// In-memory `Brokerage` used by the registration and evaluator tests:
/// scripted market state plus a recording of every action the engine issues.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum BrokerAction {
        Buy { ticker: String, qty: f64 },
        Sell { ticker: String, qty: f64 },
        Cancel { ticker: String, order_no: String },
        CancelAll { ticker: String },
    }

    #[derive(Default)]
    pub struct FakeBroker {
        pub market_open: Mutex<bool>,
        pub prices: Mutex<HashMap<String, f64>>,
        pub names: Mutex<HashMap<String, String>>,
        pub holdings: Mutex<Vec<Holding>>,
        pub resting: Mutex<HashMap<String, Vec<RestingOrder>>>,
        pub actions: Mutex<Vec<BrokerAction>>,
        /// Tickers whose price lookups fail, for error-isolation tests.
        pub failing_tickers: Mutex<Vec<String>>,
    }

    impl FakeBroker {
        pub fn open_market() -> Self {
            let broker = Self::default();
            *broker.market_open.lock().unwrap() = true;
            broker
        }

        pub fn set_price(&self, ticker: &str, price: f64) {
            self.prices.lock().unwrap().insert(ticker.into(), price);
        }

        pub fn set_holding(&self, ticker: &str, free_qty: f64) {
            let mut holdings = self.holdings.lock().unwrap();
            holdings.retain(|h| h.ticker != ticker);
            holdings.push(Holding {
                ticker: ticker.into(),
                free_qty,
            });
        }

        pub fn add_resting_sell(&self, ticker: &str, order_no: &str, remaining_qty: f64) {
            self.resting
                .lock()
                .unwrap()
                .entry(ticker.to_string())
                .or_default()
                .push(RestingOrder {
                    order_no: order_no.into(),
                    origin_no: format!("{order_no}-0"),
                    side: OrderSide::Sell,
                    price_type: PriceType::Limit,
                    status: OrderStatus::Open,
                    remaining_qty,
                    avg_price: 0.0,
                });
        }

        pub fn actions(&self) -> Vec<BrokerAction> {
            self.actions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Brokerage for FakeBroker {
        async fn is_market_open(&self) -> Result<bool> {
            Ok(*self.market_open.lock().unwrap())
        }

        async fn current_price(&self, ticker: &str) -> Result<f64> {
            if self.failing_tickers.lock().unwrap().iter().any(|t| t == ticker) {
                anyhow::bail!("scripted price failure for {ticker}");
            }
            self.prices
                .lock()
                .unwrap()
                .get(ticker)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("no scripted price for {ticker}"))
        }

        async fn stock_name(&self, ticker: &str) -> Result<String> {
            Ok(self
                .names
                .lock()
                .unwrap()
                .get(ticker)
                .cloned()
                .unwrap_or_else(|| ticker.to_string()))
        }

        async fn holdings(&self) -> Result<Vec<Holding>> {
            Ok(self.holdings.lock().unwrap().clone())
        }

        async fn open_orders(
            &self,
            ticker: &str,
            side: OrderSide,
            status: OrderStatus,
        ) -> Result<Vec<RestingOrder>> {
            Ok(self
                .resting
                .lock()
                .unwrap()
                .get(ticker)
                .map(|orders| {
                    orders
                        .iter()
                        .filter(|o| o.side == side && o.status == status)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn cancel_order(&self, ticker: &str, order: &RestingOrder) -> Result<()> {
            self.resting
                .lock()
                .unwrap()
                .entry(ticker.to_string())
                .or_default()
                .retain(|o| o.order_no != order.order_no);
            self.actions.lock().unwrap().push(BrokerAction::Cancel {
                ticker: ticker.into(),
                order_no: order.order_no.clone(),
            });
            Ok(())
        }

        async fn cancel_all_orders(&self, ticker: &str) -> Result<()> {
            self.resting.lock().unwrap().remove(ticker);
            self.actions
                .lock()
                .unwrap()
                .push(BrokerAction::CancelAll {
                    ticker: ticker.into(),
                });
            Ok(())
        }

        async fn buy_market(&self, ticker: &str, qty: f64) -> Result<serde_json::Value> {
            self.actions.lock().unwrap().push(BrokerAction::Buy {
                ticker: ticker.into(),
                qty,
            });
            Ok(serde_json::json!({ "status": "FILLED" }))
        }

        async fn sell_market(&self, ticker: &str, qty: f64) -> Result<serde_json::Value> {
            // Market sells fill instantly in the fake and deplete the holding.
            if let Some(h) = self
                .holdings
                .lock()
                .unwrap()
                .iter_mut()
                .find(|h| h.ticker == ticker)
            {
                h.free_qty = (h.free_qty - qty).max(0.0);
            }
            self.actions.lock().unwrap().push(BrokerAction::Sell {
                ticker: ticker.into(),
                qty,
            });
            Ok(serde_json::json!({ "status": "FILLED" }))
        }
    }
}
