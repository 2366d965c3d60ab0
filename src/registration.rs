// =============================================================================
// Order registration — validates and appends new conditional orders
// =============================================================================
//
// One constructor per order kind, all sharing the same gate chain: market
// must be open (one delayed re-check), the exclusivity constraint must hold,
// quantity is clamped to the minimum unit. Business rejections return
// `Ok(None)` after a notification and leave the store untouched; only
// infrastructure failures surface as errors.
//
// The exclusivity check runs inside the store transaction so a concurrent
// registration in another process cannot slip a duplicate in between check
// and append.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::broker::Brokerage;
use crate::notify::Notifier;
use crate::order::{Order, OrderDetail, OrderId, OrderKind, Trailing};
use crate::store::OrderStore;

/// Minimum order quantity (equities trade in whole shares).
const MINIMUM_VOLUME: f64 = 1.0;

/// Client-facing registration and cancellation API, bound to one account
/// scope.
pub struct OrderDesk {
    store: OrderStore,
    broker: Arc<dyn Brokerage>,
    notifier: Notifier,
    account: String,
    market_retry_delay: Duration,
    jitter: Duration,
}

impl OrderDesk {
    pub fn new(
        store: OrderStore,
        broker: Arc<dyn Brokerage>,
        notifier: Notifier,
        account: impl Into<String>,
    ) -> Self {
        Self {
            store,
            broker,
            notifier,
            account: account.into(),
            market_retry_delay: Duration::from_secs(1),
            jitter: Duration::from_millis(100),
        }
    }

    /// Override the market re-check delay and the store-contention jitter.
    pub fn with_timing(mut self, market_retry_delay: Duration, jitter: Duration) -> Self {
        self.market_retry_delay = market_retry_delay;
        self.jitter = jitter;
        self
    }

    // -------------------------------------------------------------------------
    // Constructors, one per order kind
    // -------------------------------------------------------------------------

    pub async fn stop_buy(
        &self,
        ticker: &str,
        volume: f64,
        stop_price: f64,
        exclusive: bool,
    ) -> Result<Option<OrderId>> {
        let volume = volume.max(MINIMUM_VOLUME);
        self.register(ticker, OrderKind::StopBuy, exclusive, |_| {
            OrderDetail::StopBuy { volume, stop_price }
        })
        .await
    }

    pub async fn stop_sell(
        &self,
        ticker: &str,
        volume: f64,
        stop_price: f64,
        exclusive: bool,
        cancel_limit_orders: bool,
    ) -> Result<Option<OrderId>> {
        let volume = volume.max(MINIMUM_VOLUME);
        self.register(ticker, OrderKind::StopSell, exclusive, |_| {
            OrderDetail::StopSell {
                volume,
                stop_price,
                cancel_limit_orders,
            }
        })
        .await
    }

    pub async fn profit_sell(
        &self,
        ticker: &str,
        volume: f64,
        profit_price: f64,
        exclusive: bool,
        cancel_limit_orders: bool,
    ) -> Result<Option<OrderId>> {
        let volume = volume.max(MINIMUM_VOLUME);
        self.register(ticker, OrderKind::ProfitSell, exclusive, |_| {
            OrderDetail::ProfitSell {
                volume,
                profit_price,
                cancel_limit_orders,
            }
        })
        .await
    }

    pub async fn trailing_stop_buy(
        &self,
        ticker: &str,
        volume: f64,
        trailing_percent: f64,
        activation_price: Option<f64>,
        exclusive: bool,
    ) -> Result<Option<OrderId>> {
        let volume = volume.max(MINIMUM_VOLUME);
        self.register(ticker, OrderKind::TrailingStopBuy, exclusive, |now_price| {
            OrderDetail::TrailingStopBuy {
                volume,
                trailing: Trailing::new(trailing_percent, activation_price, now_price),
            }
        })
        .await
    }

    pub async fn trailing_stop_sell(
        &self,
        ticker: &str,
        volume: f64,
        trailing_percent: f64,
        activation_price: Option<f64>,
        exclusive: bool,
        cancel_limit_orders: bool,
    ) -> Result<Option<OrderId>> {
        let volume = volume.max(MINIMUM_VOLUME);
        self.register(
            ticker,
            OrderKind::TrailingStopSell,
            exclusive,
            |now_price| OrderDetail::TrailingStopSell {
                volume,
                trailing: Trailing::new(trailing_percent, activation_price, now_price),
                cancel_limit_orders,
            },
        )
        .await
    }

    /// Liquidates the entire free balance at trigger time; no volume.
    pub async fn stop_loss(
        &self,
        ticker: &str,
        stop_price: f64,
        exclusive: bool,
    ) -> Result<Option<OrderId>> {
        self.register(ticker, OrderKind::StopLoss, exclusive, |_| {
            OrderDetail::StopLoss { stop_price }
        })
        .await
    }

    /// Trailing variant of `stop_loss`.
    pub async fn trailing_stop_loss(
        &self,
        ticker: &str,
        trailing_percent: f64,
        activation_price: Option<f64>,
        exclusive: bool,
    ) -> Result<Option<OrderId>> {
        self.register(
            ticker,
            OrderKind::TrailingStopLoss,
            exclusive,
            |now_price| OrderDetail::TrailingStopLoss {
                trailing: Trailing::new(trailing_percent, activation_price, now_price),
            },
        )
        .await
    }

    // -------------------------------------------------------------------------
    // Cancellation
    // -------------------------------------------------------------------------

    /// Cancel one pending order by id. Returns whether anything was removed.
    pub async fn cancel_by_id(&self, id: &OrderId) -> Result<bool> {
        let mut txn = self.store.begin()?;
        match txn.remove_by_id(id, &self.account) {
            Some(order) => {
                txn.commit()?;
                let msg = format!(
                    "{} {} {} order {} cancelled.",
                    self.account,
                    order.ticker,
                    order.kind().label(),
                    id
                );
                info!(order_id = %id, "order cancelled");
                self.notifier.send(&msg).await;
                Ok(true)
            }
            None => {
                drop(txn);
                let msg = format!("{} order {} not found — nothing cancelled.", self.account, id);
                warn!(order_id = %id, "cancel requested for unknown order");
                self.notifier.send(&msg).await;
                Ok(false)
            }
        }
    }

    /// Cancel every pending order for `ticker`, optionally restricted to one
    /// kind. When `with_limit_orders` is set, resting exchange orders for the
    /// instrument are cancelled first. Returns the number of stored orders
    /// removed.
    pub async fn cancel_by_ticker(
        &self,
        ticker: &str,
        kind: Option<OrderKind>,
        with_limit_orders: bool,
    ) -> Result<usize> {
        if with_limit_orders {
            self.broker.cancel_all_orders(ticker).await?;
        }

        let mut txn = self.store.begin()?;
        let removed = txn.remove_by_ticker(ticker, kind, &self.account);
        if removed.is_empty() {
            drop(txn);
            debug!(ticker, "no pending orders to cancel");
            return Ok(0);
        }
        txn.commit()?;

        let kind_label = kind.map_or("all", |k| k.label());
        let msg = format!(
            "{} {} cancelled {} pending {} order(s).",
            self.account,
            ticker,
            removed.len(),
            kind_label
        );
        info!(ticker, count = removed.len(), "orders cancelled by ticker");
        self.notifier.send(&msg).await;
        Ok(removed.len())
    }

    // -------------------------------------------------------------------------
    // Shared registration flow
    // -------------------------------------------------------------------------

    async fn register(
        &self,
        ticker: &str,
        kind: OrderKind,
        exclusive: bool,
        build: impl FnOnce(f64) -> OrderDetail,
    ) -> Result<Option<OrderId>> {
        // Market gate: one delayed re-check, then give up without touching
        // the store.
        if !self.broker.is_market_open().await? {
            tokio::time::sleep(self.market_retry_delay).await;
            if !self.broker.is_market_open().await? {
                let msg = format!(
                    "market is closed — {} order for {} not registered.",
                    kind.label(),
                    ticker
                );
                warn!(ticker, kind = %kind, "registration rejected: market closed");
                self.notifier.send(&msg).await;
                return Ok(None);
            }
        }

        // Decorrelate store contention with the evaluator sweep.
        self.jitter_sleep().await;

        // Fetched outside the lock: the price seeds trailing extremes and
        // fills the notification, the name is display only.
        let now_price = self.broker.current_price(ticker).await?;
        let name = self.display_name(ticker).await;

        let mut txn = self.store.begin()?;
        if exclusive
            && txn
                .find_by_ticker_and_kind(ticker, kind, &self.account)
                .is_some()
        {
            drop(txn);
            let msg = format!(
                "{} {} {} already has a pending {} order — exclusive registration refused.",
                self.account,
                ticker,
                name,
                kind.label()
            );
            warn!(ticker, kind = %kind, "registration rejected: exclusivity conflict");
            self.notifier.send(&msg).await;
            return Ok(None);
        }

        let order = Order {
            id: OrderId::generate(kind, ticker),
            account: self.account.clone(),
            ticker: ticker.to_string(),
            detail: build(now_price),
        };
        let id = order.id.clone();
        txn.push(order.clone());
        txn.commit()?;

        info!(order_id = %id, ticker, kind = %kind, "order registered");
        self.notify_registered(&order, &name, now_price).await;
        Ok(Some(id))
    }

    async fn jitter_sleep(&self) {
        if self.jitter.is_zero() {
            return;
        }
        let ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    async fn display_name(&self, ticker: &str) -> String {
        self.broker
            .stock_name(ticker)
            .await
            .unwrap_or_else(|_| ticker.to_string())
    }

    async fn notify_registered(&self, order: &Order, name: &str, now_price: f64) {
        let mut msg = format!(
            "{} {} {} {} order registered.\norder id: {}",
            self.account,
            order.ticker,
            name,
            order.kind().label(),
            order.id
        );
        if let Some(volume) = order.volume() {
            msg.push_str(&format!("\nvolume: {volume}"));
        }
        match &order.detail {
            OrderDetail::StopBuy { stop_price, .. }
            | OrderDetail::StopSell { stop_price, .. }
            | OrderDetail::StopLoss { stop_price } => {
                msg.push_str(&format!("\nstop price: {stop_price}"));
            }
            OrderDetail::ProfitSell { profit_price, .. } => {
                msg.push_str(&format!("\nprofit price: {profit_price}"));
            }
            OrderDetail::TrailingStopBuy { trailing, .. }
            | OrderDetail::TrailingStopSell { trailing, .. }
            | OrderDetail::TrailingStopLoss { trailing } => {
                msg.push_str(&format!("\ntrailing percent: {}%", trailing.percent));
                if let Some(activation) = trailing.activation_price {
                    msg.push_str(&format!("\nactivation price: {activation}"));
                }
            }
        }
        msg.push_str(&format!("\ncurrent price: {now_price}"));
        if matches!(
            order.kind(),
            OrderKind::StopLoss | OrderKind::TrailingStopLoss
        ) {
            msg.push_str("\nlimit orders auto-cancel: enabled");
        }
        self.notifier.send(&msg).await;
    }
}

// =============================================================================
// Tests
// =============================================================================
