// =============================================================================
// Evaluation engine — one full sweep over the order store per invocation
// =============================================================================
//
// The sweep loads the store under its exclusive lock, evaluates every pending
// order against the live price, issues the matching brokerage actions,
// removes completed orders and commits the remainder once, atomically. A
// closed market aborts before the store is even opened.
//
// Each order evaluates inside its own failure boundary: a brokerage error on
// one instrument logs, notifies, and leaves that order untouched for the next
// sweep instead of aborting the rest.
//
// A fired stop loss cascades: every other stored order on the instrument is
// removed, and after the sweep the instrument's balance is checked once more
// so quantity settled mid-sweep still gets liquidated.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::broker::{Brokerage, OrderSide, OrderStatus, PriceType};
use crate::notify::Notifier;
use crate::order::{Order, OrderDetail, OrderId, Trailing};
use crate::store::OrderStore;

// ---------------------------------------------------------------------------
// Sweep report
// ---------------------------------------------------------------------------

/// Summary of a single evaluation sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    /// Whether the market was open; a closed market skips everything below.
    pub market_open: bool,
    /// Orders evaluated this sweep.
    pub evaluated: u32,
    /// Orders whose trigger fired and whose action was issued.
    pub triggered: u32,
    /// Sibling orders removed by a stop-loss cascade.
    pub cascaded: u32,
    /// Orders whose evaluation failed and were kept for the next sweep.
    pub errors: u32,
    /// Instruments fully liquidated this sweep.
    pub liquidated_tickers: Vec<String>,
    /// ISO-8601 timestamp of this sweep.
    pub timestamp: String,
}

impl SweepReport {
    fn closed_market(timestamp: String) -> Self {
        Self {
            market_open: false,
            evaluated: 0,
            triggered: 0,
            cascaded: 0,
            errors: 0,
            liquidated_tickers: Vec::new(),
            timestamp,
        }
    }
}

/// Outcome of one order's evaluation.
enum Verdict {
    /// Condition not met; the (possibly mutated) order stays in the store.
    Keep,
    /// Action issued; the order is removed at the end of the sweep.
    /// `liquidation` marks full-position stop losses, which cascade.
    Triggered { liquidation: bool },
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// The per-invocation sweep engine.
pub struct Evaluator {
    store: OrderStore,
    broker: Arc<dyn Brokerage>,
    notifier: Notifier,
}

impl Evaluator {
    pub fn new(store: OrderStore, broker: Arc<dyn Brokerage>, notifier: Notifier) -> Self {
        Self {
            store,
            broker,
            notifier,
        }
    }

    /// Run one sweep. The store lock is held from load to commit so
    /// registrations in other processes cannot interleave with the
    /// read-modify-write.
    pub async fn run_sweep(&self) -> Result<SweepReport> {
        let timestamp = Utc::now().to_rfc3339();

        if !self.broker.is_market_open().await? {
            info!("market is closed — sweep skipped");
            return Ok(SweepReport::closed_market(timestamp));
        }

        let mut txn = self.store.begin()?;
        let total = txn.orders().len();
        info!(count = total, "evaluation sweep started");

        let mut to_remove: Vec<OrderId> = Vec::new();
        let mut liquidated: Vec<String> = Vec::new();
        let mut triggered: u32 = 0;
        let mut errors: u32 = 0;

        for idx in 0..total {
            let mut order = txn.orders()[idx].clone();

            // A liquidation already fired for this instrument this sweep:
            // the sibling belongs to the cascade, not to its own trigger.
            if liquidated.contains(&order.ticker) {
                continue;
            }

            match self.evaluate_order(&mut order).await {
                Ok(Verdict::Keep) => {
                    // Trailing mutations (activation, extreme ratchet) must
                    // survive the sweep.
                    txn.orders_mut()[idx] = order;
                }
                Ok(Verdict::Triggered { liquidation }) => {
                    triggered += 1;
                    if liquidation && !liquidated.contains(&order.ticker) {
                        liquidated.push(order.ticker.clone());
                    }
                    to_remove.push(order.id.clone());
                }
                Err(e) => {
                    errors += 1;
                    error!(
                        order_id = %order.id,
                        ticker = %order.ticker,
                        error = %e,
                        "order evaluation failed — kept for next sweep"
                    );
                    let msg = format!(
                        "{} {} error while evaluating {} order {}: {} — will retry next sweep.",
                        order.account,
                        order.ticker,
                        order.kind().label(),
                        order.id,
                        e
                    );
                    self.notifier.send(&msg).await;
                }
            }
        }

        // Cascade: a fired liquidation takes every sibling order on the
        // instrument with it, whether or not its own condition fired.
        let mut cascade_msgs = Vec::new();
        for order in txn.orders() {
            if liquidated.contains(&order.ticker) && !to_remove.contains(&order.id) {
                to_remove.push(order.id.clone());
                cascade_msgs.push(format!(
                    "{} {} {} order {} removed due to stop loss execution.",
                    order.account,
                    order.ticker,
                    order.kind().label(),
                    order.id
                ));
            }
        }
        let cascaded = cascade_msgs.len() as u32;
        for msg in cascade_msgs {
            self.notifier.send(&msg).await;
        }

        // Second-chance pass: quantity that settled while the sweep ran
        // (late buy fills) still belongs to the liquidation.
        for ticker in &liquidated {
            if let Err(e) = self.reconcile_residual(ticker).await {
                errors += 1;
                warn!(ticker = %ticker, error = %e, "residual reconciliation failed");
                self.notifier
                    .send(&format!(
                        "residual balance check failed for {ticker}: {e}"
                    ))
                    .await;
            }
        }

        txn.orders_mut().retain(|o| !to_remove.contains(&o.id));
        txn.commit()?;

        let report = SweepReport {
            market_open: true,
            evaluated: total as u32,
            triggered,
            cascaded,
            errors,
            liquidated_tickers: liquidated,
            timestamp,
        };
        info!(
            evaluated = report.evaluated,
            triggered = report.triggered,
            cascaded = report.cascaded,
            errors = report.errors,
            "evaluation sweep completed"
        );
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Per-order evaluation
    // -------------------------------------------------------------------------

    /// Evaluate one order against the current price. Everything that can fail
    /// is inside this boundary; an `Err` leaves the caller's copy untouched.
    async fn evaluate_order(&self, order: &mut Order) -> Result<Verdict> {
        let ticker = order.ticker.clone();
        let price = self.broker.current_price(&ticker).await?;

        match order.detail.clone() {
            OrderDetail::StopBuy { volume, stop_price } => {
                if price < stop_price {
                    return Ok(Verdict::Keep);
                }
                self.broker.buy_market(&ticker, volume).await?;
                self.notify_executed(
                    order,
                    &format!("volume: {volume}\nstop price: {stop_price}\ncurrent price: {price}"),
                )
                .await;
                Ok(Verdict::Triggered { liquidation: false })
            }

            OrderDetail::StopSell {
                volume,
                stop_price,
                cancel_limit_orders,
            } => {
                if price > stop_price {
                    return Ok(Verdict::Keep);
                }
                if cancel_limit_orders {
                    self.preempt_limit_orders(order, volume).await;
                }
                self.broker.sell_market(&ticker, volume).await?;
                self.notify_executed(
                    order,
                    &format!("volume: {volume}\nstop price: {stop_price}\ncurrent price: {price}"),
                )
                .await;
                Ok(Verdict::Triggered { liquidation: false })
            }

            OrderDetail::ProfitSell {
                volume,
                profit_price,
                cancel_limit_orders,
            } => {
                if price < profit_price {
                    return Ok(Verdict::Keep);
                }
                if cancel_limit_orders {
                    self.preempt_limit_orders(order, volume).await;
                }
                self.broker.sell_market(&ticker, volume).await?;
                self.notify_executed(
                    order,
                    &format!(
                        "volume: {volume}\nprofit price: {profit_price}\ncurrent price: {price}"
                    ),
                )
                .await;
                Ok(Verdict::Triggered { liquidation: false })
            }

            OrderDetail::TrailingStopBuy {
                volume,
                mut trailing,
            } => {
                if !trailing.activated && !self.try_activate_buy_side(order, &mut trailing, price) {
                    order.detail = OrderDetail::TrailingStopBuy { volume, trailing };
                    return Ok(Verdict::Keep);
                }

                trailing.lower_extreme(price);
                let trigger_price = trailing.buy_trigger_price();
                if price >= trigger_price {
                    self.broker.buy_market(&ticker, volume).await?;
                    self.notify_executed(
                        order,
                        &format!(
                            "volume: {volume}\ntrailing percent: {}%\nlowest price: {}\ntrigger price: {trigger_price}\ncurrent price: {price}",
                            trailing.percent, trailing.extreme_price
                        ),
                    )
                    .await;
                    Ok(Verdict::Triggered { liquidation: false })
                } else {
                    order.detail = OrderDetail::TrailingStopBuy { volume, trailing };
                    Ok(Verdict::Keep)
                }
            }

            OrderDetail::TrailingStopSell {
                volume,
                mut trailing,
                cancel_limit_orders,
            } => {
                if !trailing.activated && !self.try_activate_sell_side(order, &mut trailing, price)
                {
                    order.detail = OrderDetail::TrailingStopSell {
                        volume,
                        trailing,
                        cancel_limit_orders,
                    };
                    return Ok(Verdict::Keep);
                }

                trailing.raise_extreme(price);
                let trigger_price = trailing.sell_trigger_price();
                if price <= trigger_price {
                    if cancel_limit_orders {
                        self.preempt_limit_orders(order, volume).await;
                    }
                    self.broker.sell_market(&ticker, volume).await?;
                    self.notify_executed(
                        order,
                        &format!(
                            "volume: {volume}\ntrailing percent: {}%\nhighest price: {}\ntrigger price: {trigger_price}\ncurrent price: {price}",
                            trailing.percent, trailing.extreme_price
                        ),
                    )
                    .await;
                    Ok(Verdict::Triggered { liquidation: false })
                } else {
                    order.detail = OrderDetail::TrailingStopSell {
                        volume,
                        trailing,
                        cancel_limit_orders,
                    };
                    Ok(Verdict::Keep)
                }
            }

            OrderDetail::StopLoss { stop_price } => {
                if price > stop_price {
                    return Ok(Verdict::Keep);
                }
                let sold = self.liquidate_holdings(&ticker).await?;
                if sold > 0.0 {
                    self.notify_executed(
                        order,
                        &format!(
                            "sold volume: {sold}\nstop price: {stop_price}\ncurrent price: {price}\nentire holding liquidated"
                        ),
                    )
                    .await;
                } else {
                    self.notifier
                        .send(&format!(
                            "{} {} holding is zero — stop loss order {} removed without selling.",
                            order.account, ticker, order.id
                        ))
                        .await;
                }
                Ok(Verdict::Triggered { liquidation: true })
            }

            OrderDetail::TrailingStopLoss { mut trailing } => {
                if !trailing.activated {
                    match trailing.activation_price {
                        // The loss side arms once price recovers to the gate.
                        Some(activation) if price >= activation => {
                            trailing.activate(price);
                            let msg = format!(
                                "{} {} trailing stop loss activated at {price}.",
                                order.account, ticker
                            );
                            info!(ticker = %ticker, price, "trailing stop loss activated");
                            self.notifier.send(&msg).await;
                        }
                        None => {
                            trailing.activate(price);
                            let msg = format!(
                                "{} {} trailing stop loss immediately activated at {price}.",
                                order.account, ticker
                            );
                            info!(ticker = %ticker, price, "trailing stop loss immediately activated");
                            self.notifier.send(&msg).await;
                        }
                        Some(_) => {
                            order.detail = OrderDetail::TrailingStopLoss { trailing };
                            return Ok(Verdict::Keep);
                        }
                    }
                }

                if trailing.raise_extreme(price) {
                    let msg = format!(
                        "{} {} trailing stop loss new high: {price}.",
                        order.account, ticker
                    );
                    self.notifier.send(&msg).await;
                }

                let trigger_price = trailing.sell_trigger_price();
                if price <= trigger_price {
                    let sold = self.liquidate_holdings(&ticker).await?;
                    if sold > 0.0 {
                        self.notify_executed(
                            order,
                            &format!(
                                "sold volume: {sold}\nexecution price: {price}\nhighest price: {}\ntrigger price: {trigger_price}\nentire holding liquidated",
                                trailing.extreme_price
                            ),
                        )
                        .await;
                    } else {
                        self.notifier
                            .send(&format!(
                                "{} {} holding is zero — trailing stop loss order {} removed without selling.",
                                order.account, ticker, order.id
                            ))
                            .await;
                    }
                    Ok(Verdict::Triggered { liquidation: true })
                } else {
                    order.detail = OrderDetail::TrailingStopLoss { trailing };
                    Ok(Verdict::Keep)
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Activation gating
    // -------------------------------------------------------------------------

    /// Buy-side activation: arms when price falls to the gate. Returns
    /// whether the order is live after this tick.
    fn try_activate_buy_side(&self, order: &Order, trailing: &mut Trailing, price: f64) -> bool {
        match trailing.activation_price {
            Some(activation) if price <= activation => {
                trailing.activate(price);
                info!(
                    ticker = %order.ticker,
                    price,
                    activation,
                    "trailing stop buy activated"
                );
                true
            }
            None => {
                trailing.activate(price);
                info!(ticker = %order.ticker, price, "trailing stop buy immediately activated");
                true
            }
            Some(_) => false,
        }
    }

    /// Sell-side activation: arms when price falls to the gate.
    fn try_activate_sell_side(&self, order: &Order, trailing: &mut Trailing, price: f64) -> bool {
        match trailing.activation_price {
            Some(activation) if price <= activation => {
                trailing.activate(price);
                info!(
                    ticker = %order.ticker,
                    price,
                    activation,
                    "trailing stop sell activated"
                );
                true
            }
            None => {
                trailing.activate(price);
                info!(ticker = %order.ticker, price, "trailing stop sell immediately activated");
                true
            }
            Some(_) => false,
        }
    }

    // -------------------------------------------------------------------------
    // Limit-order preemption
    // -------------------------------------------------------------------------

    /// Free up enough quantity for an unconditional market sell of `volume`:
    /// cancel resting limit sells oldest-first until the shortfall is covered
    /// or candidates run out. Best-effort: individual failures are logged and
    /// skipped, the market sell proceeds regardless.
    async fn preempt_limit_orders(&self, order: &Order, volume: f64) {
        let ticker = order.ticker.as_str();

        let free = match self.broker.free_quantity(ticker).await {
            Ok(free) => free,
            Err(e) => {
                warn!(ticker, error = %e, "could not read free quantity — skipping preemption");
                return;
            }
        };

        let shortfall = volume - free;
        if shortfall <= 0.0 {
            debug!(ticker, free, volume, "no shortfall — preemption not needed");
            return;
        }

        let resting = match self
            .broker
            .open_orders(ticker, OrderSide::Sell, OrderStatus::Open)
            .await
        {
            Ok(resting) => resting,
            Err(e) => {
                warn!(ticker, error = %e, "could not list resting orders — skipping preemption");
                return;
            }
        };

        let mut cancelled = 0.0;
        for resting_order in &resting {
            if cancelled >= shortfall {
                debug!(ticker, cancelled, shortfall, "shortfall covered — stopping cancellation");
                break;
            }
            if resting_order.price_type != PriceType::Limit
                || resting_order.status != OrderStatus::Open
            {
                continue;
            }
            match self.broker.cancel_order(ticker, resting_order).await {
                Ok(()) => {
                    cancelled += resting_order.remaining_qty;
                    debug!(
                        ticker,
                        order_no = %resting_order.order_no,
                        qty = resting_order.remaining_qty,
                        cancelled,
                        "resting limit order cancelled"
                    );
                }
                Err(e) => {
                    warn!(
                        ticker,
                        order_no = %resting_order.order_no,
                        error = %e,
                        "failed to cancel resting order"
                    );
                }
            }
        }

        if cancelled > 0.0 {
            let msg = format!(
                "{} {} cancelled {cancelled} resting limit quantity ahead of {} execution.",
                order.account,
                ticker,
                order.kind().label()
            );
            self.notifier.send(&msg).await;
        }
    }

    // -------------------------------------------------------------------------
    // Full liquidation
    // -------------------------------------------------------------------------

    /// Cancel everything resting for the instrument and market-sell the whole
    /// free balance. Returns the quantity sold (0.0 when nothing was held).
    async fn liquidate_holdings(&self, ticker: &str) -> Result<f64> {
        self.broker.cancel_all_orders(ticker).await?;
        let free = self.broker.free_quantity(ticker).await?;
        if free <= 0.0 {
            return Ok(0.0);
        }
        self.broker.sell_market(ticker, free).await?;
        Ok(free)
    }

    /// Post-sweep re-check for a liquidated instrument: anything that settled
    /// while the sweep ran is sold now.
    async fn reconcile_residual(&self, ticker: &str) -> Result<()> {
        self.broker.cancel_all_orders(ticker).await?;
        let residual = self.broker.free_quantity(ticker).await?;
        if residual > 0.0 {
            self.broker.sell_market(ticker, residual).await?;
            let msg = format!(
                "{ticker} residual holding found after stop loss and sold: {residual}."
            );
            info!(ticker, residual, "residual holding sold");
            self.notifier.send(&msg).await;
        }
        Ok(())
    }

    async fn notify_executed(&self, order: &Order, detail_lines: &str) {
        let name = self
            .broker
            .stock_name(&order.ticker)
            .await
            .unwrap_or_else(|_| order.ticker.clone());
        let msg = format!(
            "{} {} {} {} order executed.\norder id: {}\n{}",
            order.account,
            order.ticker,
            name,
            order.kind().label(),
            order.id,
            detail_lines
        );
        self.notifier.send(&msg).await;
    }
}

// =============================================================================
// Tests
// =============================================================================
