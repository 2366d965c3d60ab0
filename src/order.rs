// =============================================================================
// Order model — the single persisted entity of the engine
// =============================================================================
//
// An `Order` is one price-triggered instruction scoped to an account. The
// seven kinds carry different fields, so the payload is a tagged sum type
// rather than one struct full of optionals: a `StopBuy` cannot hold an
// activation price, a `StopLoss` cannot hold a volume.
//
// Orders are created by the registration API, mutated only by the evaluator
// (trailing extremes, activation flips) and removed on trigger, explicit
// cancellation, or a stop-loss cascade.
// =============================================================================

use chrono::Local;
use serde::{Deserialize, Serialize};

// =============================================================================
// OrderKind
// =============================================================================

/// The seven supported order kinds. The discriminant is fixed at creation and
/// decides which fields of the payload are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderKind {
    StopBuy,
    StopSell,
    ProfitSell,
    TrailingStopBuy,
    TrailingStopSell,
    StopLoss,
    TrailingStopLoss,
}

impl OrderKind {
    /// Human-readable label used in notification text.
    pub fn label(&self) -> &'static str {
        match self {
            Self::StopBuy => "stop buy",
            Self::StopSell => "stop sell",
            Self::ProfitSell => "profit sell",
            Self::TrailingStopBuy => "trailing stop buy",
            Self::TrailingStopSell => "trailing stop sell",
            Self::StopLoss => "stop loss",
            Self::TrailingStopLoss => "trailing stop loss",
        }
    }
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopBuy => write!(f, "StopBuy"),
            Self::StopSell => write!(f, "StopSell"),
            Self::ProfitSell => write!(f, "ProfitSell"),
            Self::TrailingStopBuy => write!(f, "TrailingStopBuy"),
            Self::TrailingStopSell => write!(f, "TrailingStopSell"),
            Self::StopLoss => write!(f, "StopLoss"),
            Self::TrailingStopLoss => write!(f, "TrailingStopLoss"),
        }
    }
}

// =============================================================================
// OrderId
// =============================================================================

/// Unique order identifier: `<Kind>_<YYYYMMDD_HHMMSS_mmm>_<ticker>`.
/// Immutable once assigned; unique across the whole store regardless of
/// account scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    /// Generate a fresh id from the kind, the current wall clock (millisecond
    /// precision) and the ticker.
    pub fn generate(kind: OrderKind, ticker: &str) -> Self {
        let stamp = Local::now().format("%Y%m%d_%H%M%S_%3f");
        Self(format!("{kind}_{stamp}_{ticker}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// Trailing state
// =============================================================================

/// Mutable state shared by the three trailing kinds.
///
/// `extreme_price` is the best price observed since activation: the lowest
/// for the buy side, the highest for the sell/liquidation side. It is seeded
/// with the current price at registration, re-seeded at the moment of
/// activation, and from then on ratchets monotonically in the favorable
/// direction only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trailing {
    /// Pullback/rally threshold in percent (e.g. 3.0 means 3 %).
    pub percent: f64,

    /// Price gate that must be crossed before the trigger logic goes live.
    /// Absent means the order is active from the start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_price: Option<f64>,

    /// Whether the activation gate has been crossed.
    pub activated: bool,

    /// Best price seen since activation (lowest or highest depending on
    /// side). Placeholder value before activation.
    pub extreme_price: f64,
}

impl Trailing {
    /// Build the state as the registration API stores it: active immediately
    /// when no activation price is given, dormant otherwise. `seed_price` is
    /// the current market price at registration time.
    pub fn new(percent: f64, activation_price: Option<f64>, seed_price: f64) -> Self {
        Self {
            percent,
            activation_price,
            activated: activation_price.is_none(),
            extreme_price: seed_price,
        }
    }

    /// Flip the order live and seed the extreme with the activation-tick
    /// price.
    pub fn activate(&mut self, price: f64) {
        self.activated = true;
        self.extreme_price = price;
    }

    /// Sell-side ratchet: extreme = max(extreme, price). Returns whether the
    /// extreme moved.
    pub fn raise_extreme(&mut self, price: f64) -> bool {
        if price > self.extreme_price {
            self.extreme_price = price;
            true
        } else {
            false
        }
    }

    /// Buy-side ratchet: extreme = min(extreme, price). Returns whether the
    /// extreme moved.
    pub fn lower_extreme(&mut self, price: f64) -> bool {
        if price < self.extreme_price {
            self.extreme_price = price;
            true
        } else {
            false
        }
    }

    /// Trigger level for sell-side trailing: highest × (1 − percent/100).
    pub fn sell_trigger_price(&self) -> f64 {
        self.extreme_price * (1.0 - self.percent / 100.0)
    }

    /// Trigger level for buy-side trailing: lowest × (1 + percent/100).
    pub fn buy_trigger_price(&self) -> f64 {
        self.extreme_price * (1.0 + self.percent / 100.0)
    }
}

// =============================================================================
// OrderDetail — per-kind payload
// =============================================================================

/// Kind-specific payload. Serialized internally tagged so the store document
/// stays a flat, readable JSON array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum OrderDetail {
    StopBuy {
        volume: f64,
        stop_price: f64,
    },
    StopSell {
        volume: f64,
        stop_price: f64,
        #[serde(default)]
        cancel_limit_orders: bool,
    },
    ProfitSell {
        volume: f64,
        profit_price: f64,
        #[serde(default)]
        cancel_limit_orders: bool,
    },
    TrailingStopBuy {
        volume: f64,
        #[serde(flatten)]
        trailing: Trailing,
    },
    TrailingStopSell {
        volume: f64,
        #[serde(flatten)]
        trailing: Trailing,
        #[serde(default)]
        cancel_limit_orders: bool,
    },
    /// Liquidates the entire free balance at trigger time; resting limit
    /// orders are always cancelled first.
    StopLoss {
        stop_price: f64,
    },
    /// Trailing variant of `StopLoss`, same liquidation semantics.
    TrailingStopLoss {
        #[serde(flatten)]
        trailing: Trailing,
    },
}

impl OrderDetail {
    pub fn kind(&self) -> OrderKind {
        match self {
            Self::StopBuy { .. } => OrderKind::StopBuy,
            Self::StopSell { .. } => OrderKind::StopSell,
            Self::ProfitSell { .. } => OrderKind::ProfitSell,
            Self::TrailingStopBuy { .. } => OrderKind::TrailingStopBuy,
            Self::TrailingStopSell { .. } => OrderKind::TrailingStopSell,
            Self::StopLoss { .. } => OrderKind::StopLoss,
            Self::TrailingStopLoss { .. } => OrderKind::TrailingStopLoss,
        }
    }
}

// =============================================================================
// Order
// =============================================================================

/// One persisted conditional order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    /// Account scope label. All store queries filter on it so multiple
    /// accounts share one store file safely.
    pub account: String,
    /// Instrument code the order targets.
    pub ticker: String,
    #[serde(flatten)]
    pub detail: OrderDetail,
}

impl Order {
    pub fn kind(&self) -> OrderKind {
        self.detail.kind()
    }

    /// Quantity to trade. Absent for the full-liquidation kinds, which sell
    /// whatever the free balance is at trigger time.
    pub fn volume(&self) -> Option<f64> {
        match &self.detail {
            OrderDetail::StopBuy { volume, .. }
            | OrderDetail::StopSell { volume, .. }
            | OrderDetail::ProfitSell { volume, .. }
            | OrderDetail::TrailingStopBuy { volume, .. }
            | OrderDetail::TrailingStopSell { volume, .. } => Some(*volume),
            OrderDetail::StopLoss { .. } | OrderDetail::TrailingStopLoss { .. } => None,
        }
    }

    /// Whether resting limit sell orders must be cancelled to free quantity
    /// before the market action. Always true for the liquidation kinds.
    pub fn cancel_limit_orders(&self) -> bool {
        match &self.detail {
            OrderDetail::StopSell {
                cancel_limit_orders, ..
            }
            | OrderDetail::ProfitSell {
                cancel_limit_orders, ..
            }
            | OrderDetail::TrailingStopSell {
                cancel_limit_orders, ..
            } => *cancel_limit_orders,
            OrderDetail::StopLoss { .. } | OrderDetail::TrailingStopLoss { .. } => true,
            OrderDetail::StopBuy { .. } | OrderDetail::TrailingStopBuy { .. } => false,
        }
    }

    pub fn trailing(&self) -> Option<&Trailing> {
        match &self.detail {
            OrderDetail::TrailingStopBuy { trailing, .. }
            | OrderDetail::TrailingStopSell { trailing, .. }
            | OrderDetail::TrailingStopLoss { trailing } => Some(trailing),
            _ => None,
        }
    }

    pub fn trailing_mut(&mut self) -> Option<&mut Trailing> {
        match &mut self.detail {
            OrderDetail::TrailingStopBuy { trailing, .. }
            | OrderDetail::TrailingStopSell { trailing, .. }
            | OrderDetail::TrailingStopLoss { trailing } => Some(trailing),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_id_embeds_kind_and_ticker() {
        let id = OrderId::generate(OrderKind::StopBuy, "005930");
        assert!(id.as_str().starts_with("StopBuy_"));
        assert!(id.as_str().ends_with("_005930"));
        // kind, date, time, millis, ticker
        assert_eq!(id.as_str().split('_').count(), 5);
    }

    #[test]
    fn trailing_without_activation_price_starts_active() {
        let t = Trailing::new(3.0, None, 100.0);
        assert!(t.activated);
        assert_eq!(t.extreme_price, 100.0);
    }

    #[test]
    fn trailing_with_activation_price_starts_dormant() {
        let t = Trailing::new(3.0, Some(95.0), 100.0);
        assert!(!t.activated);
        // Placeholder extreme until activation re-seeds it.
        assert_eq!(t.extreme_price, 100.0);
    }

    #[test]
    fn highest_extreme_never_decreases() {
        let p0 = 1000.0;
        let mut t = Trailing::new(5.0, None, p0);
        for price in [p0, p0 + 5.0, p0 + 2.0, p0 + 8.0] {
            t.raise_extreme(price);
        }
        assert_eq!(t.extreme_price, p0 + 8.0);
    }

    #[test]
    fn lowest_extreme_never_increases() {
        let mut t = Trailing::new(5.0, None, 1000.0);
        for price in [1000.0, 995.0, 998.0, 990.0] {
            t.lower_extreme(price);
        }
        assert_eq!(t.extreme_price, 990.0);
    }

    #[test]
    fn trigger_prices_offset_from_extreme() {
        let t = Trailing::new(10.0, None, 200.0);
        assert!((t.sell_trigger_price() - 180.0).abs() < 1e-9);
        assert!((t.buy_trigger_price() - 220.0).abs() < 1e-9);
    }

    #[test]
    fn liquidation_kinds_always_cancel_limit_orders() {
        let stop_loss = Order {
            id: OrderId::from("StopLoss_x_005930"),
            account: "REAL".into(),
            ticker: "005930".into(),
            detail: OrderDetail::StopLoss { stop_price: 50.0 },
        };
        assert!(stop_loss.cancel_limit_orders());
        assert!(stop_loss.volume().is_none());

        let stop_buy = Order {
            id: OrderId::from("StopBuy_x_005930"),
            account: "REAL".into(),
            ticker: "005930".into(),
            detail: OrderDetail::StopBuy {
                volume: 10.0,
                stop_price: 1000.0,
            },
        };
        assert!(!stop_buy.cancel_limit_orders());
        assert_eq!(stop_buy.volume(), Some(10.0));
    }

    #[test]
    fn store_document_roundtrips_with_optional_fields() {
        let orders = vec![
            Order {
                id: OrderId::from("TrailingStopSell_20250101_090000_000_005930"),
                account: "REAL".into(),
                ticker: "005930".into(),
                detail: OrderDetail::TrailingStopSell {
                    volume: 5.0,
                    trailing: Trailing::new(2.5, Some(70000.0), 68000.0),
                    cancel_limit_orders: true,
                },
            },
            Order {
                id: OrderId::from("StopLoss_20250101_090001_000_000660"),
                account: "REAL2".into(),
                ticker: "000660".into(),
                detail: OrderDetail::StopLoss { stop_price: 90000.0 },
            },
        ];

        let json = serde_json::to_string_pretty(&orders).unwrap();
        let back: Vec<Order> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].kind(), OrderKind::TrailingStopSell);
        assert_eq!(back[0].trailing().unwrap().activation_price, Some(70000.0));
        assert!(!back[0].trailing().unwrap().activated);
        assert_eq!(back[1].kind(), OrderKind::StopLoss);
        assert!(back[1].cancel_limit_orders());
    }

    #[test]
    fn missing_cancel_flag_defaults_to_false() {
        let json = r#"{
            "id": "StopSell_20250101_090000_000_005930",
            "account": "REAL",
            "ticker": "005930",
            "kind": "StopSell",
            "volume": 3.0,
            "stop_price": 1000.0
        }"#;
        let order: Order = serde_json::from_str(json).unwrap();
        assert!(!order.cancel_limit_orders());
    }
}
