// =============================================================================
// Stop Sentinel — conditional order engine
// =============================================================================
//
// Trading processes register price-triggered orders (stop buy/sell, profit
// take, trailing stops, full-position stop loss) through `OrderDesk`; the
// orders persist in one file-locked JSON store shared across processes. A
// separately scheduled run of the evaluator binary sweeps the store, checks
// every pending order against the live price and issues the matching market
// actions through the `Brokerage` gateway.
// =============================================================================

pub mod broker;
pub mod evaluator;
pub mod notify;
pub mod order;
pub mod registration;
pub mod settings;
pub mod singleton;
pub mod store;

pub use broker::{Brokerage, RestBroker};
pub use evaluator::{Evaluator, SweepReport};
pub use notify::Notifier;
pub use order::{Order, OrderDetail, OrderId, OrderKind, Trailing};
pub use registration::OrderDesk;
pub use settings::Settings;
pub use singleton::SingletonGuard;
pub use store::OrderStore;
