// =============================================================================
// Stop Sentinel evaluator — entry point
// =============================================================================
//
// One invocation performs exactly one evaluation sweep and exits; the caller
// (cron or an equivalent scheduler) sets the cadence. The singleton lock
// guarantees two sweeps never interleave even if the scheduler misfires.
// =============================================================================

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stop_sentinel::broker::RestBroker;
use stop_sentinel::evaluator::Evaluator;
use stop_sentinel::notify::Notifier;
use stop_sentinel::settings::Settings;
use stop_sentinel::singleton::SingletonGuard;
use stop_sentinel::store::OrderStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Stop Sentinel evaluator starting");

    let settings = Settings::from_env();
    info!(
        store = %settings.store_path.display(),
        account = %settings.account,
        "settings resolved"
    );

    // ── 2. Singleton guard ───────────────────────────────────────────────
    let Some(_guard) = SingletonGuard::acquire(&settings.singleton_lock_path)? else {
        warn!("another evaluator instance holds the lock — exiting");
        return Ok(());
    };

    // ── 3. Startup delay (offsets the cadence from sibling traders) ──────
    if !settings.startup_delay.is_zero() {
        info!(secs = settings.startup_delay.as_secs(), "startup delay");
        tokio::time::sleep(settings.startup_delay).await;
    }

    // ── 4. Wire up and sweep ─────────────────────────────────────────────
    let broker = Arc::new(RestBroker::new(
        settings.broker_base_url.clone(),
        settings.broker_api_key.clone(),
        settings.broker_secret.clone(),
    ));
    let notifier = Notifier::new(
        settings.telegram_bot_token.clone(),
        settings.telegram_chat_id.clone(),
    );
    let store = OrderStore::new(settings.store_path.clone());

    let evaluator = Evaluator::new(store, broker, notifier);
    let report = evaluator.run_sweep().await?;

    if report.market_open {
        info!(
            evaluated = report.evaluated,
            triggered = report.triggered,
            cascaded = report.cascaded,
            errors = report.errors,
            liquidated = ?report.liquidated_tickers,
            "sweep finished"
        );
    } else {
        info!("market closed — nothing evaluated");
    }

    Ok(())
}
