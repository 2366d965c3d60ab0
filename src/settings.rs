// =============================================================================
// Settings — environment-driven engine configuration
// =============================================================================
//
// Everything deployment-specific comes from the environment (loaded via
// dotenv in the binary): store location, brokerage credentials, notification
// credentials, account scope, and the timing knobs. Every field has a
// documented default so a bare environment still yields a usable Settings.
// =============================================================================

use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the engine, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path of the shared order store document.
    pub store_path: PathBuf,
    /// Path of the evaluator's process-singleton lock file.
    pub singleton_lock_path: PathBuf,
    /// Account scope label stamped on registered orders.
    pub account: String,

    /// Brokerage gateway base URL (no trailing slash).
    pub broker_base_url: String,
    pub broker_api_key: String,
    pub broker_secret: String,

    /// Telegram credentials; both empty disables notifications.
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,

    /// Delay slept by the evaluator before its sweep, to offset the cadence
    /// from sibling traders sharing the store.
    pub startup_delay: Duration,
    /// How long registration waits before re-checking a closed market once.
    pub market_retry_delay: Duration,
    /// Upper bound of the random registration jitter sleep.
    pub registration_jitter: Duration,
}

impl Settings {
    /// Resolve settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve settings from an arbitrary key lookup (tests inject a map).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let num = |key: &str, default: u64| {
            get(key)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };

        Self {
            store_path: get("SENTINEL_STORE_PATH")
                .unwrap_or_else(|| "stop_sentinel_orders.json".into())
                .into(),
            singleton_lock_path: get("SENTINEL_SINGLETON_LOCK")
                .unwrap_or_else(|| "stop_sentinel_evaluator.lock".into())
                .into(),
            account: get("SENTINEL_ACCOUNT").unwrap_or_else(|| "REAL".into()),

            broker_base_url: get("SENTINEL_BROKER_URL")
                .unwrap_or_else(|| "http://127.0.0.1:9443".into()),
            broker_api_key: get("SENTINEL_BROKER_API_KEY").unwrap_or_default(),
            broker_secret: get("SENTINEL_BROKER_SECRET").unwrap_or_default(),

            telegram_bot_token: get("SENTINEL_TELEGRAM_TOKEN"),
            telegram_chat_id: get("SENTINEL_TELEGRAM_CHAT_ID"),

            startup_delay: Duration::from_secs(num("SENTINEL_STARTUP_DELAY_SECS", 0)),
            market_retry_delay: Duration::from_millis(num(
                "SENTINEL_MARKET_RETRY_DELAY_MS",
                1000,
            )),
            registration_jitter: Duration::from_millis(num(
                "SENTINEL_REGISTRATION_JITTER_MS",
                100,
            )),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
