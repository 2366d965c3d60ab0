// =============================================================================
// Notification sink — best-effort Telegram alerts
// =============================================================================
//
// Every state transition (registration, rejection, trigger execution,
// cascade removal, cancellation, error) produces one human-readable message.
// Delivery is fire-and-forget: a failed or unconfigured sink never affects
// the engine's control flow.
// =============================================================================

use serde::Serialize;
use tracing::{debug, info, warn};

/// Telegram Bot API sendMessage payload.
#[derive(Serialize)]
struct TelegramMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

/// Best-effort notification sink. Unconfigured credentials disable delivery;
/// messages are still logged.
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    endpoint: Option<Endpoint>,
}

#[derive(Clone)]
struct Endpoint {
    url: String,
    chat_id: String,
}

impl Notifier {
    /// Build from optional credentials. Both must be present for delivery to
    /// be enabled.
    pub fn new(bot_token: Option<String>, chat_id: Option<String>) -> Self {
        let endpoint = match (bot_token, chat_id) {
            (Some(token), Some(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
                info!("telegram notifications enabled");
                Some(Endpoint {
                    url: format!("https://api.telegram.org/bot{token}/sendMessage"),
                    chat_id,
                })
            }
            _ => {
                warn!("telegram notifications disabled (no credentials)");
                None
            }
        };

        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    /// Sink with delivery disabled. Used by tests and dry runs.
    pub fn disabled() -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: None,
        }
    }

    /// Send one text message. Failures are swallowed and logged; the caller
    /// never sees them.
    pub async fn send(&self, text: &str) {
        info!(message = text, "notification");

        let Some(endpoint) = &self.endpoint else {
            return;
        };

        let payload = TelegramMessage {
            chat_id: &endpoint.chat_id,
            text,
        };

        match self.client.post(&endpoint.url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("notification delivered");
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "telegram rejected notification");
            }
            Err(e) => {
                warn!(error = %e, "failed to deliver notification");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
