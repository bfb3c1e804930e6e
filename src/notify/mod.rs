// =============================================================================
// Notifier — best-effort outbound webhook
// =============================================================================
//
// Fire-and-forget: every send runs on its own task and a failure is logged
// and forgotten. Nothing here may ever block trading.
// =============================================================================

use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

/// Events relayed to the operator's webhook.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum NotifyEvent {
    BracketPlaced {
        symbol: String,
        side: String,
        size: u32,
        entry: f64,
        stop_loss: f64,
        take_profit: f64,
    },
    EntryFilled {
        symbol: String,
        side: String,
        size: u32,
        price: f64,
    },
    ExitFilled {
        symbol: String,
        reason: String,
        size: u32,
        price: f64,
        realized_pnl: f64,
    },
    BreakevenAdjusted {
        symbol: String,
        new_stop: f64,
    },
    RiskLimitApproaching {
        limit: String,
        remaining: f64,
    },
    MllBreached {
        balance: f64,
        floor: f64,
    },
    EodSummary {
        balance: f64,
        realized_today: f64,
        highest_eod_balance: f64,
    },
    IntentRejected {
        symbol: String,
        reason: String,
    },
}

pub struct Notifier {
    client: reqwest::Client,
    url: Option<String>,
}

impl Notifier {
    /// An empty URL disables the notifier entirely.
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: if url.is_empty() {
                None
            } else {
                Some(url.to_string())
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Send an event without waiting for the outcome.
    pub fn notify(&self, event: NotifyEvent) {
        let Some(url) = self.url.clone() else {
            debug!(?event, "notifier disabled — event dropped");
            return;
        };

        let client = self.client.clone();
        tokio::spawn(async move {
            let payload = json!({
                "source": "vega-bot",
                "at": chrono::Utc::now().to_rfc3339(),
                "payload": event,
            });
            match client.post(&url).json(&payload).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    warn!(status = %resp.status(), "notifier webhook returned non-success");
                }
                Err(e) => {
                    warn!(error = %e, "notifier webhook failed");
                }
            }
        });
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_url_disables() {
        assert!(!Notifier::new("").is_enabled());
        assert!(Notifier::new("https://hooks.example/x").is_enabled());
    }

    #[test]
    fn events_serialize_with_kebab_tags() {
        let json = serde_json::to_string(&NotifyEvent::MllBreached {
            balance: 147_700.0,
            floor: 147_750.75,
        })
        .unwrap();
        assert!(json.contains("\"mll-breached\""));

        let json = serde_json::to_string(&NotifyEvent::RiskLimitApproaching {
            limit: "dll".into(),
            remaining: 150.0,
        })
        .unwrap();
        assert!(json.contains("\"risk-limit-approaching\""));
        assert!(json.contains("150.0"));
    }

    #[tokio::test]
    async fn disabled_notifier_drops_silently() {
        let n = Notifier::new("");
        // Must not panic or spawn anything that errors loudly.
        n.notify(NotifyEvent::EntryFilled {
            symbol: "MNQ".into(),
            side: "Buy".into(),
            size: 2,
            price: 21_425.25,
        });
    }
}
