// =============================================================================
// Quote stream — persistent hub connection feeding the Quote Hub
// =============================================================================
//
// Connects to the broker's streaming hub, subscribes the hub's symbol set,
// and forwards parsed quotes. On drop the caller reconnects with exponential
// backoff; subscriptions are replayed on every (re)connect because the
// subscribe frame is sent inside `run_once`.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::market_data::quote_hub::QuoteHub;
use crate::types::Quote;

/// Ceiling for the reconnect backoff.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
/// Initial reconnect delay.
const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Run the quote stream forever, reconnecting with exponential backoff on
/// every drop. Never returns under normal operation.
pub async fn run_quote_stream(url: String, hub: Arc<QuoteHub>) {
    let mut delay = BASE_RECONNECT_DELAY;

    loop {
        match run_once(&url, &hub).await {
            Ok(()) => {
                warn!("quote stream ended cleanly — reconnecting");
                delay = BASE_RECONNECT_DELAY;
            }
            Err(e) => {
                error!(error = %e, delay_s = delay.as_secs(), "quote stream error — reconnecting");
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
    }
}

/// One connection lifetime: connect, subscribe every symbol the hub tracks,
/// and pump messages until the stream drops.
async fn run_once(url: &str, hub: &Arc<QuoteHub>) -> Result<()> {
    info!(url, "connecting to quote hub");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to quote hub")?;

    let (mut write, mut read) = ws_stream.split();

    // Resubscribe everything the hub knows about.
    let symbols = hub.subscribed_symbols();
    if !symbols.is_empty() {
        let frame = json!({ "action": "subscribe", "symbols": symbols });
        write
            .send(Message::Text(frame.to_string()))
            .await
            .context("failed to send subscribe frame")?;
        info!(count = frame["symbols"].as_array().map_or(0, Vec::len), "symbols subscribed");
    }

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match parse_quote_message(&text) {
                Ok(Some(quote)) => {
                    hub.on_quote(&quote);
                }
                Ok(None) => {
                    debug!("non-quote hub message ignored");
                }
                Err(e) => {
                    warn!(error = %e, "failed to parse hub message");
                }
            },
            Some(Ok(_)) => {
                // Ping/Pong/Binary frames; tungstenite answers pings itself.
            }
            Some(Err(e)) => {
                error!(error = %e, "quote stream read error");
                return Err(e.into());
            }
            None => {
                warn!("quote stream closed by remote");
                return Ok(());
            }
        }
    }
}

/// Parse a hub frame. Returns `Ok(None)` for non-quote event types.
///
/// Expected quote shape:
/// ```json
/// { "type": "quote", "symbol": "MNQ", "price": 21425.25,
///   "volume": 3, "timestamp": "2026-02-10T14:30:00Z" }
/// ```
fn parse_quote_message(text: &str) -> Result<Option<Quote>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("hub frame is not valid JSON")?;

    if root["type"].as_str() != Some("quote") {
        return Ok(None);
    }

    let symbol = root["symbol"]
        .as_str()
        .context("quote missing symbol")?
        .to_string();
    let price = root["price"].as_f64().context("quote missing price")?;
    let volume = root["volume"].as_f64().unwrap_or(0.0);

    let timestamp: DateTime<Utc> = root["timestamp"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(Some(Quote {
        symbol,
        price,
        volume,
        timestamp,
    }))
}
