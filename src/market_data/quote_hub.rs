// =============================================================================
// Quote Hub — the single consumer of the broker's streaming quote feed
// =============================================================================
//
// Every live quote flows through here exactly once:
//   1. forwarded to the price listener (unrealized-PnL updater), debounced to
//      at most one update per symbol per 200 ms;
//   2. handed to the bar aggregator.
//
// The hub also owns the set of subscribed symbols so the stream task can
// resubscribe everything after a reconnect.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::types::Quote;

use super::aggregator::BarAggregator;

/// Minimum interval between PnL forwards for one symbol.
const PNL_FORWARD_INTERVAL: Duration = Duration::from_millis(200);

/// Receives debounced price updates (implemented by the account tracker).
pub trait PriceListener: Send + Sync {
    fn on_price(&self, symbol: &str, price: f64);
}

pub struct QuoteHub {
    aggregator: Arc<BarAggregator>,
    listeners: RwLock<Vec<Arc<dyn PriceListener>>>,
    subscribed: RwLock<HashSet<String>>,
    last_forward: RwLock<HashMap<String, Instant>>,
    last_price: RwLock<HashMap<String, f64>>,
}

impl QuoteHub {
    pub fn new(aggregator: Arc<BarAggregator>) -> Self {
        Self {
            aggregator,
            listeners: RwLock::new(Vec::new()),
            subscribed: RwLock::new(HashSet::new()),
            last_forward: RwLock::new(HashMap::new()),
            last_price: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn PriceListener>) {
        self.listeners.write().push(listener);
    }

    /// Record a symbol as subscribed. Returns false when it already was.
    pub fn subscribe(&self, symbol: &str) -> bool {
        self.subscribed.write().insert(symbol.to_string())
    }

    pub fn unsubscribe(&self, symbol: &str) -> bool {
        self.subscribed.write().remove(symbol)
    }

    /// Snapshot of subscribed symbols, used to resubscribe after reconnect.
    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.subscribed.read().iter().cloned().collect()
    }

    /// Most recent price seen for a symbol.
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.last_price.read().get(symbol).copied()
    }

    /// Process one streamed quote.
    pub fn on_quote(&self, quote: &Quote) {
        self.last_price
            .write()
            .insert(quote.symbol.clone(), quote.price);

        // Debounced PnL forward: at most one per symbol per interval.
        let forward = {
            let mut map = self.last_forward.write();
            let now = Instant::now();
            match map.get(&quote.symbol) {
                Some(prev) if now.duration_since(*prev) < PNL_FORWARD_INTERVAL => false,
                _ => {
                    map.insert(quote.symbol.clone(), now);
                    true
                }
            }
        };

        if forward {
            let listeners = self.listeners.read();
            for l in listeners.iter() {
                l.on_price(&quote.symbol, quote.price);
            }
        } else {
            debug!(symbol = %quote.symbol, "pnl forward debounced");
        }

        self.aggregator.on_quote(quote);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::BarBuffer;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingListener {
        calls: AtomicU32,
    }

    impl PriceListener for CountingListener {
        fn on_price(&self, _symbol: &str, _price: f64) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn hub() -> (QuoteHub, Arc<CountingListener>) {
        let agg = Arc::new(BarAggregator::new(Arc::new(BarBuffer::new(10))));
        let hub = QuoteHub::new(agg);
        let listener = Arc::new(CountingListener {
            calls: AtomicU32::new(0),
        });
        hub.add_listener(listener.clone());
        (hub, listener)
    }

    fn quote(symbol: &str, price: f64) -> Quote {
        Quote {
            symbol: symbol.to_string(),
            price,
            volume: 1.0,
            timestamp: Utc.timestamp_opt(0, 0).unwrap(),
        }
    }

    #[test]
    fn pnl_forward_is_debounced_per_symbol() {
        let (hub, listener) = hub();

        // Burst of quotes for the same symbol: only the first forwards.
        for i in 0..10 {
            hub.on_quote(&quote("MNQ", 21_000.0 + i as f64));
        }
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);

        // A different symbol forwards independently.
        hub.on_quote(&quote("MES", 5_000.0));
        assert_eq!(listener.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn last_price_tracks_every_quote() {
        let (hub, _) = hub();
        hub.on_quote(&quote("MNQ", 21_000.0));
        hub.on_quote(&quote("MNQ", 21_001.5));
        assert_eq!(hub.last_price("MNQ"), Some(21_001.5));
        assert_eq!(hub.last_price("MES"), None);
    }

    #[test]
    fn subscription_set_round_trip() {
        let (hub, _) = hub();
        assert!(hub.subscribe("MNQ"));
        assert!(!hub.subscribe("MNQ")); // already present
        assert!(hub.subscribe("MES"));

        let mut symbols = hub.subscribed_symbols();
        symbols.sort();
        assert_eq!(symbols, vec!["MES", "MNQ"]);

        assert!(hub.unsubscribe("MES"));
        assert!(!hub.unsubscribe("MES"));
        assert_eq!(hub.subscribed_symbols(), vec!["MNQ"]);
    }
}
