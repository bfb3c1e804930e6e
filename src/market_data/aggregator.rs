// =============================================================================
// Bar Aggregator — builds OHLCV bars from the streaming quote feed
// =============================================================================
//
// One in-progress bar per (symbol, timeframe). A quote whose timestamp lands
// on an interval boundary opens the NEW bar. Close events per key are emitted
// in strictly monotonic open-time order; quotes arriving for an already
// closed interval are dropped and logged as anomalies rather than mutating
// history.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::Quote;

use super::{Bar, BarBuffer, BarKey, Timeframe};

/// A bar-close notification delivered to global sinks (e.g. the cache flush).
#[derive(Debug, Clone)]
pub struct BarCloseEvent {
    pub key: BarKey,
    pub bar: Bar,
}

/// The bar currently being built for one key.
#[derive(Debug, Clone)]
struct WorkingBar {
    open_time: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl WorkingBar {
    fn start(open_time: DateTime<Utc>, quote: &Quote) -> Self {
        Self {
            open_time,
            open: quote.price,
            high: quote.price,
            low: quote.price,
            close: quote.price,
            volume: quote.volume,
        }
    }

    fn update(&mut self, quote: &Quote) {
        self.close = quote.price;
        if quote.price > self.high {
            self.high = quote.price;
        }
        if quote.price < self.low {
            self.low = quote.price;
        }
        self.volume += quote.volume;
    }

    fn finish(&self) -> Bar {
        Bar {
            open_time: self.open_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

/// Aggregates quotes into bars for every subscribed (symbol, timeframe) and
/// fans out close events.
pub struct BarAggregator {
    in_progress: RwLock<HashMap<BarKey, WorkingBar>>,
    /// Timeframes tracked per symbol. First quote for an unknown symbol
    /// auto-subscribes the standard set.
    subscribed: RwLock<HashMap<String, Vec<Timeframe>>>,
    /// Per-key bar-close subscribers (strategies, chart feed).
    subscribers: RwLock<HashMap<BarKey, Vec<mpsc::UnboundedSender<Bar>>>>,
    /// Global sinks receiving every close event (cache flush).
    sinks: RwLock<Vec<mpsc::UnboundedSender<BarCloseEvent>>>,
    /// Open time of the last closed bar per key; enforces monotonic emission.
    last_closed: RwLock<HashMap<BarKey, DateTime<Utc>>>,
    /// Recent closed bars kept in memory.
    pub buffer: Arc<BarBuffer>,
    late_quotes: AtomicU64,
}

impl BarAggregator {
    pub fn new(buffer: Arc<BarBuffer>) -> Self {
        Self {
            in_progress: RwLock::new(HashMap::new()),
            subscribed: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            sinks: RwLock::new(Vec::new()),
            last_closed: RwLock::new(HashMap::new()),
            buffer,
            late_quotes: AtomicU64::new(0),
        }
    }

    /// Ensure `symbol` is tracked at the given timeframes.
    pub fn track(&self, symbol: &str, timeframes: &[Timeframe]) {
        let mut map = self.subscribed.write();
        let entry = map.entry(symbol.to_string()).or_default();
        for tf in timeframes {
            if !entry.contains(tf) {
                entry.push(*tf);
            }
        }
        entry.sort();
    }

    /// Register a bar-close subscriber for one key.
    pub fn subscribe(&self, key: BarKey) -> mpsc::UnboundedReceiver<Bar> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().entry(key).or_default().push(tx);
        rx
    }

    /// Register a global sink receiving every close event.
    pub fn subscribe_all(&self) -> mpsc::UnboundedReceiver<BarCloseEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sinks.write().push(tx);
        rx
    }

    /// Number of quotes dropped for arriving after their bar closed.
    pub fn late_quote_count(&self) -> u64 {
        self.late_quotes.load(Ordering::Relaxed)
    }

    /// Feed one quote through every tracked timeframe for its symbol.
    pub fn on_quote(&self, quote: &Quote) {
        // Auto-subscribe the standard timeframes on first sight of a symbol.
        let timeframes = {
            let map = self.subscribed.read();
            map.get(&quote.symbol).cloned()
        };
        let timeframes = match timeframes {
            Some(tfs) => tfs,
            None => {
                self.track(&quote.symbol, &Timeframe::STANDARD);
                debug!(symbol = %quote.symbol, "auto-subscribed standard timeframes");
                Timeframe::STANDARD.to_vec()
            }
        };

        for tf in timeframes {
            self.apply(quote, tf);
        }
    }

    fn apply(&self, quote: &Quote, tf: Timeframe) {
        let key = BarKey::new(quote.symbol.clone(), tf);
        let bucket = tf.floor(quote.timestamp);

        let closed = {
            let mut map = self.in_progress.write();
            match map.get_mut(&key) {
                None => {
                    map.insert(key.clone(), WorkingBar::start(bucket, quote));
                    None
                }
                Some(working) if bucket == working.open_time => {
                    working.update(quote);
                    None
                }
                Some(working) if bucket > working.open_time => {
                    // Interval rolled over: close the old bar, start the new
                    // one from this quote (a boundary quote belongs to the
                    // new bar).
                    let finished = working.finish();
                    *working = WorkingBar::start(bucket, quote);
                    Some(finished)
                }
                Some(working) => {
                    self.late_quotes.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        key = %key,
                        quote_ts = %quote.timestamp,
                        bar_open = %working.open_time,
                        "late quote dropped (bar already rolled)"
                    );
                    None
                }
            }
        };

        if let Some(bar) = closed {
            self.emit(&key, bar);
        }
    }

    /// Force-close any in-progress bar for `key` (used at shutdown so the
    /// final partial bar is not lost).
    pub fn flush(&self, key: &BarKey) {
        let closed = self.in_progress.write().remove(key).map(|w| w.finish());
        if let Some(bar) = closed {
            self.emit(key, bar);
        }
    }

    fn emit(&self, key: &BarKey, bar: Bar) {
        // Strict monotonic open-time order per key.
        {
            let mut last = self.last_closed.write();
            if let Some(prev) = last.get(key) {
                if bar.open_time <= *prev {
                    warn!(key = %key, open_time = %bar.open_time, "non-monotonic bar close suppressed");
                    return;
                }
            }
            last.insert(key.clone(), bar.open_time);
        }

        debug!(key = %key, open_time = %bar.open_time, close = bar.close, "bar closed");
        self.buffer.push(key.clone(), bar.clone());

        // Per-key subscribers; prune dead receivers as we go.
        {
            let mut subs = self.subscribers.write();
            if let Some(list) = subs.get_mut(key) {
                list.retain(|tx| tx.send(bar.clone()).is_ok());
            }
        }

        // Global sinks.
        {
            let mut sinks = self.sinks.write();
            sinks.retain(|tx| {
                tx.send(BarCloseEvent {
                    key: key.clone(),
                    bar: bar.clone(),
                })
                .is_ok()
            });
        }
    }
}
