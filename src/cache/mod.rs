// =============================================================================
// Bar Cache — two tiers (process memory + store) over the broker
// =============================================================================
//
// Lookups check L1, then the persistent store, then fall through to the
// broker. Freshness is volatility-aware: short TTLs inside the market-hours
// window, long TTLs overnight. Requests for a handful of sub-15-minute bars
// bypass the cache entirely so real-time decision paths never act on stale
// data.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::client::BrokerClient;
use crate::config::CacheConfig;
use crate::error::EngineResult;
use crate::market_data::{Bar, BarKey, Timeframe};
use crate::store::Store;

/// Requests at or below this many bars of sub-15-minute data skip the cache.
const BYPASS_MAX_BARS: usize = 5;
/// Timeframes strictly below this many seconds are bypass-eligible.
const BYPASS_TIMEFRAME_SECS: u64 = 900;

struct CachedSeries {
    bars: Vec<Bar>,
    fetched_at: DateTime<Utc>,
}

/// Cache hit/miss counters for `/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub bypasses: u64,
    pub hit_rate: f64,
}

pub struct BarCache {
    l1: RwLock<HashMap<BarKey, CachedSeries>>,
    store: Arc<Store>,
    broker: Arc<BrokerClient>,
    config: CacheConfig,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    bypasses: AtomicU64,
}

impl BarCache {
    pub fn new(store: Arc<Store>, broker: Arc<BrokerClient>, config: CacheConfig) -> Self {
        Self {
            l1: RwLock::new(HashMap::new()),
            store,
            broker,
            config,
            l1_hits: AtomicU64::new(0),
            l2_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            bypasses: AtomicU64::new(0),
        }
    }

    /// Fetch the most recent `count` bars for (symbol, timeframe), newest
    /// ending at "now".
    pub async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> EngineResult<Vec<Bar>> {
        let key = BarKey::new(symbol, timeframe);

        // Short-horizon bypass: real-time decision paths go straight to the
        // broker.
        if count <= BYPASS_MAX_BARS && timeframe.secs() < BYPASS_TIMEFRAME_SECS {
            self.bypasses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, count, "short-horizon bypass");
            return self.fetch_from_broker(&key, count).await;
        }

        let ttl = self.ttl_seconds(Utc::now());

        // L1.
        {
            let l1 = self.l1.read();
            if let Some(series) = l1.get(&key) {
                let age = (Utc::now() - series.fetched_at).num_seconds();
                if age >= 0
                    && (age as u64) < ttl
                    && series.bars.len() >= count
                    && is_contiguous(&series.bars, timeframe)
                {
                    self.l1_hits.fetch_add(1, Ordering::Relaxed);
                    let start = series.bars.len() - count;
                    return Ok(series.bars[start..].to_vec());
                }
            }
        }

        // L2: accept only when the stored run is fresh, long enough, and
        // contiguous.
        if let Ok(Some(fetched_at)) = self.store.cache_fetched_at(&key).await {
            let age = (Utc::now() - fetched_at).num_seconds();
            if age >= 0 && (age as u64) < ttl {
                let span = timeframe.duration() * (count as i32 + 2);
                let start = Utc::now() - span;
                if let Ok(bars) = self.store.bars_in_range(&key, start, Utc::now()).await {
                    if bars.len() >= count && is_contiguous(&bars, timeframe) {
                        self.l2_hits.fetch_add(1, Ordering::Relaxed);
                        let slice = bars[bars.len() - count..].to_vec();
                        self.l1.write().insert(
                            key.clone(),
                            CachedSeries {
                                bars,
                                fetched_at,
                            },
                        );
                        debug!(key = %key, count, "L2 hit promoted to L1");
                        return Ok(slice);
                    }
                }
            }
        }

        // Fall through to the broker.
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.fetch_from_broker(&key, count).await
    }

    async fn fetch_from_broker(&self, key: &BarKey, count: usize) -> EngineResult<Vec<Bar>> {
        let contract = self.broker.resolve_contract(&key.symbol).await?;

        // Over-fetch slightly so session gaps still yield enough bars.
        let span = key.timeframe.duration() * (count as i32 * 2).max(4);
        let end = Utc::now();
        let bars = self
            .broker
            .get_historical_bars(&contract.contract_id, key.timeframe, end - span, end)
            .await?;

        // Write-through, best-effort: a down store never blocks the caller.
        if let Err(e) = self.store.upsert_bars(key, &bars).await {
            debug!(key = %key, error = %e, "bar write-through skipped");
        }

        self.l1.write().insert(
            key.clone(),
            CachedSeries {
                bars: bars.clone(),
                fetched_at: Utc::now(),
            },
        );

        let start = bars.len().saturating_sub(count);
        Ok(bars[start..].to_vec())
    }

    /// Append a freshly closed live bar to L1 and write it through to the
    /// store. Called from the aggregator's close-event sink.
    pub async fn on_bar_close(&self, key: &BarKey, bar: Bar) {
        {
            let mut l1 = self.l1.write();
            let series = l1.entry(key.clone()).or_insert_with(|| CachedSeries {
                bars: Vec::new(),
                fetched_at: Utc::now(),
            });
            if series
                .bars
                .last()
                .map_or(true, |last| bar.open_time > last.open_time)
            {
                series.bars.push(bar.clone());
                series.fetched_at = Utc::now();
            }
        }

        if let Err(e) = self.store.upsert_bars(key, std::slice::from_ref(&bar)).await {
            debug!(key = %key, error = %e, "live bar write-through skipped");
        }
    }

    /// Warm the cache for the configured (symbol, timeframe) list. Invoked
    /// every five minutes at background priority.
    pub async fn prefetch_pass(&self) {
        if !self.config.prefetch_enabled {
            return;
        }
        for symbol in self.config.prefetch_symbols.clone() {
            for label in self.config.prefetch_timeframes.clone() {
                let Some(tf) = Timeframe::parse(&label) else {
                    warn!(timeframe = %label, "skipping unparsable prefetch timeframe");
                    continue;
                };
                if let Err(e) = self.get_bars(&symbol, tf, 100).await {
                    debug!(symbol = %symbol, timeframe = %tf, error = %e, "prefetch fetch failed");
                }
                // Yield between fetches so foreground tasks are never starved.
                tokio::task::yield_now().await;
            }
        }
        info!("prefetch pass complete");
    }

    /// Effective TTL in seconds for lookups happening at `now`.
    fn ttl_seconds(&self, now: DateTime<Utc>) -> u64 {
        let start = self.config.market_hours_start_utc;
        let end = self.config.market_hours_end_utc;
        if start == end {
            return self.config.cache_ttl_default;
        }
        if in_market_hours(now.hour(), start, end) {
            self.config.cache_ttl_market_hours
        } else {
            self.config.cache_ttl_off_hours
        }
    }

    pub fn stats(&self) -> CacheStats {
        let l1 = self.l1_hits.load(Ordering::Relaxed);
        let l2 = self.l2_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = l1 + l2 + misses;
        CacheStats {
            l1_hits: l1,
            l2_hits: l2,
            misses,
            bypasses: self.bypasses.load(Ordering::Relaxed),
            hit_rate: if total > 0 {
                (l1 + l2) as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    #[cfg(test)]
    fn seed_l1(&self, key: BarKey, bars: Vec<Bar>, fetched_at: DateTime<Utc>) {
        self.l1
            .write()
            .insert(key, CachedSeries { bars, fetched_at });
    }
}

/// True when `hour` falls inside a window that may cross midnight
/// (e.g. 13:00 → 03:00 UTC).
fn in_market_hours(hour: u32, start: u32, end: u32) -> bool {
    if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// An unbroken run of bars spaced exactly one interval apart.
fn is_contiguous(bars: &[Bar], timeframe: Timeframe) -> bool {
    bars.windows(2).all(|w| {
        (w[1].open_time - w[0].open_time).num_seconds() == timeframe.secs() as i64
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::client::Credentials;
    use chrono::{Duration, TimeZone};

    fn bars(count: usize, tf: Timeframe, end: DateTime<Utc>) -> Vec<Bar> {
        (0..count)
            .map(|i| Bar {
                open_time: end - tf.duration() * ((count - i) as i32),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                volume: 10.0,
            })
            .collect()
    }

    fn cache() -> BarCache {
        let broker = Arc::new(BrokerClient::new(
            "https://broker.test",
            Credentials {
                username: "u".into(),
                api_key: "k".into(),
            },
        ));
        BarCache::new(Arc::new(Store::disconnected()), broker, CacheConfig::default())
    }

    #[test]
    fn market_hours_window_crosses_midnight() {
        // Default window 13:00 → 03:00 UTC.
        assert!(in_market_hours(13, 13, 3));
        assert!(in_market_hours(20, 13, 3));
        assert!(in_market_hours(0, 13, 3));
        assert!(in_market_hours(2, 13, 3));
        assert!(!in_market_hours(3, 13, 3));
        assert!(!in_market_hours(9, 13, 3));
        assert!(!in_market_hours(12, 13, 3));

        // Non-crossing window behaves conventionally.
        assert!(in_market_hours(10, 9, 17));
        assert!(!in_market_hours(17, 9, 17));
    }

    #[test]
    fn ttl_selection() {
        let c = cache();
        // 14:00 UTC is inside the default market window.
        let market = Utc.with_ymd_and_hms(2026, 2, 10, 14, 0, 0).unwrap();
        assert_eq!(c.ttl_seconds(market), 120);
        // 08:00 UTC is outside.
        let off = Utc.with_ymd_and_hms(2026, 2, 10, 8, 0, 0).unwrap();
        assert_eq!(c.ttl_seconds(off), 900);
    }

    #[test]
    fn contiguity_detection() {
        let end = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let run = bars(10, Timeframe::M5, end);
        assert!(is_contiguous(&run, Timeframe::M5));

        let mut gapped = run.clone();
        gapped.remove(4);
        assert!(!is_contiguous(&gapped, Timeframe::M5));

        // Single bar and empty run are trivially contiguous.
        assert!(is_contiguous(&run[..1], Timeframe::M5));
        assert!(is_contiguous(&[], Timeframe::M5));
    }

    #[tokio::test]
    async fn l1_hit_serves_fresh_series() {
        let c = cache();
        let key = BarKey::new("MNQ", Timeframe::M5);
        let series = bars(50, Timeframe::M5, Utc::now());
        c.seed_l1(key.clone(), series.clone(), Utc::now());

        let got = c.get_bars("MNQ", Timeframe::M5, 20).await.unwrap();
        assert_eq!(got.len(), 20);
        assert_eq!(got.last(), series.last());
        assert_eq!(c.stats().l1_hits, 1);
        assert_eq!(c.stats().misses, 0);
    }

    #[tokio::test]
    async fn stale_l1_falls_through() {
        let c = cache();
        let key = BarKey::new("MNQ", Timeframe::M5);
        // Fetched two hours ago: stale under every TTL.
        c.seed_l1(
            key,
            bars(50, Timeframe::M5, Utc::now()),
            Utc::now() - Duration::hours(2),
        );

        // Store is disconnected and the broker URL is fake, so the fall
        // through fails — the point is that L1 did NOT serve.
        let result = c.get_bars("MNQ", Timeframe::M5, 20).await;
        assert!(result.is_err());
        assert_eq!(c.stats().l1_hits, 0);
        assert_eq!(c.stats().misses, 1);
    }

    #[tokio::test]
    async fn short_horizon_bypass_skips_cache() {
        let c = cache();
        let key = BarKey::new("MNQ", Timeframe::M1);
        c.seed_l1(key, bars(50, Timeframe::M1, Utc::now()), Utc::now());

        // 5 bars of 1m data bypasses even a fresh L1.
        let _ = c.get_bars("MNQ", Timeframe::M1, 5).await;
        assert_eq!(c.stats().bypasses, 1);
        assert_eq!(c.stats().l1_hits, 0);

        // 6 bars does not bypass.
        let got = c.get_bars("MNQ", Timeframe::M1, 6).await.unwrap();
        assert_eq!(got.len(), 6);
        assert_eq!(c.stats().l1_hits, 1);

        // 5 bars of 15m data does not bypass either.
        let key15 = BarKey::new("MNQ", Timeframe::M15);
        c.seed_l1(key15, bars(50, Timeframe::M15, Utc::now()), Utc::now());
        let got = c.get_bars("MNQ", Timeframe::M15, 5).await.unwrap();
        assert_eq!(got.len(), 5);
        assert_eq!(c.stats().bypasses, 1);
    }

    #[tokio::test]
    async fn live_bar_appends_in_open_time_order() {
        let c = cache();
        let key = BarKey::new("MNQ", Timeframe::M1);
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let mk = |secs: i64, close: f64| Bar {
            open_time: t0 + Duration::seconds(secs),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        };

        c.on_bar_close(&key, mk(0, 1.0)).await;
        c.on_bar_close(&key, mk(60, 2.0)).await;
        c.on_bar_close(&key, mk(60, 3.0)).await; // duplicate open_time ignored
        c.on_bar_close(&key, mk(0, 4.0)).await; // regression ignored

        let l1 = c.l1.read();
        let series = l1.get(&key).unwrap();
        assert_eq!(series.bars.len(), 2);
        assert_eq!(series.bars[1].close, 2.0);
    }
}
