// =============================================================================
// Market data primitives — bars, timeframes, and the live bar ring buffer
// =============================================================================

pub mod aggregator;
pub mod quote_hub;

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Timeframe
// ---------------------------------------------------------------------------

/// A bar interval, stored as whole seconds. Parsed from compact labels such
/// as "1m", "5m", "15m", "1h", "1d".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timeframe(u64);

impl Timeframe {
    pub const M1: Timeframe = Timeframe(60);
    pub const M5: Timeframe = Timeframe(300);
    pub const M15: Timeframe = Timeframe(900);
    pub const H1: Timeframe = Timeframe(3_600);
    pub const D1: Timeframe = Timeframe(86_400);

    /// The standard set auto-subscribed on first quote for a symbol.
    pub const STANDARD: [Timeframe; 4] = [Self::M1, Self::M5, Self::M15, Self::H1];

    pub fn from_secs(secs: u64) -> Option<Self> {
        if secs == 0 {
            None
        } else {
            Some(Self(secs))
        }
    }

    pub fn secs(self) -> u64 {
        self.0
    }

    /// Parse "30s" / "5m" / "1h" / "1d" labels.
    pub fn parse(label: &str) -> Option<Self> {
        let label = label.trim();
        if label.len() < 2 {
            return None;
        }
        let (num, unit) = label.split_at(label.len() - 1);
        let n: u64 = num.parse().ok()?;
        let secs = match unit {
            "s" => n,
            "m" => n * 60,
            "h" => n * 3_600,
            "d" => n * 86_400,
            _ => return None,
        };
        Self::from_secs(secs)
    }

    pub fn label(self) -> String {
        match self.0 {
            s if s % 86_400 == 0 => format!("{}d", s / 86_400),
            s if s % 3_600 == 0 => format!("{}h", s / 3_600),
            s if s % 60 == 0 => format!("{}m", s / 60),
            s => format!("{s}s"),
        }
    }

    /// Start of the interval containing `ts`. A timestamp exactly on the
    /// boundary belongs to the bar that starts there.
    pub fn floor(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let interval = self.0 as i64;
        let floored = secs.div_euclid(interval) * interval;
        Utc.timestamp_opt(floored, 0).single().unwrap_or(ts)
    }

    pub fn duration(self) -> Duration {
        Duration::seconds(self.0 as i64)
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl Serialize for Timeframe {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

impl<'de> Deserialize<'de> for Timeframe {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Timeframe::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timeframe '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Bar
// ---------------------------------------------------------------------------

/// One closed OHLCV bar. `open_time` is the interval start in UTC and, with
/// (symbol, timeframe), forms the primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Composite key identifying a bar series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct BarKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl BarKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl std::fmt::Display for BarKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

// ---------------------------------------------------------------------------
// BarBuffer — thread-safe ring buffer of closed bars per (symbol, timeframe)
// ---------------------------------------------------------------------------

/// Retains the most recent closed bars per key. The aggregator pushes a bar
/// here at close time so strategies and the dashboard can read recent history
/// without a broker call.
pub struct BarBuffer {
    buffers: RwLock<HashMap<BarKey, VecDeque<Bar>>>,
    max_bars: usize,
}

impl BarBuffer {
    pub fn new(max_bars: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_bars,
        }
    }

    /// Append a closed bar and trim the ring to `max_bars`. Bars arriving
    /// with an `open_time` not after the last retained bar are ignored;
    /// close events are strictly ordered upstream.
    pub fn push(&self, key: BarKey, bar: Bar) {
        let mut map = self.buffers.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.max_bars + 1));

        if let Some(last) = ring.back() {
            if bar.open_time <= last.open_time {
                return;
            }
        }
        ring.push_back(bar);
        while ring.len() > self.max_bars {
            ring.pop_front();
        }
    }

    /// Return the most recent `count` bars (oldest-first order).
    pub fn recent(&self, key: &BarKey, count: usize) -> Vec<Bar> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Close price of the most recent bar, if any.
    pub fn last_close(&self, key: &BarKey) -> Option<f64> {
        let map = self.buffers.read();
        map.get(key).and_then(|ring| ring.back().map(|b| b.close))
    }

    pub fn count(&self, key: &BarKey) -> usize {
        let map = self.buffers.read();
        map.get(key).map_or(0, VecDeque::len)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(open_secs: i64, close: f64) -> Bar {
        Bar {
            open_time: Utc.timestamp_opt(open_secs, 0).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
        }
    }

    #[test]
    fn timeframe_parse_and_label() {
        assert_eq!(Timeframe::parse("1m"), Some(Timeframe::M1));
        assert_eq!(Timeframe::parse("5m"), Some(Timeframe::M5));
        assert_eq!(Timeframe::parse("15m"), Some(Timeframe::M15));
        assert_eq!(Timeframe::parse("1h"), Some(Timeframe::H1));
        assert_eq!(Timeframe::parse("1d"), Some(Timeframe::D1));
        assert_eq!(Timeframe::parse("bogus"), None);
        assert_eq!(Timeframe::parse("0m"), None);

        assert_eq!(Timeframe::M5.label(), "5m");
        assert_eq!(Timeframe::H1.label(), "1h");
        assert_eq!(Timeframe::D1.label(), "1d");
    }

    #[test]
    fn timeframe_floor_boundary_belongs_to_new_bar() {
        let tf = Timeframe::M1;
        let boundary = Utc.timestamp_opt(120, 0).unwrap();
        assert_eq!(tf.floor(boundary), boundary);

        let inside = Utc.timestamp_opt(179, 0).unwrap();
        assert_eq!(tf.floor(inside), Utc.timestamp_opt(120, 0).unwrap());
    }

    #[test]
    fn ring_buffer_trimming() {
        let buf = BarBuffer::new(3);
        let key = BarKey::new("MNQ", Timeframe::M1);

        for i in 0..5 {
            buf.push(key.clone(), bar(i * 60, 100.0 + i as f64));
        }

        assert_eq!(buf.count(&key), 3);
        let bars = buf.recent(&key, 10);
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![102.0, 103.0, 104.0]);
    }

    #[test]
    fn out_of_order_push_is_ignored() {
        let buf = BarBuffer::new(10);
        let key = BarKey::new("MNQ", Timeframe::M1);

        buf.push(key.clone(), bar(120, 101.0));
        buf.push(key.clone(), bar(60, 100.0)); // older — dropped
        buf.push(key.clone(), bar(120, 999.0)); // duplicate open_time — dropped

        assert_eq!(buf.count(&key), 1);
        assert_eq!(buf.last_close(&key), Some(101.0));
    }

    #[test]
    fn timeframe_serde_round_trip() {
        let key = BarKey::new("MNQ", Timeframe::M15);
        let json = serde_json::to_string(&key).unwrap();
        assert!(json.contains("\"15m\""));
        let back: BarKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
