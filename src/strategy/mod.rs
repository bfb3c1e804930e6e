// =============================================================================
// Strategy layer — capability trait, registry, and verify reports
// =============================================================================
//
// Strategies are driven by the scheduler through a narrow capability set and
// talk back to the engine only via the IntentSink seam, so neither side owns
// the other. Per-strategy durable state round-trips through the store as a
// JSON blob keyed by (account, strategy-name).
// =============================================================================

pub mod overnight_range;
pub mod scheduler;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::market_data::{Bar, BarKey};

/// Response shape of `GET /api/strategies/{name}/verify`.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub will_trade: bool,
    pub reasons: Vec<String>,
    pub next_execution: Option<DateTime<Utc>>,
    pub hours_until_execution: Option<f64>,
}

/// The capability set the scheduler drives.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);

    /// Compact phase summary for the dashboard.
    fn phase_summary(&self) -> serde_json::Value;

    /// Durable state as persisted to the store.
    fn state_json(&self) -> serde_json::Value;

    /// Rehydrate from persisted state at startup.
    fn restore_state(&self, state: &serde_json::Value);

    /// Would this strategy trade, and when does it act next?
    fn verify(&self, now: DateTime<Utc>) -> VerifyReport;

    /// Scheduler heartbeat; drives time-based phase transitions.
    async fn tick(&self, now: DateTime<Utc>) -> anyhow::Result<()>;

    /// Bar-close event for a subscribed (symbol, timeframe).
    fn on_bar_close(&self, key: &BarKey, bar: &Bar);

    /// Stop and re-start, clearing accumulated in-memory state.
    async fn restart(&self) -> anyhow::Result<()>;
}

/// Arena of strategies keyed by name.
pub struct StrategyRegistry {
    map: RwLock<HashMap<String, Arc<dyn Strategy>>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, strategy: Arc<dyn Strategy>) {
        self.map
            .write()
            .insert(strategy.name().to_string(), strategy);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Strategy>> {
        self.map.read().get(name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<dyn Strategy>> {
        self.map.read().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.map.read().keys().cloned().collect()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("strategies", &self.names())
            .finish()
    }
}
