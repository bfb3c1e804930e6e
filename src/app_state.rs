// =============================================================================
// Central Application State — Vega Trading Engine
// =============================================================================
//
// Ties the subsystem handles together for the operational API. Subsystems
// own their internal state; AppState only aggregates snapshots for /health
// and /metrics and keeps the small operational ring buffers.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::account::{AccountState, AccountTracker};
use crate::cache::{BarCache, CacheStats};
use crate::config::EngineConfig;
use crate::market_data::aggregator::BarAggregator;
use crate::market_data::quote_hub::QuoteHub;
use crate::orders::engine::OrderEngine;
use crate::orders::{BracketIntent, TrackedPosition};
use crate::queue::{QueueStats, TaskQueue};
use crate::signals::SignalIntake;
use crate::store::Store;
use crate::strategy::StrategyRegistry;
use crate::types::Account;

/// Maximum recent errors retained for the dashboard.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded operational error.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub at: String,
}

pub struct AppState {
    pub config: Arc<RwLock<EngineConfig>>,
    pub tracker: Arc<AccountTracker>,
    pub engine: Arc<OrderEngine>,
    pub registry: Arc<StrategyRegistry>,
    pub queue: Arc<TaskQueue>,
    pub cache: Arc<BarCache>,
    pub aggregator: Arc<BarAggregator>,
    pub hub: Arc<QuoteHub>,
    pub store: Arc<Store>,
    pub intake: Arc<SignalIntake>,

    pub broker_authenticated: RwLock<bool>,
    pub selected_account: RwLock<Option<Account>>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub state_version: AtomicU64,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn push_error(&self, message: String) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: "ok",
            authenticated: *self.broker_authenticated.read(),
            account: self.selected_account.read().clone(),
            trading_mode: self.config.read().trading_mode.to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            store_available: self.store.is_available(),
            queue: self.queue.stats(),
            state_version: self.state_version.load(Ordering::SeqCst),
            server_time: Utc::now().timestamp_millis(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache: self.cache.stats(),
            queue: self.queue.stats(),
            account: self.tracker.state(),
            late_quotes: self.aggregator.late_quote_count(),
            positions: self.engine.book.all(),
            intents: self.engine.intents_snapshot(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

/// Payload of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub authenticated: bool,
    pub account: Option<Account>,
    pub trading_mode: String,
    pub uptime_seconds: u64,
    pub store_available: bool,
    pub queue: QueueStats,
    pub state_version: u64,
    pub server_time: i64,
}

/// Payload of `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub cache: CacheStats,
    pub queue: QueueStats,
    pub account: AccountState,
    pub late_quotes: u64,
    pub positions: Vec<TrackedPosition>,
    pub intents: Vec<BracketIntent>,
    pub recent_errors: Vec<ErrorRecord>,
}
