// =============================================================================
// Persistence Store — pool-backed Postgres with typed operations
// =============================================================================
//
// The store never exposes raw query strings to the rest of the engine. On
// connect failure every operation reports `persistence-unavailable` and the
// callers degrade to in-memory state; a background task retries the
// connection. Durable writes (EOD snapshots, strategy state on arming) are
// re-enqueued by their owners until the store accepts them.
// =============================================================================

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::market_data::{Bar, BarKey};

/// Connection-pool bounds.
const MIN_CONNECTIONS: u32 = 2;
const MAX_CONNECTIONS: u32 = 10;

/// Retention windows for `purge_expired`.
const BAR_RETENTION_DAYS: i64 = 30;
const METRIC_RETENTION_DAYS: i64 = 7;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    account_type    TEXT NOT NULL,
    starting_balance DOUBLE PRECISION NOT NULL
);

CREATE TABLE IF NOT EXISTS account_snapshots (
    account_id      TEXT NOT NULL,
    ts              TIMESTAMPTZ NOT NULL,
    balance         DOUBLE PRECISION NOT NULL,
    realized_pnl    DOUBLE PRECISION NOT NULL,
    unrealized_pnl  DOUBLE PRECISION NOT NULL,
    commissions     DOUBLE PRECISION NOT NULL,
    fees            DOUBLE PRECISION NOT NULL,
    highest_eod_balance DOUBLE PRECISION NOT NULL,
    is_eod          BOOLEAN NOT NULL,
    PRIMARY KEY (account_id, ts)
);
CREATE INDEX IF NOT EXISTS idx_snapshots_account_ts
    ON account_snapshots (account_id, ts);

CREATE TABLE IF NOT EXISTS historical_bars (
    symbol      TEXT NOT NULL,
    timeframe   TEXT NOT NULL,
    open_time   TIMESTAMPTZ NOT NULL,
    open        DOUBLE PRECISION NOT NULL,
    high        DOUBLE PRECISION NOT NULL,
    low         DOUBLE PRECISION NOT NULL,
    close       DOUBLE PRECISION NOT NULL,
    volume      DOUBLE PRECISION NOT NULL,
    PRIMARY KEY (symbol, timeframe, open_time)
);
CREATE INDEX IF NOT EXISTS idx_bars_key
    ON historical_bars (symbol, timeframe, open_time);

CREATE TABLE IF NOT EXISTS cache_metadata (
    symbol      TEXT NOT NULL,
    timeframe   TEXT NOT NULL,
    fetched_at  TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (symbol, timeframe)
);

CREATE TABLE IF NOT EXISTS strategy_states (
    account_id      TEXT NOT NULL,
    strategy_name   TEXT NOT NULL,
    state           JSONB NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (account_id, strategy_name)
);

CREATE TABLE IF NOT EXISTS trade_history (
    id              BIGSERIAL PRIMARY KEY,
    account_id      TEXT NOT NULL,
    symbol          TEXT NOT NULL,
    side            TEXT NOT NULL,
    size            INTEGER NOT NULL,
    entry_price     DOUBLE PRECISION NOT NULL,
    exit_price      DOUBLE PRECISION NOT NULL,
    realized_pnl    DOUBLE PRECISION NOT NULL,
    closed_at       TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS api_metrics (
    id          BIGSERIAL PRIMARY KEY,
    endpoint    TEXT NOT NULL,
    latency_ms  BIGINT NOT NULL,
    outcome     TEXT NOT NULL,
    at          TIMESTAMPTZ NOT NULL
);
"#;

/// One row of the account PnL time series.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub timestamp: DateTime<Utc>,
    pub balance: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub commissions: f64,
    pub fees: f64,
    pub highest_end_of_day_balance: f64,
    pub is_eod: bool,
}

/// A completed round trip for the trade journal.
#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub account_id: String,
    pub symbol: String,
    pub side: String,
    pub size: u32,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub closed_at: DateTime<Utc>,
}

/// Pool-backed store. The pool slot is `None` while the database is
/// unreachable; operations then fail fast with `StoreUnavailable`.
pub struct Store {
    url: String,
    pool: RwLock<Option<PgPool>>,
}

impl Store {
    /// Connect to `url` and initialise the schema. On failure a disconnected
    /// store is returned so the engine can run memory-only while the
    /// background reconnect task retries.
    pub async fn connect(url: &str) -> Self {
        let store = Self {
            url: url.to_string(),
            pool: RwLock::new(None),
        };
        if url.is_empty() {
            info!("no database url configured — store disabled, memory-only mode");
            return store;
        }
        if let Err(e) = store.try_reconnect().await {
            warn!(error = %e, "database unavailable at startup — degrading to memory-only");
        }
        store
    }

    /// A store that is permanently disconnected (tests, memory-only mode).
    pub fn disconnected() -> Self {
        Self {
            url: String::new(),
            pool: RwLock::new(None),
        }
    }

    pub fn is_available(&self) -> bool {
        self.pool.read().is_some()
    }

    /// Attempt to (re)connect and initialise the schema.
    pub async fn try_reconnect(&self) -> EngineResult<()> {
        if self.url.is_empty() {
            return Err(EngineError::StoreUnavailable("no database url".into()));
        }
        if self.is_available() {
            return Ok(());
        }

        let pool = PgPoolOptions::new()
            .min_connections(MIN_CONNECTIONS)
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&self.url)
            .await
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| EngineError::StoreUnavailable(format!("schema init: {e}")))?;

        *self.pool.write() = Some(pool);
        info!(min = MIN_CONNECTIONS, max = MAX_CONNECTIONS, "database connected, schema ready");
        Ok(())
    }

    /// Grab a pool handle or fail fast. The handle is cloned out of the lock
    /// so no lock is held across an await point.
    fn handle(&self) -> EngineResult<PgPool> {
        self.pool
            .read()
            .clone()
            .ok_or_else(|| EngineError::StoreUnavailable("database not connected".into()))
    }

    /// Drop the pool after a persistent failure so `is_available` reflects
    /// reality and the reconnect task takes over.
    fn mark_unavailable(&self, context: &str, err: &sqlx::Error) {
        warn!(context, error = %err, "database operation failed — marking store unavailable");
        *self.pool.write() = None;
    }

    // -------------------------------------------------------------------------
    // Bars
    // -------------------------------------------------------------------------

    pub async fn upsert_bars(&self, key: &BarKey, bars: &[Bar]) -> EngineResult<()> {
        let pool = self.handle()?;
        let tf = key.timeframe.label();

        for bar in bars {
            let result = sqlx::query(
                "INSERT INTO historical_bars \
                 (symbol, timeframe, open_time, open, high, low, close, volume) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (symbol, timeframe, open_time) DO UPDATE SET \
                 open = EXCLUDED.open, high = EXCLUDED.high, low = EXCLUDED.low, \
                 close = EXCLUDED.close, volume = EXCLUDED.volume",
            )
            .bind(&key.symbol)
            .bind(&tf)
            .bind(bar.open_time)
            .bind(bar.open)
            .bind(bar.high)
            .bind(bar.low)
            .bind(bar.close)
            .bind(bar.volume)
            .execute(&pool)
            .await;

            if let Err(e) = result {
                self.mark_unavailable("upsert_bars", &e);
                return Err(EngineError::StoreUnavailable(e.to_string()));
            }
        }

        // Refresh cache metadata so coverage queries know how fresh L2 is.
        let result = sqlx::query(
            "INSERT INTO cache_metadata (symbol, timeframe, fetched_at) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (symbol, timeframe) DO UPDATE SET fetched_at = EXCLUDED.fetched_at",
        )
        .bind(&key.symbol)
        .bind(&tf)
        .bind(Utc::now())
        .execute(&pool)
        .await;

        if let Err(e) = result {
            self.mark_unavailable("cache_metadata", &e);
            return Err(EngineError::StoreUnavailable(e.to_string()));
        }

        debug!(key = %key, count = bars.len(), "bars upserted");
        Ok(())
    }

    pub async fn bars_in_range(
        &self,
        key: &BarKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<Vec<Bar>> {
        let pool = self.handle()?;

        let rows = sqlx::query(
            "SELECT open_time, open, high, low, close, volume FROM historical_bars \
             WHERE symbol = $1 AND timeframe = $2 AND open_time >= $3 AND open_time <= $4 \
             ORDER BY open_time",
        )
        .bind(&key.symbol)
        .bind(key.timeframe.label())
        .bind(start)
        .bind(end)
        .fetch_all(&pool)
        .await
        .map_err(|e| {
            self.mark_unavailable("bars_in_range", &e);
            EngineError::StoreUnavailable(e.to_string())
        })?;

        Ok(rows
            .into_iter()
            .map(|row| Bar {
                open_time: row.get("open_time"),
                open: row.get("open"),
                high: row.get("high"),
                low: row.get("low"),
                close: row.get("close"),
                volume: row.get("volume"),
            })
            .collect())
    }

    /// When the (symbol, timeframe) series was last written.
    pub async fn cache_fetched_at(&self, key: &BarKey) -> EngineResult<Option<DateTime<Utc>>> {
        let pool = self.handle()?;

        let row = sqlx::query(
            "SELECT fetched_at FROM cache_metadata WHERE symbol = $1 AND timeframe = $2",
        )
        .bind(&key.symbol)
        .bind(key.timeframe.label())
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            self.mark_unavailable("cache_fetched_at", &e);
            EngineError::StoreUnavailable(e.to_string())
        })?;

        Ok(row.map(|r| r.get("fetched_at")))
    }

    // -------------------------------------------------------------------------
    // Strategy state
    // -------------------------------------------------------------------------

    pub async fn upsert_strategy_state(
        &self,
        account_id: &str,
        strategy_name: &str,
        state: &Value,
    ) -> EngineResult<()> {
        let pool = self.handle()?;

        sqlx::query(
            "INSERT INTO strategy_states (account_id, strategy_name, state, updated_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (account_id, strategy_name) DO UPDATE SET \
             state = EXCLUDED.state, updated_at = EXCLUDED.updated_at",
        )
        .bind(account_id)
        .bind(strategy_name)
        .bind(state.clone())
        .bind(Utc::now())
        .execute(&pool)
        .await
        .map_err(|e| {
            self.mark_unavailable("upsert_strategy_state", &e);
            EngineError::StoreUnavailable(e.to_string())
        })?;

        debug!(account_id, strategy_name, "strategy state persisted");
        Ok(())
    }

    pub async fn fetch_strategy_state(
        &self,
        account_id: &str,
        strategy_name: &str,
    ) -> EngineResult<Option<Value>> {
        let pool = self.handle()?;

        let row = sqlx::query(
            "SELECT state FROM strategy_states WHERE account_id = $1 AND strategy_name = $2",
        )
        .bind(account_id)
        .bind(strategy_name)
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            self.mark_unavailable("fetch_strategy_state", &e);
            EngineError::StoreUnavailable(e.to_string())
        })?;

        Ok(row.map(|r| r.get("state")))
    }

    // -------------------------------------------------------------------------
    // Account snapshots
    // -------------------------------------------------------------------------

    pub async fn append_snapshot(&self, snap: &AccountSnapshot) -> EngineResult<()> {
        let pool = self.handle()?;

        sqlx::query(
            "INSERT INTO account_snapshots \
             (account_id, ts, balance, realized_pnl, unrealized_pnl, commissions, fees, \
              highest_eod_balance, is_eod) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (account_id, ts) DO NOTHING",
        )
        .bind(&snap.account_id)
        .bind(snap.timestamp)
        .bind(snap.balance)
        .bind(snap.realized_pnl)
        .bind(snap.unrealized_pnl)
        .bind(snap.commissions)
        .bind(snap.fees)
        .bind(snap.highest_end_of_day_balance)
        .bind(snap.is_eod)
        .execute(&pool)
        .await
        .map_err(|e| {
            self.mark_unavailable("append_snapshot", &e);
            EngineError::StoreUnavailable(e.to_string())
        })?;

        debug!(account_id = %snap.account_id, is_eod = snap.is_eod, "account snapshot appended");
        Ok(())
    }

    /// Most recent end-of-day snapshot for an account, used to restore the
    /// trailing highest-EOD balance at startup.
    pub async fn latest_eod_snapshot(
        &self,
        account_id: &str,
    ) -> EngineResult<Option<AccountSnapshot>> {
        let pool = self.handle()?;

        let row = sqlx::query(
            "SELECT * FROM account_snapshots \
             WHERE account_id = $1 AND is_eod = TRUE \
             ORDER BY ts DESC LIMIT 1",
        )
        .bind(account_id)
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            self.mark_unavailable("latest_eod_snapshot", &e);
            EngineError::StoreUnavailable(e.to_string())
        })?;

        Ok(row.map(|r| AccountSnapshot {
            account_id: r.get("account_id"),
            timestamp: r.get("ts"),
            balance: r.get("balance"),
            realized_pnl: r.get("realized_pnl"),
            unrealized_pnl: r.get("unrealized_pnl"),
            commissions: r.get("commissions"),
            fees: r.get("fees"),
            highest_end_of_day_balance: r.get("highest_eod_balance"),
            is_eod: r.get("is_eod"),
        }))
    }

    // -------------------------------------------------------------------------
    // Trade history & metrics
    // -------------------------------------------------------------------------

    pub async fn append_trade(&self, trade: &TradeRecord) -> EngineResult<()> {
        let pool = self.handle()?;

        sqlx::query(
            "INSERT INTO trade_history \
             (account_id, symbol, side, size, entry_price, exit_price, realized_pnl, closed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&trade.account_id)
        .bind(&trade.symbol)
        .bind(&trade.side)
        .bind(trade.size as i32)
        .bind(trade.entry_price)
        .bind(trade.exit_price)
        .bind(trade.realized_pnl)
        .bind(trade.closed_at)
        .execute(&pool)
        .await
        .map_err(|e| {
            self.mark_unavailable("append_trade", &e);
            EngineError::StoreUnavailable(e.to_string())
        })?;

        Ok(())
    }

    pub async fn append_api_metric(
        &self,
        endpoint: &str,
        latency_ms: u64,
        outcome: &str,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let pool = self.handle()?;

        sqlx::query(
            "INSERT INTO api_metrics (endpoint, latency_ms, outcome, at) VALUES ($1, $2, $3, $4)",
        )
        .bind(endpoint)
        .bind(latency_ms as i64)
        .bind(outcome)
        .bind(at)
        .execute(&pool)
        .await
        .map_err(|e| {
            self.mark_unavailable("append_api_metric", &e);
            EngineError::StoreUnavailable(e.to_string())
        })?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Retention
    // -------------------------------------------------------------------------

    /// Delete bars older than 30 days and metrics older than 7 days.
    pub async fn purge_expired(&self) -> EngineResult<(u64, u64)> {
        let pool = self.handle()?;

        let bar_cutoff = Utc::now() - chrono::Duration::days(BAR_RETENTION_DAYS);
        let metric_cutoff = Utc::now() - chrono::Duration::days(METRIC_RETENTION_DAYS);

        let bars = sqlx::query("DELETE FROM historical_bars WHERE open_time < $1")
            .bind(bar_cutoff)
            .execute(&pool)
            .await
            .map_err(|e| {
                self.mark_unavailable("purge_bars", &e);
                EngineError::StoreUnavailable(e.to_string())
            })?
            .rows_affected();

        let metrics = sqlx::query("DELETE FROM api_metrics WHERE at < $1")
            .bind(metric_cutoff)
            .execute(&pool)
            .await
            .map_err(|e| {
                self.mark_unavailable("purge_metrics", &e);
                EngineError::StoreUnavailable(e.to_string())
            })?
            .rows_affected();

        if bars > 0 || metrics > 0 {
            info!(bars, metrics, "expired rows purged");
        }
        Ok((bars, metrics))
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("available", &self.is_available())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Timeframe;
    use chrono::TimeZone;

    fn key() -> BarKey {
        BarKey::new("MNQ", Timeframe::M5)
    }

    fn bar() -> Bar {
        Bar {
            open_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
        }
    }

    #[tokio::test]
    async fn disconnected_store_degrades_not_panics() {
        let store = Store::disconnected();
        assert!(!store.is_available());

        let err = store.upsert_bars(&key(), &[bar()]).await.unwrap_err();
        assert_eq!(err.kind(), "persistence-unavailable");

        let err = store
            .bars_in_range(&key(), Utc::now() - chrono::Duration::hours(1), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "persistence-unavailable");

        let err = store
            .fetch_strategy_state("acct", "overnight-range")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "persistence-unavailable");

        let err = store.purge_expired().await.unwrap_err();
        assert_eq!(err.kind(), "persistence-unavailable");
    }

    #[tokio::test]
    async fn reconnect_without_url_is_unavailable() {
        let store = Store::disconnected();
        let err = store.try_reconnect().await.unwrap_err();
        assert_eq!(err.kind(), "persistence-unavailable");
    }
}
