// =============================================================================
// Engine Configuration — JSON file + environment overrides with atomic save
// =============================================================================
//
// Every tunable parameter lives here. Persistence uses an atomic tmp + rename
// pattern to prevent corruption on crash. All fields carry `#[serde(default)]`
// so that adding new fields never breaks loading an older config file.
//
// Environment variables with the `VEGA_` prefix override the file values at
// startup (see `apply_env_overrides`).
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{AccountType, TradingMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["MNQ".to_string()]
}

fn default_position_size() -> u32 {
    2
}

fn default_max_position_size() -> u32 {
    4
}

fn default_tp1_fraction() -> f64 {
    0.75
}

fn default_true() -> bool {
    true
}

fn default_debounce_seconds() -> u64 {
    300
}

fn default_auto_stop_ticks() -> u32 {
    10
}

fn default_auto_target_ticks() -> u32 {
    20
}

fn default_overnight_start() -> String {
    "18:00".to_string()
}

fn default_overnight_end() -> String {
    "09:30".to_string()
}

fn default_market_open() -> String {
    "09:30".to_string()
}

fn default_timezone() -> String {
    "US/Eastern".to_string()
}

fn default_atr_period() -> usize {
    14
}

fn default_atr_timeframe() -> String {
    "5m".to_string()
}

fn default_stop_atr_multiplier() -> f64 {
    1.25
}

fn default_target_atr_multiplier() -> f64 {
    2.0
}

fn default_range_break_offset() -> f64 {
    0.25
}

fn default_breakeven_profit_points() -> f64 {
    15.0
}

fn default_eod_exit_time() -> String {
    "15:45".to_string()
}

fn default_session_close_utc() -> String {
    "21:00".to_string()
}

fn default_cache_ttl_market_hours() -> u64 {
    120
}

fn default_cache_ttl_off_hours() -> u64 {
    900
}

fn default_cache_ttl_default() -> u64 {
    300
}

fn default_prefetch_timeframes() -> Vec<String> {
    vec!["1m".to_string(), "5m".to_string()]
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism().map_or(4, |n| n.get())
}

fn default_max_pending_tasks() -> usize {
    1000
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_broker_base_url() -> String {
    "https://api.topstepx.com".to_string()
}

fn default_quote_hub_url() -> String {
    "wss://rtc.topstepx.com/hubs/market".to_string()
}

// =============================================================================
// Section structs
// =============================================================================

/// Account selection and sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Broker account identifier to trade. Empty means "pick the first
    /// account the broker lists".
    #[serde(default)]
    pub account_id: String,

    #[serde(default)]
    pub account_type: AccountType,

    /// Starting balance used for PnL and limit percentages.
    #[serde(default)]
    pub starting_balance: f64,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            account_type: AccountType::Practice,
            starting_balance: 50_000.0,
        }
    }
}

/// Order placement policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPolicyConfig {
    /// Contracts per entry.
    #[serde(default = "default_position_size")]
    pub position_size: u32,

    /// Hard cap on net position size per symbol.
    #[serde(default = "default_max_position_size")]
    pub max_position_size: u32,

    /// When true, the full position closes at TP1 (no staged exit).
    #[serde(default)]
    pub close_entire_at_tp1: bool,

    /// Fraction of the position that exits at TP1 when staging.
    #[serde(default = "default_tp1_fraction")]
    pub tp1_fraction: f64,

    /// Drop external signals that are not entries.
    #[serde(default = "default_true")]
    pub ignore_non_entry_signals: bool,

    /// Drop external tp1-hit signals specifically (exits are broker-managed
    /// when staged brackets are active).
    #[serde(default = "default_true")]
    pub ignore_tp1_signals: bool,

    /// Debounce window for duplicate (symbol, action) intents.
    #[serde(default = "default_debounce_seconds")]
    pub debounce_seconds: u64,

    /// Enforce that every open position carries a stop and target.
    #[serde(default = "default_true")]
    pub protect_positions: bool,

    /// Default stop distance in ticks for auto-bracketed positions.
    #[serde(default = "default_auto_stop_ticks")]
    pub auto_bracket_stop_ticks: u32,

    /// Default target distance in ticks for auto-bracketed positions.
    #[serde(default = "default_auto_target_ticks")]
    pub auto_bracket_target_ticks: u32,
}

impl Default for OrderPolicyConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

/// Overnight-range breakout strategy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OvernightRangeConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Tracking window start, HH:MM in `timezone`.
    #[serde(default = "default_overnight_start")]
    pub overnight_start_time: String,

    /// Tracking window end, HH:MM in `timezone`.
    #[serde(default = "default_overnight_end")]
    pub overnight_end_time: String,

    /// Market open (arming time), HH:MM in `timezone`.
    #[serde(default = "default_market_open")]
    pub market_open_time: String,

    /// IANA timezone name for all session times.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_atr_period")]
    pub atr_period: usize,

    /// Timeframe used for the current-price ATR (e.g. "5m").
    #[serde(default = "default_atr_timeframe")]
    pub atr_timeframe: String,

    #[serde(default = "default_stop_atr_multiplier")]
    pub stop_atr_multiplier: f64,

    #[serde(default = "default_target_atr_multiplier")]
    pub target_atr_multiplier: f64,

    /// Distance beyond the range extreme for the stop entry.
    #[serde(default = "default_range_break_offset")]
    pub range_break_offset: f64,

    #[serde(default)]
    pub breakeven_enabled: bool,

    /// Unrealized profit (points) at which the stop moves to entry.
    #[serde(default = "default_breakeven_profit_points")]
    pub breakeven_profit_points: f64,

    /// Force-flatten time, HH:MM in `timezone`.
    #[serde(default = "default_eod_exit_time")]
    pub eod_exit_time: String,

    // --- Market-condition gates (all optional, all default off) --------------
    #[serde(default)]
    pub min_range_points: Option<f64>,

    #[serde(default)]
    pub max_range_points: Option<f64>,

    /// Skip the day when |open gap| exceeds this many points.
    #[serde(default)]
    pub max_gap_points: Option<f64>,

    #[serde(default)]
    pub min_atr: Option<f64>,

    #[serde(default)]
    pub max_atr: Option<f64>,

    /// Skip arming when today's loss already exceeds this fraction of the DLL.
    #[serde(default)]
    pub dll_proximity_fraction: Option<f64>,
}

impl Default for OvernightRangeConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

/// Risk limits. Zero means "derive from account type".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default)]
    pub daily_loss_limit: f64,

    #[serde(default)]
    pub maximum_loss_limit: f64,
}

impl RiskConfig {
    /// Resolve the effective (DLL, MLL), falling back to the account-type
    /// defaults for any limit left at zero.
    pub fn resolve(&self, account_type: AccountType) -> (f64, f64) {
        let (dll_default, mll_default) = account_type.default_limits();
        let dll = if self.daily_loss_limit > 0.0 {
            self.daily_loss_limit
        } else {
            dll_default
        };
        let mll = if self.maximum_loss_limit > 0.0 {
            self.maximum_loss_limit
        } else {
            mll_default
        };
        (dll, mll)
    }
}

/// Historical-bar cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL (seconds) while inside the market-hours window.
    #[serde(default = "default_cache_ttl_market_hours")]
    pub cache_ttl_market_hours: u64,

    /// TTL (seconds) outside market hours.
    #[serde(default = "default_cache_ttl_off_hours")]
    pub cache_ttl_off_hours: u64,

    /// Fallback TTL (seconds) when the window cannot be evaluated.
    #[serde(default = "default_cache_ttl_default")]
    pub cache_ttl_default: u64,

    /// Market-hours window start hour, UTC. The window may cross midnight.
    #[serde(default = "default_market_hours_start")]
    pub market_hours_start_utc: u32,

    /// Market-hours window end hour, UTC.
    #[serde(default = "default_market_hours_end")]
    pub market_hours_end_utc: u32,

    #[serde(default = "default_true")]
    pub prefetch_enabled: bool,

    #[serde(default = "default_symbols")]
    pub prefetch_symbols: Vec<String>,

    #[serde(default = "default_prefetch_timeframes")]
    pub prefetch_timeframes: Vec<String>,
}

fn default_market_hours_start() -> u32 {
    13
}

fn default_market_hours_end() -> u32 {
    3
}

impl Default for CacheConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Vega engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Current trading mode: Active, Paused, or Halted.
    #[serde(default)]
    pub trading_mode: TradingMode,

    #[serde(default)]
    pub account: AccountConfig,

    #[serde(default)]
    pub order_policy: OrderPolicyConfig,

    #[serde(default)]
    pub overnight_range: OvernightRangeConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    // --- Runtime -------------------------------------------------------------
    /// Worker count for the priority task queue.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Maximum queued tasks before backpressure shedding kicks in.
    #[serde(default = "default_max_pending_tasks")]
    pub max_pending_tasks: usize,

    /// Postgres URL. Empty disables the persistent store (memory-only).
    #[serde(default)]
    pub database_url: String,

    /// Session close (EOD rollover) time, HH:MM UTC.
    #[serde(default = "default_session_close_utc")]
    pub session_close_utc: String,

    /// HTTP bind address for the operational API.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Broker REST base URL.
    #[serde(default = "default_broker_base_url")]
    pub broker_base_url: String,

    /// Broker streaming hub URL.
    #[serde(default = "default_quote_hub_url")]
    pub quote_hub_url: String,

    /// Outbound notifier webhook URL. Empty disables the notifier.
    #[serde(default)]
    pub notifier_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.overnight_range.symbols,
            trading_mode = %config.trading_mode,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Override selected fields from `VEGA_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("VEGA_DATABASE_URL") {
            self.database_url = url;
        }
        if let Ok(url) = std::env::var("VEGA_BROKER_BASE_URL") {
            self.broker_base_url = url;
        }
        if let Ok(url) = std::env::var("VEGA_QUOTE_HUB_URL") {
            self.quote_hub_url = url;
        }
        if let Ok(url) = std::env::var("VEGA_NOTIFIER_URL") {
            self.notifier_url = url;
        }
        if let Ok(addr) = std::env::var("VEGA_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(id) = std::env::var("VEGA_ACCOUNT_ID") {
            self.account.account_id = id;
        }
        if let Ok(syms) = std::env::var("VEGA_SYMBOLS") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.overnight_range.symbols = parsed;
            }
        }
        if let Ok(n) = std::env::var("VEGA_WORKER_COUNT") {
            match n.parse::<usize>() {
                Ok(v) if v > 0 => self.worker_count = v,
                _ => warn!(value = %n, "ignoring invalid VEGA_WORKER_COUNT"),
            }
        }
    }

    /// Parse an "HH:MM" time-of-day string into (hour, minute).
    pub fn parse_hhmm(s: &str) -> Result<(u32, u32)> {
        let (h, m) = s
            .split_once(':')
            .with_context(|| format!("expected HH:MM, got '{s}'"))?;
        let hour: u32 = h.parse().with_context(|| format!("bad hour in '{s}'"))?;
        let minute: u32 = m.parse().with_context(|| format!("bad minute in '{s}'"))?;
        anyhow::ensure!(hour < 24 && minute < 60, "time out of range: '{s}'");
        Ok((hour, minute))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.order_policy.position_size, 2);
        assert_eq!(cfg.order_policy.max_position_size, 4);
        assert!((cfg.order_policy.tp1_fraction - 0.75).abs() < f64::EPSILON);
        assert_eq!(cfg.order_policy.debounce_seconds, 300);
        assert!(cfg.order_policy.protect_positions);
        assert_eq!(cfg.overnight_range.symbols, vec!["MNQ"]);
        assert_eq!(cfg.overnight_range.timezone, "US/Eastern");
        assert_eq!(cfg.overnight_range.atr_period, 14);
        assert!((cfg.overnight_range.stop_atr_multiplier - 1.25).abs() < f64::EPSILON);
        assert!((cfg.overnight_range.target_atr_multiplier - 2.0).abs() < f64::EPSILON);
        assert!((cfg.overnight_range.range_break_offset - 0.25).abs() < f64::EPSILON);
        assert_eq!(cfg.cache.cache_ttl_market_hours, 120);
        assert_eq!(cfg.cache.cache_ttl_off_hours, 900);
        assert_eq!(cfg.cache.cache_ttl_default, 300);
        assert_eq!(cfg.max_pending_tasks, 1000);
        assert!(cfg.overnight_range.min_range_points.is_none());
        assert!(cfg.overnight_range.dll_proximity_fraction.is_none());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.overnight_range.market_open_time, "09:30");
        assert_eq!(cfg.overnight_range.eod_exit_time, "15:45");
        assert_eq!(cfg.session_close_utc, "21:00");
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "trading_mode": "Active",
            "overnight_range": { "enabled": true, "symbols": ["MES"] }
        }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Active);
        assert!(cfg.overnight_range.enabled);
        assert_eq!(cfg.overnight_range.symbols, vec!["MES"]);
        assert_eq!(cfg.overnight_range.atr_period, 14);
        assert_eq!(cfg.order_policy.position_size, 2);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.overnight_range.symbols, cfg2.overnight_range.symbols);
        assert_eq!(cfg.order_policy.debounce_seconds, cfg2.order_policy.debounce_seconds);
        assert_eq!(cfg.trading_mode, cfg2.trading_mode);
    }

    #[test]
    fn risk_limits_derive_from_account_type() {
        let risk = RiskConfig::default();
        let (dll, mll) = risk.resolve(AccountType::Evaluation150k);
        assert_eq!((dll, mll), AccountType::Evaluation150k.default_limits());

        let explicit = RiskConfig {
            daily_loss_limit: 1_000.0,
            maximum_loss_limit: 4_500.0,
        };
        assert_eq!(explicit.resolve(AccountType::Evaluation150k), (1_000.0, 4_500.0));
    }

    #[test]
    fn parse_hhmm_accepts_valid_and_rejects_garbage() {
        assert_eq!(EngineConfig::parse_hhmm("09:30").unwrap(), (9, 30));
        assert_eq!(EngineConfig::parse_hhmm("15:45").unwrap(), (15, 45));
        assert!(EngineConfig::parse_hhmm("2530").is_err());
        assert!(EngineConfig::parse_hhmm("25:00").is_err());
        assert!(EngineConfig::parse_hhmm("09:75").is_err());
    }
}
