// =============================================================================
// Overnight-Range Breakout — one state machine per (account, symbol)
// =============================================================================
//
// Phases (times in the configured exchange timezone):
//   Tracking (18:00 → 09:30)  collect overnight high/low from 1-minute closes
//   Arming   (09:30)          ATR-derived stop/target zones, both stop-entry
//                             brackets submitted, armed ids persisted
//   Managing (day)            reconciler/engine own the orders; breakeven
//                             active when enabled
//   EOD      (15:45)          flatten the position, cancel surviving armed
//                             orders, back to Idle
//
// Market-condition gates (range size, gap, ATR bounds, DLL proximity) are
// all off by default; a failing gate skips straight to Idle for the day
// with a recorded reason. Every phase transition persists state so a
// restart rehydrates armed order ids and resumes.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::account::AccountTracker;
use crate::broker::client::builtin_contract_meta;
use crate::cache::BarCache;
use crate::config::{EngineConfig, OvernightRangeConfig};
use crate::indicators::atr::calculate_atr;
use crate::market_data::{Bar, BarKey, Timeframe};
use crate::orders::engine::IntentSink;
use crate::orders::BracketIntent;
use crate::queue::{Priority, TaskQueue, TaskSpec};
use crate::store::Store;
use crate::types::{round_to_tick, OrderType, Side};

use super::{Strategy, VerifyReport};

pub const STRATEGY_NAME: &str = "overnight-range";

// ---------------------------------------------------------------------------
// Durable per-symbol state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Tracking,
    Armed,
}

impl Default for Phase {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Tracking => write!(f, "Tracking"),
            Self::Armed => write!(f, "Armed"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolState {
    pub phase: Phase,
    pub overnight_high: Option<f64>,
    pub overnight_low: Option<f64>,
    pub current_atr: Option<f64>,
    pub daily_atr: Option<f64>,
    pub armed_long_order: Option<String>,
    pub armed_short_order: Option<String>,
    pub armed_long_intent: Option<String>,
    pub armed_short_intent: Option<String>,
    pub skip_reason: Option<String>,
    /// The trading day this machine is working (the day of market open).
    pub session_date: Option<NaiveDate>,
    pub armed_date: Option<NaiveDate>,
}

// ---------------------------------------------------------------------------
// Pure arming math
// ---------------------------------------------------------------------------

/// Both sides of the breakout bracket, tick-aligned.
#[derive(Debug, Clone, PartialEq)]
pub struct ArmPlan {
    pub long_entry: f64,
    pub long_stop: f64,
    pub long_target: f64,
    pub short_entry: f64,
    pub short_stop: f64,
    pub short_target: f64,
}

/// Long entry = high + offset, SL = entry − stop-mult × current-ATR,
/// TP = entry + target-mult × daily-ATR. Short mirrors. All prices are
/// rounded to the contract tick.
#[allow(clippy::too_many_arguments)]
pub fn compute_arm_plan(
    overnight_high: f64,
    overnight_low: f64,
    offset: f64,
    stop_multiplier: f64,
    current_atr: f64,
    target_multiplier: f64,
    daily_atr: f64,
    tick: f64,
) -> ArmPlan {
    let long_entry = round_to_tick(overnight_high + offset, tick);
    let short_entry = round_to_tick(overnight_low - offset, tick);
    let stop_distance = stop_multiplier * current_atr;
    let target_distance = target_multiplier * daily_atr;

    ArmPlan {
        long_entry,
        long_stop: round_to_tick(long_entry - stop_distance, tick),
        long_target: round_to_tick(long_entry + target_distance, tick),
        short_entry,
        short_stop: round_to_tick(short_entry + stop_distance, tick),
        short_target: round_to_tick(short_entry - target_distance, tick),
    }
}

/// Inputs to the optional market-condition gates.
#[derive(Debug, Clone)]
pub struct GateInputs {
    pub range_points: f64,
    pub gap_points: Option<f64>,
    pub current_atr: f64,
    pub dll_utilization: f64,
}

/// All gates default off; `Err` carries the recorded skip reason.
pub fn evaluate_gates(cfg: &OvernightRangeConfig, inputs: &GateInputs) -> Result<(), String> {
    if let Some(min) = cfg.min_range_points {
        if inputs.range_points < min {
            return Err(format!("range {:.2} below minimum {min:.2}", inputs.range_points));
        }
    }
    if let Some(max) = cfg.max_range_points {
        if inputs.range_points > max {
            return Err(format!("range {:.2} above maximum {max:.2}", inputs.range_points));
        }
    }
    if let (Some(max_gap), Some(gap)) = (cfg.max_gap_points, inputs.gap_points) {
        if gap.abs() > max_gap {
            return Err(format!("gap {:.2} exceeds limit {max_gap:.2}", gap.abs()));
        }
    }
    if let Some(min) = cfg.min_atr {
        if inputs.current_atr < min {
            return Err(format!("ATR {:.2} below minimum {min:.2}", inputs.current_atr));
        }
    }
    if let Some(max) = cfg.max_atr {
        if inputs.current_atr > max {
            return Err(format!("ATR {:.2} above maximum {max:.2}", inputs.current_atr));
        }
    }
    if let Some(fraction) = cfg.dll_proximity_fraction {
        if inputs.dll_utilization > fraction {
            return Err(format!(
                "daily loss at {:.0}% of DLL exceeds {:.0}% gate",
                inputs.dll_utilization * 100.0,
                fraction * 100.0
            ));
        }
    }
    Ok(())
}

/// Membership in a time window that may cross midnight.
pub fn in_window(t: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        t >= start && t < end
    } else {
        t >= start || t < end
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

pub struct OvernightRangeStrategy {
    config: OvernightRangeConfig,
    account_id: String,
    sink: Arc<dyn IntentSink>,
    cache: Arc<BarCache>,
    store: Arc<Store>,
    tracker: Arc<AccountTracker>,
    queue: Arc<TaskQueue>,
    tz: Tz,
    overnight_start: NaiveTime,
    overnight_end: NaiveTime,
    market_open: NaiveTime,
    eod_exit: NaiveTime,
    atr_timeframe: Timeframe,
    position_size: u32,
    enabled: AtomicBool,
    machines: RwLock<HashMap<String, SymbolState>>,
}

impl OvernightRangeStrategy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OvernightRangeConfig,
        position_size: u32,
        account_id: String,
        sink: Arc<dyn IntentSink>,
        cache: Arc<BarCache>,
        store: Arc<Store>,
        tracker: Arc<AccountTracker>,
        queue: Arc<TaskQueue>,
    ) -> anyhow::Result<Arc<Self>> {
        let tz: Tz = config
            .timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid timezone '{}': {e}", config.timezone))?;

        let parse_time = |s: &str| -> anyhow::Result<NaiveTime> {
            let (h, m) = EngineConfig::parse_hhmm(s)?;
            NaiveTime::from_hms_opt(h, m, 0)
                .ok_or_else(|| anyhow::anyhow!("invalid time '{s}'"))
        };

        let atr_timeframe = Timeframe::parse(&config.atr_timeframe)
            .ok_or_else(|| anyhow::anyhow!("invalid atr timeframe '{}'", config.atr_timeframe))?;

        let mut machines = HashMap::new();
        for symbol in &config.symbols {
            machines.insert(symbol.clone(), SymbolState::default());
        }

        Ok(Arc::new(Self {
            overnight_start: parse_time(&config.overnight_start_time)?,
            overnight_end: parse_time(&config.overnight_end_time)?,
            market_open: parse_time(&config.market_open_time)?,
            eod_exit: parse_time(&config.eod_exit_time)?,
            enabled: AtomicBool::new(config.enabled),
            atr_timeframe,
            position_size,
            config,
            account_id,
            sink,
            cache,
            store,
            tracker,
            queue,
            tz,
            machines: RwLock::new(machines),
        }))
    }

    pub fn symbol_state(&self, symbol: &str) -> Option<SymbolState> {
        self.machines.read().get(symbol).cloned()
    }

    /// Trading day a tracking window that includes `local_date`/`t` works
    /// toward: the evening leg tracks for the NEXT calendar day.
    fn trading_day(&self, local_date: NaiveDate, t: NaiveTime) -> NaiveDate {
        if t >= self.overnight_start {
            local_date.succ_opt().unwrap_or(local_date)
        } else {
            local_date
        }
    }

    fn next_market_open(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = now.with_timezone(&self.tz);
        let mut day = local.date_naive();
        if local.time() >= self.market_open {
            day = day.succ_opt()?;
        }
        while matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            day = day.succ_opt()?;
        }
        self.tz
            .from_local_datetime(&day.and_time(self.market_open))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }

    // -------------------------------------------------------------------------
    // Phase actions
    // -------------------------------------------------------------------------

    async fn enter_tracking(&self, symbol: &str, day: NaiveDate) {
        {
            let mut machines = self.machines.write();
            let state = machines.entry(symbol.to_string()).or_default();
            *state = SymbolState {
                phase: Phase::Tracking,
                session_date: Some(day),
                ..SymbolState::default()
            };
        }
        info!(symbol, trading_day = %day, "tracking window entered — collecting overnight range");
        self.persist().await;
    }

    async fn arm(&self, symbol: &str) {
        let range = {
            let machines = self.machines.read();
            machines
                .get(symbol)
                .map(|state| (state.overnight_high, state.overnight_low))
        };
        let (high, low) = match range {
            None => return,
            Some((Some(h), Some(l))) => (h, l),
            Some(_) => {
                self.skip_day(symbol, "no overnight bars collected".to_string())
                    .await;
                return;
            }
        };

        // ATRs: current-price ATR on the configured intraday timeframe,
        // daily ATR on daily bars.
        let intraday = self
            .cache
            .get_bars(symbol, self.atr_timeframe, self.config.atr_period * 3)
            .await;
        let daily = self
            .cache
            .get_bars(symbol, Timeframe::D1, self.config.atr_period * 2)
            .await;

        let (intraday, daily) = match (intraday, daily) {
            (Ok(i), Ok(d)) => (i, d),
            (i, d) => {
                let err = i.err().or(d.err()).map(|e| e.to_string()).unwrap_or_default();
                self.skip_day(symbol, format!("bar fetch failed: {err}")).await;
                return;
            }
        };

        let current_atr = calculate_atr(&intraday, self.config.atr_period);
        let daily_atr = calculate_atr(&daily, self.config.atr_period);
        let (current_atr, daily_atr) = match (current_atr, daily_atr) {
            (Some(c), Some(d)) => (c, d),
            _ => {
                self.skip_day(symbol, "insufficient bars for ATR".to_string())
                    .await;
                return;
            }
        };

        // Gates.
        let last_price = intraday.last().map(|b| b.close).unwrap_or(high);
        let prev_daily_close = daily.last().map(|b| b.close);
        let inputs = GateInputs {
            range_points: high - low,
            gap_points: prev_daily_close.map(|c| last_price - c),
            current_atr,
            dll_utilization: self.tracker.state().dll_utilization,
        };
        if let Err(reason) = evaluate_gates(&self.config, &inputs) {
            self.skip_day(symbol, reason).await;
            return;
        }

        let tick = builtin_contract_meta(symbol).map(|(_, t)| t).unwrap_or(0.25);
        let plan = compute_arm_plan(
            high,
            low,
            self.config.range_break_offset,
            self.config.stop_atr_multiplier,
            current_atr,
            self.config.target_atr_multiplier,
            daily_atr,
            tick,
        );

        info!(
            symbol,
            overnight_high = high,
            overnight_low = low,
            current_atr,
            daily_atr,
            long_entry = plan.long_entry,
            short_entry = plan.short_entry,
            "arming breakout brackets"
        );

        // Submit both stop-entry brackets.
        let long = self
            .sink
            .submit(BracketIntent::new(
                STRATEGY_NAME,
                self.account_id.clone(),
                symbol,
                Side::Buy,
                OrderType::Stop,
                Some(plan.long_entry),
                self.position_size,
                plan.long_stop,
                plan.long_target,
                None,
            ))
            .await;

        let short = self
            .sink
            .submit(BracketIntent::new(
                STRATEGY_NAME,
                self.account_id.clone(),
                symbol,
                Side::Sell,
                OrderType::Stop,
                Some(plan.short_entry),
                self.position_size,
                plan.short_stop,
                plan.short_target,
                None,
            ))
            .await;

        {
            let mut machines = self.machines.write();
            if let Some(state) = machines.get_mut(symbol) {
                state.current_atr = Some(current_atr);
                state.daily_atr = Some(daily_atr);
                state.armed_date = Some(Utc::now().with_timezone(&self.tz).date_naive());
                match &long {
                    Ok(i) => {
                        state.armed_long_intent = Some(i.id.clone());
                        state.armed_long_order = i.entry_order_id.clone();
                    }
                    Err(reason) => warn!(symbol, reason = %reason, "long arm rejected"),
                }
                match &short {
                    Ok(i) => {
                        state.armed_short_intent = Some(i.id.clone());
                        state.armed_short_order = i.entry_order_id.clone();
                    }
                    Err(reason) => warn!(symbol, reason = %reason, "short arm rejected"),
                }
                state.phase = if state.armed_long_intent.is_some() || state.armed_short_intent.is_some()
                {
                    Phase::Armed
                } else {
                    state.skip_reason = Some("both arms rejected".to_string());
                    Phase::Idle
                };
            }
        }

        if self.config.breakeven_enabled {
            self.sink
                .enable_breakeven(symbol, self.config.breakeven_profit_points);
        }

        self.persist().await;
    }

    async fn skip_day(&self, symbol: &str, reason: String) {
        warn!(symbol, reason = %reason, "arming skipped — idle for the day");
        {
            let mut machines = self.machines.write();
            if let Some(state) = machines.get_mut(symbol) {
                state.phase = Phase::Idle;
                state.skip_reason = Some(reason);
            }
        }
        self.persist().await;
    }

    async fn eod_flatten(&self, symbol: &str) {
        info!(symbol, "EOD — flattening and cancelling armed orders");

        if let Err(e) = self.sink.flatten(Some(symbol)).await {
            warn!(symbol, error = %e, "EOD flatten failed");
        }

        let (long_order, short_order) = {
            let machines = self.machines.read();
            machines
                .get(symbol)
                .map(|s| (s.armed_long_order.clone(), s.armed_short_order.clone()))
                .unwrap_or((None, None))
        };
        for order_id in [long_order, short_order].into_iter().flatten() {
            if let Err(e) = self.sink.cancel_order(&order_id).await {
                debug!(order_id = %order_id, error = %e, "armed-order cancel failed (may already be done)");
            }
        }

        {
            let mut machines = self.machines.write();
            if let Some(state) = machines.get_mut(symbol) {
                state.phase = Phase::Idle;
                state.armed_long_order = None;
                state.armed_short_order = None;
                state.armed_long_intent = None;
                state.armed_short_intent = None;
            }
        }
        self.persist().await;
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Write durable state through to the store. Arming state is required
    /// durable: a failed write re-enqueues through the task queue.
    async fn persist(&self) {
        let state = self.state_json();
        if self
            .store
            .upsert_strategy_state(&self.account_id, STRATEGY_NAME, &state)
            .await
            .is_ok()
        {
            return;
        }

        warn!("strategy state persist failed — queueing retry");
        let store = Arc::clone(&self.store);
        let account_id = self.account_id.clone();
        let spec = TaskSpec::new("persist-strategy-state", Priority::High)
            .with_max_retries(5);
        let result = self
            .queue
            .submit(spec, move |_| {
                let store = Arc::clone(&store);
                let account_id = account_id.clone();
                let state = state.clone();
                async move {
                    store
                        .upsert_strategy_state(&account_id, STRATEGY_NAME, &state)
                        .await?;
                    Ok(())
                }
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "could not queue strategy-state retry");
        }
    }
}

#[async_trait]
impl Strategy for OvernightRangeStrategy {
    fn name(&self) -> &'static str {
        STRATEGY_NAME
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!(strategy = STRATEGY_NAME, enabled, "strategy toggled");
    }

    fn phase_summary(&self) -> serde_json::Value {
        let machines = self.machines.read();
        let phases: HashMap<&str, String> = machines
            .iter()
            .map(|(sym, st)| (sym.as_str(), st.phase.to_string()))
            .collect();
        json!(phases)
    }

    fn state_json(&self) -> serde_json::Value {
        json!({
            "enabled": self.enabled(),
            "symbols": &*self.machines.read(),
        })
    }

    fn restore_state(&self, state: &serde_json::Value) {
        if let Some(enabled) = state["enabled"].as_bool() {
            self.enabled.store(enabled, Ordering::SeqCst);
        }
        if let Ok(symbols) =
            serde_json::from_value::<HashMap<String, SymbolState>>(state["symbols"].clone())
        {
            let mut machines = self.machines.write();
            for (symbol, restored) in symbols {
                machines.insert(symbol.clone(), restored.clone());
                info!(
                    symbol = %symbol,
                    phase = %restored.phase,
                    armed_long = ?restored.armed_long_order,
                    armed_short = ?restored.armed_short_order,
                    "strategy state rehydrated"
                );
            }
        }
    }

    fn verify(&self, now: DateTime<Utc>) -> VerifyReport {
        let mut reasons = Vec::new();

        if !self.enabled() {
            reasons.push("strategy disabled".to_string());
        }
        if self.tracker.state().session_disabled {
            reasons.push("session disabled by risk limits".to_string());
        }
        {
            let machines = self.machines.read();
            for (symbol, state) in machines.iter() {
                if let Some(reason) = &state.skip_reason {
                    reasons.push(format!("{symbol}: skipped ({reason})"));
                }
            }
        }

        let next_execution = self.next_market_open(now);
        let hours_until_execution =
            next_execution.map(|at| (at - now).num_minutes() as f64 / 60.0);

        VerifyReport {
            will_trade: reasons.is_empty(),
            reasons,
            next_execution,
            hours_until_execution,
        }
    }

    async fn tick(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        if !self.enabled() {
            return Ok(());
        }

        let local = now.with_timezone(&self.tz);
        let t = local.time();
        let date = local.date_naive();
        let tracking = in_window(t, self.overnight_start, self.overnight_end);
        let symbols: Vec<String> = self.machines.read().keys().cloned().collect();

        for symbol in symbols {
            let (phase, session_date) = {
                let machines = self.machines.read();
                let state = machines.get(&symbol).cloned().unwrap_or_default();
                (state.phase, state.session_date)
            };

            match phase {
                Phase::Idle => {
                    if tracking {
                        let day = self.trading_day(date, t);
                        if session_date != Some(day) {
                            self.enter_tracking(&symbol, day).await;
                        }
                    }
                }
                Phase::Tracking => {
                    if !tracking {
                        if t >= self.market_open && t < self.eod_exit {
                            self.arm(&symbol).await;
                        } else if t >= self.eod_exit {
                            self.skip_day(&symbol, "missed arming window".to_string()).await;
                        }
                    }
                }
                Phase::Armed => {
                    if t >= self.eod_exit && in_window(t, self.eod_exit, self.overnight_start) {
                        self.eod_flatten(&symbol).await;
                    }
                }
            }
        }

        Ok(())
    }

    fn on_bar_close(&self, key: &BarKey, bar: &Bar) {
        if key.timeframe != Timeframe::M1 {
            return;
        }
        let mut machines = self.machines.write();
        let Some(state) = machines.get_mut(&key.symbol) else {
            return;
        };
        if state.phase != Phase::Tracking {
            return;
        }

        state.overnight_high = Some(state.overnight_high.map_or(bar.high, |h| h.max(bar.high)));
        state.overnight_low = Some(state.overnight_low.map_or(bar.low, |l| l.min(bar.low)));
        debug!(
            symbol = %key.symbol,
            high = state.overnight_high,
            low = state.overnight_low,
            "overnight range updated"
        );
    }

    async fn restart(&self) -> anyhow::Result<()> {
        info!(strategy = STRATEGY_NAME, "scheduled restart — clearing accumulated state");
        {
            let mut machines = self.machines.write();
            for state in machines.values_mut() {
                *state = SymbolState::default();
            }
        }
        self.persist().await;
        Ok(())
    }
}

impl std::fmt::Debug for OvernightRangeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OvernightRangeStrategy")
            .field("enabled", &self.enabled())
            .field("symbols", &self.config.symbols)
            .finish()
    }
}
