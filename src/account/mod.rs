// =============================================================================
// Account Tracker — balance, PnL, and the DLL/MLL compliance gates
// =============================================================================
//
// Two prop-firm rules protect the account:
//   1. Daily Loss Limit (DLL)    — an intent is refused when today's realized
//      loss plus the intent's worst case at its stop would cross the limit.
//      A warning event fires at 75 % utilization; the block is hard at 100 %.
//   2. Trailing Maximum Loss Limit (MLL) — the floor is the highest
//      end-of-day balance minus the MLL value. Touching the floor flattens
//      everything and disables new intents for the rest of the session.
//
// The highest-EOD balance is the one piece of state that must never be lost:
// it only rises, and the EOD rollover writes it through synchronously.
// Daily counters reset automatically when the UTC date rolls over.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::RejectReason;
use crate::market_data::quote_hub::PriceListener;
use crate::orders::{BracketIntent, PositionBook};
use crate::store::{AccountSnapshot, Store};

/// Fired over the compliance channel; the order engine reacts (flatten-all
/// on MLL breach) and the notifier relays.
#[derive(Debug, Clone)]
pub enum ComplianceEvent {
    DllWarning { remaining: f64 },
    MllBreached { balance: f64, floor: f64 },
    EodCompleted { balance: f64, highest: f64 },
}

/// Dashboard snapshot of the tracker.
#[derive(Debug, Clone, Serialize)]
pub struct AccountState {
    pub account_id: String,
    pub balance: f64,
    pub realized_today: f64,
    pub unrealized: f64,
    pub commissions: f64,
    pub fees: f64,
    pub daily_loss_limit: f64,
    pub dll_utilization: f64,
    pub highest_eod_balance: f64,
    pub mll_floor: f64,
    pub session_disabled: bool,
    pub disabled_reason: Option<String>,
}

struct Inner {
    realized_total: f64,
    realized_today: f64,
    commissions: f64,
    fees: f64,
    highest_eod_balance: f64,
    session_disabled: bool,
    disabled_reason: Option<String>,
    dll_warned_today: bool,
    last_eod_date: Option<String>,
    current_date: String,
}

pub struct AccountTracker {
    inner: RwLock<Inner>,
    account_id: String,
    starting_balance: f64,
    daily_loss_limit: f64,
    maximum_loss_limit: f64,
    book: Arc<PositionBook>,
    point_values: RwLock<HashMap<String, f64>>,
    events: mpsc::UnboundedSender<ComplianceEvent>,
}

impl AccountTracker {
    pub fn new(
        account_id: impl Into<String>,
        starting_balance: f64,
        daily_loss_limit: f64,
        maximum_loss_limit: f64,
        book: Arc<PositionBook>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ComplianceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(Self {
            inner: RwLock::new(Inner {
                realized_total: 0.0,
                realized_today: 0.0,
                commissions: 0.0,
                fees: 0.0,
                // Until the first EOD the trailing floor anchors to the
                // starting balance.
                highest_eod_balance: starting_balance,
                session_disabled: false,
                disabled_reason: None,
                dll_warned_today: false,
                last_eod_date: None,
                current_date: Utc::now().format("%Y-%m-%d").to_string(),
            }),
            account_id: account_id.into(),
            starting_balance,
            daily_loss_limit,
            maximum_loss_limit,
            book,
            point_values: RwLock::new(HashMap::new()),
            events: tx,
        });
        info!(
            account_id = %tracker.account_id,
            starting_balance,
            daily_loss_limit,
            maximum_loss_limit,
            "account tracker initialised"
        );
        (tracker, rx)
    }

    // -------------------------------------------------------------------------
    // Contract metadata
    // -------------------------------------------------------------------------

    pub fn set_point_value(&self, symbol: &str, point_value: f64) {
        self.point_values
            .write()
            .insert(symbol.to_string(), point_value);
    }

    pub fn point_value(&self, symbol: &str) -> f64 {
        match self.point_values.read().get(symbol) {
            Some(pv) => *pv,
            None => {
                warn!(symbol, "no point value registered — defaulting to 1.0");
                1.0
            }
        }
    }

    // -------------------------------------------------------------------------
    // Balance arithmetic
    // -------------------------------------------------------------------------

    /// starting + realized + unrealized − fees − commissions.
    pub fn current_balance(&self) -> f64 {
        let inner = self.inner.read();
        self.starting_balance + inner.realized_total + self.book.total_unrealized()
            - inner.fees
            - inner.commissions
    }

    /// The trailing MLL floor: highest-EOD balance minus the MLL value.
    pub fn mll_floor(&self) -> f64 {
        self.inner.read().highest_eod_balance - self.maximum_loss_limit
    }

    pub fn is_session_disabled(&self) -> bool {
        self.inner.read().session_disabled
    }

    /// Record realized PnL from a filled exit.
    pub fn record_realized(&self, pnl: f64) {
        self.maybe_reset_daily();
        let mut inner = self.inner.write();
        inner.realized_total += pnl;
        inner.realized_today += pnl;
        debug!(pnl, realized_today = inner.realized_today, "realized pnl recorded");
    }

    pub fn record_commission(&self, amount: f64) {
        self.inner.write().commissions += amount;
    }

    pub fn record_fee(&self, amount: f64) {
        self.inner.write().fees += amount;
    }

    /// Restore the persisted highest-EOD balance at startup. Monotonic: a
    /// lower stored value never shrinks the in-memory one.
    pub fn restore_highest_eod(&self, value: f64) {
        let mut inner = self.inner.write();
        if value > inner.highest_eod_balance {
            inner.highest_eod_balance = value;
            info!(highest_eod = value, "highest end-of-day balance restored");
        }
    }

    pub fn highest_eod_balance(&self) -> f64 {
        self.inner.read().highest_eod_balance
    }

    // -------------------------------------------------------------------------
    // Intent gate
    // -------------------------------------------------------------------------

    /// Vet an order intent against the compliance rules. Called on every
    /// submission before anything reaches the broker.
    pub fn check_intent(&self, intent: &BracketIntent) -> Result<(), RejectReason> {
        self.maybe_reset_daily();

        if self.is_session_disabled() {
            return Err(RejectReason::SessionDisabled);
        }

        // MLL: the floor check uses the live balance including unrealized.
        let balance = self.current_balance();
        let floor = self.mll_floor();
        if balance <= floor {
            return Err(RejectReason::ComplianceMll);
        }

        // DLL: project the worst case of this intent on top of today's
        // realized result.
        let point_value = self.point_value(&intent.symbol);
        let worst_case = intent.worst_case_loss(point_value);
        let (realized_today, warned) = {
            let inner = self.inner.read();
            (inner.realized_today, inner.dll_warned_today)
        };
        let projected = realized_today - worst_case;
        let remaining = (self.daily_loss_limit + realized_today.min(0.0)).max(0.0);

        if projected < -self.daily_loss_limit {
            warn!(
                realized_today,
                worst_case,
                projected,
                limit = self.daily_loss_limit,
                "intent blocked: projected daily loss exceeds DLL"
            );
            let _ = self.events.send(ComplianceEvent::DllWarning { remaining });
            return Err(RejectReason::ComplianceDll { remaining });
        }

        // Soft warning at 75 % utilization, once per day.
        let loss_so_far = (-realized_today).max(0.0);
        if !warned && loss_so_far >= 0.75 * self.daily_loss_limit {
            self.inner.write().dll_warned_today = true;
            warn!(loss_so_far, limit = self.daily_loss_limit, "DLL utilization above 75%");
            let _ = self.events.send(ComplianceEvent::DllWarning { remaining });
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // MLL enforcement
    // -------------------------------------------------------------------------

    /// Evaluate the MLL floor against the live balance; on breach, disable
    /// the session and emit the event that triggers flatten-all.
    fn enforce_mll(&self) {
        let balance = self.current_balance();
        let floor = self.mll_floor();
        if balance > floor {
            return;
        }

        let mut inner = self.inner.write();
        if inner.session_disabled {
            return;
        }
        inner.session_disabled = true;
        inner.disabled_reason = Some(format!(
            "MLL breached: balance {balance:.2} <= floor {floor:.2}"
        ));
        drop(inner);

        warn!(balance, floor, "MLL breached — disabling session and flattening");
        let _ = self.events.send(ComplianceEvent::MllBreached { balance, floor });
    }

    // -------------------------------------------------------------------------
    // EOD rollover
    // -------------------------------------------------------------------------

    /// Append today's end-of-day snapshot and roll the trailing highest-EOD
    /// balance forward. Exactly once per session-close date; the snapshot
    /// write is synchronous and the caller re-enqueues on store failure.
    pub async fn eod_rollover(&self, closing_balance: f64, store: &Store) -> anyhow::Result<()> {
        let today = Utc::now().format("%Y-%m-%d").to_string();

        {
            let inner = self.inner.read();
            if inner.last_eod_date.as_deref() == Some(today.as_str()) {
                debug!(date = %today, "eod rollover already completed today");
                return Ok(());
            }
        }

        // H is monotonic: it only rises. Bump memory first so risk
        // enforcement is correct even if the store write needs a retry.
        let highest = {
            let mut inner = self.inner.write();
            if closing_balance > inner.highest_eod_balance {
                inner.highest_eod_balance = closing_balance;
            }
            inner.highest_eod_balance
        };

        let snapshot = {
            let inner = self.inner.read();
            AccountSnapshot {
                account_id: self.account_id.clone(),
                timestamp: Utc::now(),
                balance: closing_balance,
                realized_pnl: inner.realized_today,
                unrealized_pnl: self.book.total_unrealized(),
                commissions: inner.commissions,
                fees: inner.fees,
                highest_end_of_day_balance: highest,
                is_eod: true,
            }
        };

        store.append_snapshot(&snapshot).await.map_err(|e| {
            warn!(error = %e, "EOD snapshot write failed — must be retried");
            anyhow::anyhow!("eod snapshot write failed: {e}")
        })?;

        self.inner.write().last_eod_date = Some(today.clone());
        info!(date = %today, closing_balance, highest, "EOD rollover complete");
        let _ = self.events.send(ComplianceEvent::EodCompleted {
            balance: closing_balance,
            highest,
        });
        Ok(())
    }

    /// Build an intraday (non-EOD) snapshot row.
    pub fn intraday_snapshot(&self) -> AccountSnapshot {
        let inner = self.inner.read();
        AccountSnapshot {
            account_id: self.account_id.clone(),
            timestamp: Utc::now(),
            balance: self.starting_balance + inner.realized_total + self.book.total_unrealized()
                - inner.fees
                - inner.commissions,
            realized_pnl: inner.realized_today,
            unrealized_pnl: self.book.total_unrealized(),
            commissions: inner.commissions,
            fees: inner.fees,
            highest_end_of_day_balance: inner.highest_eod_balance,
            is_eod: false,
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn state(&self) -> AccountState {
        self.maybe_reset_daily();
        let inner = self.inner.read();
        let balance = self.starting_balance + inner.realized_total + self.book.total_unrealized()
            - inner.fees
            - inner.commissions;
        let loss_so_far = (-inner.realized_today).max(0.0);

        AccountState {
            account_id: self.account_id.clone(),
            balance,
            realized_today: inner.realized_today,
            unrealized: self.book.total_unrealized(),
            commissions: inner.commissions,
            fees: inner.fees,
            daily_loss_limit: self.daily_loss_limit,
            dll_utilization: if self.daily_loss_limit > 0.0 {
                loss_so_far / self.daily_loss_limit
            } else {
                0.0
            },
            highest_eod_balance: inner.highest_eod_balance,
            mll_floor: inner.highest_eod_balance - self.maximum_loss_limit,
            session_disabled: inner.session_disabled,
            disabled_reason: inner.disabled_reason.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Daily reset
    // -------------------------------------------------------------------------

    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let inner = self.inner.read();
            if inner.current_date == today {
                return;
            }
        }
        let mut inner = self.inner.write();
        if inner.current_date != today {
            info!(
                old_date = %inner.current_date,
                new_date = %today,
                "date rolled — resetting daily counters"
            );
            inner.realized_today = 0.0;
            inner.dll_warned_today = false;
            inner.session_disabled = false;
            inner.disabled_reason = None;
            inner.current_date = today;
        }
    }
}

impl PriceListener for AccountTracker {
    /// Debounced price update from the quote hub: refresh unrealized PnL for
    /// the symbol and re-evaluate the MLL floor.
    fn on_price(&self, symbol: &str, price: f64) {
        let point_value = self.point_value(symbol);
        self.book.update_price(symbol, price, point_value);
        self.enforce_mll();
    }
}

impl std::fmt::Debug for AccountTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountTracker")
            .field("account_id", &self.account_id)
            .field("starting_balance", &self.starting_balance)
            .field("daily_loss_limit", &self.daily_loss_limit)
            .field("maximum_loss_limit", &self.maximum_loss_limit)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderType, Side};

    fn tracker(
        starting: f64,
        dll: f64,
        mll: f64,
    ) -> (
        Arc<AccountTracker>,
        mpsc::UnboundedReceiver<ComplianceEvent>,
        Arc<PositionBook>,
    ) {
        let book = Arc::new(PositionBook::new());
        let (t, rx) = AccountTracker::new("acct-1", starting, dll, mll, book.clone());
        t.set_point_value("MNQ", 2.0);
        (t, rx, book)
    }

    fn long_intent(entry: f64, stop: f64, size: u32) -> BracketIntent {
        BracketIntent::new(
            "signal",
            "acct-1",
            "MNQ",
            Side::Buy,
            OrderType::Market,
            Some(entry),
            size,
            stop,
            entry + 50.0,
            None,
        )
    }

    #[test]
    fn dll_block_at_projected_worst_case() {
        // Scenario: limit 1000, today's realized −850. Incoming long with a
        // 40-point stop, $2 point value, size 3 → worst case −240.
        // −850 − 240 = −1090 < −1000 → blocked with remaining = 150.
        let (t, mut rx, _) = tracker(50_000.0, 1_000.0, 100_000.0);
        t.record_realized(-850.0);

        let intent = long_intent(21_000.0, 20_960.0, 3);
        match t.check_intent(&intent) {
            Err(RejectReason::ComplianceDll { remaining }) => {
                assert!((remaining - 150.0).abs() < 1e-9);
            }
            other => panic!("expected DLL block, got {other:?}"),
        }

        // The warning event carries the remaining headroom for the notifier.
        match rx.try_recv().unwrap() {
            ComplianceEvent::DllWarning { remaining } => {
                assert!((remaining - 150.0).abs() < 1e-9)
            }
            other => panic!("expected DllWarning, got {other:?}"),
        }
    }

    #[test]
    fn dll_allows_within_budget() {
        let (t, _rx, _) = tracker(50_000.0, 1_000.0, 100_000.0);
        t.record_realized(-500.0);

        // Worst case 240: −500 − 240 = −740 > −1000 → allowed.
        let intent = long_intent(21_000.0, 20_960.0, 3);
        assert!(t.check_intent(&intent).is_ok());
    }

    #[test]
    fn dll_warns_once_at_75_percent() {
        let (t, mut rx, _) = tracker(50_000.0, 1_000.0, 100_000.0);
        t.record_realized(-800.0);

        let small = long_intent(21_000.0, 20_990.0, 1); // worst case 20
        assert!(t.check_intent(&small).is_ok());
        assert!(matches!(rx.try_recv(), Ok(ComplianceEvent::DllWarning { .. })));

        // Second check within the same day does not warn again.
        assert!(t.check_intent(&small).is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn mll_breach_disables_and_emits() {
        // Scenario: H = 152250.75, mll = 4500, floor = 147750.75.
        let (t, mut rx, book) = tracker(152_000.0, 10_000.0, 4_500.0);
        t.restore_highest_eod(152_250.75);
        assert!((t.mll_floor() - 147_750.75).abs() < 1e-9);

        // A losing open long drags the live balance to 147 700.
        book.apply_fill("MNQ", Side::Buy, 1, 21_000.0, 2.0);
        let drop_needed = t.current_balance() - 147_700.0;
        let price = 21_000.0 - drop_needed / 2.0;
        t.on_price("MNQ", price);

        assert!(t.is_session_disabled());
        match rx.try_recv().unwrap() {
            ComplianceEvent::MllBreached { balance, floor } => {
                assert!((balance - 147_700.0).abs() < 1e-6);
                assert!((floor - 147_750.75).abs() < 1e-9);
            }
            other => panic!("expected MllBreached, got {other:?}"),
        }

        // Further intents are refused for the session.
        let intent = long_intent(21_000.0, 20_990.0, 1);
        assert!(matches!(
            t.check_intent(&intent),
            Err(RejectReason::SessionDisabled)
        ));
    }

    #[test]
    fn mll_event_fires_once() {
        let (t, mut rx, book) = tracker(50_000.0, 1_000.0, 2_000.0);
        book.apply_fill("MNQ", Side::Buy, 2, 21_000.0, 2.0);

        t.on_price("MNQ", 20_000.0); // −4000 unrealized: well past the floor
        t.on_price("MNQ", 19_900.0);

        assert!(matches!(rx.try_recv(), Ok(ComplianceEvent::MllBreached { .. })));
        assert!(rx.try_recv().is_err(), "breach event must fire once");
    }

    #[tokio::test]
    async fn eod_rollover_is_monotonic_and_once_per_day() {
        let (t, _rx, _) = tracker(50_000.0, 1_000.0, 2_000.0);
        let store = Store::disconnected();

        // Store down: rollover reports failure for re-enqueue, but H has
        // already risen (it must never be lost to a lower value).
        assert!(t.eod_rollover(50_400.0, &store).await.is_err());
        assert_eq!(t.highest_eod_balance(), 50_400.0);

        // A lower closing balance never reduces H.
        assert!(t.eod_rollover(50_100.0, &store).await.is_err());
        assert_eq!(t.highest_eod_balance(), 50_400.0);
    }

    #[test]
    fn balance_arithmetic() {
        let (t, _rx, book) = tracker(50_000.0, 1_000.0, 2_000.0);
        t.record_realized(300.0);
        t.record_commission(12.0);
        t.record_fee(8.0);

        book.apply_fill("MNQ", Side::Buy, 2, 21_000.0, 2.0);
        book.update_price("MNQ", 21_025.0, 2.0); // +100 unrealized

        assert!((t.current_balance() - (50_000.0 + 300.0 + 100.0 - 12.0 - 8.0)).abs() < 1e-9);

        let state = t.state();
        assert!((state.unrealized - 100.0).abs() < 1e-9);
        assert!((state.realized_today - 300.0).abs() < 1e-9);
        assert_eq!(state.dll_utilization, 0.0);
    }
}
