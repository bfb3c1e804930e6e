// =============================================================================
// Order domain model — orders, bracket intents, and the position book
// =============================================================================

pub mod engine;
pub mod reconcile;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::RejectReason;
use crate::types::{OrderStatus, OrderType, Side};

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// An order as tracked by the engine (mirrors the broker's view plus our
/// correlation tag).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Broker-assigned order id.
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub size: u32,
    #[serde(default)]
    pub limit_price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    pub status: OrderStatus,
    /// Parent order id for bracket children.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Engine-owned correlation tag.
    #[serde(default)]
    pub custom_tag: Option<String>,
    #[serde(default)]
    pub filled_size: u32,
    #[serde(default)]
    pub fill_price: Option<f64>,
}

// ---------------------------------------------------------------------------
// Bracket intent
// ---------------------------------------------------------------------------

/// Lifecycle state of a bracket intent. Terminal states are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentState {
    New,
    Submitting,
    /// Native bracket accepted; entry not yet triggered.
    Armed,
    /// Fallback path: entry order working, brackets attach after the fill.
    EntryWorking,
    /// Entry filled and stop/target legs attached.
    Protected,
    Closed,
    Cancelled,
    Failed,
}

impl IntentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled | Self::Failed)
    }
}

impl std::fmt::Display for IntentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Submitting => "SUBMITTING",
            Self::Armed => "ARMED",
            Self::EntryWorking => "ENTRY_WORKING",
            Self::Protected => "PROTECTED",
            Self::Closed => "CLOSED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// The engine's pending-work record for one bracketed entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketIntent {
    pub id: String,
    /// Originating strategy (or "signal" for external intents).
    pub strategy: String,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_type: OrderType,
    /// Entry price for limit/stop entries; `None` for market entries.
    pub entry_price: Option<f64>,
    pub size: u32,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    /// Second target for staged exits.
    #[serde(default)]
    pub take_profit_2: Option<f64>,
    /// Correlation tag assigned at submit time; empty until then.
    #[serde(default)]
    pub correlation_tag: String,
    pub state: IntentState,
    #[serde(default)]
    pub reject_reason: Option<RejectReason>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub entry_order_id: Option<String>,
    #[serde(default)]
    pub stop_order_id: Option<String>,
    #[serde(default)]
    pub tp1_order_id: Option<String>,
    #[serde(default)]
    pub tp2_order_id: Option<String>,
}

impl BracketIntent {
    pub fn new(
        strategy: impl Into<String>,
        account_id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        entry_type: OrderType,
        entry_price: Option<f64>,
        size: u32,
        stop_loss: f64,
        take_profit_1: f64,
        take_profit_2: Option<f64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            strategy: strategy.into(),
            account_id: account_id.into(),
            symbol: symbol.into(),
            side,
            entry_type,
            entry_price,
            size,
            stop_loss,
            take_profit_1,
            take_profit_2,
            correlation_tag: String::new(),
            state: IntentState::New,
            reject_reason: None,
            created_at: Utc::now(),
            entry_order_id: None,
            stop_order_id: None,
            tp1_order_id: None,
            tp2_order_id: None,
        }
    }

    /// Split the position size into (TP1 quantity, TP2 quantity) for a
    /// staged exit: `q1 = round(size × fraction)`, remainder rides to TP2.
    pub fn staged_quantities(size: u32, tp1_fraction: f64) -> (u32, u32) {
        let q1 = ((size as f64) * tp1_fraction).round() as u32;
        let q1 = q1.clamp(0, size);
        (q1, size - q1)
    }

    /// Worst-case loss at the stop, in account currency.
    pub fn worst_case_loss(&self, point_value: f64) -> f64 {
        let entry = self.entry_price.unwrap_or(self.stop_loss);
        (entry - self.stop_loss).abs() * point_value * self.size as f64
    }
}

// ---------------------------------------------------------------------------
// Position book
// ---------------------------------------------------------------------------

/// Net position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    fn from_order_side(side: Side) -> Self {
        match side {
            Side::Buy => Self::Long,
            Side::Sell => Self::Short,
        }
    }

    /// The order side that closes this position.
    pub fn closing_side(self) -> Side {
        match self {
            Self::Long => Side::Sell,
            Self::Short => Side::Buy,
        }
    }
}

/// A net position per (account, symbol), derived from fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub symbol: String,
    pub side: PositionSide,
    pub size: u32,
    pub avg_entry: f64,
    #[serde(default)]
    pub last_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub stop_order_id: Option<String>,
    #[serde(default)]
    pub target_order_id: Option<String>,
    #[serde(default)]
    pub target2_order_id: Option<String>,
    /// Breakeven adjustment fires at most once per position.
    #[serde(default)]
    pub breakeven_done: bool,
    pub opened_at: DateTime<Utc>,
}

impl TrackedPosition {
    /// A position is protected when both a stop and at least one target are
    /// attached.
    pub fn is_protected(&self) -> bool {
        self.stop_order_id.is_some() && self.target_order_id.is_some()
    }
}

/// Thread-safe owner of all open positions for the traded account.
pub struct PositionBook {
    inner: RwLock<HashMap<String, TrackedPosition>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Apply one fill to the book. Returns the realized PnL delta (non-zero
    /// only when the fill reduces or flips an existing position).
    pub fn apply_fill(
        &self,
        symbol: &str,
        side: Side,
        size: u32,
        price: f64,
        point_value: f64,
    ) -> f64 {
        let mut book = self.inner.write();
        let fill_side = PositionSide::from_order_side(side);

        match book.get_mut(symbol) {
            None => {
                book.insert(
                    symbol.to_string(),
                    TrackedPosition {
                        symbol: symbol.to_string(),
                        side: fill_side,
                        size,
                        avg_entry: price,
                        last_price: price,
                        unrealized_pnl: 0.0,
                        stop_order_id: None,
                        target_order_id: None,
                        target2_order_id: None,
                        breakeven_done: false,
                        opened_at: Utc::now(),
                    },
                );
                info!(symbol, side = %side, size, price, "position opened");
                0.0
            }
            Some(pos) if pos.side == fill_side => {
                // Adding to the position: recompute the weighted average.
                let total = pos.size + size;
                pos.avg_entry = (pos.avg_entry * pos.size as f64 + price * size as f64)
                    / total as f64;
                pos.size = total;
                debug!(symbol, size = pos.size, avg_entry = pos.avg_entry, "position increased");
                0.0
            }
            Some(pos) => {
                // Opposite-side fill: reduce, close, or flip.
                let closed = size.min(pos.size);
                let realized =
                    (price - pos.avg_entry) * pos.side.sign() * point_value * closed as f64;

                if size < pos.size {
                    pos.size -= size;
                    info!(symbol, closed, remaining = pos.size, realized, "position reduced");
                } else if size == pos.size {
                    book.remove(symbol);
                    info!(symbol, closed, realized, "position closed");
                } else {
                    let flip_size = size - pos.size;
                    let new_side = fill_side;
                    *pos = TrackedPosition {
                        symbol: symbol.to_string(),
                        side: new_side,
                        size: flip_size,
                        avg_entry: price,
                        last_price: price,
                        unrealized_pnl: 0.0,
                        stop_order_id: None,
                        target_order_id: None,
                        target2_order_id: None,
                        breakeven_done: false,
                        opened_at: Utc::now(),
                    };
                    info!(symbol, closed, flip_size, realized, "position flipped");
                }
                realized
            }
        }
    }

    /// Recompute unrealized PnL for `symbol` at `price`.
    pub fn update_price(&self, symbol: &str, price: f64, point_value: f64) {
        let mut book = self.inner.write();
        if let Some(pos) = book.get_mut(symbol) {
            pos.last_price = price;
            pos.unrealized_pnl =
                (price - pos.avg_entry) * pos.side.sign() * point_value * pos.size as f64;
        }
    }

    /// Attach protective order ids to an open position.
    pub fn set_protection(
        &self,
        symbol: &str,
        stop: Option<String>,
        target: Option<String>,
        target2: Option<String>,
    ) {
        let mut book = self.inner.write();
        if let Some(pos) = book.get_mut(symbol) {
            if stop.is_some() {
                pos.stop_order_id = stop;
            }
            if target.is_some() {
                pos.target_order_id = target;
            }
            if target2.is_some() {
                pos.target2_order_id = target2;
            }
        }
    }

    /// Mark the breakeven adjustment done. Returns `true` only the first
    /// time for a given position.
    pub fn mark_breakeven_done(&self, symbol: &str) -> bool {
        let mut book = self.inner.write();
        match book.get_mut(symbol) {
            Some(pos) if !pos.breakeven_done => {
                pos.breakeven_done = true;
                true
            }
            _ => false,
        }
    }

    pub fn position(&self, symbol: &str) -> Option<TrackedPosition> {
        self.inner.read().get(symbol).cloned()
    }

    pub fn all(&self) -> Vec<TrackedPosition> {
        self.inner.read().values().cloned().collect()
    }

    /// Net signed size for a symbol (0 when flat).
    pub fn net_size(&self, symbol: &str) -> i64 {
        self.inner
            .read()
            .get(symbol)
            .map(|p| p.size as i64 * if p.side == PositionSide::Long { 1 } else { -1 })
            .unwrap_or(0)
    }

    /// Sum of unrealized PnL across all open positions.
    pub fn total_unrealized(&self) -> f64 {
        self.inner.read().values().map(|p| p.unrealized_pnl).sum()
    }

    /// Drop a position without generating PnL (used after an external
    /// flatten confirmed by reconciliation).
    pub fn remove(&self, symbol: &str) -> Option<TrackedPosition> {
        self.inner.write().remove(symbol)
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionBook")
            .field("open", &self.inner.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const PV: f64 = 2.0; // MNQ point value

    #[test]
    fn staged_quantities_split() {
        // Size 4 at fraction 0.75 → TP1 covers 3, TP2 covers 1.
        assert_eq!(BracketIntent::staged_quantities(4, 0.75), (3, 1));
        assert_eq!(BracketIntent::staged_quantities(2, 0.75), (2, 0));
        assert_eq!(BracketIntent::staged_quantities(10, 0.5), (5, 5));
        assert_eq!(BracketIntent::staged_quantities(1, 0.75), (1, 0));
        assert_eq!(BracketIntent::staged_quantities(3, 0.0), (0, 3));
    }

    #[test]
    fn worst_case_loss_scales_with_size_and_point_value() {
        let intent = BracketIntent::new(
            "signal", "acct", "MNQ", Side::Buy, OrderType::Market,
            Some(21_000.0), 3, 20_960.0, 21_100.0, None,
        );
        // 40 points × $2 × 3 contracts.
        assert_eq!(intent.worst_case_loss(PV), 240.0);
    }

    #[test]
    fn intent_terminal_states() {
        assert!(IntentState::Closed.is_terminal());
        assert!(IntentState::Cancelled.is_terminal());
        assert!(IntentState::Failed.is_terminal());
        assert!(!IntentState::Armed.is_terminal());
        assert!(!IntentState::Protected.is_terminal());
    }

    #[test]
    fn fill_opens_and_increases_position() {
        let book = PositionBook::new();
        let realized = book.apply_fill("MNQ", Side::Buy, 2, 21_000.0, PV);
        assert_eq!(realized, 0.0);

        let realized = book.apply_fill("MNQ", Side::Buy, 2, 21_010.0, PV);
        assert_eq!(realized, 0.0);

        let pos = book.position("MNQ").unwrap();
        assert_eq!(pos.side, PositionSide::Long);
        assert_eq!(pos.size, 4);
        assert_eq!(pos.avg_entry, 21_005.0);
        assert_eq!(book.net_size("MNQ"), 4);
    }

    #[test]
    fn opposite_fill_reduces_then_closes() {
        let book = PositionBook::new();
        book.apply_fill("MNQ", Side::Buy, 4, 21_000.0, PV);

        // Partial exit of 3 at +10 points.
        let realized = book.apply_fill("MNQ", Side::Sell, 3, 21_010.0, PV);
        assert_eq!(realized, 60.0); // 10 pts × $2 × 3
        assert_eq!(book.net_size("MNQ"), 1);

        // Close the remainder at -5 points.
        let realized = book.apply_fill("MNQ", Side::Sell, 1, 20_995.0, PV);
        assert_eq!(realized, -10.0);
        assert!(book.position("MNQ").is_none());
    }

    #[test]
    fn oversized_opposite_fill_flips() {
        let book = PositionBook::new();
        book.apply_fill("MNQ", Side::Buy, 2, 21_000.0, PV);

        let realized = book.apply_fill("MNQ", Side::Sell, 5, 21_020.0, PV);
        assert_eq!(realized, 80.0); // closed 2 long at +20 points

        let pos = book.position("MNQ").unwrap();
        assert_eq!(pos.side, PositionSide::Short);
        assert_eq!(pos.size, 3);
        assert_eq!(pos.avg_entry, 21_020.0);
        assert!(!pos.is_protected());
    }

    #[test]
    fn short_position_pnl_signs() {
        let book = PositionBook::new();
        book.apply_fill("MNQ", Side::Sell, 2, 21_000.0, PV);
        book.update_price("MNQ", 20_990.0, PV);

        let pos = book.position("MNQ").unwrap();
        assert_eq!(pos.unrealized_pnl, 40.0); // short gains as price falls

        let realized = book.apply_fill("MNQ", Side::Buy, 2, 21_015.0, PV);
        assert_eq!(realized, -60.0);
    }

    #[test]
    fn protection_and_breakeven_once() {
        let book = PositionBook::new();
        book.apply_fill("MNQ", Side::Buy, 2, 21_000.0, PV);
        assert!(!book.position("MNQ").unwrap().is_protected());

        book.set_protection("MNQ", Some("s-1".into()), Some("t-1".into()), None);
        assert!(book.position("MNQ").unwrap().is_protected());

        assert!(book.mark_breakeven_done("MNQ"));
        assert!(!book.mark_breakeven_done("MNQ")); // second trigger refused
        assert!(!book.mark_breakeven_done("MES")); // unknown symbol
    }

    #[test]
    fn flip_clears_protection_and_breakeven() {
        let book = PositionBook::new();
        book.apply_fill("MNQ", Side::Buy, 1, 21_000.0, PV);
        book.set_protection("MNQ", Some("s-1".into()), Some("t-1".into()), None);
        book.mark_breakeven_done("MNQ");

        book.apply_fill("MNQ", Side::Sell, 2, 21_010.0, PV);
        let pos = book.position("MNQ").unwrap();
        assert!(!pos.is_protected());
        assert!(!pos.breakeven_done);
    }
}
