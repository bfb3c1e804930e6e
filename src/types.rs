// =============================================================================
// Shared types used across the Vega trading engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The opposite direction, used when flattening a position.
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// +1.0 for buys, -1.0 for sells. Used in PnL math.
    pub fn sign(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
        }
    }
}

/// Broker order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "Market"),
            Self::Limit => write!(f, "Limit"),
            Self::Stop => write!(f, "Stop"),
            Self::StopLimit => write!(f, "StopLimit"),
        }
    }
}

/// Broker-reported order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Working,
    Filled,
    PartiallyFilled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Working => write!(f, "Working"),
            Self::Filled => write!(f, "Filled"),
            Self::PartiallyFilled => write!(f, "PartiallyFilled"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Rejected => write!(f, "Rejected"),
        }
    }
}

/// Prop-firm account classification. Determines default loss limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountType {
    Practice,
    #[serde(rename = "evaluation-50k")]
    Evaluation50k,
    #[serde(rename = "evaluation-100k")]
    Evaluation100k,
    #[serde(rename = "evaluation-150k")]
    Evaluation150k,
    ExpressFunded,
    LiveFunded,
}

impl AccountType {
    /// Default (daily-loss-limit, trailing-maximum-loss-limit) in account
    /// currency for each account class. Config can override both.
    pub fn default_limits(self) -> (f64, f64) {
        match self {
            Self::Practice => (1_000.0, 2_000.0),
            Self::Evaluation50k => (1_000.0, 2_000.0),
            Self::Evaluation100k => (2_000.0, 3_000.0),
            Self::Evaluation150k => (3_000.0, 4_500.0),
            Self::ExpressFunded => (1_000.0, 2_000.0),
            Self::LiveFunded => (2_000.0, 3_000.0),
        }
    }
}

impl Default for AccountType {
    fn default() -> Self {
        Self::Practice
    }
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Practice => write!(f, "practice"),
            Self::Evaluation50k => write!(f, "evaluation-50k"),
            Self::Evaluation100k => write!(f, "evaluation-100k"),
            Self::Evaluation150k => write!(f, "evaluation-150k"),
            Self::ExpressFunded => write!(f, "express-funded"),
            Self::LiveFunded => write!(f, "live-funded"),
        }
    }
}

/// Whether the engine is actively trading, paused, or halted for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Active,
    Paused,
    Halted,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Paused => write!(f, "Paused"),
            Self::Halted => write!(f, "Halted"),
        }
    }
}

/// A trading account as reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub account_type: AccountType,
    pub starting_balance: f64,
}

/// Resolved contract metadata for a user-facing symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub symbol: String,
    /// Opaque broker contract identifier.
    pub contract_id: String,
    /// Currency value of one full price point.
    pub point_value: f64,
    /// Minimum price increment.
    pub tick_size: f64,
}

/// A single streamed quote from the broker hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    #[serde(default)]
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

/// Round a price to the nearest multiple of `tick_size`.
pub fn round_to_tick(price: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 {
        return price;
    }
    (price / tick_size).round() * tick_size
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_opposite_and_sign() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
        assert_eq!(Side::Buy.sign(), 1.0);
        assert_eq!(Side::Sell.sign(), -1.0);
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::Working.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn account_type_limits_scale_with_size() {
        let (dll_50, mll_50) = AccountType::Evaluation50k.default_limits();
        let (dll_150, mll_150) = AccountType::Evaluation150k.default_limits();
        assert!(dll_150 > dll_50);
        assert!(mll_150 > mll_50);
    }

    #[test]
    fn account_type_serde_round_trip() {
        let json = serde_json::to_string(&AccountType::Evaluation50k).unwrap();
        assert_eq!(json, "\"evaluation-50k\"");
        let back: AccountType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AccountType::Evaluation50k);

        let funded: AccountType = serde_json::from_str("\"express-funded\"").unwrap();
        assert_eq!(funded, AccountType::ExpressFunded);
    }

    #[test]
    fn tick_rounding() {
        assert_eq!(round_to_tick(21368.6875, 0.25), 21368.75);
        assert_eq!(round_to_tick(21425.25, 0.25), 21425.25);
        assert_eq!(round_to_tick(100.13, 0.25), 100.25);
        assert_eq!(round_to_tick(100.12, 0.25), 100.0);
        // Degenerate tick size leaves the price untouched.
        assert_eq!(round_to_tick(100.13, 0.0), 100.13);
    }
}
