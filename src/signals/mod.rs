// =============================================================================
// Signal Intake — external strategy signals normalized into order intents
// =============================================================================
//
// The webhook boundary accepts a closed vocabulary of actions; unknown
// actions are rejected right here. Entry signals require entry, stop, and
// TP1 fields. Duplicate (symbol, action) events inside the debounce window
// are dropped, so a chatty upstream produces at most one submission per
// window. When staged bracket exits are active, non-entry signals are
// ignored: exits are broker-managed via the bracket legs.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::OrderPolicyConfig;
use crate::orders::engine::IntentSink;
use crate::orders::BracketIntent;
use crate::types::{OrderType, Side};

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// The closed set of actions the webhook understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalAction {
    OpenLong,
    OpenShort,
    Tp1HitLong,
    Tp1HitShort,
    StopOutLong,
    StopOutShort,
    SessionCloseLong,
    SessionCloseShort,
}

impl SignalAction {
    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }

    pub fn is_entry(self) -> bool {
        matches!(self, Self::OpenLong | Self::OpenShort)
    }

    pub fn is_tp1(self) -> bool {
        matches!(self, Self::Tp1HitLong | Self::Tp1HitShort)
    }

    /// Direction of the position this action refers to.
    pub fn side(self) -> Side {
        match self {
            Self::OpenLong | Self::Tp1HitLong | Self::StopOutLong | Self::SessionCloseLong => {
                Side::Buy
            }
            _ => Side::Sell,
        }
    }
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Raw webhook payload, exactly as the upstream sends it.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSignal {
    pub action: String,
    pub symbol: String,
    #[serde(default)]
    pub entry: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit_1: Option<f64>,
    #[serde(default)]
    pub take_profit_2: Option<f64>,
}

/// A validated, normalized signal.
#[derive(Debug, Clone, Serialize)]
pub struct SignalEvent {
    pub symbol: String,
    pub action: SignalAction,
    pub entry: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit_1: Option<f64>,
    pub take_profit_2: Option<f64>,
    pub received_at: DateTime<Utc>,
}

/// Why a payload was refused at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum NormalizeError {
    UnknownAction(String),
    MissingField(&'static str),
    EmptySymbol,
}

impl std::fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownAction(a) => write!(f, "unknown action '{a}'"),
            Self::MissingField(field) => write!(f, "missing required field '{field}'"),
            Self::EmptySymbol => write!(f, "empty symbol"),
        }
    }
}

/// Validate a raw payload against the per-action field requirements.
pub fn normalize(raw: &RawSignal) -> Result<SignalEvent, NormalizeError> {
    let action = SignalAction::parse(&raw.action)
        .ok_or_else(|| NormalizeError::UnknownAction(raw.action.clone()))?;

    let symbol = raw.symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(NormalizeError::EmptySymbol);
    }

    if action.is_entry() {
        if raw.entry.is_none() {
            return Err(NormalizeError::MissingField("entry"));
        }
        if raw.stop_loss.is_none() {
            return Err(NormalizeError::MissingField("stop_loss"));
        }
        if raw.take_profit_1.is_none() {
            return Err(NormalizeError::MissingField("take_profit_1"));
        }
    }

    Ok(SignalEvent {
        symbol,
        action,
        entry: raw.entry,
        stop_loss: raw.stop_loss,
        take_profit_1: raw.take_profit_1,
        take_profit_2: raw.take_profit_2,
        received_at: Utc::now(),
    })
}

// ---------------------------------------------------------------------------
// Debounce
// ---------------------------------------------------------------------------

/// Drops duplicate (symbol, action) events inside a fixed window.
pub struct SignalDebouncer {
    window: Duration,
    last: RwLock<HashMap<(String, SignalAction), Instant>>,
}

impl SignalDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: RwLock::new(HashMap::new()),
        }
    }

    /// Returns true when the event passes; records the acceptance time.
    pub fn accept(&self, symbol: &str, action: SignalAction) -> bool {
        let key = (symbol.to_string(), action);
        let mut last = self.last.write();
        match last.get(&key) {
            Some(at) if at.elapsed() < self.window => false,
            _ => {
                last.insert(key, Instant::now());
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Intake
// ---------------------------------------------------------------------------

/// Outcome reported back on the webhook response.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum SignalOutcome {
    Accepted { intent_id: String },
    Ignored { reason: String },
    Rejected { reason: String },
}

pub struct SignalIntake {
    sink: Arc<dyn IntentSink>,
    debouncer: SignalDebouncer,
    policy: OrderPolicyConfig,
    account_id: String,
}

impl SignalIntake {
    pub fn new(sink: Arc<dyn IntentSink>, policy: OrderPolicyConfig, account_id: String) -> Self {
        let window = Duration::from_secs(policy.debounce_seconds);
        Self {
            sink,
            debouncer: SignalDebouncer::new(window),
            policy,
            account_id,
        }
    }

    /// Process one webhook payload end to end.
    pub async fn handle(&self, raw: RawSignal) -> SignalOutcome {
        let event = match normalize(&raw) {
            Ok(ev) => ev,
            Err(e) => {
                warn!(error = %e, "signal rejected at boundary");
                return SignalOutcome::Rejected {
                    reason: e.to_string(),
                };
            }
        };

        if !event.action.is_entry() {
            // With staged bracket exits active, exits are broker-managed.
            if self.policy.ignore_non_entry_signals
                || (event.action.is_tp1() && self.policy.ignore_tp1_signals)
            {
                debug!(action = %event.action, symbol = %event.symbol, "non-entry signal ignored by policy");
                return SignalOutcome::Ignored {
                    reason: format!("non-entry action '{}' ignored", event.action),
                };
            }
            // Stop-out / session-close with the policy off: flatten.
            info!(action = %event.action, symbol = %event.symbol, "exit signal — flattening");
            return match self.sink.flatten(Some(&event.symbol)).await {
                Ok(()) => SignalOutcome::Accepted {
                    intent_id: String::new(),
                },
                Err(e) => SignalOutcome::Rejected {
                    reason: e.to_string(),
                },
            };
        }

        if !self.debouncer.accept(&event.symbol, event.action) {
            debug!(symbol = %event.symbol, action = %event.action, "signal debounced");
            return SignalOutcome::Ignored {
                reason: "debounced".to_string(),
            };
        }

        // Entry actions passed normalization, so the price fields are set.
        let (Some(stop_loss), Some(take_profit_1)) = (event.stop_loss, event.take_profit_1)
        else {
            return SignalOutcome::Rejected {
                reason: "entry signal missing price fields".to_string(),
            };
        };

        let intent = BracketIntent::new(
            "signal",
            self.account_id.clone(),
            event.symbol.clone(),
            event.action.side(),
            OrderType::Market,
            event.entry,
            self.policy.position_size,
            stop_loss,
            take_profit_1,
            event.take_profit_2,
        );

        match self.sink.submit(intent).await {
            Ok(submitted) => {
                info!(symbol = %event.symbol, action = %event.action, state = %submitted.state, "signal intent submitted");
                SignalOutcome::Accepted {
                    intent_id: submitted.id,
                }
            }
            Err(reason) => SignalOutcome::Rejected {
                reason: reason.to_string(),
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectReason;
    use crate::orders::{IntentState, TrackedPosition};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct RecordingSink {
        submissions: AtomicU32,
        flattens: AtomicU32,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                submissions: AtomicU32::new(0),
                flattens: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl IntentSink for RecordingSink {
        async fn submit(&self, mut intent: BracketIntent) -> Result<BracketIntent, RejectReason> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            intent.state = IntentState::Armed;
            Ok(intent)
        }

        async fn flatten(&self, _symbol: Option<&str>) -> anyhow::Result<()> {
            self.flattens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn cancel_order(&self, _order_id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn position(&self, _symbol: &str) -> Option<TrackedPosition> {
            None
        }

        fn enable_breakeven(&self, _symbol: &str, _profit_points: f64) {}
    }

    fn raw(action: &str) -> RawSignal {
        RawSignal {
            action: action.to_string(),
            symbol: "MNQ".to_string(),
            entry: Some(21_425.25),
            stop_loss: Some(21_368.75),
            take_profit_1: Some(21_562.25),
            take_profit_2: None,
        }
    }

    fn intake(sink: Arc<RecordingSink>, policy: OrderPolicyConfig) -> SignalIntake {
        SignalIntake::new(sink, policy, "acct-1".to_string())
    }

    #[test]
    fn unknown_action_rejected_at_boundary() {
        let bad = RawSignal {
            action: "yolo-buy".into(),
            ..raw("open-long")
        };
        assert_eq!(
            normalize(&bad).unwrap_err(),
            NormalizeError::UnknownAction("yolo-buy".into())
        );
    }

    #[test]
    fn entry_requires_price_fields() {
        let mut r = raw("open-long");
        r.stop_loss = None;
        assert_eq!(
            normalize(&r).unwrap_err(),
            NormalizeError::MissingField("stop_loss")
        );

        let mut r = raw("open-short");
        r.entry = None;
        assert_eq!(normalize(&r).unwrap_err(), NormalizeError::MissingField("entry"));

        // Non-entry actions carry no price requirements.
        let mut r = raw("stop-out-long");
        r.entry = None;
        r.stop_loss = None;
        r.take_profit_1 = None;
        assert!(normalize(&r).is_ok());
    }

    #[test]
    fn symbol_is_normalized_uppercase() {
        let mut r = raw("open-long");
        r.symbol = " mnq ".into();
        assert_eq!(normalize(&r).unwrap().symbol, "MNQ");

        r.symbol = "  ".into();
        assert_eq!(normalize(&r).unwrap_err(), NormalizeError::EmptySymbol);
    }

    #[tokio::test]
    async fn duplicate_signal_in_window_submits_once() {
        // Two open-long signals 30 s apart with a 300 s window: exactly one
        // submission reaches the sink.
        let sink = RecordingSink::new();
        let intake = intake(sink.clone(), OrderPolicyConfig::default());

        let first = intake.handle(raw("open-long")).await;
        assert!(matches!(first, SignalOutcome::Accepted { .. }));

        let second = intake.handle(raw("open-long")).await;
        assert!(matches!(second, SignalOutcome::Ignored { .. }));

        assert_eq!(sink.submissions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_actions_debounce_independently() {
        let sink = RecordingSink::new();
        let intake = intake(sink.clone(), OrderPolicyConfig::default());

        intake.handle(raw("open-long")).await;
        intake.handle(raw("open-short")).await;
        assert_eq!(sink.submissions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_entry_signals_ignored_by_default() {
        let sink = RecordingSink::new();
        let intake = intake(sink.clone(), OrderPolicyConfig::default());

        let outcome = intake.handle(raw("tp1-hit-long")).await;
        assert!(matches!(outcome, SignalOutcome::Ignored { .. }));

        let outcome = intake.handle(raw("session-close-short")).await;
        assert!(matches!(outcome, SignalOutcome::Ignored { .. }));

        assert_eq!(sink.submissions.load(Ordering::SeqCst), 0);
        assert_eq!(sink.flattens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exit_signals_flatten_when_policy_allows() {
        let sink = RecordingSink::new();
        let policy = OrderPolicyConfig {
            ignore_non_entry_signals: false,
            ..OrderPolicyConfig::default()
        };
        let intake = intake(sink.clone(), policy);

        let outcome = intake.handle(raw("stop-out-long")).await;
        assert!(matches!(outcome, SignalOutcome::Accepted { .. }));
        assert_eq!(sink.flattens.load(Ordering::SeqCst), 1);
        assert_eq!(sink.submissions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tp1_hit_still_ignored_when_only_tp1_flag_set() {
        let sink = RecordingSink::new();
        let policy = OrderPolicyConfig {
            ignore_non_entry_signals: false,
            ignore_tp1_signals: true,
            ..OrderPolicyConfig::default()
        };
        let intake = intake(sink.clone(), policy);

        let outcome = intake.handle(raw("tp1-hit-short")).await;
        assert!(matches!(outcome, SignalOutcome::Ignored { .. }));
        assert_eq!(sink.flattens.load(Ordering::SeqCst), 0);
    }
}
