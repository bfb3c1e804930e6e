// =============================================================================
// Order Lifecycle Engine — bracket intents from submission to terminal state
// =============================================================================
//
// Contract: a submitted BracketIntent either becomes a live protected
// position, is cleanly cancelled, or fails terminally with a structured
// reason. Orphaned half-states are not acceptable.
//
// Submit path:
//   1. debounce / position cap / compliance gate,
//   2. correlation tag `{strategy}-{account}-{symbol}-{seq}` (idempotent:
//      a tag already in flight never produces a second broker order),
//   3. single-target intents try the broker's native atomic bracket first,
//   4. "brackets not enabled" (and every staged exit) falls back to a plain
//      entry plus a fill-watch task that attaches the protective legs after
//      the fill,
//   5. staged exits: TP1 for round(size × f), TP2 for the remainder, one
//      stop for the full size; the stop is resized when TP1 fills.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::account::AccountTracker;
use crate::broker::client::BrokerClient;
use crate::config::OrderPolicyConfig;
use crate::error::{EngineError, RejectReason};
use crate::notify::{Notifier, NotifyEvent};
use crate::queue::{Priority, TaskQueue, TaskSpec};
use crate::store::{Store, TradeRecord};
use crate::types::{round_to_tick, OrderStatus, OrderType, Side};

use super::{BracketIntent, IntentState, Order, PositionBook, TrackedPosition};

/// Poll interval for the fill watch.
const FILL_WATCH_INTERVAL: Duration = Duration::from_secs(1);
/// The fill watch gives up exactly here; the intent fails and no protective
/// leg is ever placed.
const FILL_WATCH_DEADLINE: Duration = Duration::from_secs(3_600);

/// Seam the strategy scheduler depends on, inverting the scheduler→engine
/// coupling.
#[async_trait]
pub trait IntentSink: Send + Sync {
    /// Submit an intent; returns the updated intent or a structured reason.
    async fn submit(&self, intent: BracketIntent) -> Result<BracketIntent, RejectReason>;
    /// Cancel working orders and close the position for `symbol` (or all).
    async fn flatten(&self, symbol: Option<&str>) -> anyhow::Result<()>;
    async fn cancel_order(&self, order_id: &str) -> anyhow::Result<()>;
    fn position(&self, symbol: &str) -> Option<TrackedPosition>;
    /// Arm the at-most-once breakeven adjustment for a symbol.
    fn enable_breakeven(&self, symbol: &str, profit_points: f64);
}

pub struct OrderEngine {
    broker: Arc<BrokerClient>,
    pub book: Arc<PositionBook>,
    tracker: Arc<AccountTracker>,
    queue: Arc<TaskQueue>,
    notifier: Arc<Notifier>,
    store: Arc<Store>,
    policy: OrderPolicyConfig,
    account_id: String,

    intents: RwLock<HashMap<String, BracketIntent>>,
    orders: RwLock<HashMap<String, Order>>,
    seq: AtomicU64,
    /// (symbol, side) → last accepted submission, for the debounce window.
    recent: RwLock<HashMap<(String, Side), Instant>>,
    inflight_tags: RwLock<HashSet<String>>,
    /// Symbols with an armed breakeven threshold (points of profit).
    breakeven: RwLock<HashMap<String, f64>>,
    last_fill_at: RwLock<Option<Instant>>,
    /// Back-reference for handing owned handles to queued tasks.
    self_ref: std::sync::Weak<OrderEngine>,
}

impl OrderEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<BrokerClient>,
        book: Arc<PositionBook>,
        tracker: Arc<AccountTracker>,
        queue: Arc<TaskQueue>,
        notifier: Arc<Notifier>,
        store: Arc<Store>,
        policy: OrderPolicyConfig,
        account_id: impl Into<String>,
    ) -> Arc<Self> {
        let account_id = account_id.into();
        Arc::new_cyclic(|weak| Self {
            broker,
            book,
            tracker,
            queue,
            notifier,
            store,
            policy,
            account_id,
            intents: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            recent: RwLock::new(HashMap::new()),
            inflight_tags: RwLock::new(HashSet::new()),
            breakeven: RwLock::new(HashMap::new()),
            last_fill_at: RwLock::new(None),
            self_ref: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("engine outlives its tasks")
    }

    pub fn policy(&self) -> &OrderPolicyConfig {
        &self.policy
    }

    /// Moment of the most recent fill, driving the reconciler's adaptive
    /// cadence.
    pub fn last_fill_at(&self) -> Option<Instant> {
        *self.last_fill_at.read()
    }

    pub fn intent(&self, id: &str) -> Option<BracketIntent> {
        self.intents.read().get(id).cloned()
    }

    pub fn intents_snapshot(&self) -> Vec<BracketIntent> {
        self.intents.read().values().cloned().collect()
    }

    pub fn order_record(&self, id: &str) -> Option<Order> {
        self.orders.read().get(id).cloned()
    }

    pub fn working_order_count(&self) -> usize {
        self.orders
            .read()
            .values()
            .filter(|o| !o.status.is_terminal())
            .count()
    }

    // -------------------------------------------------------------------------
    // Submit path
    // -------------------------------------------------------------------------

    pub async fn submit_intent(
        &self,
        mut intent: BracketIntent,
    ) -> Result<BracketIntent, RejectReason> {
        // Idempotence: a tag already in flight never yields a second order.
        if !intent.correlation_tag.is_empty()
            && self.inflight_tags.read().contains(&intent.correlation_tag)
        {
            debug!(tag = %intent.correlation_tag, "duplicate submission ignored (tag in flight)");
            if let Some(existing) = self
                .intents
                .read()
                .values()
                .find(|i| i.correlation_tag == intent.correlation_tag)
            {
                return Ok(existing.clone());
            }
            return Err(RejectReason::Debounced);
        }

        // Debounce per (symbol, side).
        if let Err(reason) = self.check_debounce(&intent) {
            return self.reject(intent, reason);
        }

        // Position cap against the current net position.
        let net = self.book.net_size(&intent.symbol).unsigned_abs() as u32;
        if net + intent.size > self.policy.max_position_size {
            let reason = RejectReason::PositionCap {
                current: net,
                requested: intent.size,
                max: self.policy.max_position_size,
            };
            return self.reject(intent, reason);
        }

        // Compliance gate (DLL / MLL / session kill).
        if let Err(reason) = self.tracker.check_intent(&intent) {
            return self.reject(intent, reason);
        }

        // Correlation tag and bookkeeping.
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        intent.correlation_tag = format!(
            "{}-{}-{}-{}",
            intent.strategy, intent.account_id, intent.symbol, seq
        );
        intent.state = IntentState::Submitting;
        self.inflight_tags
            .write()
            .insert(intent.correlation_tag.clone());
        self.recent.write().insert(
            (intent.symbol.clone(), intent.side),
            Instant::now(),
        );
        self.intents
            .write()
            .insert(intent.id.clone(), intent.clone());

        let result = self.place(intent.clone()).await;

        match &result {
            Ok(updated) => {
                self.intents
                    .write()
                    .insert(updated.id.clone(), updated.clone());
            }
            Err(_) => {
                self.inflight_tags.write().remove(&intent.correlation_tag);
            }
        }
        result
    }

    fn check_debounce(&self, intent: &BracketIntent) -> Result<(), RejectReason> {
        let window = Duration::from_secs(self.policy.debounce_seconds);
        let recent = self.recent.read();
        if let Some(at) = recent.get(&(intent.symbol.clone(), intent.side)) {
            if at.elapsed() < window {
                debug!(
                    symbol = %intent.symbol,
                    side = %intent.side,
                    elapsed_s = at.elapsed().as_secs(),
                    "intent debounced"
                );
                return Err(RejectReason::Debounced);
            }
        }
        Ok(())
    }

    fn reject(
        &self,
        mut intent: BracketIntent,
        reason: RejectReason,
    ) -> Result<BracketIntent, RejectReason> {
        warn!(symbol = %intent.symbol, side = %intent.side, reason = %reason, "intent rejected");
        intent.state = IntentState::Failed;
        intent.reject_reason = Some(reason.clone());
        self.intents
            .write()
            .insert(intent.id.clone(), intent.clone());
        self.notifier.notify(NotifyEvent::IntentRejected {
            symbol: intent.symbol.clone(),
            reason: reason.to_string(),
        });
        self.persist_terminal(&intent);
        Err(reason)
    }

    /// Whether this intent exits in stages (TP1 fraction + runner to TP2).
    fn is_staged(&self, intent: &BracketIntent) -> bool {
        intent.take_profit_2.is_some() && !self.policy.close_entire_at_tp1
    }

    async fn place(&self, mut intent: BracketIntent) -> Result<BracketIntent, RejectReason> {
        let contract = match self.broker.resolve_contract(&intent.symbol).await {
            Ok(c) => c,
            Err(e) => {
                return self
                    .reject(intent, RejectReason::BrokerRejected { message: e.to_string() });
            }
        };

        // A staged exit needs two targets, which the native single-TP
        // bracket cannot express; it always takes the fallback path.
        if !self.is_staged(&intent) {
            match self
                .broker
                .place_bracket(
                    &self.account_id,
                    &contract.contract_id,
                    intent.side,
                    intent.entry_type,
                    intent.size,
                    intent.entry_price,
                    intent.stop_loss,
                    intent.take_profit_1,
                    &intent.correlation_tag,
                )
                .await
            {
                Ok(entry_id) => {
                    intent.entry_order_id = Some(entry_id.clone());
                    intent.state = IntentState::Armed;
                    self.record_order(&intent, &entry_id, intent.entry_type, intent.size);
                    info!(
                        tag = %intent.correlation_tag,
                        entry_id = %entry_id,
                        "native bracket armed"
                    );
                    self.notifier.notify(NotifyEvent::BracketPlaced {
                        symbol: intent.symbol.clone(),
                        side: intent.side.to_string(),
                        size: intent.size,
                        entry: intent.entry_price.unwrap_or(0.0),
                        stop_loss: intent.stop_loss,
                        take_profit: intent.take_profit_1,
                    });
                    return Ok(intent);
                }
                Err(e) if e.is_brackets_disabled() => {
                    info!(tag = %intent.correlation_tag, "native brackets disabled — falling back");
                }
                Err(EngineError::Rejected { message, .. }) => {
                    return self.reject(intent, RejectReason::BrokerRejected { message });
                }
                Err(e) => {
                    return self
                        .reject(intent, RejectReason::BrokerRejected { message: e.to_string() });
                }
            }
        }

        // Fallback / staged path: plain entry + fill watch.
        match self
            .broker
            .place_order(
                &self.account_id,
                &contract.contract_id,
                intent.side,
                intent.entry_type,
                intent.size,
                if intent.entry_type == OrderType::Limit {
                    intent.entry_price
                } else {
                    None
                },
                if matches!(intent.entry_type, OrderType::Stop | OrderType::StopLimit) {
                    intent.entry_price
                } else {
                    None
                },
                &intent.correlation_tag,
            )
            .await
        {
            Ok(entry_id) => {
                intent.entry_order_id = Some(entry_id.clone());
                intent.state = IntentState::EntryWorking;
                self.record_order(&intent, &entry_id, intent.entry_type, intent.size);
                self.spawn_fill_watch(intent.id.clone(), entry_id.clone())
                    .await;
                info!(tag = %intent.correlation_tag, entry_id = %entry_id, "entry working, fill watch queued");
                self.notifier.notify(NotifyEvent::BracketPlaced {
                    symbol: intent.symbol.clone(),
                    side: intent.side.to_string(),
                    size: intent.size,
                    entry: intent.entry_price.unwrap_or(0.0),
                    stop_loss: intent.stop_loss,
                    take_profit: intent.take_profit_1,
                });
                Ok(intent)
            }
            Err(EngineError::Rejected { message, .. }) => {
                self.reject(intent, RejectReason::BrokerRejected { message })
            }
            Err(e) => self.reject(intent, RejectReason::BrokerRejected { message: e.to_string() }),
        }
    }

    fn record_order(&self, intent: &BracketIntent, order_id: &str, order_type: OrderType, size: u32) {
        self.orders.write().insert(
            order_id.to_string(),
            Order {
                id: order_id.to_string(),
                account_id: intent.account_id.clone(),
                symbol: intent.symbol.clone(),
                side: intent.side,
                order_type,
                size,
                limit_price: if order_type == OrderType::Limit {
                    intent.entry_price
                } else {
                    None
                },
                stop_price: if matches!(order_type, OrderType::Stop | OrderType::StopLimit) {
                    intent.entry_price
                } else {
                    None
                },
                status: OrderStatus::Working,
                parent_id: None,
                custom_tag: Some(intent.correlation_tag.clone()),
                filled_size: 0,
                fill_price: None,
            },
        );
    }

    // -------------------------------------------------------------------------
    // Fill watch (fallback path)
    // -------------------------------------------------------------------------

    async fn spawn_fill_watch(&self, intent_id: String, entry_id: String) {
        let engine = self.arc();
        let spec = TaskSpec::new(format!("fill-watch:{entry_id}"), Priority::High)
            .with_timeout(FILL_WATCH_DEADLINE + Duration::from_secs(60))
            .with_max_retries(0);

        let result = self
            .queue
            .submit(spec, move |cancel| {
                let engine = Arc::clone(&engine);
                let intent_id = intent_id.clone();
                let entry_id = entry_id.clone();
                async move {
                    engine.fill_watch(intent_id, entry_id, cancel).await;
                    Ok(())
                }
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to queue fill watch");
        }
    }

    /// Poll the entry order once per second for up to one hour. On fill,
    /// attach the protective legs; on cancel/reject or deadline, the intent
    /// fails and nothing protective is ever placed.
    async fn fill_watch(
        self: Arc<Self>,
        intent_id: String,
        entry_id: String,
        cancel: crate::queue::CancelToken,
    ) {
        let started = Instant::now();

        loop {
            if cancel.is_cancelled() {
                debug!(entry_id = %entry_id, "fill watch cancelled");
                return;
            }
            if started.elapsed() >= FILL_WATCH_DEADLINE {
                warn!(entry_id = %entry_id, "fill watch deadline reached — failing intent");
                let _ = self.broker.cancel_order(&entry_id).await;
                self.finish_intent(&intent_id, IntentState::Failed, None);
                return;
            }

            match self.broker.get_order(&entry_id).await {
                Ok(order) => {
                    self.orders.write().insert(order.id.clone(), order.clone());
                    match order.status {
                        OrderStatus::Filled => {
                            let price = order.fill_price.unwrap_or(0.0);
                            self.on_entry_filled(&intent_id, price, order.size).await;
                            return;
                        }
                        OrderStatus::Cancelled => {
                            self.finish_intent(&intent_id, IntentState::Cancelled, None);
                            return;
                        }
                        OrderStatus::Rejected => {
                            self.finish_intent(&intent_id, IntentState::Failed, None);
                            return;
                        }
                        _ => {}
                    }
                }
                Err(EngineError::NotFound(_)) => {
                    warn!(entry_id = %entry_id, "entry order vanished — failing intent");
                    self.finish_intent(&intent_id, IntentState::Failed, None);
                    return;
                }
                Err(e) => {
                    debug!(entry_id = %entry_id, error = %e, "fill watch poll failed — will retry");
                }
            }

            tokio::time::sleep(FILL_WATCH_INTERVAL).await;
        }
    }

    /// Entry filled on the fallback path: apply the fill and attach stop and
    /// target(s).
    pub async fn on_entry_filled(&self, intent_id: &str, price: f64, size: u32) {
        let Some(intent) = self.intent(intent_id) else {
            warn!(intent_id, "entry fill for unknown intent");
            return;
        };

        let point_value = self.tracker.point_value(&intent.symbol);
        self.book
            .apply_fill(&intent.symbol, intent.side, size, price, point_value);
        *self.last_fill_at.write() = Some(Instant::now());

        self.notifier.notify(NotifyEvent::EntryFilled {
            symbol: intent.symbol.clone(),
            side: intent.side.to_string(),
            size,
            price,
        });

        if let Err(e) = self.attach_protection(&intent).await {
            warn!(intent_id, error = %e, "failed to attach protective legs — sweep will retry");
        }
    }

    /// Place stop-loss and take-profit legs for an intent whose entry is
    /// filled. One stop covers the full size; staged exits split the targets.
    async fn attach_protection(&self, intent: &BracketIntent) -> anyhow::Result<()> {
        let contract = self.broker.resolve_contract(&intent.symbol).await?;
        let exit_side = intent.side.opposite();

        let stop_id = self
            .broker
            .place_order(
                &self.account_id,
                &contract.contract_id,
                exit_side,
                OrderType::Stop,
                intent.size,
                None,
                Some(intent.stop_loss),
                &format!("{}-sl", intent.correlation_tag),
            )
            .await?;

        let (q1, q2) = if self.is_staged(intent) {
            BracketIntent::staged_quantities(intent.size, self.policy.tp1_fraction)
        } else {
            (intent.size, 0)
        };

        let tp1_id = if q1 > 0 {
            Some(
                self.broker
                    .place_order(
                        &self.account_id,
                        &contract.contract_id,
                        exit_side,
                        OrderType::Limit,
                        q1,
                        Some(intent.take_profit_1),
                        None,
                        &format!("{}-tp1", intent.correlation_tag),
                    )
                    .await?,
            )
        } else {
            None
        };

        let tp2_id = match (q2, intent.take_profit_2) {
            (q, Some(tp2)) if q > 0 => Some(
                self.broker
                    .place_order(
                        &self.account_id,
                        &contract.contract_id,
                        exit_side,
                        OrderType::Limit,
                        q,
                        Some(tp2),
                        None,
                        &format!("{}-tp2", intent.correlation_tag),
                    )
                    .await?,
            ),
            _ => None,
        };

        self.book.set_protection(
            &intent.symbol,
            Some(stop_id.clone()),
            tp1_id.clone(),
            tp2_id.clone(),
        );

        {
            let mut intents = self.intents.write();
            if let Some(stored) = intents.get_mut(&intent.id) {
                stored.stop_order_id = Some(stop_id);
                stored.tp1_order_id = tp1_id;
                stored.tp2_order_id = tp2_id;
                stored.state = IntentState::Protected;
            }
        }

        info!(tag = %intent.correlation_tag, "protective legs attached — intent PROTECTED");
        Ok(())
    }

    /// TP1 filled on a staged exit: shrink the stop to cover the remainder.
    pub async fn on_tp1_filled(&self, intent_id: &str) {
        let Some(intent) = self.intent(intent_id) else {
            return;
        };
        let (_q1, q2) = BracketIntent::staged_quantities(intent.size, self.policy.tp1_fraction);
        if q2 == 0 {
            return;
        }
        if let Some(stop_id) = intent.stop_order_id.as_deref() {
            match self.broker.modify_order(stop_id, None, Some(q2)).await {
                Ok(()) => {
                    info!(tag = %intent.correlation_tag, remaining = q2, "stop resized after TP1 fill")
                }
                Err(e) => warn!(stop_id, error = %e, "failed to resize stop after TP1"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Breakeven
    // -------------------------------------------------------------------------

    /// Evaluate every armed breakeven threshold against the live position.
    /// Fires at most once per position; the arm is consumed on trigger.
    pub async fn apply_breakeven_checks(&self) {
        let armed: Vec<(String, f64)> = self
            .breakeven
            .read()
            .iter()
            .map(|(s, p)| (s.clone(), *p))
            .collect();

        for (symbol, threshold) in armed {
            let Some(pos) = self.book.position(&symbol) else {
                // Position closed: the arm auto-disables.
                self.breakeven.write().remove(&symbol);
                continue;
            };
            let profit_points = (pos.last_price - pos.avg_entry) * pos.side.sign();
            if profit_points < threshold || pos.breakeven_done {
                continue;
            }
            let Some(stop_id) = pos.stop_order_id.clone() else {
                continue;
            };
            if !self.book.mark_breakeven_done(&symbol) {
                continue;
            }
            match self
                .broker
                .modify_order(&stop_id, Some(pos.avg_entry), None)
                .await
            {
                Ok(()) => {
                    info!(symbol = %symbol, new_stop = pos.avg_entry, "breakeven adjustment applied");
                    self.notifier.notify(NotifyEvent::BreakevenAdjusted {
                        symbol: symbol.clone(),
                        new_stop: pos.avg_entry,
                    });
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "breakeven modify failed"),
            }
            self.breakeven.write().remove(&symbol);
        }
    }

    // -------------------------------------------------------------------------
    // Flatten
    // -------------------------------------------------------------------------

    /// Cancel working orders for the target and market out the position.
    /// The next reconciler sweep confirms the result.
    pub async fn flatten_symbol(&self, symbol: &str) -> anyhow::Result<()> {
        info!(symbol, "flattening");

        // Cancel everything the engine knows is working for the symbol.
        let working: Vec<String> = self
            .orders
            .read()
            .values()
            .filter(|o| o.symbol == symbol && !o.status.is_terminal())
            .map(|o| o.id.clone())
            .collect();
        for order_id in working {
            if let Err(e) = self.broker.cancel_order(&order_id).await {
                warn!(order_id = %order_id, error = %e, "cancel during flatten failed");
            }
        }

        let Some(pos) = self.book.position(symbol) else {
            return Ok(());
        };

        let contract = self.broker.resolve_contract(symbol).await?;
        let exit_side = pos.side.closing_side();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let tag = format!("flatten-{}-{}-{}", self.account_id, symbol, seq);

        let order_id = self
            .broker
            .place_order(
                &self.account_id,
                &contract.contract_id,
                exit_side,
                OrderType::Market,
                pos.size,
                None,
                None,
                &tag,
            )
            .await?;

        info!(symbol, order_id = %order_id, size = pos.size, "flatten order submitted");
        Ok(())
    }

    pub async fn flatten_all(&self) -> anyhow::Result<()> {
        let symbols: Vec<String> = self.book.all().into_iter().map(|p| p.symbol).collect();
        for symbol in symbols {
            if let Err(e) = self.flatten_symbol(&symbol).await {
                warn!(symbol = %symbol, error = %e, "flatten failed for symbol");
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Auto-bracket (unprotected-position sweep)
    // -------------------------------------------------------------------------

    /// Attach a default stop/target pair to an unprotected position: stop at
    /// entry ∓ N ticks, target at entry ± M ticks.
    pub async fn auto_bracket(&self, symbol: &str) -> anyhow::Result<()> {
        let Some(pos) = self.book.position(symbol) else {
            return Ok(());
        };
        if pos.is_protected() {
            return Ok(());
        }

        let contract = self.broker.resolve_contract(symbol).await?;
        let tick = contract.tick_size;
        let sign = pos.side.sign();
        let stop_price = round_to_tick(
            pos.avg_entry - sign * self.policy.auto_bracket_stop_ticks as f64 * tick,
            tick,
        );
        let target_price = round_to_tick(
            pos.avg_entry + sign * self.policy.auto_bracket_target_ticks as f64 * tick,
            tick,
        );

        let exit_side = pos.side.closing_side();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let tag = format!("autobracket-{}-{}-{}", self.account_id, symbol, seq);

        let stop_id = self
            .broker
            .place_order(
                &self.account_id,
                &contract.contract_id,
                exit_side,
                OrderType::Stop,
                pos.size,
                None,
                Some(stop_price),
                &format!("{tag}-sl"),
            )
            .await?;

        let target_id = self
            .broker
            .place_order(
                &self.account_id,
                &contract.contract_id,
                exit_side,
                OrderType::Limit,
                pos.size,
                Some(target_price),
                None,
                &format!("{tag}-tp"),
            )
            .await?;

        self.book
            .set_protection(symbol, Some(stop_id), Some(target_id), None);

        info!(
            symbol,
            stop_price,
            target_price,
            "auto-bracket attached to unprotected position"
        );
        Ok(())
    }

    /// Compute the default auto-bracket prices for a position.
    pub fn auto_bracket_prices(&self, pos: &TrackedPosition, tick: f64) -> (f64, f64) {
        let sign = pos.side.sign();
        (
            round_to_tick(
                pos.avg_entry - sign * self.policy.auto_bracket_stop_ticks as f64 * tick,
                tick,
            ),
            round_to_tick(
                pos.avg_entry + sign * self.policy.auto_bracket_target_ticks as f64 * tick,
                tick,
            ),
        )
    }

    // -------------------------------------------------------------------------
    // Fill application (shared with the reconciler)
    // -------------------------------------------------------------------------

    /// Apply a broker-reported terminal order to the book and ledgers.
    /// Idempotent per order id: an order already recorded as filled is not
    /// applied twice.
    pub async fn apply_order_update(&self, order: &Order) {
        let already_filled = self
            .orders
            .read()
            .get(&order.id)
            .map(|o| o.status == OrderStatus::Filled)
            .unwrap_or(false);

        self.orders.write().insert(order.id.clone(), order.clone());

        // A cancelled or rejected entry order terminates its intent.
        if matches!(order.status, OrderStatus::Cancelled | OrderStatus::Rejected) {
            let intent_id = self
                .intents
                .read()
                .values()
                .find(|i| {
                    i.entry_order_id.as_deref() == Some(order.id.as_str())
                        && !i.state.is_terminal()
                })
                .map(|i| i.id.clone());
            if let Some(id) = intent_id {
                let state = if order.status == OrderStatus::Cancelled {
                    IntentState::Cancelled
                } else {
                    IntentState::Failed
                };
                self.finish_intent(&id, state, None);
            }
            return;
        }

        if order.status != OrderStatus::Filled || already_filled {
            return;
        }

        let price = order.fill_price.unwrap_or(0.0);
        let point_value = self.tracker.point_value(&order.symbol);
        let entry_before = self.book.position(&order.symbol).map(|p| p.avg_entry);
        let realized = self
            .book
            .apply_fill(&order.symbol, order.side, order.size, price, point_value);
        *self.last_fill_at.write() = Some(Instant::now());

        if realized != 0.0 {
            self.tracker.record_realized(realized);
            let record = TradeRecord {
                account_id: self.account_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side.to_string(),
                size: order.size,
                entry_price: entry_before.unwrap_or(price),
                exit_price: price,
                realized_pnl: realized,
                closed_at: chrono::Utc::now(),
            };
            if let Err(e) = self.store.append_trade(&record).await {
                debug!(error = %e, "trade record write skipped (store unavailable)");
            }
            self.notifier.notify(NotifyEvent::ExitFilled {
                symbol: order.symbol.clone(),
                reason: order
                    .custom_tag
                    .clone()
                    .unwrap_or_else(|| "exit".to_string()),
                size: order.size,
                price,
                realized_pnl: realized,
            });
        }

        // Route fills to the owning intent's state machine.
        self.route_fill_to_intent(order).await;
    }

    async fn route_fill_to_intent(&self, order: &Order) {
        let Some(tag) = order.custom_tag.as_deref() else {
            return;
        };

        // Leg tags look like "{tag}-sl" / "{tag}-tp1" / "{tag}-tp2".
        let (base_tag, leg) = match tag.rsplit_once('-') {
            Some((base, leg @ ("sl" | "tp1" | "tp2" | "tp"))) => (base.to_string(), Some(leg)),
            _ => (tag.to_string(), None),
        };

        let intent_id = self
            .intents
            .read()
            .values()
            .find(|i| i.correlation_tag == base_tag)
            .map(|i| i.id.clone());
        let Some(intent_id) = intent_id else {
            return;
        };

        match leg {
            None => {
                // Entry leg of an armed native bracket.
                let mut promote = false;
                {
                    let mut intents = self.intents.write();
                    if let Some(intent) = intents.get_mut(&intent_id) {
                        if intent.state == IntentState::Armed {
                            intent.state = IntentState::Protected;
                            promote = true;
                        }
                    }
                }
                if promote {
                    info!(tag = %base_tag, "armed entry filled — intent PROTECTED");
                }
            }
            Some("tp1") => {
                let staged = self
                    .intent(&intent_id)
                    .map(|i| self.is_staged(&i))
                    .unwrap_or(false);
                if staged && self.book.position(&order.symbol).is_some() {
                    self.on_tp1_filled(&intent_id).await;
                } else {
                    self.finish_intent(&intent_id, IntentState::Closed, None);
                }
            }
            Some(_) => {
                // Stop or final target: the position is done when flat.
                if self.book.position(&order.symbol).is_none() {
                    self.finish_intent(&intent_id, IntentState::Closed, None);
                }
            }
        }
    }

    /// Close any still-protected intents for a symbol the broker reports
    /// flat. Called from the reconciler after a position drop (native
    /// bracket legs carry broker-side ids we never see fill events for).
    pub fn close_intents_for_symbol(&self, symbol: &str) {
        let ids: Vec<String> = self
            .intents
            .read()
            .values()
            .filter(|i| i.symbol == symbol && i.state == IntentState::Protected)
            .map(|i| i.id.clone())
            .collect();
        for id in ids {
            self.finish_intent(&id, IntentState::Closed, None);
        }
    }

    /// Drive an intent to a terminal state and release its tag.
    pub fn finish_intent(&self, intent_id: &str, state: IntentState, reason: Option<RejectReason>) {
        debug_assert!(state.is_terminal());
        let finished = {
            let mut intents = self.intents.write();
            match intents.get_mut(intent_id) {
                Some(intent) if !intent.state.is_terminal() => {
                    intent.state = state;
                    intent.reject_reason = reason;
                    Some(intent.clone())
                }
                _ => None,
            }
        };

        if let Some(intent) = finished {
            self.inflight_tags.write().remove(&intent.correlation_tag);
            info!(tag = %intent.correlation_tag, state = %state, "intent reached terminal state");
            self.persist_terminal(&intent);
        }
    }

    /// Terminal intents are written through so a restart can reconstruct the
    /// audit trail. Best-effort: the in-memory record is authoritative for
    /// the running session.
    fn persist_terminal(&self, intent: &BracketIntent) {
        if intent.correlation_tag.is_empty() {
            return;
        }
        let store = Arc::clone(&self.store);
        let account_id = intent.account_id.clone();
        let name = format!("intent:{}", intent.correlation_tag);
        let state = json!(intent);
        tokio::spawn(async move {
            if let Err(e) = store.upsert_strategy_state(&account_id, &name, &state).await {
                debug!(error = %e, "terminal intent persist skipped");
            }
        });
    }
}

#[async_trait]
impl IntentSink for OrderEngine {
    async fn submit(&self, intent: BracketIntent) -> Result<BracketIntent, RejectReason> {
        self.submit_intent(intent).await
    }

    async fn flatten(&self, symbol: Option<&str>) -> anyhow::Result<()> {
        match symbol {
            Some(s) => self.flatten_symbol(s).await,
            None => self.flatten_all().await,
        }
    }

    async fn cancel_order(&self, order_id: &str) -> anyhow::Result<()> {
        self.broker.cancel_order(order_id).await?;
        Ok(())
    }

    fn position(&self, symbol: &str) -> Option<TrackedPosition> {
        self.book.position(symbol)
    }

    fn enable_breakeven(&self, symbol: &str, profit_points: f64) {
        self.breakeven
            .write()
            .insert(symbol.to_string(), profit_points);
    }
}

impl std::fmt::Debug for OrderEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderEngine")
            .field("account_id", &self.account_id)
            .field("intents", &self.intents.read().len())
            .field("orders", &self.orders.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::client::Credentials;
    use crate::orders::PositionSide;

    fn engine() -> Arc<OrderEngine> {
        engine_with_policy(OrderPolicyConfig::default())
    }

    fn engine_with_policy(policy: OrderPolicyConfig) -> Arc<OrderEngine> {
        let broker = Arc::new(BrokerClient::new(
            "https://broker.invalid",
            Credentials {
                username: "u".into(),
                api_key: "k".into(),
            },
        ));
        let book = Arc::new(PositionBook::new());
        let (tracker, _rx) =
            AccountTracker::new("acct-1", 50_000.0, 1_000.0, 2_000.0, book.clone());
        tracker.set_point_value("MNQ", 2.0);
        let queue = TaskQueue::new(1, 100);
        OrderEngine::new(
            broker,
            book,
            tracker,
            queue,
            Arc::new(Notifier::new("")),
            Arc::new(Store::disconnected()),
            policy,
            "acct-1",
        )
    }

    fn intent(side: Side, size: u32) -> BracketIntent {
        BracketIntent::new(
            "overnight",
            "acct-1",
            "MNQ",
            side,
            OrderType::Stop,
            Some(21_425.25),
            size,
            21_368.75,
            21_562.25,
            None,
        )
    }

    #[tokio::test]
    async fn debounce_rejects_second_intent_in_window() {
        let e = engine();
        // Seed the debounce map as if a submission just happened.
        e.recent
            .write()
            .insert(("MNQ".to_string(), Side::Buy), Instant::now());

        let result = e.submit_intent(intent(Side::Buy, 1)).await;
        assert!(matches!(result, Err(RejectReason::Debounced)));

        // Opposite side is a different action and passes the debounce (it
        // then fails later at the broker, which is fine for this test).
        let result = e.submit_intent(intent(Side::Sell, 1)).await;
        assert!(!matches!(result, Err(RejectReason::Debounced)));
    }

    #[tokio::test]
    async fn position_cap_blocks_oversized_intent() {
        let e = engine();
        // Existing net long 3 with max 4: a 2-lot intent must be refused.
        e.book.apply_fill("MNQ", Side::Buy, 3, 21_000.0, 2.0);

        let result = e.submit_intent(intent(Side::Buy, 2)).await;
        match result {
            Err(RejectReason::PositionCap {
                current,
                requested,
                max,
            }) => {
                assert_eq!((current, requested, max), (3, 2, 4));
            }
            other => panic!("expected position cap, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_intent_is_terminal_with_reason() {
        let e = engine();
        e.book.apply_fill("MNQ", Side::Buy, 4, 21_000.0, 2.0);

        let _ = e.submit_intent(intent(Side::Buy, 1)).await;
        let stored: Vec<_> = e.intents_snapshot();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].state, IntentState::Failed);
        assert!(matches!(
            stored[0].reject_reason,
            Some(RejectReason::PositionCap { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_correlation_tag_yields_no_second_submission() {
        let e = engine();

        // Simulate an in-flight intent with an assigned tag.
        let mut first = intent(Side::Buy, 1);
        first.correlation_tag = "overnight-acct-1-MNQ-0".to_string();
        first.state = IntentState::EntryWorking;
        e.intents.write().insert(first.id.clone(), first.clone());
        e.inflight_tags
            .write()
            .insert(first.correlation_tag.clone());

        let resubmitted = e.submit_intent(first.clone()).await.unwrap();
        assert_eq!(resubmitted.id, first.id);
        assert_eq!(resubmitted.state, IntentState::EntryWorking);
        // No broker order was attempted: the engine's order map is empty.
        assert_eq!(e.working_order_count(), 0);
    }

    #[tokio::test]
    async fn staged_quantities_follow_policy() {
        let e = engine();
        let mut i = intent(Side::Buy, 4);
        i.take_profit_2 = Some(21_600.0);
        assert!(e.is_staged(&i));

        let policy = OrderPolicyConfig {
            close_entire_at_tp1: true,
            ..OrderPolicyConfig::default()
        };
        let e2 = engine_with_policy(policy);
        assert!(!e2.is_staged(&i));

        i.take_profit_2 = None;
        assert!(!e.is_staged(&i));
    }

    #[tokio::test]
    async fn auto_bracket_prices_use_tick_distances() {
        // Scenario: long 2 @ 25300 with defaults 10/20 ticks on a 0.25-tick
        // contract → stop 25297.50, target 25305.00.
        let e = engine();
        e.book.apply_fill("MNQ", Side::Buy, 2, 25_300.0, 2.0);
        let pos = e.book.position("MNQ").unwrap();

        let (stop, target) = e.auto_bracket_prices(&pos, 0.25);
        assert_eq!(stop, 25_297.5);
        assert_eq!(target, 25_305.0);

        // Short positions mirror.
        e.book.apply_fill("MNQ", Side::Sell, 4, 25_300.0, 2.0); // flip to short 2
        let pos = e.book.position("MNQ").unwrap();
        assert_eq!(pos.side, PositionSide::Short);
        let (stop, target) = e.auto_bracket_prices(&pos, 0.25);
        assert_eq!(stop, 25_302.5);
        assert_eq!(target, 25_295.0);
    }

    #[tokio::test]
    async fn apply_order_update_is_idempotent() {
        let e = engine();

        let order = Order {
            id: "x-1".into(),
            account_id: "acct-1".into(),
            symbol: "MNQ".into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            size: 2,
            limit_price: None,
            stop_price: None,
            status: OrderStatus::Filled,
            parent_id: None,
            custom_tag: None,
            filled_size: 2,
            fill_price: Some(21_000.0),
        };

        e.apply_order_update(&order).await;
        assert_eq!(e.book.net_size("MNQ"), 2);

        // Re-applying the same terminal order must not double the position.
        e.apply_order_update(&order).await;
        assert_eq!(e.book.net_size("MNQ"), 2);
    }

    #[tokio::test]
    async fn exit_fill_records_realized_pnl() {
        let e = engine();
        e.book.apply_fill("MNQ", Side::Buy, 3, 21_000.0, 2.0);

        let exit = Order {
            id: "x-2".into(),
            account_id: "acct-1".into(),
            symbol: "MNQ".into(),
            side: Side::Sell,
            order_type: OrderType::Limit,
            size: 3,
            limit_price: Some(21_050.0),
            stop_price: None,
            status: OrderStatus::Filled,
            parent_id: None,
            custom_tag: None,
            filled_size: 3,
            fill_price: Some(21_050.0),
        };
        e.apply_order_update(&exit).await;

        assert!(e.book.position("MNQ").is_none());
        // 50 pts × $2 × 3 = 300 realized.
        let state = e.tracker.state();
        assert!((state.realized_today - 300.0).abs() < 1e-9);
        assert!(e.last_fill_at().is_some());
    }

    #[tokio::test]
    async fn cancelled_entry_order_terminates_intent() {
        let e = engine();
        let mut i = intent(Side::Buy, 1);
        i.correlation_tag = "overnight-acct-1-MNQ-3".to_string();
        i.state = IntentState::EntryWorking;
        i.entry_order_id = Some("ord-77".to_string());
        e.intents.write().insert(i.id.clone(), i.clone());
        e.inflight_tags.write().insert(i.correlation_tag.clone());

        let cancelled = Order {
            id: "ord-77".into(),
            account_id: "acct-1".into(),
            symbol: "MNQ".into(),
            side: Side::Buy,
            order_type: OrderType::Stop,
            size: 1,
            limit_price: None,
            stop_price: Some(21_425.25),
            status: OrderStatus::Cancelled,
            parent_id: None,
            custom_tag: Some(i.correlation_tag.clone()),
            filled_size: 0,
            fill_price: None,
        };
        e.apply_order_update(&cancelled).await;

        assert_eq!(e.intent(&i.id).unwrap().state, IntentState::Cancelled);
        assert!(!e.inflight_tags.read().contains(&i.correlation_tag));
        // No position was ever created.
        assert_eq!(e.book.net_size("MNQ"), 0);
    }

    #[tokio::test]
    async fn flat_symbol_closes_protected_intents() {
        let e = engine();
        let mut i = intent(Side::Buy, 2);
        i.correlation_tag = "overnight-acct-1-MNQ-4".to_string();
        i.state = IntentState::Protected;
        e.intents.write().insert(i.id.clone(), i.clone());
        e.inflight_tags.write().insert(i.correlation_tag.clone());

        e.close_intents_for_symbol("MNQ");
        assert_eq!(e.intent(&i.id).unwrap().state, IntentState::Closed);
    }

    #[tokio::test]
    async fn finish_intent_releases_tag_and_is_terminal_once() {
        let e = engine();
        let mut i = intent(Side::Buy, 1);
        i.correlation_tag = "overnight-acct-1-MNQ-9".to_string();
        i.state = IntentState::Protected;
        e.intents.write().insert(i.id.clone(), i.clone());
        e.inflight_tags.write().insert(i.correlation_tag.clone());

        e.finish_intent(&i.id, IntentState::Closed, None);
        assert_eq!(e.intent(&i.id).unwrap().state, IntentState::Closed);
        assert!(!e.inflight_tags.read().contains(&i.correlation_tag));

        // A second terminal transition is a no-op.
        e.finish_intent(&i.id, IntentState::Failed, None);
        assert_eq!(e.intent(&i.id).unwrap().state, IntentState::Closed);
    }
}
