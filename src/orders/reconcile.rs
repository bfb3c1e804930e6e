// =============================================================================
// Reconciler — aligns broker-reported state with engine-tracked state
// =============================================================================
//
// Runs at an adaptive cadence: 10 s while any order is working or a fill
// landed in the last five minutes, 30 s when idle. Each pass:
//   1. pulls open orders and positions from the broker,
//   2. resolves engine-tracked orders that left the broker's open set
//      (applying fills exactly once through the engine),
//   3. imports externally created positions and drops positions the broker
//      no longer reports (flatten confirmation),
//   4. detects unprotected positions and queues an auto-bracket task,
//   5. evaluates pending breakeven adjustments.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::client::{BrokerClient, BrokerPosition};
use crate::queue::{Priority, TaskQueue, TaskSpec};
use crate::types::Side;

use super::engine::OrderEngine;
use super::TrackedPosition;

/// Cadence while orders are working or fills are fresh.
const ACTIVE_INTERVAL: Duration = Duration::from_secs(10);
/// Cadence when idle.
const IDLE_INTERVAL: Duration = Duration::from_secs(30);
/// A fill within this window keeps the reconciler on the active cadence.
const RECENT_FILL_WINDOW: Duration = Duration::from_secs(300);

/// Summary of a single reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub orders_resolved: u32,
    pub orphan_orders: u32,
    pub positions_imported: u32,
    pub positions_dropped: u32,
    pub unprotected_swept: u32,
    pub timestamp: String,
}

/// Pick the next sleep interval from the engine's activity.
pub fn cadence(working_orders: usize, recent_fill: bool) -> Duration {
    if working_orders > 0 || recent_fill {
        ACTIVE_INTERVAL
    } else {
        IDLE_INTERVAL
    }
}

/// Position-set diff: broker is the source of truth.
/// Returns (symbols to import into the book, symbols to drop from it).
pub fn diff_positions(
    book: &[TrackedPosition],
    broker: &[BrokerPosition],
) -> (Vec<BrokerPosition>, Vec<String>) {
    let book_symbols: HashSet<&str> = book.iter().map(|p| p.symbol.as_str()).collect();
    let broker_map: HashMap<&str, &BrokerPosition> = broker
        .iter()
        .filter(|p| p.size != 0)
        .map(|p| (p.symbol.as_str(), p))
        .collect();

    let to_import = broker_map
        .values()
        .filter(|p| !book_symbols.contains(p.symbol.as_str()))
        .map(|p| (*p).clone())
        .collect();

    let to_drop = book
        .iter()
        .filter(|p| !broker_map.contains_key(p.symbol.as_str()))
        .map(|p| p.symbol.clone())
        .collect();

    (to_import, to_drop)
}

/// Run the reconciler forever.
pub async fn run_reconciler(
    engine: Arc<OrderEngine>,
    broker: Arc<BrokerClient>,
    queue: Arc<TaskQueue>,
    account_id: String,
    protect_positions: bool,
) {
    info!("reconciler starting");
    loop {
        match reconcile_once(&engine, &broker, &queue, &account_id, protect_positions).await {
            Ok(report) => {
                debug!(
                    orders_resolved = report.orders_resolved,
                    orphans = report.orphan_orders,
                    imported = report.positions_imported,
                    dropped = report.positions_dropped,
                    swept = report.unprotected_swept,
                    "reconcile pass complete"
                );
            }
            Err(e) => {
                warn!(error = %e, "reconcile pass failed");
            }
        }

        let recent_fill = engine
            .last_fill_at()
            .map(|t| t.elapsed() < RECENT_FILL_WINDOW)
            .unwrap_or(false);
        tokio::time::sleep(cadence(engine.working_order_count(), recent_fill)).await;
    }
}

/// One reconciliation pass.
pub async fn reconcile_once(
    engine: &Arc<OrderEngine>,
    broker: &Arc<BrokerClient>,
    queue: &Arc<TaskQueue>,
    account_id: &str,
    protect_positions: bool,
) -> Result<ReconcileReport> {
    let open_orders = broker.list_open_orders(account_id).await?;
    let broker_positions = broker.list_open_positions(account_id).await?;

    let open_ids: HashSet<&str> = open_orders.iter().map(|o| o.id.as_str()).collect();

    // ── 1. Resolve engine-tracked orders that left the open set ─────────
    let tracked: Vec<String> = engine
        .intents_snapshot()
        .iter()
        .flat_map(|i| {
            [
                i.entry_order_id.clone(),
                i.stop_order_id.clone(),
                i.tp1_order_id.clone(),
                i.tp2_order_id.clone(),
            ]
        })
        .flatten()
        .collect();

    let mut orders_resolved = 0u32;
    for order_id in tracked {
        let record = engine.order_record(&order_id);
        let already_terminal = record
            .as_ref()
            .map(|o| o.status.is_terminal())
            .unwrap_or(false);
        if already_terminal || open_ids.contains(order_id.as_str()) {
            continue;
        }
        match broker.get_order(&order_id).await {
            Ok(order) => {
                if order.status.is_terminal() {
                    engine.apply_order_update(&order).await;
                    orders_resolved += 1;
                } else {
                    // Still live, just absent from the page we fetched.
                    engine.apply_order_update(&order).await;
                }
            }
            Err(e) => {
                debug!(order_id = %order_id, error = %e, "order status fetch failed");
            }
        }
    }

    // Keep the engine's view of still-open orders current.
    for order in &open_orders {
        engine.apply_order_update(order).await;
    }

    // ── 2. Orphan orders (broker-side, unknown tag) ─────────────────────
    let orphan_orders = open_orders
        .iter()
        .filter(|o| engine.order_record(&o.id).is_none())
        .inspect(|o| {
            warn!(
                order_id = %o.id,
                symbol = %o.symbol,
                "orphan broker order with no engine record"
            );
        })
        .count() as u32;

    // ── 3. Position import / drop ───────────────────────────────────────
    let (to_import, to_drop) = diff_positions(&engine.book.all(), &broker_positions);

    let positions_imported = to_import.len() as u32;
    for p in to_import {
        let side = if p.size > 0 { Side::Buy } else { Side::Sell };
        warn!(
            symbol = %p.symbol,
            size = p.size,
            "importing externally created position"
        );
        engine.book.apply_fill(
            &p.symbol,
            side,
            p.size.unsigned_abs() as u32,
            p.average_price,
            1.0, // opening a fresh position realizes nothing
        );
    }

    let positions_dropped = to_drop.len() as u32;
    for symbol in to_drop {
        info!(symbol = %symbol, "broker reports flat — dropping tracked position");
        engine.book.remove(&symbol);
        engine.close_intents_for_symbol(&symbol);
    }

    // ── 4. Unprotected-position sweep ───────────────────────────────────
    let mut unprotected_swept = 0u32;
    if protect_positions {
        for pos in engine.book.all() {
            if pos.is_protected() || pos.size == 0 {
                continue;
            }
            unprotected_swept += 1;
            let engine_task = Arc::clone(engine);
            let symbol = pos.symbol.clone();
            let spec = TaskSpec::new(format!("auto-bracket:{symbol}"), Priority::High)
                .with_timeout(Duration::from_secs(60));
            let submitted = queue
                .submit(spec, move |_| {
                    let engine = Arc::clone(&engine_task);
                    let symbol = symbol.clone();
                    async move { engine.auto_bracket(&symbol).await }
                })
                .await;
            match submitted {
                Ok(_) => warn!(symbol = %pos.symbol, "unprotected position — auto-bracket queued"),
                Err(e) => warn!(symbol = %pos.symbol, error = %e, "auto-bracket enqueue failed"),
            }
        }
    }

    // ── 5. Breakeven ────────────────────────────────────────────────────
    engine.apply_breakeven_checks().await;

    Ok(ReconcileReport {
        orders_resolved,
        orphan_orders,
        positions_imported,
        positions_dropped,
        unprotected_swept,
        timestamp: Utc::now().to_rfc3339(),
    })
}
