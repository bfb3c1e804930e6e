// =============================================================================
// Strategy Scheduler — heartbeat, bar feed, rehydration, daily restart
// =============================================================================
//
// A single loop ticks every registered strategy; time-based phase logic
// lives in the strategies themselves. The 08:00 weekday restart stops and
// re-starts enabled strategies so no stale state survives into the 09:30
// arming; the guard tolerates the loop firing many times inside the
// 08:00–08:05 window without double-executing.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::market_data::aggregator::BarCloseEvent;
use crate::queue::{Priority, TaskQueue, TaskSpec};
use crate::store::Store;

use super::StrategyRegistry;

/// Heartbeat between strategy ticks.
const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Window in which the daily restart may fire.
const RESTART_WINDOW_START: (u32, u32) = (8, 0);
const RESTART_WINDOW_END: (u32, u32) = (8, 5);

// ---------------------------------------------------------------------------
// Restart guard
// ---------------------------------------------------------------------------

/// Executes the daily restart exactly once per weekday, never on weekends,
/// guarded against the scheduler loop re-entering the 08:00–08:05 window.
pub struct RestartGuard {
    last_restart: RwLock<Option<NaiveDate>>,
}

impl RestartGuard {
    pub fn new() -> Self {
        Self {
            last_restart: RwLock::new(None),
        }
    }

    pub fn should_restart(&self, local: DateTime<Tz>) -> bool {
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }

        let t = local.time();
        let start = NaiveTime::from_hms_opt(RESTART_WINDOW_START.0, RESTART_WINDOW_START.1, 0)
            .expect("valid window start");
        let end = NaiveTime::from_hms_opt(RESTART_WINDOW_END.0, RESTART_WINDOW_END.1, 0)
            .expect("valid window end");
        if t < start || t >= end {
            return false;
        }

        let today = local.date_naive();
        let mut last = self.last_restart.write();
        if *last == Some(today) {
            return false;
        }
        *last = Some(today);
        true
    }
}

impl Default for RestartGuard {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

/// Main scheduler heartbeat. Never returns.
pub async fn run_scheduler(registry: Arc<StrategyRegistry>, queue: Arc<TaskQueue>, tz: Tz) {
    info!(strategies = ?registry.names(), "strategy scheduler starting");
    let guard = RestartGuard::new();
    let mut interval = tokio::time::interval(TICK_INTERVAL);

    loop {
        interval.tick().await;
        let now = Utc::now();

        if guard.should_restart(now.with_timezone(&tz)) {
            info!("daily 08:00 restart window — queueing strategy restarts");
            for strategy in registry.all() {
                if !strategy.enabled() {
                    continue;
                }
                let name = strategy.name().to_string();
                let spec = TaskSpec::new(format!("restart:{name}"), Priority::Normal)
                    .with_timeout(Duration::from_secs(60));
                let result = queue
                    .submit(spec, move |_| {
                        let strategy = strategy.clone();
                        async move { strategy.restart().await }
                    })
                    .await;
                if let Err(e) = result {
                    warn!(strategy = %name, error = %e, "restart enqueue failed");
                }
            }
        }

        for strategy in registry.all() {
            if !strategy.enabled() {
                continue;
            }
            if let Err(e) = strategy.tick(now).await {
                warn!(strategy = strategy.name(), error = %e, "strategy tick failed");
            }
        }
    }
}

/// Deliver bar-close events to every registered strategy.
pub async fn run_bar_feed(
    mut events: mpsc::UnboundedReceiver<BarCloseEvent>,
    registry: Arc<StrategyRegistry>,
) {
    while let Some(event) = events.recv().await {
        for strategy in registry.all() {
            strategy.on_bar_close(&event.key, &event.bar);
        }
    }
    debug!("bar feed channel closed — feed loop exiting");
}

/// Restore persisted strategy state at startup.
pub async fn rehydrate(registry: &StrategyRegistry, store: &Store, account_id: &str) {
    for strategy in registry.all() {
        match store.fetch_strategy_state(account_id, strategy.name()).await {
            Ok(Some(state)) => {
                strategy.restore_state(&state);
                info!(strategy = strategy.name(), "strategy state rehydrated from store");
            }
            Ok(None) => {
                debug!(strategy = strategy.name(), "no persisted state — starting fresh");
            }
            Err(e) => {
                warn!(strategy = strategy.name(), error = %e, "state rehydration skipped");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::US::Eastern;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Tz> {
        Eastern.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn restart_fires_once_per_weekday() {
        let guard = RestartGuard::new();
        // Tuesday 2026-02-10 08:02 Eastern.
        assert!(guard.should_restart(at(2026, 2, 10, 8, 2)));
        // Re-entering the window the same day is a no-op.
        assert!(!guard.should_restart(at(2026, 2, 10, 8, 3)));
        assert!(!guard.should_restart(at(2026, 2, 10, 8, 4)));
        // The next weekday fires again.
        assert!(guard.should_restart(at(2026, 2, 11, 8, 1)));
    }

    #[test]
    fn restart_never_fires_on_weekends() {
        let guard = RestartGuard::new();
        // 2026-02-14 is a Saturday, 02-15 a Sunday.
        assert!(!guard.should_restart(at(2026, 2, 14, 8, 2)));
        assert!(!guard.should_restart(at(2026, 2, 15, 8, 2)));
        // Monday fires.
        assert!(guard.should_restart(at(2026, 2, 16, 8, 2)));
    }

    #[test]
    fn restart_window_boundaries() {
        let guard = RestartGuard::new();
        assert!(!guard.should_restart(at(2026, 2, 10, 7, 59)));
        assert!(guard.should_restart(at(2026, 2, 10, 8, 0)));

        let guard = RestartGuard::new();
        assert!(!guard.should_restart(at(2026, 2, 10, 8, 5)));
        assert!(!guard.should_restart(at(2026, 2, 10, 12, 0)));
    }
}
