// =============================================================================
// Vega Futures Engine — Main Entry Point
// =============================================================================
//
// Subsystems come up leaves-first: store → task queue → broker client →
// account tracker → cache → aggregator → quote hub → order engine →
// strategy scheduler → API. The engine starts Paused; trading is enabled
// through config or the API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod account;
mod api;
mod app_state;
mod broker;
mod cache;
mod config;
mod error;
mod indicators;
mod market_data;
mod notify;
mod orders;
mod queue;
mod signals;
mod store;
mod strategy;
mod types;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::account::{AccountTracker, ComplianceEvent};
use crate::app_state::AppState;
use crate::broker::client::{builtin_contract_meta, BrokerClient, Credentials};
use crate::cache::BarCache;
use crate::config::EngineConfig;
use crate::market_data::aggregator::BarAggregator;
use crate::market_data::quote_hub::QuoteHub;
use crate::market_data::{BarBuffer, Timeframe};
use crate::notify::{Notifier, NotifyEvent};
use crate::orders::engine::{IntentSink, OrderEngine};
use crate::orders::PositionBook;
use crate::queue::{Priority, TaskQueue, TaskSpec};
use crate::signals::SignalIntake;
use crate::store::Store;
use crate::strategy::overnight_range::OvernightRangeStrategy;
use crate::strategy::StrategyRegistry;

const CONFIG_PATH: &str = "vega_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║           Vega Futures Engine — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });
    config.apply_env_overrides();

    info!(
        symbols = ?config.overnight_range.symbols,
        trading_mode = %config.trading_mode,
        "engine configuration resolved"
    );

    // ── 2. Persistence store ─────────────────────────────────────────────
    let store = Arc::new(Store::connect(&config.database_url).await);
    if !config.database_url.is_empty() {
        let store = store.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(30)).await;
                if !store.is_available() {
                    if let Err(e) = store.try_reconnect().await {
                        warn!(error = %e, "store reconnect attempt failed");
                    }
                }
            }
        });
    }

    // ── 3. Priority task queue ───────────────────────────────────────────
    let queue = TaskQueue::new(config.worker_count, config.max_pending_tasks);
    queue.start();

    // ── 4. Broker client & account selection ─────────────────────────────
    let credentials = Credentials {
        username: std::env::var("VEGA_BROKER_USER").unwrap_or_default(),
        api_key: std::env::var("VEGA_BROKER_API_KEY").unwrap_or_default(),
    };
    let broker_client = Arc::new(BrokerClient::new(config.broker_base_url.clone(), credentials));

    let mut authenticated = false;
    let mut selected_account = None;
    match broker_client.authenticate().await {
        Ok(()) => {
            authenticated = true;
            match broker_client.list_accounts().await {
                Ok(accounts) => {
                    selected_account = if config.account.account_id.is_empty() {
                        accounts.into_iter().next()
                    } else {
                        accounts
                            .into_iter()
                            .find(|a| a.id == config.account.account_id)
                    };
                    match &selected_account {
                        Some(a) => info!(account_id = %a.id, name = %a.name, "account selected"),
                        None => warn!("no matching broker account found"),
                    }
                }
                Err(e) => warn!(error = %e, "account listing failed"),
            }
        }
        Err(e) => {
            error!(error = %e, "broker authentication failed — running degraded until retry");
        }
    }

    let account_id = selected_account
        .as_ref()
        .map(|a| a.id.clone())
        .unwrap_or_else(|| config.account.account_id.clone());
    let starting_balance = selected_account
        .as_ref()
        .map(|a| a.starting_balance)
        .filter(|b| *b > 0.0)
        .unwrap_or(config.account.starting_balance);

    // ── 5. Account tracker (DLL/MLL) ─────────────────────────────────────
    let (dll, mll) = config.risk.resolve(config.account.account_type);
    let book = Arc::new(PositionBook::new());
    let (tracker, mut compliance_rx) =
        AccountTracker::new(account_id.clone(), starting_balance, dll, mll, book.clone());

    // Contract metadata: broker wins, built-in table fills the gaps.
    match broker_client.list_contracts().await {
        Ok(contracts) => {
            broker_client.prime_contract_cache(&contracts);
            for c in &contracts {
                tracker.set_point_value(&c.symbol, c.point_value);
            }
        }
        Err(e) => warn!(error = %e, "contract listing failed — using built-in point values"),
    }
    for symbol in &config.overnight_range.symbols {
        if let Some((pv, _)) = builtin_contract_meta(symbol) {
            tracker.set_point_value(symbol, pv);
        }
    }

    // Restore the trailing highest-EOD balance; it must survive restarts.
    match store.latest_eod_snapshot(&account_id).await {
        Ok(Some(snap)) => tracker.restore_highest_eod(snap.highest_end_of_day_balance),
        Ok(None) => info!("no prior EOD snapshot — highest-EOD anchors to starting balance"),
        Err(e) => warn!(error = %e, "EOD snapshot restore skipped"),
    }

    // ── 6. Cache, aggregator, quote hub ──────────────────────────────────
    let cache = Arc::new(BarCache::new(
        store.clone(),
        broker_client.clone(),
        config.cache.clone(),
    ));

    let bar_buffer = Arc::new(BarBuffer::new(500));
    let aggregator = Arc::new(BarAggregator::new(bar_buffer));

    // Flush every closed live bar into the cache tiers.
    {
        let mut flush_rx = aggregator.subscribe_all();
        let cache = cache.clone();
        tokio::spawn(async move {
            while let Some(event) = flush_rx.recv().await {
                cache.on_bar_close(&event.key, event.bar).await;
            }
        });
    }

    let hub = Arc::new(QuoteHub::new(aggregator.clone()));
    hub.add_listener(tracker.clone());
    for symbol in &config.overnight_range.symbols {
        hub.subscribe(symbol);
        aggregator.track(symbol, &Timeframe::STANDARD);
    }

    {
        let hub = hub.clone();
        let url = config.quote_hub_url.clone();
        tokio::spawn(async move {
            broker::quote_stream::run_quote_stream(url, hub).await;
        });
    }

    // ── 7. Order engine ──────────────────────────────────────────────────
    let notifier = Arc::new(Notifier::new(&config.notifier_url));
    let engine = OrderEngine::new(
        broker_client.clone(),
        book.clone(),
        tracker.clone(),
        queue.clone(),
        notifier.clone(),
        store.clone(),
        config.order_policy.clone(),
        account_id.clone(),
    );

    // API-call metrics drain into the store off the hot path.
    {
        let (metrics_tx, mut metrics_rx) = tokio::sync::mpsc::unbounded_channel();
        broker_client.set_metrics_sink(metrics_tx);
        let store = store.clone();
        tokio::spawn(async move {
            while let Some(m) = metrics_rx.recv().await {
                let _ = store
                    .append_api_metric(&m.endpoint, m.latency_ms, &m.outcome, m.at)
                    .await;
            }
        });
    }

    // Compliance events: MLL breach flattens everything and halts intents.
    {
        let engine = engine.clone();
        let notifier = notifier.clone();
        tokio::spawn(async move {
            while let Some(event) = compliance_rx.recv().await {
                match event {
                    ComplianceEvent::MllBreached { balance, floor } => {
                        error!(balance, floor, "MLL breached — flattening all positions");
                        if let Err(e) = engine.flatten_all().await {
                            error!(error = %e, "MLL flatten failed — reconciler will retry");
                        }
                        notifier.notify(NotifyEvent::MllBreached { balance, floor });
                    }
                    ComplianceEvent::DllWarning { remaining } => {
                        notifier.notify(NotifyEvent::RiskLimitApproaching {
                            limit: "dll".to_string(),
                            remaining,
                        });
                    }
                    ComplianceEvent::EodCompleted { balance, highest } => {
                        notifier.notify(NotifyEvent::EodSummary {
                            balance,
                            realized_today: 0.0,
                            highest_eod_balance: highest,
                        });
                    }
                }
            }
        });
    }

    // ── 8. Reconciler ────────────────────────────────────────────────────
    {
        let engine = engine.clone();
        let broker_client = broker_client.clone();
        let queue = queue.clone();
        let account_id = account_id.clone();
        let protect = config.order_policy.protect_positions;
        tokio::spawn(async move {
            orders::reconcile::run_reconciler(engine, broker_client, queue, account_id, protect)
                .await;
        });
    }

    // ── 9. Strategies & scheduler ────────────────────────────────────────
    let registry = Arc::new(StrategyRegistry::new());
    let sink: Arc<dyn IntentSink> = engine.clone();

    match OvernightRangeStrategy::new(
        config.overnight_range.clone(),
        config.order_policy.position_size,
        account_id.clone(),
        sink.clone(),
        cache.clone(),
        store.clone(),
        tracker.clone(),
        queue.clone(),
    ) {
        Ok(overnight) => registry.register(overnight),
        Err(e) => error!(error = %e, "overnight-range strategy failed to build"),
    }

    strategy::scheduler::rehydrate(&registry, &store, &account_id).await;

    {
        let events = aggregator.subscribe_all();
        let registry = registry.clone();
        tokio::spawn(async move {
            strategy::scheduler::run_bar_feed(events, registry).await;
        });
    }
    {
        let registry = registry.clone();
        let queue = queue.clone();
        let tz: chrono_tz::Tz = config
            .overnight_range
            .timezone
            .parse()
            .unwrap_or(chrono_tz::US::Eastern);
        tokio::spawn(async move {
            strategy::scheduler::run_scheduler(registry, queue, tz).await;
        });
    }

    // ── 10. EOD rollover ─────────────────────────────────────────────────
    {
        let (eod_hour, eod_minute) =
            EngineConfig::parse_hhmm(&config.session_close_utc).unwrap_or((21, 0));
        let tracker = tracker.clone();
        let store = store.clone();
        let broker_client = broker_client.clone();
        let queue = queue.clone();
        let account_id = account_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(seconds_until_utc(eod_hour, eod_minute)).await;
                let tracker = tracker.clone();
                let store = store.clone();
                let broker_client = broker_client.clone();
                let account_id = account_id.clone();
                let spec = TaskSpec::new("eod-rollover", Priority::Critical)
                    .with_timeout(Duration::from_secs(120))
                    .with_max_retries(5);
                let result = queue
                    .submit(spec, move |_| {
                        let tracker = tracker.clone();
                        let store = store.clone();
                        let broker_client = broker_client.clone();
                        let account_id = account_id.clone();
                        async move {
                            let closing =
                                match broker_client.get_account_balance(&account_id).await {
                                    Ok(b) => b.balance,
                                    Err(_) => tracker.current_balance(),
                                };
                            tracker.eod_rollover(closing, &store).await
                        }
                    })
                    .await;
                if let Err(e) = result {
                    error!(error = %e, "failed to queue EOD rollover");
                }
            }
        });
    }

    // ── 11. Prefetch & retention ─────────────────────────────────────────
    if config.cache.prefetch_enabled {
        let cache = cache.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                let cache = cache.clone();
                let spec = TaskSpec::new("prefetch", Priority::Background)
                    .with_timeout(Duration::from_secs(240))
                    .with_max_retries(0);
                let _ = queue
                    .submit(spec, move |_| {
                        let cache = cache.clone();
                        async move {
                            cache.prefetch_pass().await;
                            Ok(())
                        }
                    })
                    .await;
            }
        });
    }
    {
        let store = store.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(86_400));
            loop {
                interval.tick().await;
                let store = store.clone();
                let spec = TaskSpec::new("retention-purge", Priority::Background)
                    .with_timeout(Duration::from_secs(300));
                let _ = queue
                    .submit(spec, move |_| {
                        let store = store.clone();
                        async move {
                            store.purge_expired().await?;
                            Ok(())
                        }
                    })
                    .await;
            }
        });
    }

    // ── 12. Signal intake & API server ───────────────────────────────────
    let intake = Arc::new(SignalIntake::new(
        sink,
        config.order_policy.clone(),
        account_id.clone(),
    ));

    let state = Arc::new(AppState {
        config: Arc::new(RwLock::new(config.clone())),
        tracker: tracker.clone(),
        engine: engine.clone(),
        registry: registry.clone(),
        queue: queue.clone(),
        cache: cache.clone(),
        aggregator: aggregator.clone(),
        hub: hub.clone(),
        store: store.clone(),
        intake,
        broker_authenticated: RwLock::new(authenticated),
        selected_account: RwLock::new(selected_account),
        recent_errors: RwLock::new(Vec::new()),
        state_version: AtomicU64::new(1),
        start_time: std::time::Instant::now(),
    });

    {
        let state = state.clone();
        let bind_addr = config.bind_addr.clone();
        tokio::spawn(async move {
            let app = api::rest::router(state);
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .expect("failed to bind API server");
            info!(addr = %bind_addr, "API server listening");
            axum::serve(listener, app).await.expect("API server failed");
        });
    }

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 13. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — draining critical work");

    queue.shutdown(Duration::from_secs(10)).await;

    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("Vega Futures Engine shut down complete.");
    Ok(())
}

/// Duration until the next occurrence of `HH:MM` UTC.
fn seconds_until_utc(hour: u32, minute: u32) -> Duration {
    let now = Utc::now();
    let today_target = now
        .date_naive()
        .and_hms_opt(hour, minute, 0)
        .expect("valid time of day")
        .and_utc();
    let target = if today_target > now {
        today_target
    } else {
        today_target + chrono::Duration::days(1)
    };
    (target - now).to_std().unwrap_or(Duration::from_secs(60))
}
