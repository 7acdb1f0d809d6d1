// =============================================================================
// KRX Auto-Trading Engine — Main Entry Point
// =============================================================================
//
// The engine starts in PAPER mode unless TRADE_MODE=LIVE is set explicitly.
// Orders only ever reach the broker through the order manager, and every
// signal passes the 9-stage risk pipeline first.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod config;
mod market;
mod notify;
mod order;
mod persistence;
mod risk;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::auth::{HashkeyManager, TokenManager, TokenProvider};
use crate::api::rate_limit::RateLimiter;
use crate::api::rest::KisRestClient;
use crate::api::ws::{KisWsClient, TR_ORDER_NOTICE};
use crate::config::Settings;
use crate::market::cache::RealtimeCache;
use crate::market::hub::MarketDataHub;
use crate::market::vi_monitor::ViMonitor;
use crate::notify::LogNotifier;
use crate::order::manager::{OrderManager, RiskInputs};
use crate::order::paper::PaperTradingEngine;
use crate::order::pyramid::PyramidManager;
use crate::order::state_machine::OrderStateMachine;
use crate::order::tracker::OrderTracker;
use crate::persistence::MemoryStore;
use crate::risk::drawdown::DrawdownProtocol;
use crate::risk::global_lock::GlobalPositionLock;
use crate::risk::grade_allocator::GradeAllocator;
use crate::risk::kill_switch::DailyKillSwitch;
use crate::risk::manager::{PnlContext, RiskManager};
use crate::risk::margin_guard::MarginGuard;
use crate::risk::position_sizer::PositionSizer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env();
    info!(
        trade_mode = %settings.trade_mode,
        total_capital = settings.total_capital,
        daily_loss_limit = settings.daily_loss_limit,
        "KRX auto-trading engine starting"
    );

    // Watched symbols come from the environment; strategies subscribe to
    // these at session start.
    let symbols: Vec<String> = std::env::var("KRX_SYMBOLS")
        .unwrap_or_else(|_| "005930,000660".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    info!(symbols = ?symbols, "configured stocks");

    // ── 2. Broker API stack ──────────────────────────────────────────────
    let rate_limiter = Arc::new(RateLimiter::default());
    let token_manager = Arc::new(TokenManager::new(
        settings.app_key.clone(),
        settings.app_secret.clone(),
        settings.base_url(),
        None,
    ));
    token_manager.spawn_auto_refresh();

    let hashkey_manager = Arc::new(HashkeyManager::new(
        settings.app_key.clone(),
        settings.app_secret.clone(),
        settings.base_url(),
    ));

    let rest_client = Arc::new(KisRestClient::new(
        Arc::clone(&token_manager) as Arc<dyn TokenProvider>,
        hashkey_manager,
        Arc::clone(&rate_limiter),
        settings.trade_mode,
        settings.account_no.clone(),
        settings.account_product_code.clone(),
        settings.base_url(),
    ));

    // ── 3. Market data layer ─────────────────────────────────────────────
    let cache = Arc::new(RealtimeCache::new());
    let vi_monitor = Arc::new(ViMonitor::new(Arc::clone(&cache)));
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(MarketDataHub::new(
        Arc::clone(&cache),
        Arc::clone(&vi_monitor),
        Some(Arc::clone(&rest_client)),
        Some(Arc::clone(&store) as Arc<dyn persistence::TickArchive>),
    ));

    let approval_key = match token_manager.issue_approval_key().await {
        Ok(key) => key,
        Err(e) => {
            warn!(error = %e, "approval key issuance failed; realtime feed disabled");
            String::new()
        }
    };
    let ws_client = Arc::new(KisWsClient::new(approval_key, config::WS_URL));
    hub.register_websocket_callbacks(&ws_client);

    // ── 4. Order subsystem ───────────────────────────────────────────────
    let state_machine = Arc::new(OrderStateMachine::new());
    let paper_engine = Arc::new(PaperTradingEngine::new(Arc::clone(&cache)));
    paper_engine.set_paper_cash(settings.total_capital as f64);

    let order_tracker = Arc::new(OrderTracker::new(
        Arc::clone(&state_machine),
        Some(Arc::clone(&rest_client)),
    ));

    // Fill notices from the websocket flow straight into the tracker.
    {
        let tracker = Arc::clone(&order_tracker);
        ws_client.register_callback(
            TR_ORDER_NOTICE,
            Arc::new(move |fields| tracker.on_fill_notification(&fields)),
        );
    }

    // ── 5. Risk pipeline ─────────────────────────────────────────────────
    let balance_client = Arc::clone(&rest_client);
    let margin_guard = Arc::new(MarginGuard::new(Some(Box::new(move || {
        let client = Arc::clone(&balance_client);
        Box::pin(async move {
            client
                .get_cash_balance()
                .await
                .map_err(anyhow::Error::from)
        })
    }))));

    let kill_switch = Arc::new(DailyKillSwitch::new(
        settings.daily_loss_limit,
        settings.total_capital,
    ));
    kill_switch.set_notifier(Arc::new(LogNotifier));

    let risk_manager = Arc::new(RiskManager::new(
        PositionSizer::new(),
        GradeAllocator::new(),
        Arc::new(GlobalPositionLock::new()),
        Some(Arc::clone(&vi_monitor) as Arc<dyn risk::manager::ViGate>),
        Some(Arc::clone(&margin_guard)),
        Some(Arc::clone(&kill_switch)),
        Some(Arc::new(DrawdownProtocol::new())),
    ));

    // ── 6. Order manager facade ──────────────────────────────────────────
    let order_manager = OrderManager::new(
        Some(Arc::clone(&rest_client)),
        Arc::clone(&state_machine),
        Arc::clone(&order_tracker),
        paper_engine,
        Arc::clone(&risk_manager),
        Arc::new(PyramidManager::default()),
        settings.trade_mode,
    );
    order_manager.set_risk_inputs(RiskInputs {
        regime: crate::types::MarketRegime::Sideways,
        total_capital: settings.total_capital,
        pnl: PnlContext {
            current_capital: settings.total_capital,
            ..Default::default()
        },
    });

    // The kill switch holds only function values, never the order manager
    // itself.
    {
        let om = Arc::clone(&order_manager);
        kill_switch.set_cancel_all(Arc::new(move || {
            let om = Arc::clone(&om);
            Box::pin(async move {
                let cancelled = om.cancel_all_pending().await;
                om.set_block_new_orders(true);
                warn!(cancelled, "kill switch cancelled all pending orders");
            })
        }));
    }

    // ── 7. Background loops ──────────────────────────────────────────────
    {
        let ws = Arc::clone(&ws_client);
        tokio::spawn(async move { ws.run().await });
    }
    order_tracker.start_tracking();

    // Give the websocket a moment to connect before subscribing.
    tokio::time::sleep(Duration::from_secs(2)).await;
    for symbol in &symbols {
        if let Err(e) = ws_client.subscribe_execution(symbol).await {
            warn!(symbol = %symbol, error = %e, "execution subscription failed");
        }
        if let Err(e) = ws_client.subscribe_orderbook(symbol).await {
            warn!(symbol = %symbol, error = %e, "orderbook subscription failed");
        }
        if let Err(e) = ws_client.subscribe_vi(symbol).await {
            warn!(symbol = %symbol, error = %e, "VI subscription failed");
        }
    }
    if let Err(e) = ws_client.subscribe_order_notice().await {
        warn!(error = %e, "order notice subscription failed");
    }

    // Session prep: daily history and indicator pre-computation.
    hub.load_historical_batch(&symbols).await;
    info!(count = symbols.len(), "session prep complete");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    info!("all subsystems running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received");

    order_tracker.stop_tracking();
    ws_client.disconnect().await;
    hub.shutdown();
    token_manager.shutdown();

    if store.tick_count() > 0 {
        info!(buffered_ticks = store.tick_count(), "tick archive pending bulk write");
    }

    info!("KRX auto-trading engine shut down");
    Ok(())
}
