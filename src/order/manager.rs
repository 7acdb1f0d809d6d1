// =============================================================================
// Order Manager — facade: signal -> risk -> route -> state tracking
// =============================================================================
//
// Every order in the system flows through this facade. Nothing else calls
// the REST client or the paper engine for order placement.
//
//   1. Refuse outright while the block flag is up.
//   2. Run the signal through the 9-stage risk pipeline.
//   3. Create the order in the state machine and mark it SUBMITTED.
//   4. Route: LIVE orders go to the broker REST API (fills arrive later via
//      the websocket and the tracker); PAPER orders settle synchronously
//      against the paper engine.
//   5. Track open positions at weighted average cost; release risk state
//      (exposure locks, cash reservations) as orders complete.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::api::rest::KisRestClient;
use crate::order::paper::{PaperExecution, PaperFill, PaperTradingEngine};
use crate::order::pyramid::PyramidManager;
use crate::order::state_machine::{Order, OrderDraft, OrderState, OrderStateMachine};
use crate::order::tracker::OrderTracker;
use crate::risk::manager::{PnlContext, RiskManager, RiskVerdict};
use crate::risk::margin_guard::MarginGuard;
use crate::types::{MarketRegime, OrderSide, Position, TradeMode, TradeSignal};

/// Per-session risk context the facade feeds into the pipeline. Updated by
/// the session loop as pnl and regime evolve.
#[derive(Debug, Clone, Copy)]
pub struct RiskInputs {
    pub regime: MarketRegime,
    pub total_capital: i64,
    pub pnl: PnlContext,
}

impl Default for RiskInputs {
    fn default() -> Self {
        Self {
            regime: MarketRegime::Sideways,
            total_capital: 0,
            pnl: PnlContext::default(),
        }
    }
}

/// Outcome of a placement attempt.
#[derive(Debug, Clone, Serialize)]
pub enum PlaceOutcome {
    /// Live order accepted by the broker; fills arrive asynchronously.
    Submitted {
        order_id: String,
        broker_order_no: Option<String>,
    },
    /// Paper order fully filled.
    Filled { order_id: String, fill: PaperFill },
    /// Paper order partially filled; the remainder is tracked.
    PartialFilled { order_id: String, fill: PaperFill },
    /// Refused before or during routing.
    Rejected {
        order_id: Option<String>,
        reason: String,
    },
}

impl PlaceOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }

    pub fn order_id(&self) -> Option<&str> {
        match self {
            Self::Submitted { order_id, .. }
            | Self::Filled { order_id, .. }
            | Self::PartialFilled { order_id, .. } => Some(order_id),
            Self::Rejected { order_id, .. } => order_id.as_deref(),
        }
    }
}

/// The order facade.
pub struct OrderManager {
    rest_client: Option<Arc<KisRestClient>>,
    state_machine: Arc<OrderStateMachine>,
    order_tracker: Arc<OrderTracker>,
    paper_engine: Arc<PaperTradingEngine>,
    risk_manager: Arc<RiskManager>,
    pyramid_manager: Arc<PyramidManager>,
    trade_mode: TradeMode,

    block_new_orders: AtomicBool,
    positions: RwLock<HashMap<String, Position>>,
    risk_inputs: RwLock<RiskInputs>,
}

fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl OrderManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rest_client: Option<Arc<KisRestClient>>,
        state_machine: Arc<OrderStateMachine>,
        order_tracker: Arc<OrderTracker>,
        paper_engine: Arc<PaperTradingEngine>,
        risk_manager: Arc<RiskManager>,
        pyramid_manager: Arc<PyramidManager>,
        trade_mode: TradeMode,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            rest_client,
            state_machine,
            order_tracker,
            paper_engine,
            risk_manager,
            pyramid_manager,
            trade_mode,
            block_new_orders: AtomicBool::new(false),
            positions: RwLock::new(HashMap::new()),
            risk_inputs: RwLock::new(RiskInputs::default()),
        });

        // The state machine outlives individual calls; listen weakly so the
        // two never keep each other alive.
        let weak: Weak<OrderManager> = Arc::downgrade(&manager);
        manager
            .state_machine
            .register_callback(Arc::new(move |_, _, new_state, order| {
                if let Some(om) = weak.upgrade() {
                    om.on_state_change(new_state, order);
                }
            }));

        info!(trade_mode = %manager.trade_mode, "order manager initialised");
        manager
    }

    // -------------------------------------------------------------------------
    // Flags & inputs
    // -------------------------------------------------------------------------

    pub fn block_new_orders(&self) -> bool {
        self.block_new_orders.load(Ordering::SeqCst)
    }

    pub fn set_block_new_orders(&self, value: bool) {
        let old = self.block_new_orders.swap(value, Ordering::SeqCst);
        if old != value {
            warn!(old, new = value, "order block flag changed");
        }
    }

    pub fn set_risk_inputs(&self, inputs: RiskInputs) {
        *self.risk_inputs.write() = inputs;
    }

    pub fn trade_mode(&self) -> TradeMode {
        self.trade_mode
    }

    pub fn pyramid_manager(&self) -> &Arc<PyramidManager> {
        &self.pyramid_manager
    }

    pub fn tracker(&self) -> &Arc<OrderTracker> {
        &self.order_tracker
    }

    // -------------------------------------------------------------------------
    // Place order
    // -------------------------------------------------------------------------

    /// Execute a strategy signal end-to-end.
    pub async fn place_order(&self, signal: &TradeSignal) -> PlaceOutcome {
        info!(
            stock_code = %signal.stock_code,
            side = %signal.side,
            strategy = %signal.strategy_code,
            entry_price = signal.entry_price,
            trade_mode = %self.trade_mode,
            "place order request"
        );

        // 1. Block flag.
        if self.block_new_orders() {
            warn!(stock_code = %signal.stock_code, "order blocked: new orders disabled");
            return PlaceOutcome::Rejected {
                order_id: None,
                reason: "new orders are blocked".to_string(),
            };
        }

        // 2. Risk pipeline.
        let inputs = *self.risk_inputs.read();
        let current_positions = self.get_open_positions();
        let verdict = self
            .risk_manager
            .validate_signal(
                signal,
                &current_positions,
                inputs.regime,
                inputs.total_capital,
                &inputs.pnl,
            )
            .await;

        let approval = match verdict {
            RiskVerdict::Passed(approval) => approval,
            RiskVerdict::Rejected(rejection) => {
                return PlaceOutcome::Rejected {
                    order_id: None,
                    reason: format!(
                        "risk step {} ({}): {}",
                        rejection.step, rejection.step_name, rejection.reason
                    ),
                };
            }
        };

        // 3. Create the order and mark it submitted.
        let order_id = OrderStateMachine::generate_order_id("ORD");
        let draft = OrderDraft {
            stock_code: signal.stock_code.clone(),
            side: signal.side,
            quantity: approval.quantity,
            price: signal.entry_price as f64,
            strategy_code: signal.strategy_code.clone(),
            stop_loss_price: signal.stop_loss,
            confidence: signal.confidence,
            grade: signal.grade,
            sector: signal.sector.clone(),
            position_pct: approval.position_pct,
            mode: self.trade_mode,
        };

        if let Err(e) = self.state_machine.create_order(&order_id, draft) {
            return PlaceOutcome::Rejected {
                order_id: Some(order_id),
                reason: e.to_string(),
            };
        }

        let submitted_via = match self.trade_mode {
            TradeMode::Live => "broker_rest_api",
            TradeMode::Paper => "paper_engine",
        };
        if let Err(e) = self.state_machine.transition(
            &order_id,
            OrderState::Submitted,
            Some(json!({ "submitted_via": submitted_via })),
        ) {
            return PlaceOutcome::Rejected {
                order_id: Some(order_id),
                reason: e.to_string(),
            };
        }

        // 4. Route.
        match self.trade_mode {
            TradeMode::Live => self.execute_live(&order_id, signal, approval.quantity).await,
            TradeMode::Paper => {
                self.execute_paper(&order_id, signal, approval.quantity, approval.position_pct)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Live routing
    // -------------------------------------------------------------------------

    async fn execute_live(
        &self,
        order_id: &str,
        signal: &TradeSignal,
        quantity: i64,
    ) -> PlaceOutcome {
        let Some(ref client) = self.rest_client else {
            let _ = self.state_machine.transition(
                order_id,
                OrderState::Error,
                Some(json!({ "error": "no REST client configured for live trading" })),
            );
            return PlaceOutcome::Rejected {
                order_id: Some(order_id.to_string()),
                reason: "no REST client configured for live trading".to_string(),
            };
        };

        match client
            .place_order(&signal.stock_code, signal.side, quantity, signal.entry_price)
            .await
        {
            Ok(response) => {
                let broker_order_no = response["output"]["ODNO"]
                    .as_str()
                    .map(str::to_string);
                if let Some(ref no) = broker_order_no {
                    let _ = self
                        .state_machine
                        .merge_metadata(order_id, &json!({ "broker_order_no": no }));
                }

                info!(
                    order_id,
                    broker_order_no = broker_order_no.as_deref().unwrap_or(""),
                    stock_code = %signal.stock_code,
                    "live order submitted"
                );

                // Fills arrive through the websocket and the tracker.
                PlaceOutcome::Submitted {
                    order_id: order_id.to_string(),
                    broker_order_no,
                }
            }
            Err(e) => {
                warn!(order_id, error = %e, "live order placement failed");
                let _ = self.state_machine.transition(
                    order_id,
                    OrderState::Error,
                    Some(json!({ "error": e.to_string() })),
                );
                PlaceOutcome::Rejected {
                    order_id: Some(order_id.to_string()),
                    reason: format!("order placement failed: {e}"),
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Paper routing
    // -------------------------------------------------------------------------

    fn execute_paper(
        &self,
        order_id: &str,
        signal: &TradeSignal,
        quantity: i64,
        position_pct: f64,
    ) -> PlaceOutcome {
        let result = self.paper_engine.execute_virtual_order(
            &signal.stock_code,
            signal.side,
            quantity,
            signal.entry_price as f64,
        );

        let fill = match result {
            PaperExecution::Rejected { reason } => {
                let _ = self.state_machine.transition(
                    order_id,
                    OrderState::Rejected,
                    Some(json!({ "reject_reason": reason })),
                );
                return PlaceOutcome::Rejected {
                    order_id: Some(order_id.to_string()),
                    reason,
                };
            }
            PaperExecution::Filled(fill) => fill,
        };

        let new_state = if fill.remaining_quantity > 0 {
            OrderState::PartialFilled
        } else {
            OrderState::Filled
        };

        let _ = self.state_machine.transition(
            order_id,
            new_state,
            Some(json!({
                "fill_price": fill.fill_price,
                "filled_quantity": fill.fill_quantity,
                "remaining_quantity": fill.remaining_quantity,
                "slippage_pct": fill.slippage_pct,
                "market_impact_pct": fill.market_impact_pct,
            })),
        );

        // Paper buys settle synchronously, so the position books here.
        if signal.side == OrderSide::Buy {
            self.book_buy_fill(
                &signal.stock_code,
                fill.fill_price,
                fill.fill_quantity,
                position_pct,
                signal,
            );
        }

        info!(
            order_id,
            stock_code = %signal.stock_code,
            state = %new_state,
            fill_price = fill.fill_price,
            fill_quantity = fill.fill_quantity,
            remaining_quantity = fill.remaining_quantity,
            "paper order executed"
        );

        if new_state == OrderState::Filled {
            PlaceOutcome::Filled {
                order_id: order_id.to_string(),
                fill,
            }
        } else {
            PlaceOutcome::PartialFilled {
                order_id: order_id.to_string(),
                fill,
            }
        }
    }

    // -------------------------------------------------------------------------
    // Cancel / modify
    // -------------------------------------------------------------------------

    /// Cancel one order: CANCEL_REQUESTED, broker cancel in live mode, then
    /// CANCELLED.
    pub async fn cancel_order(&self, order_id: &str) -> Result<Order, String> {
        let order = self
            .state_machine
            .get_order(order_id)
            .map_err(|e| e.to_string())?;

        info!(order_id, stock_code = %order.stock_code, state = %order.state, "cancel order request");

        self.state_machine
            .transition(
                order_id,
                OrderState::CancelRequested,
                Some(json!({ "cancel_reason": "caller request" })),
            )
            .map_err(|e| e.to_string())?;

        if self.trade_mode == TradeMode::Live {
            if let (Some(client), Some(broker_no)) = (&self.rest_client, &order.broker_order_no) {
                if let Err(e) = client.cancel_order(broker_no, &order.stock_code).await {
                    return Err(format!("broker cancel failed: {e}"));
                }
            }
        }

        self.state_machine
            .transition(
                order_id,
                OrderState::Cancelled,
                Some(json!({ "cancelled_by": "order_manager" })),
            )
            .map_err(|e| e.to_string())
    }

    /// Re-price an order.
    ///
    /// PARTIAL_FILLED orders travel AMEND_REQUESTED -> SUBMITTED; SUBMITTED
    /// orders are re-priced at the broker and patched in place.
    pub async fn modify_order(&self, order_id: &str, new_price: f64) -> Result<Order, String> {
        let order = self
            .state_machine
            .get_order(order_id)
            .map_err(|e| e.to_string())?;

        info!(
            order_id,
            stock_code = %order.stock_code,
            state = %order.state,
            old_price = order.price,
            new_price,
            "modify order request"
        );

        match order.state {
            OrderState::PartialFilled => {
                self.state_machine
                    .transition(
                        order_id,
                        OrderState::AmendRequested,
                        Some(json!({ "new_price": new_price })),
                    )
                    .map_err(|e| e.to_string())?;

                if self.trade_mode == TradeMode::Live {
                    if let (Some(client), Some(broker_no)) =
                        (&self.rest_client, &order.broker_order_no)
                    {
                        if let Err(e) = client
                            .modify_order(broker_no, &order.stock_code, new_price as i64, "00")
                            .await
                        {
                            return Err(format!("broker modify failed: {e}"));
                        }
                    }
                }

                self.state_machine
                    .transition(
                        order_id,
                        OrderState::Submitted,
                        Some(json!({ "price": new_price, "amend_result": "re-priced" })),
                    )
                    .map_err(|e| e.to_string())
            }
            OrderState::Submitted => {
                if self.trade_mode == TradeMode::Live {
                    if let (Some(client), Some(broker_no)) =
                        (&self.rest_client, &order.broker_order_no)
                    {
                        if let Err(e) = client
                            .modify_order(broker_no, &order.stock_code, new_price as i64, "00")
                            .await
                        {
                            return Err(format!("broker modify failed: {e}"));
                        }
                    }
                }
                // Patch in place; no state change for a simple re-price.
                self.state_machine
                    .merge_metadata(order_id, &json!({ "price": new_price }))
                    .map_err(|e| e.to_string())
            }
            other => Err(format!(
                "order {order_id} cannot be modified in state {other}"
            )),
        }
    }

    // -------------------------------------------------------------------------
    // Bulk helpers
    // -------------------------------------------------------------------------

    /// Cancel every pending order. Returns the number cancelled.
    pub async fn cancel_all_pending(&self) -> usize {
        let pending = self.state_machine.get_pending_orders();
        info!(pending_count = pending.len(), "cancelling all pending orders");

        let mut cancelled = 0;
        for order in pending {
            if self.cancel_order(&order.order_id).await.is_ok() {
                cancelled += 1;
            }
        }

        info!(cancelled, "cancel-all complete");
        cancelled
    }

    /// Close every open position with a market-price sell.
    pub async fn close_all_positions(&self) -> Vec<PlaceOutcome> {
        let positions = self.get_open_positions();
        info!(position_count = positions.len(), "closing all positions");

        let mut results = Vec::with_capacity(positions.len());
        for position in positions {
            if position.quantity <= 0 {
                continue;
            }
            let sell = TradeSignal {
                stock_code: position.stock_code.clone(),
                side: OrderSide::Sell,
                strategy_code: position.strategy_code.clone(),
                entry_price: 0, // market
                stop_loss: 0,
                grade: position.grade,
                confidence: 0,
                quantity: Some(position.quantity),
                position_pct: 0.0,
                sector: position.sector.clone(),
                indicators_snapshot: serde_json::Value::Null,
            };
            results.push(self.place_order(&sell).await);
        }

        let closed = results.iter().filter(|r| r.is_success()).count();
        info!(total = results.len(), closed, "close-all complete");
        results
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    pub fn get_open_positions(&self) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .filter(|p| p.quantity > 0)
            .cloned()
            .collect()
    }

    pub fn get_position(&self, stock_code: &str) -> Option<Position> {
        self.positions.read().get(stock_code).cloned()
    }

    /// Book a buy fill into the position map at weighted average cost.
    fn book_buy_fill(
        &self,
        stock_code: &str,
        fill_price: f64,
        fill_quantity: i64,
        position_pct: f64,
        signal: &TradeSignal,
    ) {
        if fill_quantity <= 0 {
            return;
        }
        let mut positions = self.positions.write();
        match positions.get_mut(stock_code) {
            Some(existing) => {
                let new_qty = existing.quantity + fill_quantity;
                let new_cost = existing.total_cost + fill_price * fill_quantity as f64;
                existing.quantity = new_qty;
                existing.total_cost = new_cost;
                existing.avg_entry_price = if new_qty > 0 {
                    new_cost / new_qty as f64
                } else {
                    0.0
                };
                existing.updated_at = now_epoch();
            }
            None => {
                positions.insert(
                    stock_code.to_string(),
                    Position {
                        stock_code: stock_code.to_string(),
                        quantity: fill_quantity,
                        avg_entry_price: fill_price,
                        total_cost: fill_price * fill_quantity as f64,
                        strategy_code: signal.strategy_code.clone(),
                        stop_loss_price: signal.stop_loss,
                        grade: signal.grade,
                        sector: signal.sector.clone(),
                        position_pct,
                        mode: self.trade_mode,
                        entry_time: now_epoch(),
                        updated_at: now_epoch(),
                    },
                );
            }
        }
    }

    /// Reduce a position after a sell fill; a position reaching zero is
    /// destroyed and the risk manager releases its lock and reservation.
    fn reduce_position(&self, stock_code: &str, sell_quantity: i64, sell_price: f64) {
        let closed = {
            let mut positions = self.positions.write();
            let Some(position) = positions.get_mut(stock_code) else {
                return;
            };

            position.quantity -= sell_quantity;
            if position.quantity <= 0 {
                let strategy = position.strategy_code.clone();
                positions.remove(stock_code);
                Some(strategy)
            } else {
                position.total_cost = position.avg_entry_price * position.quantity as f64;
                position.updated_at = now_epoch();
                None
            }
        };

        if let Some(strategy_code) = closed {
            info!(stock_code, sell_price, "position closed");
            let fill_amount = (sell_quantity as f64 * sell_price) as i64;
            self.risk_manager
                .on_position_closed(stock_code, &strategy_code, fill_amount);
        }
    }

    // -------------------------------------------------------------------------
    // State machine listener
    // -------------------------------------------------------------------------

    /// Completed and dead orders release their risk state; sell fills
    /// reduce positions; live buy fills book positions.
    fn on_state_change(&self, new_state: OrderState, order: &Order) {
        match (new_state, order.side) {
            (OrderState::Filled, OrderSide::Buy) => {
                // Cash reservation is spent; release it.
                let reserved = MarginGuard::required_amount(order.quantity, order.price as i64);
                self.risk_manager.on_buy_filled(reserved);

                // Live fills arrive via the websocket, so the position is
                // booked here; paper fills already booked synchronously.
                if self.trade_mode == TradeMode::Live && order.filled_quantity > 0 {
                    let mut positions = self.positions.write();
                    let entry = positions.entry(order.stock_code.clone());
                    let position = entry.or_insert_with(|| Position {
                        stock_code: order.stock_code.clone(),
                        quantity: 0,
                        avg_entry_price: 0.0,
                        total_cost: 0.0,
                        strategy_code: order.strategy_code.clone(),
                        stop_loss_price: order.stop_loss_price,
                        grade: order.grade,
                        sector: order.sector.clone(),
                        position_pct: order.position_pct,
                        mode: order.mode,
                        entry_time: now_epoch(),
                        updated_at: now_epoch(),
                    });
                    let new_qty = position.quantity + order.filled_quantity;
                    let new_cost =
                        position.total_cost + order.fill_price * order.filled_quantity as f64;
                    position.quantity = new_qty;
                    position.total_cost = new_cost;
                    position.avg_entry_price = if new_qty > 0 {
                        new_cost / new_qty as f64
                    } else {
                        0.0
                    };
                    position.updated_at = now_epoch();
                }
            }
            (OrderState::Filled, OrderSide::Sell) => {
                let qty = if order.filled_quantity > 0 {
                    order.filled_quantity
                } else {
                    order.quantity
                };
                self.reduce_position(&order.stock_code, qty, order.fill_price);
            }
            (
                OrderState::Cancelled | OrderState::Rejected | OrderState::Expired | OrderState::Error,
                OrderSide::Buy,
            ) => {
                let reserved = MarginGuard::required_amount(order.quantity, order.price as i64);
                if order.filled_quantity == 0 {
                    // Nothing filled: the whole risk footprint comes back.
                    self.risk_manager.on_order_abandoned(
                        &order.stock_code,
                        &order.strategy_code,
                        reserved,
                    );
                } else {
                    // Partially filled then cancelled: keep the exposure
                    // lock (the position exists) but free the cash hold.
                    self.risk_manager.on_buy_filled(reserved);
                }
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for OrderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderManager")
            .field("mode", &self.trade_mode)
            .field("pending", &self.state_machine.get_pending_orders().len())
            .field("positions", &self.get_open_positions().len())
            .field("blocked", &self.block_new_orders())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::cache::{test_book, RealtimeCache};
    use crate::risk::drawdown::DrawdownProtocol;
    use crate::risk::global_lock::GlobalPositionLock;
    use crate::risk::grade_allocator::GradeAllocator;
    use crate::risk::kill_switch::DailyKillSwitch;
    use crate::risk::position_sizer::PositionSizer;
    use crate::types::StockGrade;

    const CAPITAL: i64 = 36_000_000;

    struct Fixture {
        manager: Arc<OrderManager>,
        cache: Arc<RealtimeCache>,
        state_machine: Arc<OrderStateMachine>,
        risk: Arc<RiskManager>,
        margin: Arc<MarginGuard>,
        kill: Arc<DailyKillSwitch>,
    }

    fn fixture() -> Fixture {
        let cache = Arc::new(RealtimeCache::new());
        let state_machine = Arc::new(OrderStateMachine::new());
        let tracker = Arc::new(OrderTracker::new(Arc::clone(&state_machine), None));
        let paper = Arc::new(PaperTradingEngine::new(Arc::clone(&cache)));
        paper.set_paper_cash(CAPITAL as f64);

        let margin = Arc::new(MarginGuard::new(None));
        margin.set_balance(CAPITAL);
        let kill = Arc::new(DailyKillSwitch::new(0.03, CAPITAL));
        let risk = Arc::new(RiskManager::new(
            PositionSizer::new(),
            GradeAllocator::new(),
            Arc::new(GlobalPositionLock::new()),
            None,
            Some(Arc::clone(&margin)),
            Some(Arc::clone(&kill)),
            Some(Arc::new(DrawdownProtocol::new())),
        ));

        let manager = OrderManager::new(
            None,
            Arc::clone(&state_machine),
            tracker,
            paper,
            Arc::clone(&risk),
            Arc::new(PyramidManager::default()),
            TradeMode::Paper,
        );
        manager.set_risk_inputs(RiskInputs {
            regime: MarketRegime::StrongBull,
            total_capital: CAPITAL,
            pnl: PnlContext {
                current_capital: CAPITAL,
                ..Default::default()
            },
        });

        Fixture {
            manager,
            cache,
            state_machine,
            risk,
            margin,
            kill,
        }
    }

    /// Sizes to exactly 100 shares of 005930 at 72,000 under StrongBull
    /// with full confidence (36M * 2% / 10% stop = 7.2M).
    fn buy_signal() -> TradeSignal {
        TradeSignal {
            stock_code: "005930".to_string(),
            side: OrderSide::Buy,
            strategy_code: "VB".to_string(),
            entry_price: 72_000,
            stop_loss: 64_800,
            grade: StockGrade::A,
            confidence: 5,
            quantity: None,
            position_pct: 0.0,
            sector: "semis".to_string(),
            indicators_snapshot: serde_json::Value::Null,
        }
    }

    // ---- paper buy full fill ---------------------------------------------

    #[tokio::test]
    async fn paper_buy_full_fill_books_position() {
        let fx = fixture();
        fx.cache
            .update_orderbook("005930", test_book(72_000.0, 1_000, 71_900.0, 800));

        let outcome = fx.manager.place_order(&buy_signal()).await;

        let PlaceOutcome::Filled { order_id, fill } = outcome else {
            panic!("expected full fill, got {outcome:?}");
        };
        assert_eq!(fill.fill_price, 72_072.0);
        assert_eq!(fill.fill_quantity, 100);
        assert_eq!(fill.remaining_quantity, 0);

        let order = fx.state_machine.get_order(&order_id).unwrap();
        assert_eq!(order.state, OrderState::Filled);

        let position = fx.manager.get_position("005930").unwrap();
        assert_eq!(position.quantity, 100);
        assert!((position.avg_entry_price - 72_072.0).abs() < 1e-9);

        // The buy fill spends the cash reservation.
        assert_eq!(fx.margin.pending_count(), 0);
        // The exposure lock stays while the position is open.
        assert_eq!(
            fx.risk.global_lock().get_stock_exposure("005930").total_pct,
            20.0
        );
    }

    // ---- paper buy partial fill ------------------------------------------

    #[tokio::test]
    async fn paper_buy_partial_fill_keeps_remainder_pending() {
        let fx = fixture();
        // Best ask only 300 deep: 100/300 = 33% > 20% => partial.
        fx.cache
            .update_orderbook("005930", test_book(72_000.0, 300, 71_900.0, 300));

        let outcome = fx.manager.place_order(&buy_signal()).await;

        let PlaceOutcome::PartialFilled { order_id, fill } = outcome else {
            panic!("expected partial fill, got {outcome:?}");
        };
        assert_eq!(fill.fill_quantity, 60); // 300 * 0.2
        assert_eq!(fill.remaining_quantity, 40);

        let order = fx.state_machine.get_order(&order_id).unwrap();
        assert_eq!(order.state, OrderState::PartialFilled);

        let position = fx.manager.get_position("005930").unwrap();
        assert_eq!(position.quantity, 60);
    }

    // ---- paper rejection --------------------------------------------------

    #[tokio::test]
    async fn paper_rejection_releases_all_risk_state() {
        let fx = fixture();
        // No orderbook cached: the engine must reject.
        let outcome = fx.manager.place_order(&buy_signal()).await;

        let PlaceOutcome::Rejected { order_id, reason } = outcome else {
            panic!("expected rejection");
        };
        assert!(reason.contains("no orderbook"));

        let order = fx.state_machine.get_order(&order_id.unwrap()).unwrap();
        assert_eq!(order.state, OrderState::Rejected);

        // Lock and cash reservation both came back.
        assert_eq!(
            fx.risk.global_lock().get_stock_exposure("005930").total_pct,
            0.0
        );
        assert_eq!(fx.margin.pending_count(), 0);
        assert!(fx.manager.get_position("005930").is_none());
    }

    // ---- risk rejection ---------------------------------------------------

    #[tokio::test]
    async fn risk_rejection_reports_step() {
        let fx = fixture();
        let mut signal = buy_signal();
        signal.confidence = 1;

        let outcome = fx.manager.place_order(&signal).await;
        let PlaceOutcome::Rejected { order_id, reason } = outcome else {
            panic!("expected rejection");
        };
        assert!(order_id.is_none());
        assert!(reason.contains("risk step 1"));
        assert!(reason.contains("per_trade_risk"));
        // No order was created at all.
        assert_eq!(fx.state_machine.order_count(), 0);
    }

    // ---- kill switch ------------------------------------------------------

    #[tokio::test]
    async fn killed_switch_blocks_every_new_order_until_reset() {
        let fx = fixture();
        fx.cache
            .update_orderbook("005930", test_book(72_000.0, 1_000, 71_900.0, 800));

        // Trip the breaker: -5% against starting capital.
        assert!(!fx.kill.check(CAPITAL - CAPITAL / 20));

        let outcome = fx.manager.place_order(&buy_signal()).await;
        let PlaceOutcome::Rejected { reason, .. } = outcome else {
            panic!("expected rejection");
        };
        assert!(reason.contains("daily_kill_switch"));

        fx.kill.reset_daily(CAPITAL);
        let outcome = fx.manager.place_order(&buy_signal()).await;
        assert!(outcome.is_success());
    }

    // ---- block flag -------------------------------------------------------

    #[tokio::test]
    async fn block_flag_short_circuits() {
        let fx = fixture();
        fx.manager.set_block_new_orders(true);

        let outcome = fx.manager.place_order(&buy_signal()).await;
        let PlaceOutcome::Rejected { reason, .. } = outcome else {
            panic!("expected rejection");
        };
        assert!(reason.contains("blocked"));
        assert_eq!(fx.state_machine.order_count(), 0);
    }

    // ---- sell reduces and closes ------------------------------------------

    #[tokio::test]
    async fn sell_fill_closes_position_and_releases_lock() {
        let fx = fixture();
        fx.cache
            .update_orderbook("005930", test_book(72_000.0, 1_000, 71_900.0, 1_000));

        assert!(fx.manager.place_order(&buy_signal()).await.is_success());
        assert!(fx.manager.get_position("005930").is_some());

        let mut sell = buy_signal();
        sell.side = OrderSide::Sell;
        sell.quantity = Some(100);
        sell.entry_price = 0; // market

        let outcome = fx.manager.place_order(&sell).await;
        assert!(outcome.is_success());

        assert!(fx.manager.get_position("005930").is_none());
        // Position close released the exposure lock.
        assert_eq!(
            fx.risk.global_lock().get_stock_exposure("005930").total_pct,
            0.0
        );
    }

    // ---- cancel path ------------------------------------------------------

    #[tokio::test]
    async fn cancel_pending_order_releases_reservations() {
        let fx = fixture();
        // Partial-fill book so the order stays pending.
        fx.cache
            .update_orderbook("005930", test_book(72_000.0, 300, 71_900.0, 300));

        let outcome = fx.manager.place_order(&buy_signal()).await;
        let order_id = outcome.order_id().unwrap().to_string();

        let order = fx.manager.cancel_order(&order_id).await.unwrap();
        assert_eq!(order.state, OrderState::Cancelled);

        // Cash hold is freed; the lock survives because 60 shares filled.
        assert_eq!(fx.margin.pending_count(), 0);
        assert!(fx.manager.get_position("005930").is_some());
    }

    #[tokio::test]
    async fn cancel_all_pending_sweeps_everything() {
        let fx = fixture();
        fx.cache
            .update_orderbook("005930", test_book(72_000.0, 300, 71_900.0, 300));
        // Shallow book so the second order also only partially fills.
        fx.cache
            .update_orderbook("000660", test_book(130_000.0, 100, 129_500.0, 100));

        fx.manager.place_order(&buy_signal()).await;
        let mut second = buy_signal();
        second.stock_code = "000660".to_string();
        second.entry_price = 130_000;
        second.stop_loss = 117_000;
        second.strategy_code = "GR".to_string();
        second.sector = "memory".to_string();
        fx.manager.place_order(&second).await;

        assert_eq!(fx.state_machine.get_pending_orders().len(), 2);
        let cancelled = fx.manager.cancel_all_pending().await;
        assert_eq!(cancelled, 2);
        assert!(fx.state_machine.get_pending_orders().is_empty());
    }

    // ---- modify -----------------------------------------------------------

    #[tokio::test]
    async fn modify_submitted_order_patches_price_in_place() {
        let fx = fixture();
        // Build a pending submitted order directly on the state machine.
        let draft = OrderDraft {
            stock_code: "005930".to_string(),
            side: OrderSide::Buy,
            quantity: 10,
            price: 70_000.0,
            strategy_code: "GR".to_string(),
            stop_loss_price: 65_000,
            confidence: 4,
            grade: StockGrade::A,
            sector: "semis".to_string(),
            position_pct: 2.0,
            mode: TradeMode::Paper,
        };
        fx.state_machine.create_order("ORD-M", draft).unwrap();
        fx.state_machine
            .transition("ORD-M", OrderState::Submitted, None)
            .unwrap();

        let order = fx.manager.modify_order("ORD-M", 70_500.0).await.unwrap();
        assert_eq!(order.state, OrderState::Submitted);
        assert_eq!(order.price, 70_500.0);
        // In-place patch: history gained no entry beyond CREATED+SUBMITTED.
        assert_eq!(order.history.len(), 2);
    }

    #[tokio::test]
    async fn modify_partial_filled_goes_through_amend() {
        let fx = fixture();
        let draft = OrderDraft {
            stock_code: "005930".to_string(),
            side: OrderSide::Buy,
            quantity: 10,
            price: 70_000.0,
            strategy_code: "GR".to_string(),
            stop_loss_price: 65_000,
            confidence: 4,
            grade: StockGrade::A,
            sector: "semis".to_string(),
            position_pct: 2.0,
            mode: TradeMode::Paper,
        };
        fx.state_machine.create_order("ORD-M", draft).unwrap();
        fx.state_machine
            .transition("ORD-M", OrderState::Submitted, None)
            .unwrap();
        fx.state_machine
            .transition("ORD-M", OrderState::PartialFilled, None)
            .unwrap();

        let order = fx.manager.modify_order("ORD-M", 70_500.0).await.unwrap();
        assert_eq!(order.state, OrderState::Submitted);
        // Path went PARTIAL_FILLED -> AMEND_REQUESTED -> SUBMITTED.
        let states: Vec<OrderState> = order.history.iter().map(|h| h.state).collect();
        assert!(states.contains(&OrderState::AmendRequested));
    }

    #[tokio::test]
    async fn modify_terminal_order_is_refused() {
        let fx = fixture();
        fx.cache
            .update_orderbook("005930", test_book(72_000.0, 1_000, 71_900.0, 800));
        let outcome = fx.manager.place_order(&buy_signal()).await;
        let order_id = outcome.order_id().unwrap().to_string();

        let err = fx.manager.modify_order(&order_id, 73_000.0).await.unwrap_err();
        assert!(err.contains("FILLED"));
    }

    // ---- close all --------------------------------------------------------

    #[tokio::test]
    async fn close_all_positions_sells_market() {
        let fx = fixture();
        fx.cache
            .update_orderbook("005930", test_book(72_000.0, 1_000, 71_900.0, 1_000));

        fx.manager.place_order(&buy_signal()).await;
        assert_eq!(fx.manager.get_open_positions().len(), 1);

        let results = fx.manager.close_all_positions().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_success());
        assert!(fx.manager.get_open_positions().is_empty());
    }
}
