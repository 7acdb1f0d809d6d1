// =============================================================================
// Order Tracker — TTL sweep over pending orders plus fill ingestion
// =============================================================================
//
// A background task sweeps SUBMITTED / PARTIAL_FILLED orders every 10 s.
// Each strategy gets its own time-to-live (volatility breakout needs speed,
// grid orders can wait):
//
//   VB 60 s | S2 120 s | GR 600 s | default 300 s
//
// Sweep policy per order, with age_ratio = elapsed / ttl:
//   - age_ratio >= 1.0: cancel (remaining quantity only when partially
//     filled).
//   - age_ratio >= 0.8, still SUBMITTED, not yet amended: re-price to
//     market (price 0) to chase the fill, then flag it so the amend happens
//     once.
//
// Fill notifications from the websocket land in `on_fill_notification` and
// drive FILLED / PARTIAL_FILLED transitions on the state machine.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::api::rest::KisRestClient;
use crate::api::ws::FieldMap;
use crate::order::state_machine::{Order, OrderState, OrderStateMachine};
use crate::types::OrderSide;

/// Fallback TTL for strategies without a dedicated entry.
pub const DEFAULT_ORDER_TTL_SECS: u64 = 300;

/// Sweep period.
const CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Fraction of TTL after which an unfilled order is re-priced to market.
const AMEND_THRESHOLD_RATIO: f64 = 0.80;

/// Strategy-specific time-to-live in seconds.
pub fn strategy_ttl_secs(strategy_code: &str) -> u64 {
    match strategy_code {
        "VB" => 60,  // volatility breakout: needs a fast fill
        "S2" => 120, // gap-and-go
        "GR" => 600, // grid orders can rest
        _ => DEFAULT_ORDER_TTL_SECS,
    }
}

/// What the sweep decided for one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepAction {
    Cancel,
    CancelRemaining,
    AmendToMarket,
}

/// Pure sweep decision, separated from I/O so the policy is testable.
fn sweep_action(state: OrderState, age_ratio: f64, amended: bool) -> Option<SweepAction> {
    if age_ratio >= 1.0 {
        return Some(if state == OrderState::PartialFilled {
            SweepAction::CancelRemaining
        } else {
            SweepAction::Cancel
        });
    }
    if age_ratio >= AMEND_THRESHOLD_RATIO && state == OrderState::Submitted && !amended {
        return Some(SweepAction::AmendToMarket);
    }
    None
}

/// Watches pending orders and reconciles websocket fills.
pub struct OrderTracker {
    state_machine: Arc<OrderStateMachine>,
    rest_client: Option<Arc<KisRestClient>>,
    running: AtomicBool,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl OrderTracker {
    pub fn new(state_machine: Arc<OrderStateMachine>, rest_client: Option<Arc<KisRestClient>>) -> Self {
        info!(
            default_ttl_secs = DEFAULT_ORDER_TTL_SECS,
            check_interval_secs = CHECK_INTERVAL.as_secs(),
            "order tracker initialised"
        );
        Self {
            state_machine,
            rest_client,
            running: AtomicBool::new(false),
            task: parking_lot::Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Spawn the 10-second sweep loop.
    pub fn start_tracking(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("order tracker already running");
            return;
        }

        let tracker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!("order tracker loop started");
            let mut interval = tokio::time::interval(CHECK_INTERVAL);
            while tracker.running.load(Ordering::SeqCst) {
                interval.tick().await;
                tracker.check_pending_orders().await;
            }
            info!("order tracker loop stopped");
        });

        if let Some(prev) = self.task.lock().replace(handle) {
            prev.abort();
        }
    }

    /// Stop the sweep loop.
    pub fn stop_tracking(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        info!("order tracker stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Sweep
    // -------------------------------------------------------------------------

    /// One sweep over all pending orders.
    pub async fn check_pending_orders(&self) {
        let pending = self.state_machine.get_pending_orders();
        if pending.is_empty() {
            return;
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        for order in pending {
            let ttl = strategy_ttl_secs(&order.strategy_code) as f64;
            let elapsed = now - order.created_at;
            let age_ratio = if ttl > 0.0 { elapsed / ttl } else { 1.0 };

            debug!(
                order_id = %order.order_id,
                state = %order.state,
                strategy = %order.strategy_code,
                ttl_secs = ttl,
                elapsed_secs = format!("{elapsed:.1}"),
                age_ratio = format!("{age_ratio:.2}"),
                "order tracker check"
            );

            match sweep_action(order.state, age_ratio, order.amended) {
                Some(SweepAction::Cancel) => self.cancel_order(&order, "order TTL expired").await,
                Some(SweepAction::CancelRemaining) => self.cancel_remaining(&order).await,
                Some(SweepAction::AmendToMarket) => self.amend_to_market(&order).await,
                None => {}
            }
        }
    }

    // -------------------------------------------------------------------------
    // Cancel / amend
    // -------------------------------------------------------------------------

    async fn cancel_order(&self, order: &Order, reason: &str) {
        let order_id = order.order_id.as_str();
        info!(order_id, stock_code = %order.stock_code, reason, "tracker cancelling order");

        if let Err(e) = self.state_machine.transition(
            order_id,
            OrderState::CancelRequested,
            Some(json!({ "cancel_reason": reason })),
        ) {
            warn!(order_id, error = %e, "cancel transition refused");
            return;
        }

        if let (Some(client), Some(broker_no)) = (&self.rest_client, &order.broker_order_no) {
            if let Err(e) = client.cancel_order(broker_no, &order.stock_code).await {
                warn!(order_id, error = %e, "broker cancel failed; order left in CANCEL_REQUESTED");
                return;
            }
        }

        if let Err(e) = self.state_machine.transition(
            order_id,
            OrderState::Cancelled,
            Some(json!({ "cancel_reason": reason, "cancelled_by": "order_tracker" })),
        ) {
            warn!(order_id, error = %e, "cancelled transition refused");
        }
    }

    async fn cancel_remaining(&self, order: &Order) {
        let remaining = order.remaining_quantity();
        info!(
            order_id = %order.order_id,
            stock_code = %order.stock_code,
            filled_qty = order.filled_quantity,
            remaining_qty = remaining,
            "tracker cancelling partial-fill remainder"
        );

        let order_id = order.order_id.as_str();
        if let Err(e) = self.state_machine.transition(
            order_id,
            OrderState::CancelRequested,
            Some(json!({
                "cancel_reason": "partial fill remainder past TTL",
                "remaining_quantity": remaining,
            })),
        ) {
            warn!(order_id, error = %e, "cancel-remaining transition refused");
            return;
        }

        if let (Some(client), Some(broker_no)) = (&self.rest_client, &order.broker_order_no) {
            if let Err(e) = client.cancel_order(broker_no, &order.stock_code).await {
                warn!(order_id, error = %e, "broker cancel failed; order left in CANCEL_REQUESTED");
                return;
            }
        }

        if let Err(e) = self.state_machine.transition(
            order_id,
            OrderState::Cancelled,
            Some(json!({
                "cancel_reason": "partial fill remainder cancelled",
                "remaining_quantity": remaining,
                "cancelled_by": "order_tracker",
            })),
        ) {
            warn!(order_id, error = %e, "cancelled transition refused");
        }
    }

    /// Re-price an unfilled order to market (price 0) to chase the fill.
    async fn amend_to_market(&self, order: &Order) {
        let order_id = order.order_id.as_str();
        info!(
            order_id,
            stock_code = %order.stock_code,
            "tracker amending order to market price"
        );

        // PARTIAL_FILLED goes through the AMEND_REQUESTED edge; SUBMITTED
        // has no such edge and is re-priced at the broker only.
        let via_amend_state = order.state == OrderState::PartialFilled;
        if via_amend_state {
            if let Err(e) = self.state_machine.transition(
                order_id,
                OrderState::AmendRequested,
                Some(json!({ "amend_reason": "market re-price at 80% TTL" })),
            ) {
                warn!(order_id, error = %e, "amend transition refused");
                return;
            }
        }

        if let (Some(client), Some(broker_no)) = (&self.rest_client, &order.broker_order_no) {
            if let Err(e) = client
                .modify_order(broker_no, &order.stock_code, 0, "01")
                .await
            {
                warn!(order_id, error = %e, "broker amend failed");
                return;
            }
        }

        if via_amend_state {
            if let Err(e) = self.state_machine.transition(
                order_id,
                OrderState::Submitted,
                Some(json!({ "amend_result": "re-priced to market" })),
            ) {
                warn!(order_id, error = %e, "post-amend transition refused");
            }
        }

        if let Err(e) = self.state_machine.mark_amended(order_id) {
            warn!(order_id, error = %e, "failed to flag amended order");
        }
    }

    // -------------------------------------------------------------------------
    // Locked capital
    // -------------------------------------------------------------------------

    /// KRW locked in pending buy orders: remaining quantity times price.
    /// Sells lock shares, not cash, and are excluded.
    pub fn get_locked_capital(&self) -> f64 {
        let pending = self.state_machine.get_pending_orders();
        let total: f64 = pending
            .iter()
            .filter(|o| o.side == OrderSide::Buy)
            .map(|o| o.remaining_quantity() as f64 * o.price)
            .sum();

        debug!(total_locked = total, pending_count = pending.len(), "locked capital computed");
        total
    }

    // -------------------------------------------------------------------------
    // Websocket fill ingestion
    // -------------------------------------------------------------------------

    /// Apply an order-notice frame (H0STCNC0) to the state machine.
    ///
    /// The order is resolved by internal id when present, otherwise by the
    /// broker order number. Zero remaining quantity means a full fill.
    pub fn on_fill_notification(&self, fields: &FieldMap) {
        let raw_id = fields
            .get("order_id")
            .or_else(|| fields.get("odno"))
            .cloned()
            .unwrap_or_default();
        if raw_id.is_empty() {
            warn!("fill notification without order id");
            return;
        }

        let order = match self.state_machine.get_order(&raw_id) {
            Ok(order) => order,
            Err(_) => match self.state_machine.find_by_broker_no(&raw_id) {
                Some(order) => order,
                None => {
                    warn!(order_ref = %raw_id, "fill notification for unknown order");
                    return;
                }
            },
        };

        let total_filled: i64 = fields
            .get("tot_ccld_qty")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let remaining: i64 = fields
            .get("rmn_qty")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let fill_price: f64 = fields
            .get("ccld_prc")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let fill_amount: f64 = fields
            .get("tot_ccld_amt")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);

        let metadata = json!({
            "fill_price": fill_price,
            "fill_amount": fill_amount,
            "filled_quantity": total_filled,
            "remaining_quantity": remaining,
            "fill_source": "websocket",
        });

        let order_id = order.order_id.clone();
        if remaining <= 0 {
            match self
                .state_machine
                .transition(&order_id, OrderState::Filled, Some(metadata))
            {
                Ok(_) => info!(
                    order_id = %order_id,
                    fill_price,
                    total_filled,
                    stock_code = %order.stock_code,
                    "order fully filled"
                ),
                Err(e) => warn!(order_id = %order_id, error = %e, "fill transition refused"),
            }
            return;
        }

        match order.state {
            OrderState::Submitted => {
                if let Err(e) =
                    self.state_machine
                        .transition(&order_id, OrderState::PartialFilled, Some(metadata))
                {
                    warn!(order_id = %order_id, error = %e, "partial-fill transition refused");
                }
            }
            OrderState::PartialFilled => {
                // Already partial: progress update only.
                if let Err(e) = self.state_machine.merge_metadata(&order_id, &metadata) {
                    warn!(order_id = %order_id, error = %e, "fill progress merge failed");
                }
            }
            other => {
                warn!(
                    order_id = %order_id,
                    state = %other,
                    "partial fill notice in unexpected state"
                );
            }
        }

        info!(
            order_id = %order_id,
            fill_price,
            total_filled,
            remaining,
            stock_code = %order.stock_code,
            "order partially filled"
        );
    }
}

impl std::fmt::Debug for OrderTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderTracker")
            .field("running", &self.is_running())
            .field("pending", &self.state_machine.get_pending_orders().len())
            .finish()
    }
}
