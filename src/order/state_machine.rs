// =============================================================================
// Order State Machine — finite-state lifecycle for every order
// =============================================================================
//
// Life-cycle:
//
//   CREATED ──> SUBMITTED ──> PARTIAL_FILLED ──> FILLED
//      │             │    │         │
//      │             │    │         ├──> CANCEL_REQUESTED ──> CANCELLED
//      │             │    │         └──> AMEND_REQUESTED ──> SUBMITTED
//      │             │    └──> CANCEL_REQUESTED ──> CANCELLED | FILLED
//      └──> REJECTED └──> REJECTED | ERROR
//
// FILLED, CANCELLED, REJECTED, EXPIRED, and ERROR are terminal: no edges
// leave them. FILLED, CANCELLED, and EXPIRED additionally fire the
// completion hook.
//
// Every transition appends to the order's history and fans out to the
// registered listeners; a panicking listener is logged and isolated, it
// never poisons the transition.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::types::{OrderSide, StockGrade, TradeMode};

/// Order lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OrderState {
    Created,
    Submitted,
    PartialFilled,
    Filled,
    CancelRequested,
    Cancelled,
    AmendRequested,
    Rejected,
    Expired,
    Error,
}

impl OrderState {
    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired | Self::Error
        )
    }

    /// Completed states fire the completion hook.
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Expired)
    }

    /// The permitted edge set.
    fn can_transition_to(self, next: OrderState) -> bool {
        use OrderState::*;
        match self {
            Created => matches!(next, Submitted | Rejected),
            Submitted => matches!(
                next,
                PartialFilled | Filled | CancelRequested | Rejected | Error
            ),
            PartialFilled => matches!(next, Filled | CancelRequested | AmendRequested),
            CancelRequested => matches!(next, Cancelled | Filled),
            AmendRequested => matches!(next, Submitted | Rejected),
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Created => "CREATED",
            Self::Submitted => "SUBMITTED",
            Self::PartialFilled => "PARTIAL_FILLED",
            Self::Filled => "FILLED",
            Self::CancelRequested => "CANCEL_REQUESTED",
            Self::Cancelled => "CANCELLED",
            Self::AmendRequested => "AMEND_REQUESTED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
            Self::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// One history entry per state change.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub state: OrderState,
    /// Epoch seconds.
    pub timestamp: f64,
    pub metadata: Option<Value>,
}

/// Everything known about one order. Owned exclusively by the state
/// machine; callers get clones.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub order_id: String,
    pub stock_code: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub price: f64,
    pub strategy_code: String,
    pub stop_loss_price: i64,
    pub confidence: u8,
    pub grade: StockGrade,
    pub sector: String,
    /// % of capital this order represents.
    pub position_pct: f64,
    pub mode: TradeMode,
    pub broker_order_no: Option<String>,
    pub state: OrderState,
    pub created_at: f64,
    pub updated_at: f64,
    pub history: Vec<HistoryEntry>,
    pub filled_quantity: i64,
    pub fill_price: f64,
    /// Set once the tracker has amended the order to market price.
    pub amended: bool,
}

impl Order {
    pub fn remaining_quantity(&self) -> i64 {
        (self.quantity - self.filled_quantity).max(0)
    }
}

/// Initial order fields supplied at creation.
#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub stock_code: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub price: f64,
    pub strategy_code: String,
    pub stop_loss_price: i64,
    pub confidence: u8,
    pub grade: StockGrade,
    pub sector: String,
    pub position_pct: f64,
    pub mode: TradeMode,
}

/// State machine failures.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order not found: {0}")]
    NotFound(String),

    #[error("duplicate order id: {0}")]
    DuplicateId(String),

    #[error("order {order_id}: transition {from} -> {to} is not allowed")]
    InvalidTransition {
        order_id: String,
        from: OrderState,
        to: OrderState,
    },
}

/// Listener signature: (order_id, old_state, new_state, order snapshot).
pub type StateChangeCallback = Arc<dyn Fn(&str, OrderState, OrderState, &Order) + Send + Sync>;
/// Completion hook signature: (order_id, final_state, order snapshot).
pub type CompletionCallback = Arc<dyn Fn(&str, OrderState, &Order) + Send + Sync>;

/// Owns every order and enforces the lifecycle graph.
pub struct OrderStateMachine {
    orders: RwLock<HashMap<String, Order>>,
    callbacks: RwLock<Vec<StateChangeCallback>>,
    completion_callbacks: RwLock<Vec<CompletionCallback>>,
}

fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl OrderStateMachine {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
            completion_callbacks: RwLock::new(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Creation
    // -------------------------------------------------------------------------

    /// Allocate a unique order id: `{prefix}-{epoch_ms}-{uuid8}`.
    pub fn generate_order_id(prefix: &str) -> String {
        let epoch_ms = chrono::Utc::now().timestamp_millis();
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        format!("{prefix}-{epoch_ms}-{}", &uuid[..8])
    }

    /// Create a new order in CREATED state.
    pub fn create_order(&self, order_id: &str, draft: OrderDraft) -> Result<Order, OrderError> {
        let mut orders = self.orders.write();
        if orders.contains_key(order_id) {
            return Err(OrderError::DuplicateId(order_id.to_string()));
        }

        let now = now_epoch();
        let order = Order {
            order_id: order_id.to_string(),
            stock_code: draft.stock_code,
            side: draft.side,
            quantity: draft.quantity,
            price: draft.price,
            strategy_code: draft.strategy_code,
            stop_loss_price: draft.stop_loss_price,
            confidence: draft.confidence,
            grade: draft.grade,
            sector: draft.sector,
            position_pct: draft.position_pct,
            mode: draft.mode,
            broker_order_no: None,
            state: OrderState::Created,
            created_at: now,
            updated_at: now,
            history: vec![HistoryEntry {
                state: OrderState::Created,
                timestamp: now,
                metadata: None,
            }],
            filled_quantity: 0,
            fill_price: 0.0,
            amended: false,
        };

        info!(
            order_id,
            stock_code = %order.stock_code,
            side = %order.side,
            quantity = order.quantity,
            price = order.price,
            "order created"
        );

        orders.insert(order_id.to_string(), order.clone());
        Ok(order)
    }

    // -------------------------------------------------------------------------
    // Transition
    // -------------------------------------------------------------------------

    /// Drive an order to `new_state`.
    ///
    /// Validates the edge, stamps history, merges recognised metadata into
    /// the order, then fans out to listeners. Completed states additionally
    /// fire the completion hook.
    pub fn transition(
        &self,
        order_id: &str,
        new_state: OrderState,
        metadata: Option<Value>,
    ) -> Result<Order, OrderError> {
        let (old_state, snapshot) = {
            let mut orders = self.orders.write();
            let order = orders
                .get_mut(order_id)
                .ok_or_else(|| OrderError::NotFound(order_id.to_string()))?;

            let old_state = order.state;
            if old_state.is_terminal() || !old_state.can_transition_to(new_state) {
                return Err(OrderError::InvalidTransition {
                    order_id: order_id.to_string(),
                    from: old_state,
                    to: new_state,
                });
            }

            let now = now_epoch();
            order.state = new_state;
            order.updated_at = now;
            order.history.push(HistoryEntry {
                state: new_state,
                timestamp: now,
                metadata: metadata.clone(),
            });
            if let Some(ref meta) = metadata {
                apply_metadata(order, meta);
            }

            (old_state, order.clone())
        };

        info!(
            order_id,
            old_state = %old_state,
            new_state = %new_state,
            stock_code = %snapshot.stock_code,
            "order state transition"
        );

        // Listener fan-out outside the write lock; a panicking listener is
        // logged but must not abort the transition or later listeners.
        let callbacks: Vec<StateChangeCallback> = self.callbacks.read().clone();
        for callback in callbacks {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(order_id, old_state, new_state, &snapshot)
            }));
            if result.is_err() {
                error!(order_id, "state change listener panicked");
            }
        }

        if new_state.is_completed() {
            info!(
                order_id,
                final_state = %new_state,
                stock_code = %snapshot.stock_code,
                quantity = snapshot.quantity,
                "order completed"
            );
            let hooks: Vec<CompletionCallback> = self.completion_callbacks.read().clone();
            for hook in hooks {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    hook(order_id, new_state, &snapshot)
                }));
                if result.is_err() {
                    error!(order_id, "completion listener panicked");
                }
            }
        }

        Ok(snapshot)
    }

    /// Merge metadata into an order without a state change (fill progress
    /// updates on an already-PARTIAL_FILLED order, broker order numbers).
    pub fn merge_metadata(&self, order_id: &str, metadata: &Value) -> Result<Order, OrderError> {
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| OrderError::NotFound(order_id.to_string()))?;
        apply_metadata(order, metadata);
        order.updated_at = now_epoch();
        Ok(order.clone())
    }

    /// Flag the order as amended-to-market so the tracker never amends it
    /// twice.
    pub fn mark_amended(&self, order_id: &str) -> Result<(), OrderError> {
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| OrderError::NotFound(order_id.to_string()))?;
        order.amended = true;
        order.updated_at = now_epoch();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get_order(&self, order_id: &str) -> Result<Order, OrderError> {
        self.orders
            .read()
            .get(order_id)
            .cloned()
            .ok_or_else(|| OrderError::NotFound(order_id.to_string()))
    }

    /// Orders awaiting fills: SUBMITTED or PARTIAL_FILLED.
    pub fn get_pending_orders(&self) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| matches!(o.state, OrderState::Submitted | OrderState::PartialFilled))
            .cloned()
            .collect()
    }

    pub fn get_orders_by_state(&self, state: OrderState) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| o.state == state)
            .cloned()
            .collect()
    }

    /// Find an order by the broker-assigned order number.
    pub fn find_by_broker_no(&self, broker_order_no: &str) -> Option<Order> {
        self.orders
            .read()
            .values()
            .find(|o| o.broker_order_no.as_deref() == Some(broker_order_no))
            .cloned()
    }

    pub fn order_count(&self) -> usize {
        self.orders.read().len()
    }

    // -------------------------------------------------------------------------
    // Listener registration
    // -------------------------------------------------------------------------

    pub fn register_callback(&self, callback: StateChangeCallback) {
        self.callbacks.write().push(callback);
    }

    pub fn register_completion_callback(&self, callback: CompletionCallback) {
        self.completion_callbacks.write().push(callback);
    }
}

/// Fold recognised metadata keys into the typed order fields. Unrecognised
/// keys stay in the history entry only.
fn apply_metadata(order: &mut Order, metadata: &Value) {
    if let Some(v) = metadata.get("fill_price").and_then(Value::as_f64) {
        order.fill_price = v;
    }
    if let Some(v) = metadata.get("filled_quantity").and_then(Value::as_i64) {
        order.filled_quantity = v;
    }
    if let Some(v) = metadata.get("broker_order_no").and_then(Value::as_str) {
        order.broker_order_no = Some(v.to_string());
    }
    if let Some(v) = metadata.get("price").and_then(Value::as_f64) {
        order.price = v;
    }
    if let Some(true) = metadata.get("amended").and_then(Value::as_bool) {
        order.amended = true;
    }
    if metadata.get("reject_reason").is_some() || metadata.get("error").is_some() {
        warn!(
            order_id = %order.order_id,
            metadata = %metadata,
            "order carries failure metadata"
        );
    }
}

impl Default for OrderStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OrderStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderStateMachine")
            .field("total_orders", &self.order_count())
            .field("pending", &self.get_pending_orders().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub(crate) fn draft(stock: &str) -> OrderDraft {
        OrderDraft {
            stock_code: stock.to_string(),
            side: OrderSide::Buy,
            quantity: 100,
            price: 72_000.0,
            strategy_code: "VB".to_string(),
            stop_loss_price: 70_000,
            confidence: 4,
            grade: StockGrade::A,
            sector: "semis".to_string(),
            position_pct: 7.2,
            mode: TradeMode::Paper,
        }
    }

    // ---- creation --------------------------------------------------------

    #[test]
    fn create_starts_in_created_with_history() {
        let sm = OrderStateMachine::new();
        let order = sm.create_order("ORD-1", draft("005930")).unwrap();
        assert_eq!(order.state, OrderState::Created);
        assert_eq!(order.history.len(), 1);
        assert_eq!(order.history[0].state, OrderState::Created);
        assert_eq!(order.filled_quantity, 0);
    }

    #[test]
    fn duplicate_id_is_refused() {
        let sm = OrderStateMachine::new();
        sm.create_order("ORD-1", draft("005930")).unwrap();
        assert!(matches!(
            sm.create_order("ORD-1", draft("005930")),
            Err(OrderError::DuplicateId(_))
        ));
    }

    #[test]
    fn generated_ids_are_unique_and_prefixed() {
        let a = OrderStateMachine::generate_order_id("ORD");
        let b = OrderStateMachine::generate_order_id("ORD");
        assert!(a.starts_with("ORD-"));
        assert_ne!(a, b);
    }

    // ---- valid paths -----------------------------------------------------

    #[test]
    fn happy_path_to_filled() {
        let sm = OrderStateMachine::new();
        sm.create_order("ORD-1", draft("005930")).unwrap();
        sm.transition("ORD-1", OrderState::Submitted, None).unwrap();
        sm.transition("ORD-1", OrderState::PartialFilled, Some(json!({"filled_quantity": 40})))
            .unwrap();
        let order = sm
            .transition("ORD-1", OrderState::Filled, Some(json!({"filled_quantity": 100, "fill_price": 72100.0})))
            .unwrap();

        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.filled_quantity, 100);
        assert_eq!(order.fill_price, 72_100.0);
        let states: Vec<OrderState> = order.history.iter().map(|h| h.state).collect();
        assert_eq!(
            states,
            vec![
                OrderState::Created,
                OrderState::Submitted,
                OrderState::PartialFilled,
                OrderState::Filled
            ]
        );
    }

    #[test]
    fn cancel_path() {
        let sm = OrderStateMachine::new();
        sm.create_order("ORD-1", draft("005930")).unwrap();
        sm.transition("ORD-1", OrderState::Submitted, None).unwrap();
        sm.transition("ORD-1", OrderState::CancelRequested, None).unwrap();
        let order = sm.transition("ORD-1", OrderState::Cancelled, None).unwrap();
        assert_eq!(order.state, OrderState::Cancelled);
    }

    #[test]
    fn cancel_request_can_still_fill() {
        // A fill can race a cancel request; the fill wins.
        let sm = OrderStateMachine::new();
        sm.create_order("ORD-1", draft("005930")).unwrap();
        sm.transition("ORD-1", OrderState::Submitted, None).unwrap();
        sm.transition("ORD-1", OrderState::CancelRequested, None).unwrap();
        assert!(sm.transition("ORD-1", OrderState::Filled, None).is_ok());
    }

    #[test]
    fn amend_path_returns_to_submitted() {
        let sm = OrderStateMachine::new();
        sm.create_order("ORD-1", draft("005930")).unwrap();
        sm.transition("ORD-1", OrderState::Submitted, None).unwrap();
        sm.transition("ORD-1", OrderState::PartialFilled, None).unwrap();
        sm.transition("ORD-1", OrderState::AmendRequested, None).unwrap();
        let order = sm.transition("ORD-1", OrderState::Submitted, None).unwrap();
        assert_eq!(order.state, OrderState::Submitted);
    }

    // ---- invalid paths ---------------------------------------------------

    #[test]
    fn created_cannot_fill_directly() {
        let sm = OrderStateMachine::new();
        sm.create_order("ORD-1", draft("005930")).unwrap();
        assert!(matches!(
            sm.transition("ORD-1", OrderState::Filled, None),
            Err(OrderError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        let sm = OrderStateMachine::new();
        sm.create_order("ORD-1", draft("005930")).unwrap();
        sm.transition("ORD-1", OrderState::Submitted, None).unwrap();
        sm.transition("ORD-1", OrderState::Filled, None).unwrap();

        for next in [
            OrderState::Submitted,
            OrderState::Cancelled,
            OrderState::PartialFilled,
        ] {
            assert!(matches!(
                sm.transition("ORD-1", next, None),
                Err(OrderError::InvalidTransition { .. })
            ));
        }
    }

    #[test]
    fn submitted_cannot_amend_directly() {
        // AMEND_REQUESTED is only reachable from PARTIAL_FILLED.
        let sm = OrderStateMachine::new();
        sm.create_order("ORD-1", draft("005930")).unwrap();
        sm.transition("ORD-1", OrderState::Submitted, None).unwrap();
        assert!(sm.transition("ORD-1", OrderState::AmendRequested, None).is_err());
    }

    #[test]
    fn unknown_order_errors() {
        let sm = OrderStateMachine::new();
        assert!(matches!(
            sm.transition("nope", OrderState::Submitted, None),
            Err(OrderError::NotFound(_))
        ));
        assert!(sm.get_order("nope").is_err());
    }

    // ---- listeners -------------------------------------------------------

    #[test]
    fn listeners_observe_every_transition() {
        let sm = OrderStateMachine::new();
        let seen = Arc::new(AtomicU32::new(0));
        let seen_clone = Arc::clone(&seen);
        sm.register_callback(Arc::new(move |_, _, _, _| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        }));

        sm.create_order("ORD-1", draft("005930")).unwrap();
        sm.transition("ORD-1", OrderState::Submitted, None).unwrap();
        sm.transition("ORD-1", OrderState::Filled, None).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_listener_does_not_block_transition() {
        let sm = OrderStateMachine::new();
        let seen = Arc::new(AtomicU32::new(0));
        let seen_clone = Arc::clone(&seen);

        sm.register_callback(Arc::new(|_, _, _, _| panic!("bad listener")));
        sm.register_callback(Arc::new(move |_, _, _, _| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        }));

        sm.create_order("ORD-1", draft("005930")).unwrap();
        let result = sm.transition("ORD-1", OrderState::Submitted, None);
        assert!(result.is_ok());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn completion_hook_fires_for_completed_states_only() {
        let sm = OrderStateMachine::new();
        let completions = Arc::new(AtomicU32::new(0));
        let completions_clone = Arc::clone(&completions);
        sm.register_completion_callback(Arc::new(move |_, _, _| {
            completions_clone.fetch_add(1, Ordering::SeqCst);
        }));

        sm.create_order("ORD-1", draft("005930")).unwrap();
        sm.transition("ORD-1", OrderState::Submitted, None).unwrap();
        assert_eq!(completions.load(Ordering::SeqCst), 0);
        sm.transition("ORD-1", OrderState::Filled, None).unwrap();
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        // REJECTED is terminal but not "completed".
        sm.create_order("ORD-2", draft("005930")).unwrap();
        sm.transition("ORD-2", OrderState::Rejected, None).unwrap();
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    // ---- queries ---------------------------------------------------------

    #[test]
    fn pending_covers_submitted_and_partial() {
        let sm = OrderStateMachine::new();
        sm.create_order("ORD-1", draft("005930")).unwrap();
        sm.create_order("ORD-2", draft("000660")).unwrap();
        sm.create_order("ORD-3", draft("035720")).unwrap();

        sm.transition("ORD-1", OrderState::Submitted, None).unwrap();
        sm.transition("ORD-2", OrderState::Submitted, None).unwrap();
        sm.transition("ORD-2", OrderState::PartialFilled, None).unwrap();
        sm.transition("ORD-3", OrderState::Rejected, None).unwrap();

        let pending = sm.get_pending_orders();
        assert_eq!(pending.len(), 2);
        assert_eq!(sm.get_orders_by_state(OrderState::Rejected).len(), 1);
    }

    #[test]
    fn broker_no_lookup() {
        let sm = OrderStateMachine::new();
        sm.create_order("ORD-1", draft("005930")).unwrap();
        sm.merge_metadata("ORD-1", &json!({"broker_order_no": "0000012345"}))
            .unwrap();

        let found = sm.find_by_broker_no("0000012345").unwrap();
        assert_eq!(found.order_id, "ORD-1");
        assert!(sm.find_by_broker_no("missing").is_none());
    }

    #[test]
    fn merge_metadata_updates_without_history() {
        let sm = OrderStateMachine::new();
        sm.create_order("ORD-1", draft("005930")).unwrap();
        let order = sm
            .merge_metadata("ORD-1", &json!({"fill_price": 72100.0, "filled_quantity": 30}))
            .unwrap();
        assert_eq!(order.fill_price, 72_100.0);
        assert_eq!(order.filled_quantity, 30);
        assert_eq!(order.history.len(), 1);
    }
}
