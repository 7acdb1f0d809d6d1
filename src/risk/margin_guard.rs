// =============================================================================
// Margin Guard — cash sufficiency checks with pending-reservation tracking
// =============================================================================
//
// Buy orders must be fully covered by cash: gross amount plus the budgeted
// fees (0.015% commission plus the 0.18% transaction tax, a 1.00195
// multiplier). Sell orders pass unconditionally.
//
// Balance queries go through an injected async function and are cached for
// 5 seconds. Validated orders park a reservation so concurrent submissions
// cannot double-spend the same cash; reservations release on fill or cancel.
// =============================================================================

use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::types::OrderSide;

/// Commission: 0.015%.
pub const COMMISSION_RATE: f64 = 0.00015;
/// Securities transaction tax (sell side, budgeted at buy): 0.18%.
pub const TAX_RATE: f64 = 0.0018;
/// Combined fee rate budgeted on the buy side: 0.195%.
pub const TOTAL_FEE_RATE: f64 = COMMISSION_RATE + TAX_RATE;

const BALANCE_CACHE_TTL: Duration = Duration::from_secs(5);

/// Async source of the broker cash balance in KRW.
pub type BalanceFn = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<i64>> + Send + Sync>;

struct BalanceCache {
    balance: i64,
    fetched_at: Option<Instant>,
}

/// Pre-trade cash validation guard.
pub struct MarginGuard {
    balance_fn: Option<BalanceFn>,
    cache: Mutex<BalanceCache>,
    /// Insertion-ordered pending reservations: (key, amount KRW).
    reservations: Mutex<Vec<(String, i64)>>,
}

impl MarginGuard {
    pub fn new(balance_fn: Option<BalanceFn>) -> Self {
        info!(
            commission_rate = COMMISSION_RATE,
            tax_rate = TAX_RATE,
            total_fee_rate = TOTAL_FEE_RATE,
            "margin guard initialised"
        );
        Self {
            balance_fn,
            cache: Mutex::new(BalanceCache {
                balance: 0,
                fetched_at: None,
            }),
            reservations: Mutex::new(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Core validation
    // -------------------------------------------------------------------------

    /// Validate cash availability for an order and park a reservation.
    ///
    /// Returns the reservation key on success; sells return `Ok` with no
    /// reservation. Failure carries the shortfall detail.
    pub async fn validate_order(
        &self,
        stock_code: &str,
        quantity: i64,
        price: i64,
        side: OrderSide,
    ) -> Result<Option<String>, String> {
        if side == OrderSide::Sell {
            debug!(stock_code, "sell order: no cash check required");
            return Ok(None);
        }

        let gross_amount = quantity * price;
        let fee_amount = (gross_amount as f64 * TOTAL_FEE_RATE).round() as i64;
        let required = gross_amount + fee_amount;

        let available = self.available_cash().await;

        if available < required {
            let shortfall = required - available;
            let reason = format!(
                "insufficient cash for {stock_code}: required {required} KRW \
                 (order {gross_amount} + fees {fee_amount}), available {available} KRW, \
                 shortfall {shortfall} KRW"
            );
            warn!(reason = %reason, "margin guard rejection");
            return Err(reason);
        }

        let key = Self::reservation_key(stock_code);
        self.reservations.lock().push((key.clone(), required));

        info!(
            stock_code,
            required,
            available,
            reservation_key = %key,
            "cash validated and reserved"
        );
        Ok(Some(key))
    }

    fn reservation_key(stock_code: &str) -> String {
        let ms = chrono::Utc::now().timestamp_millis();
        format!("{stock_code}_{ms}")
    }

    /// Required KRW for a buy of `quantity` at `price`, fees included.
    pub fn required_amount(quantity: i64, price: i64) -> i64 {
        let gross = quantity * price;
        gross + (gross as f64 * TOTAL_FEE_RATE).round() as i64
    }

    // -------------------------------------------------------------------------
    // Reservation release
    // -------------------------------------------------------------------------

    /// Release a reservation after fill or cancel. Prefers an exact amount
    /// match; otherwise drops the oldest reservation.
    pub fn release_reservation(&self, amount: i64) {
        let mut reservations = self.reservations.lock();
        if reservations.is_empty() {
            debug!("release requested but no reservations pending");
            return;
        }

        if let Some(idx) = reservations.iter().position(|(_, r)| *r == amount) {
            let (key, released) = reservations.remove(idx);
            info!(key = %key, amount = released, "reservation released (exact match)");
            return;
        }

        let (key, released) = reservations.remove(0);
        info!(
            key = %key,
            released,
            requested = amount,
            "reservation released (oldest; no exact match)"
        );
    }

    /// Release a specific reservation by key.
    pub fn release_reservation_by_key(&self, key: &str) {
        let mut reservations = self.reservations.lock();
        match reservations.iter().position(|(k, _)| k == key) {
            Some(idx) => {
                let (_, amount) = reservations.remove(idx);
                info!(key, amount, "reservation released by key");
            }
            None => debug!(key, "reservation key not found"),
        }
    }

    /// Drop every reservation (daily reset).
    pub fn clear_all_reservations(&self) {
        let mut reservations = self.reservations.lock();
        let count = reservations.len();
        reservations.clear();
        info!(count, "all cash reservations cleared");
    }

    // -------------------------------------------------------------------------
    // Balance
    // -------------------------------------------------------------------------

    /// Available cash: cached broker balance minus pending reservations.
    async fn available_cash(&self) -> i64 {
        let stale = {
            let cache = self.cache.lock();
            match cache.fetched_at {
                Some(at) => at.elapsed() > BALANCE_CACHE_TTL,
                None => true,
            }
        };

        if stale {
            if let Some(ref fetch) = self.balance_fn {
                match fetch().await {
                    Ok(balance) => {
                        let mut cache = self.cache.lock();
                        cache.balance = balance;
                        cache.fetched_at = Some(Instant::now());
                        debug!(balance, "broker balance refreshed");
                    }
                    Err(e) => {
                        // Keep serving the stale value rather than blocking
                        // the pipeline on a flaky balance endpoint.
                        warn!(error = %e, "balance query failed; using cached value");
                    }
                }
            } else {
                warn!("no balance source configured");
            }
        }

        let balance = self.cache.lock().balance;
        let reserved: i64 = self.reservations.lock().iter().map(|(_, r)| r).sum();
        (balance - reserved).max(0)
    }

    /// Manually seed the cached balance (initialisation and tests).
    pub fn set_balance(&self, balance: i64) {
        let mut cache = self.cache.lock();
        cache.balance = balance;
        cache.fetched_at = Some(Instant::now());
    }

    pub fn pending_total(&self) -> i64 {
        self.reservations.lock().iter().map(|(_, r)| r).sum()
    }

    pub fn pending_count(&self) -> usize {
        self.reservations.lock().len()
    }
}

// -----------------------------------------------------------------------------
// Cash-only order body enforcement
// -----------------------------------------------------------------------------

/// Stamp cash-only fields onto an outgoing broker order body and strip any
/// margin/loan keys, so the order can never execute on credit.
pub fn enforce_cash_order_params(body: &mut Value) {
    if let Some(map) = body.as_object_mut() {
        map.insert("ORD_DVSN".to_string(), Value::String("00".to_string()));
        map.insert("CTAC_TLNO".to_string(), Value::String(String::new()));
        map.insert("SLL_TYPE".to_string(), Value::String("01".to_string()));
        map.insert("ALGO_NO".to_string(), Value::String(String::new()));
        map.remove("CANO_LOAN");
        map.remove("MGNT_DVSN");
        map.remove("LOAN_DT");
        debug!("cash-only order parameters enforced");
    }
}

impl std::fmt::Debug for MarginGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarginGuard")
            .field("cached_balance", &self.cache.lock().balance)
            .field("pending_reservations", &self.pending_count())
            .finish()
    }
}
