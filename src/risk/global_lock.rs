// =============================================================================
// Global Position Lock — atomic per-stock exposure reservation
// =============================================================================
//
// Multiple strategies may target the same stock concurrently. This lock
// keeps the aggregate reservation per stock under the grade hard cap
// (A 30% / B 20% / C 10% / D 0% of capital), whatever combination of
// strategies is asking.
//
// Check-and-reserve is a single critical section: a reservation either fits
// and is recorded, or the call reports exactly how much capacity remains.
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::types::StockGrade;

/// All reservations held against one stock.
#[derive(Debug, Clone)]
struct StockReservation {
    grade: StockGrade,
    /// strategy_code -> reserved % of capital
    by_strategy: HashMap<String, f64>,
}

impl StockReservation {
    fn total_pct(&self) -> f64 {
        self.by_strategy.values().sum()
    }
}

/// Exposure breakdown returned by queries.
#[derive(Debug, Clone, Serialize)]
pub struct StockExposure {
    pub stock_code: String,
    pub grade: Option<StockGrade>,
    pub total_pct: f64,
    pub strategies: HashMap<String, f64>,
}

/// Atomic reservation manager across all strategies.
pub struct GlobalPositionLock {
    reservations: Mutex<HashMap<String, StockReservation>>,
}

impl GlobalPositionLock {
    pub fn new() -> Self {
        Self {
            reservations: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Core API
    // -------------------------------------------------------------------------

    /// Atomically check whether `additional_pct` fits under the grade cap
    /// for `stock_code` and record it for `strategy_code` if so.
    pub fn check_and_reserve(
        &self,
        stock_code: &str,
        grade: StockGrade,
        additional_pct: f64,
        strategy_code: &str,
    ) -> Result<(), String> {
        let mut reservations = self.reservations.lock();
        let cap = grade.hard_cap_pct();

        let current_total = reservations
            .get(stock_code)
            .map(|r| r.total_pct())
            .unwrap_or(0.0);
        let projected = current_total + additional_pct;

        if projected > cap {
            let remaining = (cap - current_total).max(0.0);
            let reason = format!(
                "position lock denied: {stock_code} ({grade}) would reach {projected:.1}% \
                 (cap {cap:.1}%); current {current_total:.1}%, requested {additional_pct:.1}%, \
                 remaining capacity {remaining:.1}%"
            );
            warn!(reason = %reason, "global lock denied");
            return Err(reason);
        }

        let entry = reservations
            .entry(stock_code.to_string())
            .or_insert_with(|| StockReservation {
                grade,
                by_strategy: HashMap::new(),
            });
        *entry.by_strategy.entry(strategy_code.to_string()).or_insert(0.0) += additional_pct;

        info!(
            stock_code,
            grade = %grade,
            strategy_code,
            additional_pct,
            total = entry.total_pct(),
            "position reserved"
        );
        Ok(())
    }

    /// Release the reservation held by `strategy_code` for `stock_code`.
    /// Entries that reach zero are removed entirely.
    pub fn release(&self, stock_code: &str, strategy_code: &str) -> Result<f64, String> {
        let mut reservations = self.reservations.lock();

        let Some(reservation) = reservations.get_mut(stock_code) else {
            let msg = format!("no reservation found for {stock_code}");
            warn!(msg = %msg, "global lock release missed");
            return Err(msg);
        };

        let Some(released) = reservation.by_strategy.remove(strategy_code) else {
            let msg = format!("no reservation for {stock_code} by {strategy_code}");
            warn!(msg = %msg, "global lock release missed");
            return Err(msg);
        };

        let remaining = reservation.total_pct();
        if reservation.by_strategy.is_empty() {
            reservations.remove(stock_code);
        }

        info!(
            stock_code,
            strategy_code,
            released_pct = released,
            remaining_pct = remaining,
            "position reservation released"
        );
        Ok(released)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Current exposure breakdown for one stock.
    pub fn get_stock_exposure(&self, stock_code: &str) -> StockExposure {
        let reservations = self.reservations.lock();
        match reservations.get(stock_code) {
            Some(r) => StockExposure {
                stock_code: stock_code.to_string(),
                grade: Some(r.grade),
                total_pct: r.total_pct(),
                strategies: r.by_strategy.clone(),
            },
            None => StockExposure {
                stock_code: stock_code.to_string(),
                grade: None,
                total_pct: 0.0,
                strategies: HashMap::new(),
            },
        }
    }

    /// How much more % can be reserved for the stock under its grade cap.
    pub fn get_remaining_capacity(&self, stock_code: &str, grade: StockGrade) -> f64 {
        let reservations = self.reservations.lock();
        let current = reservations
            .get(stock_code)
            .map(|r| r.total_pct())
            .unwrap_or(0.0);
        (grade.hard_cap_pct() - current).max(0.0)
    }

    /// Release everything. Used at the daily boundary.
    pub fn clear_all(&self) {
        let mut reservations = self.reservations.lock();
        let count = reservations.len();
        reservations.clear();
        info!(count, "all position reservations cleared");
    }
}

impl Default for GlobalPositionLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GlobalPositionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalPositionLock")
            .field("stocks", &self.reservations.lock().len())
            .finish()
    }
}
