// =============================================================================
// Grade Allocator — regime-based capital allocation limits
// =============================================================================
//
// Each market regime carries an allocation plan: how much of total capital
// may sit in grade A/B/C names and how much must stay in cash. On top of the
// per-grade totals, no single sector may exceed 40% of capital.
//
// Checks run in order (grade total, sector concentration, minimum cash) and
// the first failing rule is reported with its numbers.
// =============================================================================

use std::collections::HashMap;

use serde::Serialize;
use tracing::{info, warn};

use crate::types::{MarketRegime, Position, StockGrade};

/// Per-sector concentration cap (% of capital).
pub const SECTOR_MAX_PCT: f64 = 40.0;

/// Capital allocation plan for one regime. Percentages sum to 100.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegimeAllocation {
    pub grade_a_pct: f64,
    pub grade_b_pct: f64,
    pub grade_c_pct: f64,
    pub cash_pct: f64,
}

impl RegimeAllocation {
    fn grade_limit(&self, grade: StockGrade) -> f64 {
        match grade {
            StockGrade::A => self.grade_a_pct,
            StockGrade::B => self.grade_b_pct,
            StockGrade::C => self.grade_c_pct,
            StockGrade::D => 0.0,
        }
    }
}

fn default_allocations() -> HashMap<MarketRegime, RegimeAllocation> {
    let table = [
        (
            MarketRegime::StrongBull,
            RegimeAllocation { grade_a_pct: 40.0, grade_b_pct: 30.0, grade_c_pct: 10.0, cash_pct: 20.0 },
        ),
        (
            MarketRegime::Bull,
            RegimeAllocation { grade_a_pct: 35.0, grade_b_pct: 25.0, grade_c_pct: 10.0, cash_pct: 30.0 },
        ),
        (
            MarketRegime::Sideways,
            RegimeAllocation { grade_a_pct: 25.0, grade_b_pct: 15.0, grade_c_pct: 5.0, cash_pct: 55.0 },
        ),
        (
            MarketRegime::Bear,
            RegimeAllocation { grade_a_pct: 15.0, grade_b_pct: 10.0, grade_c_pct: 0.0, cash_pct: 75.0 },
        ),
        (
            MarketRegime::StrongBear,
            RegimeAllocation { grade_a_pct: 10.0, grade_b_pct: 0.0, grade_c_pct: 0.0, cash_pct: 90.0 },
        ),
    ];

    for (regime, alloc) in &table {
        let total = alloc.grade_a_pct + alloc.grade_b_pct + alloc.grade_c_pct + alloc.cash_pct;
        debug_assert!(
            (total - 100.0).abs() < 0.01,
            "allocation for {regime:?} sums to {total}"
        );
    }

    table.into_iter().collect()
}

/// Validates proposed positions against the regime allocation plan.
#[derive(Debug, Clone)]
pub struct GradeAllocator {
    allocations: HashMap<MarketRegime, RegimeAllocation>,
    sector_max_pct: f64,
}

impl GradeAllocator {
    pub fn new() -> Self {
        Self {
            allocations: default_allocations(),
            sector_max_pct: SECTOR_MAX_PCT,
        }
    }

    // -------------------------------------------------------------------------
    // Core check
    // -------------------------------------------------------------------------

    /// Validate a proposed position of `position_pct` percent of capital in
    /// `grade`/`sector` against existing positions under `regime`.
    ///
    /// Returns `Err(reason)` naming the first rule that fails.
    pub fn validate_allocation(
        &self,
        grade: StockGrade,
        sector: &str,
        position_pct: f64,
        current_positions: &[Position],
        regime: MarketRegime,
    ) -> Result<(), String> {
        let alloc = self.allocations[&regime];

        // 1. Grade total limit.
        let grade_limit = alloc.grade_limit(grade);
        let current_grade: f64 = current_positions
            .iter()
            .filter(|p| p.grade == grade)
            .map(|p| p.position_pct)
            .sum();
        let projected = current_grade + position_pct;
        if projected > grade_limit {
            let reason = format!(
                "grade {grade} allocation would reach {projected:.1}% \
                 (limit {grade_limit:.1}% for {regime}); current {current_grade:.1}%, \
                 requested {position_pct:.1}%"
            );
            warn!(reason = %reason, "allocation denied: grade limit");
            return Err(reason);
        }

        // 2. Sector concentration.
        let current_sector: f64 = current_positions
            .iter()
            .filter(|p| p.sector == sector)
            .map(|p| p.position_pct)
            .sum();
        let projected_sector = current_sector + position_pct;
        if projected_sector > self.sector_max_pct {
            let reason = format!(
                "sector '{sector}' would reach {projected_sector:.1}% \
                 (limit {:.1}%); current {current_sector:.1}%, requested {position_pct:.1}%",
                self.sector_max_pct
            );
            warn!(reason = %reason, "allocation denied: sector limit");
            return Err(reason);
        }

        // 3. Minimum cash reserve.
        let total_invested: f64 =
            current_positions.iter().map(|p| p.position_pct).sum::<f64>() + position_pct;
        let projected_cash = 100.0 - total_invested;
        if projected_cash < alloc.cash_pct {
            let reason = format!(
                "cash reserve would drop to {projected_cash:.1}% \
                 (minimum {:.1}% for {regime}); total invested {total_invested:.1}%",
                alloc.cash_pct
            );
            warn!(reason = %reason, "allocation denied: cash floor");
            return Err(reason);
        }

        info!(grade = %grade, sector, position_pct, regime = %regime, "allocation passed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn regime_allocation(&self, regime: MarketRegime) -> RegimeAllocation {
        self.allocations[&regime]
    }

    /// Remaining % capacity for a grade under a regime.
    pub fn remaining_capacity(
        &self,
        grade: StockGrade,
        regime: MarketRegime,
        current_positions: &[Position],
    ) -> f64 {
        let limit = self.allocations[&regime].grade_limit(grade);
        let used: f64 = current_positions
            .iter()
            .filter(|p| p.grade == grade)
            .map(|p| p.position_pct)
            .sum();
        (limit - used).max(0.0)
    }
}

impl Default for GradeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradeMode;

    fn position(grade: StockGrade, sector: &str, pct: f64) -> Position {
        Position {
            stock_code: "000000".to_string(),
            quantity: 10,
            avg_entry_price: 10_000.0,
            total_cost: 100_000.0,
            strategy_code: "VB".to_string(),
            stop_loss_price: 9_000,
            grade,
            sector: sector.to_string(),
            position_pct: pct,
            mode: TradeMode::Paper,
            entry_time: 0.0,
            updated_at: 0.0,
        }
    }

    // ---- grade limits ----------------------------------------------------

    #[test]
    fn within_grade_limit_passes() {
        let a = GradeAllocator::new();
        let held = vec![position(StockGrade::A, "semis", 20.0)];
        assert!(a
            .validate_allocation(StockGrade::A, "autos", 10.0, &held, MarketRegime::Bull)
            .is_ok());
    }

    #[test]
    fn grade_limit_breach_reports_numbers() {
        let a = GradeAllocator::new();
        // Bull grade A limit is 35%; 30 + 10 = 40 > 35.
        let held = vec![position(StockGrade::A, "semis", 30.0)];
        let err = a
            .validate_allocation(StockGrade::A, "autos", 10.0, &held, MarketRegime::Bull)
            .unwrap_err();
        assert!(err.contains("40.0%"));
        assert!(err.contains("35.0%"));
        assert!(err.contains("30.0%"));
    }

    #[test]
    fn bear_regime_prohibits_grade_c() {
        let a = GradeAllocator::new();
        let err = a
            .validate_allocation(StockGrade::C, "semis", 1.0, &[], MarketRegime::Bear)
            .unwrap_err();
        assert!(err.contains("grade C"));
        assert!(err.contains("0.0%"));
    }

    // ---- sector cap ------------------------------------------------------

    #[test]
    fn sector_cap_at_forty_percent() {
        let a = GradeAllocator::new();
        let held = vec![
            position(StockGrade::A, "semis", 20.0),
            position(StockGrade::B, "semis", 15.0),
        ];
        // Different grades, same sector: 35 + 10 = 45 > 40.
        // Keep grade totals legal (StrongBull: A=40, B=30).
        let err = a
            .validate_allocation(StockGrade::A, "semis", 10.0, &held, MarketRegime::StrongBull)
            .unwrap_err();
        assert!(err.contains("semis"));
        assert!(err.contains("45.0%"));
        assert!(err.contains("40.0%"));
    }

    // ---- cash floor ------------------------------------------------------

    #[test]
    fn cash_floor_is_enforced_after_regime_shift() {
        let a = GradeAllocator::new();
        // Positions opened under StrongBull (A 40% + B 30% invested). The
        // regime degrades to Bull, whose floor is 30% cash: a further 5%
        // grade C buy would leave only 25% cash.
        let held = vec![
            position(StockGrade::A, "semis", 40.0),
            position(StockGrade::B, "autos", 30.0),
        ];
        let err = a
            .validate_allocation(StockGrade::C, "banks", 5.0, &held, MarketRegime::Bull)
            .unwrap_err();
        assert!(err.contains("cash reserve"));
        assert!(err.contains("30.0%"));
        assert!(err.contains("25.0%"));
    }

    // ---- capacity query --------------------------------------------------

    #[test]
    fn remaining_capacity_subtracts_held() {
        let a = GradeAllocator::new();
        let held = vec![position(StockGrade::B, "semis", 18.0)];
        let cap = a.remaining_capacity(StockGrade::B, MarketRegime::Bull, &held);
        assert!((cap - 7.0).abs() < 1e-9); // Bull B = 25%
        assert_eq!(a.remaining_capacity(StockGrade::D, MarketRegime::Bull, &[]), 0.0);
    }

    #[test]
    fn allocation_tables_sum_to_hundred() {
        let a = GradeAllocator::new();
        for regime in [
            MarketRegime::StrongBull,
            MarketRegime::Bull,
            MarketRegime::Sideways,
            MarketRegime::Bear,
            MarketRegime::StrongBear,
        ] {
            let alloc = a.regime_allocation(regime);
            let total = alloc.grade_a_pct + alloc.grade_b_pct + alloc.grade_c_pct + alloc.cash_pct;
            assert!((total - 100.0).abs() < 0.01, "{regime} sums to {total}");
        }
    }
}
