// =============================================================================
// Position Sizer — Van Tharp R-multiple sizing
// =============================================================================
//
// Position size is derived from four inputs:
//   1. Market-regime risk allocation (adaptive risk % per trade)
//   2. Stop-loss distance (the R-multiple denominator)
//   3. Grade-based single-position cap
//   4. Signal confidence multiplier
//
// The formula: position = capital * risk% * confidence_mult / stop_loss%,
// capped at capital * grade_limit, floored to whole shares.
// =============================================================================

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::types::{MarketRegime, StockGrade};

/// Default take-profit target expressed in R.
pub const DEFAULT_R_TARGET: f64 = 3.0;

/// Risk per trade as a fraction of capital, by regime.
pub fn regime_risk_pct(regime: MarketRegime) -> f64 {
    match regime {
        MarketRegime::StrongBull => 0.020,
        MarketRegime::Bull => 0.018,
        MarketRegime::Sideways => 0.012,
        MarketRegime::Bear => 0.008,
        MarketRegime::StrongBear => 0.005,
    }
}

/// Confidence multiplier on the 5-star scale. Confidence <= 2 never trades.
fn confidence_multiplier(confidence: u8) -> f64 {
    match confidence {
        5 => 1.00,
        4 => 0.75,
        _ => 0.50,
    }
}

/// A sizing rejection; the trade must not proceed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SizingRejection {
    #[error("confidence {0} is too low; minimum is 3")]
    ConfidenceTooLow(u8),

    #[error("stop loss {stop_loss} is not below entry {entry_price} (long-only policy)")]
    StopAboveEntry { entry_price: i64, stop_loss: i64 },

    #[error("grade D stocks are prohibited")]
    GradeProhibited,
}

/// Full audit record of a sizing decision: inputs and outputs together so
/// downstream pipeline stages can explain the number.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionSize {
    // Outputs
    /// KRW to allocate, floored to whole shares.
    pub position_amount: i64,
    /// Fraction of total capital.
    pub position_pct: f64,
    pub quantity: i64,
    /// 1R: KRW at risk if the stop is hit.
    pub risk_amount_1r: i64,
    /// Distance to stop as a fraction of entry.
    pub stop_loss_pct: f64,
    pub r_multiple_target: f64,
    pub regime_risk_pct: f64,
    pub grade_limit_pct: f64,
    pub confidence_multiplier: f64,

    // Inputs, for the audit trail
    pub total_capital: i64,
    pub entry_price: i64,
    pub stop_loss: i64,
    pub grade: StockGrade,
    pub confidence: u8,
    pub regime: MarketRegime,
}

/// Van Tharp R-multiple position sizer.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    r_target: f64,
}

impl PositionSizer {
    pub fn new() -> Self {
        Self {
            r_target: DEFAULT_R_TARGET,
        }
    }

    /// Compute a position size, or reject the trade outright.
    pub fn calculate(
        &self,
        total_capital: i64,
        regime: MarketRegime,
        entry_price: i64,
        stop_loss: i64,
        grade: StockGrade,
        confidence: u8,
    ) -> Result<PositionSize, SizingRejection> {
        if confidence <= 2 {
            info!(confidence, "sizing rejected: confidence too low");
            return Err(SizingRejection::ConfidenceTooLow(confidence));
        }

        if stop_loss >= entry_price {
            warn!(entry_price, stop_loss, "sizing rejected: stop above entry");
            return Err(SizingRejection::StopAboveEntry {
                entry_price,
                stop_loss,
            });
        }

        if grade == StockGrade::D {
            info!("sizing rejected: grade D prohibited");
            return Err(SizingRejection::GradeProhibited);
        }

        let risk_pct = regime_risk_pct(regime);
        let conf_mult = confidence_multiplier(confidence);
        let grade_limit = grade.position_limit();
        let stop_loss_pct = (entry_price - stop_loss) as f64 / entry_price as f64;

        let raw_amount = total_capital as f64 * risk_pct * conf_mult / stop_loss_pct;
        let cap_amount = total_capital as f64 * grade_limit;
        let mut position_amount = raw_amount.min(cap_amount).floor().max(0.0) as i64;

        // Floor to whole shares and recompute the amount from them.
        let quantity = if entry_price > 0 {
            position_amount / entry_price
        } else {
            0
        };
        position_amount = quantity * entry_price;

        let position_pct = if total_capital > 0 {
            position_amount as f64 / total_capital as f64
        } else {
            0.0
        };
        let risk_amount_1r = quantity * (entry_price - stop_loss);

        let size = PositionSize {
            position_amount,
            position_pct,
            quantity,
            risk_amount_1r,
            stop_loss_pct,
            r_multiple_target: self.r_target,
            regime_risk_pct: risk_pct,
            grade_limit_pct: grade_limit,
            confidence_multiplier: conf_mult,
            total_capital,
            entry_price,
            stop_loss,
            grade,
            confidence,
            regime,
        };

        info!(
            position_amount = size.position_amount,
            quantity = size.quantity,
            position_pct = size.position_pct,
            risk_amount_1r = size.risk_amount_1r,
            "position sized"
        );

        Ok(size)
    }
}

impl Default for PositionSizer {
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

    const CAPITAL: i64 = 100_000_000;

    fn size(
        regime: MarketRegime,
        entry: i64,
        stop: i64,
        grade: StockGrade,
        confidence: u8,
    ) -> Result<PositionSize, SizingRejection> {
        PositionSizer::new().calculate(CAPITAL, regime, entry, stop, grade, confidence)
    }

    // ---- hard rejections -------------------------------------------------

    #[test]
    fn confidence_two_or_below_is_rejected() {
        assert_eq!(
            size(MarketRegime::Bull, 50_000, 47_500, StockGrade::B, 2),
            Err(SizingRejection::ConfidenceTooLow(2))
        );
        assert_eq!(
            size(MarketRegime::Bull, 50_000, 47_500, StockGrade::B, 1),
            Err(SizingRejection::ConfidenceTooLow(1))
        );
    }

    #[test]
    fn stop_at_or_above_entry_is_rejected() {
        assert!(matches!(
            size(MarketRegime::Bull, 50_000, 50_000, StockGrade::B, 4),
            Err(SizingRejection::StopAboveEntry { .. })
        ));
        assert!(matches!(
            size(MarketRegime::Bull, 50_000, 51_000, StockGrade::B, 4),
            Err(SizingRejection::StopAboveEntry { .. })
        ));
    }

    #[test]
    fn grade_d_is_rejected() {
        assert_eq!(
            size(MarketRegime::Bull, 50_000, 47_500, StockGrade::D, 5),
            Err(SizingRejection::GradeProhibited)
        );
    }

    // ---- core math -------------------------------------------------------

    #[test]
    fn bull_regime_full_confidence_sizing() {
        // risk 1.8%, mult 1.0, stop 5% => raw = 100M * 0.018 / 0.05 = 36M,
        // capped by grade B at 20M. 20M / 50000 = 400 shares.
        let s = size(MarketRegime::Bull, 50_000, 47_500, StockGrade::B, 5).unwrap();
        assert_eq!(s.quantity, 400);
        assert_eq!(s.position_amount, 20_000_000);
        assert!((s.position_pct - 0.20).abs() < 1e-9);
        assert_eq!(s.risk_amount_1r, 400 * 2_500);
    }

    #[test]
    fn uncapped_when_raw_is_below_grade_limit() {
        // Bear: risk 0.8%, mult 0.75 (conf 4), stop 10%
        // raw = 100M * 0.008 * 0.75 / 0.10 = 6M < grade A cap 30M.
        let s = size(MarketRegime::Bear, 10_000, 9_000, StockGrade::A, 4).unwrap();
        assert_eq!(s.quantity, 600);
        assert_eq!(s.position_amount, 6_000_000);
        assert_eq!(s.risk_amount_1r, 600 * 1_000);
    }

    #[test]
    fn amount_is_recomputed_from_whole_shares() {
        // Entry price that does not divide evenly into the raw amount.
        let s = size(MarketRegime::Sideways, 33_333, 31_000, StockGrade::C, 3).unwrap();
        assert_eq!(s.position_amount, s.quantity * 33_333);
        assert!(s.position_amount <= (CAPITAL as f64 * 0.10) as i64);
    }

    #[test]
    fn regime_risk_table_matches_policy() {
        assert_eq!(regime_risk_pct(MarketRegime::StrongBull), 0.020);
        assert_eq!(regime_risk_pct(MarketRegime::Bull), 0.018);
        assert_eq!(regime_risk_pct(MarketRegime::Sideways), 0.012);
        assert_eq!(regime_risk_pct(MarketRegime::Bear), 0.008);
        assert_eq!(regime_risk_pct(MarketRegime::StrongBear), 0.005);
    }

    #[test]
    fn confidence_scales_linearly_with_table() {
        let five = size(MarketRegime::Sideways, 20_000, 19_000, StockGrade::A, 5).unwrap();
        let four = size(MarketRegime::Sideways, 20_000, 19_000, StockGrade::A, 4).unwrap();
        let three = size(MarketRegime::Sideways, 20_000, 19_000, StockGrade::A, 3).unwrap();
        assert!(five.position_amount > four.position_amount);
        assert!(four.position_amount > three.position_amount);
        assert_eq!(five.confidence_multiplier, 1.00);
        assert_eq!(four.confidence_multiplier, 0.75);
        assert_eq!(three.confidence_multiplier, 0.50);
    }

    #[test]
    fn audit_record_echoes_inputs() {
        let s = size(MarketRegime::Bull, 50_000, 47_500, StockGrade::B, 4).unwrap();
        assert_eq!(s.total_capital, CAPITAL);
        assert_eq!(s.entry_price, 50_000);
        assert_eq!(s.stop_loss, 47_500);
        assert_eq!(s.grade, StockGrade::B);
        assert_eq!(s.confidence, 4);
        assert_eq!(s.regime, MarketRegime::Bull);
        assert!((s.stop_loss_pct - 0.05).abs() < 1e-9);
    }
}
