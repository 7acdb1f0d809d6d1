// =============================================================================
// Pyramid Manager — stage-gated add-ons for winning positions
// =============================================================================
//
// Winning positions may be scaled in up to three stages shaped like an
// inverted pyramid: 50% of the planned quantity at entry, then 30% once the
// position shows +5%, then 20% at +10%. Losing positions never pyramid.
//
// The manager only decides and records; order placement stays with the
// order manager.
// =============================================================================

use std::collections::HashMap;

use anyhow::{bail, Result};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::types::OrderSide;

/// Pyramiding configuration. Ratios must sum to 1 and both tables must
/// match `max_stages` in length.
#[derive(Debug, Clone, Serialize)]
pub struct PyramidConfig {
    pub max_stages: usize,
    /// Share of the planned total quantity added at each stage.
    pub stage_ratios: Vec<f64>,
    /// Profit (%) required to enter each stage; stage 0 is the entry.
    pub profit_trigger_pct: Vec<f64>,
}

impl PyramidConfig {
    pub fn new(max_stages: usize, stage_ratios: Vec<f64>, profit_trigger_pct: Vec<f64>) -> Result<Self> {
        if stage_ratios.len() != max_stages {
            bail!(
                "stage_ratios length {} does not match max_stages {}",
                stage_ratios.len(),
                max_stages
            );
        }
        if profit_trigger_pct.len() != max_stages {
            bail!(
                "profit_trigger_pct length {} does not match max_stages {}",
                profit_trigger_pct.len(),
                max_stages
            );
        }
        let ratio_sum: f64 = stage_ratios.iter().sum();
        if !(0.99..=1.01).contains(&ratio_sum) {
            bail!("stage_ratios sum {ratio_sum:.2} is not 1.0");
        }
        Ok(Self {
            max_stages,
            stage_ratios,
            profit_trigger_pct,
        })
    }
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            max_stages: 3,
            stage_ratios: vec![0.5, 0.3, 0.2],
            profit_trigger_pct: vec![0.0, 5.0, 10.0],
        }
    }
}

/// The position facts the pyramid decision needs.
#[derive(Debug, Clone)]
pub struct PyramidCandidate {
    pub trade_id: String,
    pub stock_code: String,
    pub side: OrderSide,
    pub avg_entry_price: f64,
    /// Planned quantity across all stages.
    pub total_planned_quantity: i64,
}

/// A recommended add-on buy.
#[derive(Debug, Clone, Serialize)]
pub struct PyramidOpportunity {
    /// Stage index being entered (1-based beyond the entry stage 0).
    pub stage: usize,
    pub trade_id: String,
    pub stock_code: String,
    pub quantity: i64,
    pub ratio: f64,
    pub trigger_pct: f64,
    pub current_profit_pct: f64,
    pub current_price: f64,
    pub avg_entry_price: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: usize,
    pub fill_price: f64,
    pub fill_quantity: i64,
    /// Epoch seconds.
    pub timestamp: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PyramidState {
    pub current_stage: usize,
    pub stages_executed: Vec<StageRecord>,
}

/// Tracks pyramiding progress per trade.
pub struct PyramidManager {
    config: PyramidConfig,
    states: RwLock<HashMap<String, PyramidState>>,
}

impl PyramidManager {
    pub fn new(config: PyramidConfig) -> Self {
        info!(
            max_stages = config.max_stages,
            stage_ratios = ?config.stage_ratios,
            profit_trigger_pct = ?config.profit_trigger_pct,
            "pyramid manager initialised"
        );
        Self {
            config,
            states: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Opportunity check
    // -------------------------------------------------------------------------

    /// Decide whether the position has earned its next add-on stage.
    ///
    /// Requires, in order: a buy position, a positive profit, a stage left
    /// to execute, and the stage's profit trigger met. The add-on quantity
    /// is `max(1, floor(planned * stage_ratio))`.
    pub fn check_pyramid_opportunity(
        &self,
        candidate: &PyramidCandidate,
        current_price: f64,
    ) -> Option<PyramidOpportunity> {
        if candidate.side != OrderSide::Buy {
            debug!(trade_id = %candidate.trade_id, "pyramid skipped: not a buy position");
            return None;
        }
        if candidate.avg_entry_price <= 0.0 || candidate.total_planned_quantity <= 0 {
            debug!(trade_id = %candidate.trade_id, "pyramid skipped: degenerate position");
            return None;
        }

        let profit_pct =
            (current_price - candidate.avg_entry_price) / candidate.avg_entry_price * 100.0;

        // A losing position is never added to.
        if profit_pct <= 0.0 {
            debug!(
                trade_id = %candidate.trade_id,
                profit_pct = format!("{profit_pct:.2}"),
                "pyramid skipped: position in loss"
            );
            return None;
        }

        let current_stage = self
            .states
            .read()
            .get(&candidate.trade_id)
            .map(|s| s.current_stage)
            .unwrap_or(0);
        let next_stage = current_stage + 1;

        if next_stage >= self.config.max_stages {
            debug!(
                trade_id = %candidate.trade_id,
                current_stage,
                "pyramid skipped: all stages executed"
            );
            return None;
        }

        let trigger_pct = self.config.profit_trigger_pct[next_stage];
        if profit_pct < trigger_pct {
            debug!(
                trade_id = %candidate.trade_id,
                profit_pct = format!("{profit_pct:.2}"),
                trigger_pct,
                next_stage,
                "pyramid skipped: trigger not met"
            );
            return None;
        }

        let ratio = self.config.stage_ratios[next_stage];
        let quantity = ((candidate.total_planned_quantity as f64 * ratio) as i64).max(1);

        info!(
            trade_id = %candidate.trade_id,
            stock_code = %candidate.stock_code,
            stage = next_stage,
            profit_pct = format!("{profit_pct:.2}"),
            trigger_pct,
            quantity,
            ratio,
            "pyramid opportunity"
        );

        Some(PyramidOpportunity {
            stage: next_stage,
            trade_id: candidate.trade_id.clone(),
            stock_code: candidate.stock_code.clone(),
            quantity,
            ratio,
            trigger_pct,
            current_profit_pct: profit_pct,
            current_price,
            avg_entry_price: candidate.avg_entry_price,
        })
    }

    // -------------------------------------------------------------------------
    // Stage recording
    // -------------------------------------------------------------------------

    /// Record a filled pyramid stage and advance the trade's stage counter.
    pub fn record_stage_execution(
        &self,
        trade_id: &str,
        stage: usize,
        fill_price: f64,
        fill_quantity: i64,
    ) -> PyramidState {
        let mut states = self.states.write();
        let state = states.entry(trade_id.to_string()).or_default();

        state.current_stage = stage;
        state.stages_executed.push(StageRecord {
            stage,
            fill_price,
            fill_quantity,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        });

        info!(
            trade_id,
            stage,
            fill_price,
            fill_quantity,
            total_stages_executed = state.stages_executed.len(),
            "pyramid stage recorded"
        );

        state.clone()
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get_pyramid_state(&self, trade_id: &str) -> PyramidState {
        self.states.read().get(trade_id).cloned().unwrap_or_default()
    }

    /// Whether this trade still has stages left.
    pub fn has_pyramid_in_progress(&self, trade_id: &str) -> bool {
        let current = self
            .states
            .read()
            .get(trade_id)
            .map(|s| s.current_stage)
            .unwrap_or(0);
        current < self.config.max_stages - 1
    }

    /// Forget a finished trade.
    pub fn remove_trade(&self, trade_id: &str) {
        if let Some(removed) = self.states.write().remove(trade_id) {
            info!(
                trade_id,
                stages_executed = removed.stages_executed.len(),
                "pyramid state removed"
            );
        }
    }

    pub fn config(&self) -> &PyramidConfig {
        &self.config
    }
}

impl Default for PyramidManager {
    fn default() -> Self {
        Self::new(PyramidConfig::default())
    }
}

impl std::fmt::Debug for PyramidManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PyramidManager")
            .field("max_stages", &self.config.max_stages)
            .field("tracked_trades", &self.states.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> PyramidCandidate {
        PyramidCandidate {
            trade_id: "T-1".to_string(),
            stock_code: "005930".to_string(),
            side: OrderSide::Buy,
            avg_entry_price: 50_000.0,
            total_planned_quantity: 200,
        }
    }

    // ---- config validation -----------------------------------------------

    #[test]
    fn config_rejects_mismatched_lengths() {
        assert!(PyramidConfig::new(3, vec![0.5, 0.5], vec![0.0, 5.0, 10.0]).is_err());
        assert!(PyramidConfig::new(3, vec![0.5, 0.3, 0.2], vec![0.0, 5.0]).is_err());
    }

    #[test]
    fn config_rejects_bad_ratio_sum() {
        assert!(PyramidConfig::new(3, vec![0.5, 0.3, 0.3], vec![0.0, 5.0, 10.0]).is_err());
        assert!(PyramidConfig::new(2, vec![0.4, 0.4], vec![0.0, 5.0]).is_err());
    }

    #[test]
    fn config_accepts_sum_within_tolerance() {
        assert!(PyramidConfig::new(3, vec![0.5, 0.3, 0.205], vec![0.0, 5.0, 10.0]).is_ok());
    }

    // ---- stage gating ----------------------------------------------------

    #[test]
    fn stage_one_at_five_point_two_percent() {
        let pm = PyramidManager::default();
        // 52,600 / 50,000 = +5.2% >= stage-1 trigger of 5%.
        let opp = pm.check_pyramid_opportunity(&candidate(), 52_600.0).unwrap();
        assert_eq!(opp.stage, 1);
        assert_eq!(opp.quantity, 60); // floor(200 * 0.3)
        assert_eq!(opp.trigger_pct, 5.0);
        assert!((opp.current_profit_pct - 5.2).abs() < 1e-9);
    }

    #[test]
    fn stage_two_at_ten_point_two_percent() {
        let pm = PyramidManager::default();
        pm.record_stage_execution("T-1", 1, 52_600.0, 60);

        let opp = pm.check_pyramid_opportunity(&candidate(), 55_100.0).unwrap();
        assert_eq!(opp.stage, 2);
        assert_eq!(opp.quantity, 40); // floor(200 * 0.2)
        assert_eq!(opp.trigger_pct, 10.0);
    }

    #[test]
    fn below_trigger_yields_nothing() {
        let pm = PyramidManager::default();
        pm.record_stage_execution("T-1", 1, 52_600.0, 60);
        // +5.2% again, but stage 2 needs +10%.
        assert!(pm.check_pyramid_opportunity(&candidate(), 52_600.0).is_none());
    }

    #[test]
    fn losing_position_never_pyramids() {
        let pm = PyramidManager::default();
        assert!(pm.check_pyramid_opportunity(&candidate(), 49_000.0).is_none());
        assert!(pm.check_pyramid_opportunity(&candidate(), 50_000.0).is_none());
    }

    #[test]
    fn sell_position_never_pyramids() {
        let pm = PyramidManager::default();
        let mut c = candidate();
        c.side = OrderSide::Sell;
        assert!(pm.check_pyramid_opportunity(&c, 60_000.0).is_none());
    }

    #[test]
    fn all_stages_done_yields_nothing() {
        let pm = PyramidManager::default();
        pm.record_stage_execution("T-1", 1, 52_600.0, 60);
        pm.record_stage_execution("T-1", 2, 55_100.0, 40);
        assert!(pm.check_pyramid_opportunity(&candidate(), 80_000.0).is_none());
        assert!(!pm.has_pyramid_in_progress("T-1"));
    }

    #[test]
    fn degenerate_position_is_skipped() {
        let pm = PyramidManager::default();
        let mut c = candidate();
        c.avg_entry_price = 0.0;
        assert!(pm.check_pyramid_opportunity(&c, 52_600.0).is_none());

        let mut c = candidate();
        c.total_planned_quantity = 0;
        assert!(pm.check_pyramid_opportunity(&c, 52_600.0).is_none());
    }

    #[test]
    fn add_on_quantity_has_floor_of_one() {
        let pm = PyramidManager::default();
        let mut c = candidate();
        c.total_planned_quantity = 2; // floor(2 * 0.3) == 0
        let opp = pm.check_pyramid_opportunity(&c, 52_600.0).unwrap();
        assert_eq!(opp.quantity, 1);
    }

    // ---- state tracking --------------------------------------------------

    #[test]
    fn stage_records_accumulate() {
        let pm = PyramidManager::default();
        pm.record_stage_execution("T-1", 1, 52_600.0, 60);
        let state = pm.record_stage_execution("T-1", 2, 55_100.0, 40);

        assert_eq!(state.current_stage, 2);
        assert_eq!(state.stages_executed.len(), 2);
        assert_eq!(state.stages_executed[0].stage, 1);
        assert_eq!(state.stages_executed[1].fill_quantity, 40);
    }

    #[test]
    fn remove_trade_forgets_state() {
        let pm = PyramidManager::default();
        pm.record_stage_execution("T-1", 1, 52_600.0, 60);
        pm.remove_trade("T-1");
        assert_eq!(pm.get_pyramid_state("T-1").current_stage, 0);
        assert!(pm.has_pyramid_in_progress("T-1"));
    }
}
