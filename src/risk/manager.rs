// =============================================================================
// Risk Manager — 9-stage validation pipeline
// =============================================================================
//
// Every buy signal passes nine checks in strict order before the order
// manager may act on it:
//
//   1. per_trade_risk          position sizer
//   2. monthly_cumulative_loss drawdown protocol (+ position scale)
//   3. daily_kill_switch       daily loss breaker
//   4. grade_limit             regime allocation
//   5. sector_concentration    satisfied inside step 4 (audit note)
//   6. special_event           placeholder; VI gating is authoritative in 8
//   7. global_position_lock    check-and-reserve
//   8. vi_status               reject if active (releases the step-7 lock)
//   9. cash_margin             validate and reserve (releases step-7 lock on
//                              rejection)
//
// The pipeline short-circuits on the first failure and reports the step
// number, step name, and reason. Sell signals skip sizing and limits: they
// reduce risk, and the margin guard passes them unconditionally anyway.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::risk::drawdown::DrawdownProtocol;
use crate::risk::global_lock::GlobalPositionLock;
use crate::risk::grade_allocator::GradeAllocator;
use crate::risk::kill_switch::DailyKillSwitch;
use crate::risk::margin_guard::MarginGuard;
use crate::risk::position_sizer::{PositionSize, PositionSizer};
use crate::types::{MarketRegime, OrderSide, Position, TradeSignal};

/// Structural seam for the VI gate so the pipeline can be exercised without
/// a live market feed.
pub trait ViGate: Send + Sync {
    fn is_vi_active(&self, stock_code: &str) -> bool;
}

impl ViGate for crate::market::vi_monitor::ViMonitor {
    fn is_vi_active(&self, stock_code: &str) -> bool {
        crate::market::vi_monitor::ViMonitor::is_vi_active(self, stock_code)
    }
}

/// PnL horizons and capital fed into steps 2 and 3.
#[derive(Debug, Clone, Copy, Default)]
pub struct PnlContext {
    pub daily_pnl_pct: f64,
    pub monthly_pnl_pct: f64,
    pub cumulative_pnl_pct: f64,
    pub current_capital: i64,
}

/// A rejection: which step refused and why.
#[derive(Debug, Clone, Serialize)]
pub struct RiskRejection {
    pub step: u8,
    pub step_name: &'static str,
    pub reason: String,
}

/// A passed validation with the final sizing decision.
#[derive(Debug, Clone, Serialize)]
pub struct RiskApproval {
    pub quantity: i64,
    /// Percent of capital (percent points, e.g. 10.0).
    pub position_pct: f64,
    pub sizing: Option<PositionSize>,
    /// Cash reservation created in step 9, if a margin guard is wired.
    pub reservation_key: Option<String>,
}

/// Outcome of the pipeline.
#[derive(Debug, Clone, Serialize)]
pub enum RiskVerdict {
    Passed(RiskApproval),
    Rejected(RiskRejection),
}

impl RiskVerdict {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Passed(_))
    }

    pub fn rejection(&self) -> Option<&RiskRejection> {
        match self {
            Self::Rejected(r) => Some(r),
            Self::Passed(_) => None,
        }
    }
}

/// Central risk gate for all trade signals.
pub struct RiskManager {
    position_sizer: PositionSizer,
    grade_allocator: GradeAllocator,
    global_lock: Arc<GlobalPositionLock>,
    vi_gate: Option<Arc<dyn ViGate>>,
    margin_guard: Option<Arc<MarginGuard>>,
    kill_switch: Option<Arc<DailyKillSwitch>>,
    drawdown: Option<Arc<DrawdownProtocol>>,
}

impl RiskManager {
    pub fn new(
        position_sizer: PositionSizer,
        grade_allocator: GradeAllocator,
        global_lock: Arc<GlobalPositionLock>,
        vi_gate: Option<Arc<dyn ViGate>>,
        margin_guard: Option<Arc<MarginGuard>>,
        kill_switch: Option<Arc<DailyKillSwitch>>,
        drawdown: Option<Arc<DrawdownProtocol>>,
    ) -> Self {
        info!(
            has_vi_gate = vi_gate.is_some(),
            has_margin_guard = margin_guard.is_some(),
            has_kill_switch = kill_switch.is_some(),
            has_drawdown = drawdown.is_some(),
            "risk manager initialised"
        );
        Self {
            position_sizer,
            grade_allocator,
            global_lock,
            vi_gate,
            margin_guard,
            kill_switch,
            drawdown,
        }
    }

    // -------------------------------------------------------------------------
    // Pipeline
    // -------------------------------------------------------------------------

    /// Run the 9-stage pipeline on a trade signal.
    pub async fn validate_signal(
        &self,
        signal: &TradeSignal,
        current_positions: &[Position],
        regime: MarketRegime,
        total_capital: i64,
        ctx: &PnlContext,
    ) -> RiskVerdict {
        let stock_code = signal.stock_code.as_str();
        let strategy_code = signal.strategy_code.as_str();

        info!(stock_code, strategy_code, regime = %regime, "risk pipeline started");

        // Sell signals reduce exposure; they bypass sizing and allocation
        // and carry their own quantity.
        if signal.side == OrderSide::Sell {
            let quantity = signal.quantity.unwrap_or(0);
            if quantity <= 0 {
                return Self::reject(1, "per_trade_risk", "sell signal carries no quantity");
            }
            debug!(stock_code, quantity, "sell signal: pipeline bypassed");
            return RiskVerdict::Passed(RiskApproval {
                quantity,
                position_pct: 0.0,
                sizing: None,
                reservation_key: None,
            });
        }

        // --- Step 1: per-trade risk (position sizer) ----------------------
        let mut sizing = match self.position_sizer.calculate(
            total_capital,
            regime,
            signal.entry_price,
            signal.stop_loss,
            signal.grade,
            signal.confidence,
        ) {
            Ok(s) => s,
            Err(e) => return Self::reject(1, "per_trade_risk", &e.to_string()),
        };

        // --- Step 2: monthly/cumulative drawdown --------------------------
        if let Some(ref drawdown) = self.drawdown {
            let resp = drawdown.evaluate_and_respond(
                ctx.daily_pnl_pct,
                ctx.monthly_pnl_pct,
                ctx.cumulative_pnl_pct,
            );
            if resp.trading_halted {
                return Self::reject(2, "monthly_cumulative_loss", &resp.halt_reason);
            }
            if resp.position_scale < 1.0 {
                sizing.quantity = (sizing.quantity as f64 * resp.position_scale) as i64;
                sizing.position_amount = sizing.quantity * sizing.entry_price;
                sizing.position_pct = if total_capital > 0 {
                    sizing.position_amount as f64 / total_capital as f64
                } else {
                    0.0
                };
                info!(
                    scale = resp.position_scale,
                    adjusted_quantity = sizing.quantity,
                    "drawdown position scale applied"
                );
            }
        }

        // --- Step 3: daily kill switch ------------------------------------
        if let Some(ref kill_switch) = self.kill_switch {
            let effective_capital = if ctx.current_capital > 0 {
                ctx.current_capital
            } else {
                total_capital
            };
            if !kill_switch.check(effective_capital) {
                let reason = {
                    let r = kill_switch.kill_reason();
                    if r.is_empty() {
                        "daily loss limit breached".to_string()
                    } else {
                        r
                    }
                };
                return Self::reject(3, "daily_kill_switch", &reason);
            }
        }

        let position_pct_points = sizing.position_pct * 100.0;

        // --- Step 4: grade/regime allocation ------------------------------
        if let Err(reason) = self.grade_allocator.validate_allocation(
            signal.grade,
            &signal.sector,
            position_pct_points,
            current_positions,
            regime,
        ) {
            return Self::reject(4, "grade_limit", &reason);
        }

        // --- Step 5: sector concentration ---------------------------------
        // Enforced inside the allocator's sector rule above; noted here so
        // the audit trail shows the step executed.
        debug!(stock_code, "sector concentration satisfied via grade allocator");

        // --- Step 6: special event ----------------------------------------
        // No authoritative external event source is wired; VI gating in
        // step 8 covers halts.
        debug!(stock_code, "special event check passed");

        // --- Step 7: global position lock ---------------------------------
        if let Err(reason) = self.global_lock.check_and_reserve(
            stock_code,
            signal.grade,
            position_pct_points,
            strategy_code,
        ) {
            return Self::reject(7, "global_position_lock", &reason);
        }

        // --- Step 8: VI status --------------------------------------------
        if let Some(ref vi) = self.vi_gate {
            if vi.is_vi_active(stock_code) {
                // Give back the exposure reserved in step 7.
                let _ = self.global_lock.release(stock_code, strategy_code);
                let reason = format!(
                    "volatility interruption active for {stock_code}; trading suspended until release"
                );
                return Self::reject(8, "vi_status", &reason);
            }
        }

        // --- Step 9: cash / margin ----------------------------------------
        let mut reservation_key = None;
        if let Some(ref margin) = self.margin_guard {
            match margin
                .validate_order(stock_code, sizing.quantity, signal.entry_price, signal.side)
                .await
            {
                Ok(key) => reservation_key = key,
                Err(reason) => {
                    let _ = self.global_lock.release(stock_code, strategy_code);
                    return Self::reject(9, "cash_margin", &reason);
                }
            }
        }

        info!(
            stock_code,
            strategy_code,
            quantity = sizing.quantity,
            position_amount = sizing.position_amount,
            "risk pipeline passed"
        );

        RiskVerdict::Passed(RiskApproval {
            quantity: sizing.quantity,
            position_pct: position_pct_points,
            sizing: Some(sizing),
            reservation_key,
        })
    }

    fn reject(step: u8, step_name: &'static str, reason: &str) -> RiskVerdict {
        warn!(step, step_name, reason, "risk pipeline rejected");
        RiskVerdict::Rejected(RiskRejection {
            step,
            step_name,
            reason: reason.to_string(),
        })
    }

    // -------------------------------------------------------------------------
    // Lifecycle hooks
    // -------------------------------------------------------------------------

    /// A buy order filled: the reserved cash is spent, so drop the matching
    /// reservation. The position lock stays while the position is open.
    pub fn on_buy_filled(&self, fill_amount: i64) {
        if let Some(ref margin) = self.margin_guard {
            if fill_amount > 0 {
                margin.release_reservation(fill_amount);
            }
        }
    }

    /// A buy order died unfilled (cancelled / rejected / expired / error):
    /// return both the exposure lock and the cash reservation.
    pub fn on_order_abandoned(&self, stock_code: &str, strategy_code: &str, reserved_amount: i64) {
        let _ = self.global_lock.release(stock_code, strategy_code);
        if let Some(ref margin) = self.margin_guard {
            if reserved_amount > 0 {
                margin.release_reservation(reserved_amount);
            }
        }
        info!(stock_code, strategy_code, "risk state released for abandoned order");
    }

    /// A position fully closed: release the exposure lock and any matching
    /// cash reservation.
    pub fn on_position_closed(&self, stock_code: &str, strategy_code: &str, fill_amount: i64) {
        let _ = self.global_lock.release(stock_code, strategy_code);
        if let Some(ref margin) = self.margin_guard {
            if fill_amount > 0 {
                margin.release_reservation(fill_amount);
            }
        }
        info!(stock_code, strategy_code, "risk state released for closed position");
    }

    /// Pre-market daily reset of all daily-scoped risk state.
    pub fn reset_daily(&self, new_starting_capital: i64) {
        if let Some(ref kill_switch) = self.kill_switch {
            kill_switch.reset_daily(new_starting_capital);
        }
        if let Some(ref drawdown) = self.drawdown {
            drawdown.reset_daily();
        }
        self.global_lock.clear_all();
        if let Some(ref margin) = self.margin_guard {
            margin.clear_all_reservations();
        }
        info!(new_starting_capital, "risk manager daily reset");
    }

    pub fn global_lock(&self) -> &Arc<GlobalPositionLock> {
        &self.global_lock
    }
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field("pipeline_steps", &9)
            .field("has_margin_guard", &self.margin_guard.is_some())
            .field("has_kill_switch", &self.kill_switch.is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StockGrade;

    struct NoVi;
    impl ViGate for NoVi {
        fn is_vi_active(&self, _stock_code: &str) -> bool {
            false
        }
    }

    struct ActiveVi;
    impl ViGate for ActiveVi {
        fn is_vi_active(&self, _stock_code: &str) -> bool {
            true
        }
    }

    const CAPITAL: i64 = 100_000_000;

    /// StrongBull + conf 5 + 20% stop distance sizes to exactly 10% of
    /// capital for a grade A name.
    fn ten_pct_signal(strategy: &str) -> TradeSignal {
        TradeSignal {
            stock_code: "005930".to_string(),
            side: OrderSide::Buy,
            strategy_code: strategy.to_string(),
            entry_price: 50_000,
            stop_loss: 40_000,
            grade: StockGrade::A,
            confidence: 5,
            quantity: None,
            position_pct: 0.0,
            sector: "semis".to_string(),
            indicators_snapshot: serde_json::Value::Null,
        }
    }

    fn manager(
        vi: Option<Arc<dyn ViGate>>,
        margin: Option<Arc<MarginGuard>>,
        kill: Option<Arc<DailyKillSwitch>>,
        drawdown: Option<Arc<DrawdownProtocol>>,
    ) -> RiskManager {
        RiskManager::new(
            PositionSizer::new(),
            GradeAllocator::new(),
            Arc::new(GlobalPositionLock::new()),
            vi,
            margin,
            kill,
            drawdown,
        )
    }

    fn funded_margin() -> Arc<MarginGuard> {
        let guard = MarginGuard::new(None);
        guard.set_balance(CAPITAL);
        Arc::new(guard)
    }

    // ---- happy path ------------------------------------------------------

    #[tokio::test]
    async fn full_pipeline_passes_and_reserves() {
        let rm = manager(
            Some(Arc::new(NoVi)),
            Some(funded_margin()),
            Some(Arc::new(DailyKillSwitch::new(0.03, CAPITAL))),
            Some(Arc::new(DrawdownProtocol::new())),
        );

        let verdict = rm
            .validate_signal(
                &ten_pct_signal("S3"),
                &[],
                MarketRegime::StrongBull,
                CAPITAL,
                &PnlContext::default(),
            )
            .await;

        let RiskVerdict::Passed(approval) = verdict else {
            panic!("expected pass, got {verdict:?}");
        };
        assert_eq!(approval.quantity, 200);
        assert!((approval.position_pct - 10.0).abs() < 1e-9);
        assert!(approval.reservation_key.is_some());
        // The exposure lock is held after a pass.
        assert_eq!(rm.global_lock().get_stock_exposure("005930").total_pct, 10.0);
    }

    // ---- step 1 ----------------------------------------------------------

    #[tokio::test]
    async fn step1_rejects_low_confidence() {
        let rm = manager(None, None, None, None);
        let mut signal = ten_pct_signal("S3");
        signal.confidence = 2;

        let verdict = rm
            .validate_signal(&signal, &[], MarketRegime::Bull, CAPITAL, &PnlContext::default())
            .await;

        let rejection = verdict.rejection().unwrap();
        assert_eq!(rejection.step, 1);
        assert_eq!(rejection.step_name, "per_trade_risk");
        assert!(rejection.reason.contains("confidence"));
    }

    // ---- step 2 ----------------------------------------------------------

    #[tokio::test]
    async fn step2_rejects_while_halted_and_names_level() {
        let drawdown = Arc::new(DrawdownProtocol::new());
        let rm = manager(None, None, None, Some(Arc::clone(&drawdown)));

        let ctx = PnlContext {
            daily_pnl_pct: -0.035,
            monthly_pnl_pct: -0.02,
            cumulative_pnl_pct: -0.04,
            current_capital: 0,
        };
        let verdict = rm
            .validate_signal(&ten_pct_signal("S3"), &[], MarketRegime::Bull, CAPITAL, &ctx)
            .await;

        let rejection = verdict.rejection().unwrap();
        assert_eq!(rejection.step, 2);
        assert_eq!(rejection.step_name, "monthly_cumulative_loss");
        assert!(rejection.reason.contains("YELLOW"));

        // Any later signal in the same session still rejects at step 2.
        let verdict = rm
            .validate_signal(
                &ten_pct_signal("S3"),
                &[],
                MarketRegime::Bull,
                CAPITAL,
                &PnlContext::default(),
            )
            .await;
        assert_eq!(verdict.rejection().unwrap().step, 2);
    }

    #[tokio::test]
    async fn step2_green_scales_quantity_down() {
        let drawdown = Arc::new(DrawdownProtocol::new());
        let rm = manager(None, None, None, Some(drawdown));

        let ctx = PnlContext {
            daily_pnl_pct: -0.021,
            ..Default::default()
        };
        let verdict = rm
            .validate_signal(
                &ten_pct_signal("S3"),
                &[],
                MarketRegime::StrongBull,
                CAPITAL,
                &ctx,
            )
            .await;

        let RiskVerdict::Passed(approval) = verdict else {
            panic!("expected pass");
        };
        // 200 shares halved.
        assert_eq!(approval.quantity, 100);
        assert!((approval.position_pct - 5.0).abs() < 1e-9);
    }

    // ---- step 3 ----------------------------------------------------------

    #[tokio::test]
    async fn step3_rejects_after_kill() {
        let kill = Arc::new(DailyKillSwitch::new(0.03, CAPITAL));
        let rm = manager(None, None, Some(Arc::clone(&kill)), None);

        let ctx = PnlContext {
            current_capital: 95_000_000, // -5%
            ..Default::default()
        };
        let verdict = rm
            .validate_signal(&ten_pct_signal("S3"), &[], MarketRegime::Bull, CAPITAL, &ctx)
            .await;

        let rejection = verdict.rejection().unwrap();
        assert_eq!(rejection.step, 3);
        assert_eq!(rejection.step_name, "daily_kill_switch");
        assert!(kill.is_killed());

        // Once killed, even a healthy capital reading rejects.
        let ctx = PnlContext {
            current_capital: CAPITAL,
            ..Default::default()
        };
        let verdict = rm
            .validate_signal(&ten_pct_signal("S3"), &[], MarketRegime::Bull, CAPITAL, &ctx)
            .await;
        assert_eq!(verdict.rejection().unwrap().step, 3);
    }

    // ---- step 4 ----------------------------------------------------------

    #[tokio::test]
    async fn step4_rejects_on_grade_allocation() {
        let rm = manager(None, None, None, None);
        // Bull grade A limit 35%: two held A positions at 30% leave no
        // room for 10% more.
        let held = vec![
            Position {
                stock_code: "000660".to_string(),
                quantity: 100,
                avg_entry_price: 100_000.0,
                total_cost: 10_000_000.0,
                strategy_code: "GR".to_string(),
                stop_loss_price: 90_000,
                grade: StockGrade::A,
                sector: "autos".to_string(),
                position_pct: 30.0,
                mode: crate::types::TradeMode::Paper,
                entry_time: 0.0,
                updated_at: 0.0,
            },
        ];

        let verdict = rm
            .validate_signal(
                &ten_pct_signal("S3"),
                &held,
                MarketRegime::Bull,
                CAPITAL,
                &PnlContext::default(),
            )
            .await;

        let rejection = verdict.rejection().unwrap();
        assert_eq!(rejection.step, 4);
        assert_eq!(rejection.step_name, "grade_limit");
    }

    // ---- step 7 ----------------------------------------------------------

    #[tokio::test]
    async fn step7_rejects_and_leaves_no_new_reservation() {
        let rm = manager(None, None, None, None);
        // Strategy X already holds 25% of the grade A cap (30%).
        rm.global_lock()
            .check_and_reserve("005930", StockGrade::A, 25.0, "X")
            .unwrap();

        let verdict = rm
            .validate_signal(
                &ten_pct_signal("Y"),
                &[],
                MarketRegime::StrongBull,
                CAPITAL,
                &PnlContext::default(),
            )
            .await;

        let rejection = verdict.rejection().unwrap();
        assert_eq!(rejection.step, 7);
        assert_eq!(rejection.step_name, "global_position_lock");
        assert!(rejection.reason.contains("30.0%"));
        assert!(rejection.reason.contains("25.0%"));
        assert!(rejection.reason.contains("10.0%"));

        let exposure = rm.global_lock().get_stock_exposure("005930");
        assert_eq!(exposure.total_pct, 25.0);
        assert!(!exposure.strategies.contains_key("Y"));
    }

    // ---- step 8 ----------------------------------------------------------

    #[tokio::test]
    async fn step8_rejects_on_vi_and_releases_lock() {
        let rm = manager(Some(Arc::new(ActiveVi)), None, None, None);

        let verdict = rm
            .validate_signal(
                &ten_pct_signal("S3"),
                &[],
                MarketRegime::StrongBull,
                CAPITAL,
                &PnlContext::default(),
            )
            .await;

        let rejection = verdict.rejection().unwrap();
        assert_eq!(rejection.step, 8);
        assert_eq!(rejection.step_name, "vi_status");
        // The step-7 reservation must have been rolled back.
        assert_eq!(rm.global_lock().get_stock_exposure("005930").total_pct, 0.0);
    }

    // ---- step 9 ----------------------------------------------------------

    #[tokio::test]
    async fn step9_rejects_on_cash_and_releases_lock() {
        let broke = MarginGuard::new(None);
        broke.set_balance(1_000_000); // far below the 10M position
        let rm = manager(Some(Arc::new(NoVi)), Some(Arc::new(broke)), None, None);

        let verdict = rm
            .validate_signal(
                &ten_pct_signal("S3"),
                &[],
                MarketRegime::StrongBull,
                CAPITAL,
                &PnlContext::default(),
            )
            .await;

        let rejection = verdict.rejection().unwrap();
        assert_eq!(rejection.step, 9);
        assert_eq!(rejection.step_name, "cash_margin");
        assert!(rejection.reason.contains("shortfall"));
        assert_eq!(rm.global_lock().get_stock_exposure("005930").total_pct, 0.0);
    }

    // ---- sell bypass -----------------------------------------------------

    #[tokio::test]
    async fn sell_signals_bypass_sizing() {
        let rm = manager(None, None, None, None);
        let mut signal = ten_pct_signal("S3");
        signal.side = OrderSide::Sell;
        signal.quantity = Some(150);

        let verdict = rm
            .validate_signal(&signal, &[], MarketRegime::Bear, CAPITAL, &PnlContext::default())
            .await;

        let RiskVerdict::Passed(approval) = verdict else {
            panic!("expected pass");
        };
        assert_eq!(approval.quantity, 150);
        assert!(approval.sizing.is_none());
        // No exposure lock for sells.
        assert_eq!(rm.global_lock().get_stock_exposure("005930").total_pct, 0.0);
    }

    #[tokio::test]
    async fn sell_without_quantity_rejects() {
        let rm = manager(None, None, None, None);
        let mut signal = ten_pct_signal("S3");
        signal.side = OrderSide::Sell;

        let verdict = rm
            .validate_signal(&signal, &[], MarketRegime::Bear, CAPITAL, &PnlContext::default())
            .await;
        assert_eq!(verdict.rejection().unwrap().step, 1);
    }

    // ---- cleanup hooks ---------------------------------------------------

    #[tokio::test]
    async fn position_close_releases_lock_and_cash() {
        let margin = funded_margin();
        let rm = manager(Some(Arc::new(NoVi)), Some(Arc::clone(&margin)), None, None);

        let verdict = rm
            .validate_signal(
                &ten_pct_signal("S3"),
                &[],
                MarketRegime::StrongBull,
                CAPITAL,
                &PnlContext::default(),
            )
            .await;
        assert!(verdict.passed());
        assert_eq!(margin.pending_count(), 1);

        rm.on_position_closed("005930", "S3", margin.pending_total());
        assert_eq!(rm.global_lock().get_stock_exposure("005930").total_pct, 0.0);
        assert_eq!(margin.pending_count(), 0);
    }

    #[tokio::test]
    async fn daily_reset_clears_risk_state() {
        let margin = funded_margin();
        let kill = Arc::new(DailyKillSwitch::new(0.03, CAPITAL));
        let rm = manager(Some(Arc::new(NoVi)), Some(Arc::clone(&margin)), Some(Arc::clone(&kill)), None);

        let _ = rm
            .validate_signal(
                &ten_pct_signal("S3"),
                &[],
                MarketRegime::StrongBull,
                CAPITAL,
                &PnlContext::default(),
            )
            .await;
        kill.check(90_000_000);
        assert!(kill.is_killed());

        rm.reset_daily(90_000_000);
        assert!(!kill.is_killed());
        assert_eq!(rm.global_lock().get_stock_exposure("005930").total_pct, 0.0);
        assert_eq!(margin.pending_count(), 0);
    }
}
