// =============================================================================
// Drawdown Protocol — 5-level escalating restriction ladder
// =============================================================================
//
//   Level   Threshold                 Response
//   ------  ------------------------  -------------------------------------
//   GREEN   daily  <= -2%             halve new position sizes
//   YELLOW  daily  <= -3%             halt until 16:30 KST today
//   ORANGE  monthly <= -6%            halt until the 1st of next month
//   RED     cumulative <= -10%        halt 7 days, force paper mode,
//                                     recovery = 5 consecutive paper wins
//   BLACK   cumulative <= -15%        indefinite halt, strategy review
//
// Escalation is monotonic within a session: the ladder only climbs. Levels
// clear through their scheduled resets (daily, monthly), the RED paper-win
// counter, or an explicit force-resume after a BLACK review.
// =============================================================================

use chrono::{DateTime, Datelike, Duration as ChronoDuration, FixedOffset, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

// Thresholds, compared against negative pnl fractions.
const DAILY_GREEN_THRESHOLD: f64 = 0.02;
const DAILY_YELLOW_THRESHOLD: f64 = 0.03;
const MONTHLY_ORANGE_THRESHOLD: f64 = 0.06;
const CUMULATIVE_RED_THRESHOLD: f64 = 0.10;
const CUMULATIVE_BLACK_THRESHOLD: f64 = 0.15;

/// Paper wins required to exit RED.
pub const RED_RECOVERY_PAPER_WINS: u32 = 5;
/// RED halt duration in days.
pub const RED_HALT_DAYS: i64 = 7;

fn kst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).unwrap()
}

/// Drawdown severity, ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DrawdownLevel {
    None,
    Green,
    Yellow,
    Orange,
    Red,
    Black,
}

impl DrawdownLevel {
    fn severity(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Green => 1,
            Self::Yellow => 2,
            Self::Orange => 3,
            Self::Red => 4,
            Self::Black => 5,
        }
    }
}

impl std::fmt::Display for DrawdownLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Green => write!(f, "GREEN"),
            Self::Yellow => write!(f, "YELLOW"),
            Self::Orange => write!(f, "ORANGE"),
            Self::Red => write!(f, "RED"),
            Self::Black => write!(f, "BLACK"),
        }
    }
}

/// Mutable protocol state.
#[derive(Debug, Clone)]
struct DrawdownState {
    level: DrawdownLevel,
    /// 1.0 = full size, 0.5 = halved, 0.0 = halted.
    position_scale: f64,
    trading_halted: bool,
    halt_reason: String,
    halt_until: Option<DateTime<FixedOffset>>,
    paper_mode_forced: bool,
    consecutive_paper_wins: u32,
    strategy_review_required: bool,
}

impl Default for DrawdownState {
    fn default() -> Self {
        Self {
            level: DrawdownLevel::None,
            position_scale: 1.0,
            trading_halted: false,
            halt_reason: String::new(),
            halt_until: None,
            paper_mode_forced: false,
            consecutive_paper_wins: 0,
            strategy_review_required: false,
        }
    }
}

/// Snapshot returned to callers after each evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct DrawdownResponse {
    pub level: DrawdownLevel,
    pub position_scale: f64,
    pub trading_halted: bool,
    pub halt_reason: String,
    pub halt_until: Option<DateTime<FixedOffset>>,
    pub paper_mode_forced: bool,
    pub strategy_review_required: bool,
    pub consecutive_paper_wins: u32,
    pub daily_pnl_pct: f64,
    pub monthly_pnl_pct: f64,
    pub cumulative_pnl_pct: f64,
}

/// 5-level drawdown response system.
pub struct DrawdownProtocol {
    state: Mutex<DrawdownState>,
}

impl DrawdownProtocol {
    pub fn new() -> Self {
        info!("drawdown protocol initialised");
        Self {
            state: Mutex::new(DrawdownState::default()),
        }
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Evaluate drawdown across the three horizons and apply the matching
    /// restriction. Losses are negative fractions (-0.03 = 3% down).
    pub fn evaluate_and_respond(
        &self,
        daily_pnl_pct: f64,
        monthly_pnl_pct: f64,
        cumulative_pnl_pct: f64,
    ) -> DrawdownResponse {
        self.evaluate_at(
            daily_pnl_pct,
            monthly_pnl_pct,
            cumulative_pnl_pct,
            Utc::now().with_timezone(&kst()),
        )
    }

    /// Evaluation against an explicit clock, so halt windows are testable.
    pub fn evaluate_at(
        &self,
        daily_pnl_pct: f64,
        monthly_pnl_pct: f64,
        cumulative_pnl_pct: f64,
        now: DateTime<FixedOffset>,
    ) -> DrawdownResponse {
        let mut state = self.state.lock();

        // Inside a previous timed halt window: keep the existing state
        // without re-classifying.
        if let Some(until) = state.halt_until {
            if now < until {
                info!(
                    level = %state.level,
                    halt_until = %until,
                    "still inside drawdown halt window"
                );
                return Self::response(&state, daily_pnl_pct, monthly_pnl_pct, cumulative_pnl_pct);
            }
        }

        let new_level = Self::classify(daily_pnl_pct, monthly_pnl_pct, cumulative_pnl_pct);

        // Only escalate; de-escalation happens through scheduled resets.
        if new_level.severity() > state.level.severity() {
            Self::escalate(
                &mut state,
                new_level,
                daily_pnl_pct,
                monthly_pnl_pct,
                cumulative_pnl_pct,
                now,
            );
        }

        Self::response(&state, daily_pnl_pct, monthly_pnl_pct, cumulative_pnl_pct)
    }

    /// Map the three horizons to a level; the most severe breach wins.
    fn classify(daily: f64, monthly: f64, cumulative: f64) -> DrawdownLevel {
        if cumulative <= -CUMULATIVE_BLACK_THRESHOLD {
            DrawdownLevel::Black
        } else if cumulative <= -CUMULATIVE_RED_THRESHOLD {
            DrawdownLevel::Red
        } else if monthly <= -MONTHLY_ORANGE_THRESHOLD {
            DrawdownLevel::Orange
        } else if daily <= -DAILY_YELLOW_THRESHOLD {
            DrawdownLevel::Yellow
        } else if daily <= -DAILY_GREEN_THRESHOLD {
            DrawdownLevel::Green
        } else {
            DrawdownLevel::None
        }
    }

    fn escalate(
        state: &mut DrawdownState,
        level: DrawdownLevel,
        daily: f64,
        monthly: f64,
        cumulative: f64,
        now: DateTime<FixedOffset>,
    ) {
        state.level = level;

        match level {
            DrawdownLevel::Green => {
                state.position_scale = 0.5;
                state.trading_halted = false;
                state.halt_reason = format!(
                    "GREEN: daily loss {:.1}% >= 2%; new positions reduced to 50%",
                    daily.abs() * 100.0
                );
                warn!(daily_pnl_pct = daily, "drawdown GREEN: position scale 50%");
            }
            DrawdownLevel::Yellow => {
                state.position_scale = 0.0;
                state.trading_halted = true;
                // Halt until end of session, 16:30 KST.
                let mut eod = now
                    .timezone()
                    .with_ymd_and_hms(now.year(), now.month(), now.day(), 16, 30, 0)
                    .unwrap();
                if now >= eod {
                    eod += ChronoDuration::days(1);
                }
                state.halt_until = Some(eod);
                state.halt_reason = format!(
                    "YELLOW: daily loss {:.1}% >= 3%; trading halted for the rest of the day",
                    daily.abs() * 100.0
                );
                error!(daily_pnl_pct = daily, halt_until = %eod, "drawdown YELLOW: halt rest of day");
            }
            DrawdownLevel::Orange => {
                state.position_scale = 0.0;
                state.trading_halted = true;
                // Halt until the first trading morning of next month.
                let (year, month) = if now.month() == 12 {
                    (now.year() + 1, 1)
                } else {
                    (now.year(), now.month() + 1)
                };
                let next_month = now
                    .timezone()
                    .with_ymd_and_hms(year, month, 1, 9, 0, 0)
                    .unwrap();
                state.halt_until = Some(next_month);
                state.halt_reason = format!(
                    "ORANGE: monthly loss {:.1}% >= 6%; trading halted for the rest of the month",
                    monthly.abs() * 100.0
                );
                error!(monthly_pnl_pct = monthly, halt_until = %next_month, "drawdown ORANGE: halt rest of month");
            }
            DrawdownLevel::Red => {
                state.position_scale = 0.0;
                state.trading_halted = true;
                state.paper_mode_forced = true;
                state.consecutive_paper_wins = 0;
                let halt_end = now + ChronoDuration::days(RED_HALT_DAYS);
                state.halt_until = Some(halt_end);
                state.halt_reason = format!(
                    "RED: cumulative loss {:.1}% >= 10%; halted {RED_HALT_DAYS} days, paper mode forced, \
                     recovery requires {RED_RECOVERY_PAPER_WINS} consecutive paper wins",
                    cumulative.abs() * 100.0
                );
                error!(cumulative_pnl_pct = cumulative, halt_until = %halt_end, "drawdown RED: week halt + paper mode");
            }
            DrawdownLevel::Black => {
                state.position_scale = 0.0;
                state.trading_halted = true;
                state.paper_mode_forced = true;
                state.strategy_review_required = true;
                state.halt_until = None; // indefinite
                state.halt_reason = format!(
                    "BLACK: cumulative loss {:.1}% >= 15%; INDEFINITE halt, full strategy review required",
                    cumulative.abs() * 100.0
                );
                error!(cumulative_pnl_pct = cumulative, "drawdown BLACK: indefinite halt");
            }
            DrawdownLevel::None => {}
        }
    }

    // -------------------------------------------------------------------------
    // RED recovery
    // -------------------------------------------------------------------------

    /// Record a paper trade result during RED recovery. A loss resets the
    /// win counter. Returns `true` when recovery completes.
    pub fn record_paper_trade_result(&self, win: bool) -> bool {
        let mut state = self.state.lock();
        if state.level != DrawdownLevel::Red {
            return false;
        }

        if win {
            state.consecutive_paper_wins += 1;
            info!(
                consecutive_wins = state.consecutive_paper_wins,
                required = RED_RECOVERY_PAPER_WINS,
                "paper win recorded during RED recovery"
            );
        } else {
            state.consecutive_paper_wins = 0;
            info!("paper loss during RED recovery; win counter reset");
        }

        if state.consecutive_paper_wins >= RED_RECOVERY_PAPER_WINS {
            info!("RED recovery complete; resuming live trading");
            *state = DrawdownState::default();
            return true;
        }
        false
    }

    // -------------------------------------------------------------------------
    // Resets & overrides
    // -------------------------------------------------------------------------

    /// Clear daily-scoped levels (GREEN/YELLOW) at the start of a new day.
    pub fn reset_daily(&self) {
        let mut state = self.state.lock();
        if matches!(state.level, DrawdownLevel::Green | DrawdownLevel::Yellow) {
            info!(previous_level = %state.level, "drawdown daily reset");
            *state = DrawdownState::default();
        }
    }

    /// Clear the monthly-scoped ORANGE level at the start of a new month.
    pub fn reset_monthly(&self) {
        let mut state = self.state.lock();
        if state.level == DrawdownLevel::Orange {
            info!("drawdown monthly reset");
            *state = DrawdownState::default();
        }
    }

    /// Manual resume after deliberate human review (BLACK exit path).
    pub fn force_resume(&self, reason: &str) {
        let mut state = self.state.lock();
        warn!(previous_level = %state.level, reason, "drawdown force resume");
        *state = DrawdownState::default();
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn current_level(&self) -> DrawdownLevel {
        self.state.lock().level
    }

    pub fn is_halted(&self) -> bool {
        self.state.lock().trading_halted
    }

    pub fn position_scale(&self) -> f64 {
        self.state.lock().position_scale
    }

    fn response(
        state: &DrawdownState,
        daily: f64,
        monthly: f64,
        cumulative: f64,
    ) -> DrawdownResponse {
        DrawdownResponse {
            level: state.level,
            position_scale: state.position_scale,
            trading_halted: state.trading_halted,
            halt_reason: state.halt_reason.clone(),
            halt_until: state.halt_until,
            paper_mode_forced: state.paper_mode_forced,
            strategy_review_required: state.strategy_review_required,
            consecutive_paper_wins: state.consecutive_paper_wins,
            daily_pnl_pct: daily,
            monthly_pnl_pct: monthly,
            cumulative_pnl_pct: cumulative,
        }
    }
}

impl Default for DrawdownProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DrawdownProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DrawdownProtocol")
            .field("level", &state.level)
            .field("halted", &state.trading_halted)
            .field("scale", &state.position_scale)
            .finish()
    }
}
