// =============================================================================
// Daily Kill Switch — hard circuit breaker on daily loss
// =============================================================================
//
// When the day's loss against starting capital crosses the limit, the switch
// flips immediately (synchronously, so no further order can slip through)
// and a shutdown task runs in the background: cancel every pending order,
// then raise a CRITICAL notification.
//
// The switch stays tripped until `reset_daily` supplies the next session's
// starting capital.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::notify::{Notifier, Priority};

/// Default daily loss limit: 3 % of starting capital.
pub const DEFAULT_DAILY_LOSS_LIMIT: f64 = 0.03;

/// Callback that cancels every pending order.
pub type CancelAllFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Daily-loss circuit breaker.
pub struct DailyKillSwitch {
    daily_loss_limit_pct: f64,
    starting_capital: AtomicI64,
    killed: AtomicBool,
    kill_reason: RwLock<String>,
    kill_timestamp: RwLock<Option<DateTime<FixedOffset>>>,

    // Wire-up-time callbacks; the switch never holds the order manager
    // itself, only a cancel-all function value.
    on_cancel_all: RwLock<Option<CancelAllFn>>,
    notifier: RwLock<Option<Arc<dyn Notifier>>>,
}

impl DailyKillSwitch {
    pub fn new(daily_loss_limit_pct: f64, starting_capital: i64) -> Self {
        info!(
            daily_loss_limit_pct,
            starting_capital, "daily kill switch initialised"
        );
        Self {
            daily_loss_limit_pct,
            starting_capital: AtomicI64::new(starting_capital),
            killed: AtomicBool::new(false),
            kill_reason: RwLock::new(String::new()),
            kill_timestamp: RwLock::new(None),
            on_cancel_all: RwLock::new(None),
            notifier: RwLock::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Wire-up
    // -------------------------------------------------------------------------

    pub fn set_cancel_all(&self, f: CancelAllFn) {
        *self.on_cancel_all.write() = Some(f);
    }

    pub fn set_notifier(&self, n: Arc<dyn Notifier>) {
        *self.notifier.write() = Some(n);
    }

    pub fn set_starting_capital(&self, capital: i64) {
        self.starting_capital.store(capital, Ordering::SeqCst);
    }

    // -------------------------------------------------------------------------
    // Core check
    // -------------------------------------------------------------------------

    /// Evaluate the daily loss against the limit.
    ///
    /// Returns `true` while trading may continue. On a breach the killed
    /// flag is set before this returns, and the shutdown sequence (cancel
    /// all, notify CRITICAL) runs as a detached task.
    pub fn check(&self, current_capital: i64) -> bool {
        if self.killed.load(Ordering::SeqCst) {
            return false;
        }

        let starting = self.starting_capital.load(Ordering::SeqCst);
        if starting <= 0 {
            warn!(starting_capital = starting, "kill switch has no starting capital");
            return true;
        }

        let daily_pnl = current_capital - starting;
        let daily_pnl_pct = daily_pnl as f64 / starting as f64;

        if daily_pnl_pct <= -self.daily_loss_limit_pct {
            let reason = format!(
                "daily loss {:.2}% exceeded limit {:.1}% (lost {} KRW)",
                daily_pnl_pct.abs() * 100.0,
                self.daily_loss_limit_pct * 100.0,
                -daily_pnl
            );

            // Flip the flag before anything async happens so no new order
            // can pass between breach and shutdown.
            self.killed.store(true, Ordering::SeqCst);
            *self.kill_reason.write() = reason.clone();
            let kst = FixedOffset::east_opt(9 * 3600).unwrap();
            *self.kill_timestamp.write() = Some(Utc::now().with_timezone(&kst));

            error!(
                daily_pnl,
                daily_pnl_pct = format!("{daily_pnl_pct:.4}"),
                limit_pct = self.daily_loss_limit_pct,
                reason = %reason,
                "DAILY KILL SWITCH TRIGGERED"
            );

            self.spawn_emergency_shutdown(reason);
            return false;
        }

        true
    }

    fn spawn_emergency_shutdown(&self, reason: String) {
        let cancel_all = self.on_cancel_all.read().clone();
        let notifier = self.notifier.read().clone();
        let timestamp = *self.kill_timestamp.read();

        tokio::spawn(async move {
            error!(reason = %reason, "emergency shutdown started");

            if let Some(cancel) = cancel_all {
                cancel().await;
                info!("emergency shutdown: pending orders cancelled");
            }

            if let Some(notifier) = notifier {
                let when = timestamp
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S KST").to_string())
                    .unwrap_or_default();
                let message = format!(
                    "[EMERGENCY] Daily kill switch activated\nReason: {reason}\nTime: {when}\n\
                     All pending orders cancelled. New orders blocked."
                );
                notifier.send(&message, Priority::Critical).await;
                info!("emergency shutdown: notification sent");
            }

            error!("emergency shutdown completed");
        });
    }

    // -------------------------------------------------------------------------
    // Queries & reset
    // -------------------------------------------------------------------------

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn kill_reason(&self) -> String {
        self.kill_reason.read().clone()
    }

    pub fn daily_loss_limit_pct(&self) -> f64 {
        self.daily_loss_limit_pct
    }

    /// Re-arm the switch for a new trading day.
    pub fn reset_daily(&self, new_starting_capital: i64) {
        self.killed.store(false, Ordering::SeqCst);
        *self.kill_reason.write() = String::new();
        *self.kill_timestamp.write() = None;
        self.starting_capital
            .store(new_starting_capital, Ordering::SeqCst);

        info!(new_starting_capital, "daily kill switch reset");
    }
}

impl std::fmt::Debug for DailyKillSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DailyKillSwitch")
            .field("limit_pct", &(self.daily_loss_limit_pct * 100.0))
            .field("killed", &self.is_killed())
            .field(
                "starting_capital",
                &self.starting_capital.load(Ordering::SeqCst),
            )
            .finish()
    }
}
