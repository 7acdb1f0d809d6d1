// =============================================================================
// VI Monitor — per-stock volatility-interruption state machine
// =============================================================================
//
// KRX specifics:
//   - Static VI triggers on a +-10% move from the reference price (previous
//     close); the stock halts for roughly 2 minutes.
//   - After the broker reports a release, a 30-second cooling observation
//     window applies before new orders should go out.
//
// This module tracks trigger boundaries per stock, transitions a small state
// machine on broker VI events, and gives the risk pipeline an advisory check
// so orders never collide with a VI boundary.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::api::ws::FieldMap;
use crate::market::cache::RealtimeCache;

/// Default post-release observation window per KRX rules.
pub const DEFAULT_COOLING: Duration = Duration::from_secs(30);
/// Distance (%) to a VI boundary at which a warning is attached.
pub const DEFAULT_PROXIMITY_PCT: f64 = 1.0;

/// Per-stock VI machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViState {
    Normal,
    /// Price within 1% of a static VI boundary (derived, not event-driven).
    Warning,
    /// Trading halt in effect.
    Triggered,
    /// Post-release observation window.
    Cooling,
}

impl std::fmt::Display for ViState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::Warning => write!(f, "WARNING"),
            Self::Triggered => write!(f, "TRIGGERED"),
            Self::Cooling => write!(f, "COOLING"),
        }
    }
}

/// Trigger price boundaries for a stock.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ViPrices {
    pub reference_price: f64,
    pub static_upper: f64,
    pub static_lower: f64,
    pub dynamic: f64,
}

/// Advisory result of a proximity check before order placement.
#[derive(Debug, Clone, Serialize)]
pub struct ViProximity {
    /// `false` means the order must be blocked.
    pub allow_order: bool,
    /// Set when blocked.
    pub reason: Option<String>,
    /// Set when the target price is close to a boundary.
    pub warning: Option<String>,
    pub vi_state: ViState,
}

/// Realtime VI state tracker and order gate.
pub struct ViMonitor {
    cache: Arc<RealtimeCache>,
    cooling: Duration,
    proximity_pct: f64,

    prices: RwLock<HashMap<String, ViPrices>>,
    states: RwLock<HashMap<String, ViState>>,
    released_at: RwLock<HashMap<String, Instant>>,
    /// Pending cooling timers, cancellable when a new trigger arrives.
    cooling_tasks: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl ViMonitor {
    pub fn new(cache: Arc<RealtimeCache>) -> Self {
        Self::with_config(cache, DEFAULT_COOLING, DEFAULT_PROXIMITY_PCT)
    }

    pub fn with_config(cache: Arc<RealtimeCache>, cooling: Duration, proximity_pct: f64) -> Self {
        Self {
            cache,
            cooling,
            proximity_pct,
            prices: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            released_at: RwLock::new(HashMap::new()),
            cooling_tasks: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Websocket callback
    // -------------------------------------------------------------------------

    /// Handle a broker VI event (H0STVI0 stream).
    ///
    /// `vi_cls_code` "1" = triggered, "2" = released. Reference prices in the
    /// event refresh the static boundaries.
    pub fn on_vi_data(self: &Arc<Self>, stock_code: &str, fields: &FieldMap) {
        let vi_cls = fields.get("vi_cls_code").map(String::as_str).unwrap_or("");
        let ref_price: f64 = fields
            .get("vi_stnd_prc")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let dyn_price: f64 = fields
            .get("vi_dyn_prc")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);

        if ref_price > 0.0 {
            self.prices.write().insert(
                stock_code.to_string(),
                ViPrices {
                    reference_price: ref_price,
                    static_upper: ref_price * 1.10,
                    static_lower: ref_price * 0.90,
                    dynamic: dyn_price,
                },
            );
        }

        match vi_cls {
            "1" => {
                self.states
                    .write()
                    .insert(stock_code.to_string(), ViState::Triggered);
                self.cancel_cooling_task(stock_code);

                warn!(
                    stock_code,
                    reference_price = ref_price,
                    "VI triggered; trading halted"
                );

                self.cache.update_vi(stock_code, vi_cls, ref_price);
            }
            "2" => {
                self.states
                    .write()
                    .insert(stock_code.to_string(), ViState::Cooling);
                self.released_at
                    .write()
                    .insert(stock_code.to_string(), Instant::now());

                info!(
                    stock_code,
                    cooling_seconds = self.cooling.as_secs(),
                    "VI released; cooling observation started"
                );

                self.cancel_cooling_task(stock_code);
                let monitor = Arc::clone(self);
                let code = stock_code.to_string();
                let delay = self.cooling;
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    monitor.states.write().insert(code.clone(), ViState::Normal);
                    monitor.cooling_tasks.lock().remove(&code);
                    info!(stock_code = %code, "VI cooling complete; state NORMAL");
                });
                self.cooling_tasks.lock().insert(stock_code.to_string(), task);

                self.cache.update_vi(stock_code, vi_cls, ref_price);
            }
            other => {
                debug!(stock_code, vi_cls_code = other, "VI informational update");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get_state(&self, stock_code: &str) -> ViState {
        self.states
            .read()
            .get(stock_code)
            .copied()
            .unwrap_or(ViState::Normal)
    }

    pub fn get_vi_prices(&self, stock_code: &str) -> Option<ViPrices> {
        self.prices.read().get(stock_code).copied()
    }

    /// Whether an order is currently blocked by VI state. TRIGGERED and
    /// COOLING block; NORMAL and WARNING allow.
    pub fn is_vi_active(&self, stock_code: &str) -> bool {
        matches!(
            self.get_state(stock_code),
            ViState::Triggered | ViState::Cooling
        )
    }

    pub fn is_tradeable(&self, stock_code: &str) -> bool {
        !self.is_vi_active(stock_code)
    }

    /// Evaluate whether `target_price` can be safely used for an order.
    ///
    /// Hard-blocks when VI is TRIGGERED or COOLING; attaches a WARNING when
    /// the target is within `proximity_pct` of a static boundary.
    pub fn check_vi_proximity(&self, stock_code: &str, target_price: f64) -> ViProximity {
        let state = self.get_state(stock_code);

        if state == ViState::Triggered {
            return ViProximity {
                allow_order: false,
                reason: Some(format!(
                    "{stock_code} VI triggered; trading halted for 2 minutes"
                )),
                warning: None,
                vi_state: state,
            };
        }

        if state == ViState::Cooling {
            let elapsed = self
                .released_at
                .read()
                .get(stock_code)
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO);
            let remaining = self.cooling.saturating_sub(elapsed);
            return ViProximity {
                allow_order: false,
                reason: Some(format!(
                    "{stock_code} VI just released; {}s cooling observation remaining",
                    remaining.as_secs()
                )),
                warning: None,
                vi_state: state,
            };
        }

        if target_price > 0.0 {
            if let Some(prices) = self.get_vi_prices(stock_code) {
                for (bound, label) in [
                    (prices.static_upper, "upper"),
                    (prices.static_lower, "lower"),
                ] {
                    if bound > 0.0 {
                        let proximity = (target_price - bound).abs() / bound * 100.0;
                        if proximity < self.proximity_pct {
                            return ViProximity {
                                allow_order: true,
                                reason: None,
                                warning: Some(format!(
                                    "target price {target_price:.0} is {proximity:.2}% from static VI {label} ({bound:.0})"
                                )),
                                vi_state: ViState::Warning,
                            };
                        }
                    }
                }
            }
        }

        ViProximity {
            allow_order: true,
            reason: None,
            warning: None,
            vi_state: ViState::Normal,
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Pre-seed VI boundaries from the previous close (session prep).
    pub fn initialize_vi_prices(&self, stock_code: &str, prev_close: f64) {
        if prev_close <= 0.0 {
            return;
        }
        self.prices.write().insert(
            stock_code.to_string(),
            ViPrices {
                reference_price: prev_close,
                static_upper: prev_close * 1.10,
                static_lower: prev_close * 0.90,
                dynamic: 0.0,
            },
        );
        self.states
            .write()
            .entry(stock_code.to_string())
            .or_insert(ViState::Normal);

        debug!(
            stock_code,
            prev_close,
            static_upper = prev_close * 1.10,
            static_lower = prev_close * 0.90,
            "VI prices initialised"
        );
    }

    fn cancel_cooling_task(&self, stock_code: &str) {
        if let Some(task) = self.cooling_tasks.lock().remove(stock_code) {
            task.abort();
            debug!(stock_code, "pending cooling timer cancelled");
        }
    }

    /// Cancel every pending cooling timer (teardown).
    pub fn shutdown(&self) {
        let mut tasks = self.cooling_tasks.lock();
        for (_, task) in tasks.drain() {
            task.abort();
        }
        info!("vi monitor shut down");
    }
}

impl std::fmt::Debug for ViMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViMonitor")
            .field("tracked", &self.states.read().len())
            .field("cooling_seconds", &self.cooling.as_secs())
            .field("proximity_pct", &self.proximity_pct)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn vi_fields(cls: &str, ref_price: &str) -> FieldMap {
        let mut map = FieldMap::new();
        map.insert("vi_cls_code".to_string(), cls.to_string());
        map.insert("vi_stnd_prc".to_string(), ref_price.to_string());
        map.insert("vi_dyn_prc".to_string(), "0".to_string());
        map
    }

    fn monitor(cooling: Duration) -> Arc<ViMonitor> {
        Arc::new(ViMonitor::with_config(
            Arc::new(RealtimeCache::new()),
            cooling,
            DEFAULT_PROXIMITY_PCT,
        ))
    }

    // ---- state machine ---------------------------------------------------

    #[tokio::test]
    async fn trigger_blocks_orders() {
        let m = monitor(DEFAULT_COOLING);
        m.on_vi_data("005930", &vi_fields("1", "70000"));

        assert_eq!(m.get_state("005930"), ViState::Triggered);
        assert!(!m.is_tradeable("005930"));

        let check = m.check_vi_proximity("005930", 71000.0);
        assert!(!check.allow_order);
        assert!(check.reason.unwrap().contains("VI triggered"));
    }

    #[tokio::test]
    async fn release_enters_cooling_then_normal() {
        let m = monitor(Duration::from_millis(20));
        m.on_vi_data("005930", &vi_fields("1", "70000"));
        m.on_vi_data("005930", &vi_fields("2", "70000"));

        assert_eq!(m.get_state("005930"), ViState::Cooling);
        assert!(!m.is_tradeable("005930"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(m.get_state("005930"), ViState::Normal);
        assert!(m.is_tradeable("005930"));
    }

    #[tokio::test]
    async fn retrigger_cancels_cooling_timer() {
        let m = monitor(Duration::from_millis(20));
        m.on_vi_data("005930", &vi_fields("1", "70000"));
        m.on_vi_data("005930", &vi_fields("2", "70000"));
        // New trigger during cooling must cancel the pending NORMAL
        // transition.
        m.on_vi_data("005930", &vi_fields("1", "70000"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(m.get_state("005930"), ViState::Triggered);
    }

    // ---- proximity advisory ----------------------------------------------

    #[tokio::test]
    async fn proximity_to_upper_bound_warns() {
        let m = monitor(DEFAULT_COOLING);
        m.initialize_vi_prices("005930", 70000.0);

        // Static upper = 77000; 76800 is ~0.26% away.
        let check = m.check_vi_proximity("005930", 76800.0);
        assert!(check.allow_order);
        assert_eq!(check.vi_state, ViState::Warning);
        assert!(check.warning.unwrap().contains("upper"));
    }

    #[tokio::test]
    async fn proximity_to_lower_bound_warns() {
        let m = monitor(DEFAULT_COOLING);
        m.initialize_vi_prices("005930", 70000.0);

        // Static lower = 63000.
        let check = m.check_vi_proximity("005930", 63200.0);
        assert!(check.allow_order);
        assert_eq!(check.vi_state, ViState::Warning);
        assert!(check.warning.unwrap().contains("lower"));
    }

    #[tokio::test]
    async fn mid_range_price_is_clear() {
        let m = monitor(DEFAULT_COOLING);
        m.initialize_vi_prices("005930", 70000.0);

        let check = m.check_vi_proximity("005930", 70500.0);
        assert!(check.allow_order);
        assert!(check.warning.is_none());
        assert_eq!(check.vi_state, ViState::Normal);
    }

    #[tokio::test]
    async fn unknown_stock_defaults_to_normal() {
        let m = monitor(DEFAULT_COOLING);
        assert_eq!(m.get_state("999999"), ViState::Normal);
        assert!(m.is_tradeable("999999"));
        assert!(m.check_vi_proximity("999999", 10000.0).allow_order);
    }

    // ---- seeding ---------------------------------------------------------

    #[tokio::test]
    async fn seed_from_prev_close_sets_bounds() {
        let m = monitor(DEFAULT_COOLING);
        m.initialize_vi_prices("005930", 70000.0);

        let prices = m.get_vi_prices("005930").unwrap();
        assert!((prices.static_upper - 77000.0).abs() < 1e-9);
        assert!((prices.static_lower - 63000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn seed_ignores_non_positive_close() {
        let m = monitor(DEFAULT_COOLING);
        m.initialize_vi_prices("005930", 0.0);
        assert!(m.get_vi_prices("005930").is_none());
    }
}
