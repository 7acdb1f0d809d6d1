// =============================================================================
// Realtime Cache — last-value store for price, orderbook, and VI status
// =============================================================================
//
// Websocket callbacks WRITE into the cache; strategies and the risk pipeline
// READ from it. Nothing outside this process ever calls the REST API for a
// realtime quote.
//
// Entries are immutable values replaced wholesale under a short write lock,
// so readers always observe a consistent tick or book. Reads older than 5 s
// log a stale-feed warning; the freshness gate for trading is 3 s.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::market::vi_monitor::ViState;

/// Reads older than this log a stale-feed warning.
const STALE_WARN_AGE: Duration = Duration::from_secs(5);
/// Default freshness window for `is_data_fresh`.
pub const DEFAULT_FRESH_AGE: Duration = Duration::from_secs(3);

/// Latest trade execution for a single stock.
#[derive(Debug, Clone, Copy)]
pub struct PriceTick {
    pub price: f64,
    pub volume: i64,
    pub change_pct: f64,
    /// Monotonic reception time.
    pub timestamp: Instant,
}

/// 10-level orderbook snapshot. Asks are best-first (lowest price at index
/// 0); bids are best-first (highest price at index 0).
#[derive(Debug, Clone)]
pub struct OrderbookSnapshot {
    pub ask_prices: [f64; 10],
    pub ask_volumes: [i64; 10],
    pub bid_prices: [f64; 10],
    pub bid_volumes: [i64; 10],
    pub total_ask_volume: i64,
    pub total_bid_volume: i64,
    pub timestamp: Instant,
}

impl OrderbookSnapshot {
    pub fn best_ask(&self) -> (f64, i64) {
        (self.ask_prices[0], self.ask_volumes[0])
    }

    pub fn best_bid(&self) -> (f64, i64) {
        (self.bid_prices[0], self.bid_volumes[0])
    }
}

/// Volatility-interruption status held per stock.
#[derive(Debug, Clone, Copy)]
pub struct ViStatus {
    pub state: ViState,
    pub reference_price: f64,
    /// Static upper trigger: reference * 1.10.
    pub static_upper: f64,
    /// Static lower trigger: reference * 0.90.
    pub static_lower: f64,
    pub triggered_at: Option<Instant>,
}

/// Serialisable combined view of one stock's cached state.
#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub stock_code: String,
    pub price: Option<f64>,
    pub volume: Option<i64>,
    pub change_pct: Option<f64>,
    pub best_ask: Option<f64>,
    pub best_bid: Option<f64>,
    pub total_ask_volume: Option<i64>,
    pub total_bid_volume: Option<i64>,
    pub vi_state: String,
    pub data_fresh: bool,
}

/// In-memory last-value cache fed by the websocket.
pub struct RealtimeCache {
    prices: RwLock<HashMap<String, PriceTick>>,
    orderbooks: RwLock<HashMap<String, OrderbookSnapshot>>,
    vi_status: RwLock<HashMap<String, ViStatus>>,
    last_update: RwLock<HashMap<String, Instant>>,
}

impl RealtimeCache {
    pub fn new() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
            orderbooks: RwLock::new(HashMap::new()),
            vi_status: RwLock::new(HashMap::new()),
            last_update: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Websocket write path
    // -------------------------------------------------------------------------

    /// Record the latest trade execution for a stock.
    pub fn update_price(&self, stock_code: &str, price: f64, volume: i64, change_pct: f64) {
        let now = Instant::now();
        let tick = PriceTick {
            price,
            volume,
            change_pct,
            timestamp: now,
        };
        self.prices.write().insert(stock_code.to_string(), tick);
        self.last_update.write().insert(stock_code.to_string(), now);

        debug!(stock_code, price, volume, change_pct, "price cache updated");
    }

    /// Replace the orderbook snapshot for a stock.
    pub fn update_orderbook(&self, stock_code: &str, mut book: OrderbookSnapshot) {
        let now = Instant::now();
        book.timestamp = now;

        debug!(
            stock_code,
            best_ask = book.ask_prices[0],
            best_bid = book.bid_prices[0],
            total_ask_vol = book.total_ask_volume,
            total_bid_vol = book.total_bid_volume,
            "orderbook cache updated"
        );

        self.orderbooks.write().insert(stock_code.to_string(), book);
        self.last_update.write().insert(stock_code.to_string(), now);
    }

    /// Update VI status from a broker VI event. `vi_cls_code` is "1" for a
    /// trigger and "2" for a release.
    pub fn update_vi(&self, stock_code: &str, vi_cls_code: &str, reference_price: f64) {
        let now = Instant::now();

        let (state, triggered_at) = match vi_cls_code {
            "1" => (ViState::Triggered, Some(now)),
            "2" => {
                let prior = self.vi_status.read().get(stock_code).and_then(|v| v.triggered_at);
                (ViState::Cooling, prior)
            }
            _ => (ViState::Normal, None),
        };

        let status = ViStatus {
            state,
            reference_price,
            static_upper: if reference_price > 0.0 { reference_price * 1.10 } else { 0.0 },
            static_lower: if reference_price > 0.0 { reference_price * 0.90 } else { 0.0 },
            triggered_at,
        };

        self.vi_status.write().insert(stock_code.to_string(), status);
        self.last_update.write().insert(stock_code.to_string(), now);

        info!(
            stock_code,
            vi_state = %state,
            reference_price,
            static_upper = status.static_upper,
            static_lower = status.static_lower,
            "vi cache updated"
        );
    }

    // -------------------------------------------------------------------------
    // Read path
    // -------------------------------------------------------------------------

    /// Latest cached price, or `None` if never received. Warns when the
    /// entry is older than 5 s.
    pub fn get_price(&self, stock_code: &str) -> Option<PriceTick> {
        let tick = self.prices.read().get(stock_code).copied();
        if let Some(t) = tick {
            let age = t.timestamp.elapsed();
            if age > STALE_WARN_AGE {
                warn!(
                    stock_code,
                    age_seconds = format!("{:.2}", age.as_secs_f64()),
                    "stale price data; feed may be delayed"
                );
            }
        }
        tick
    }

    /// Latest cached orderbook, or `None`. Warns when older than 5 s.
    pub fn get_orderbook(&self, stock_code: &str) -> Option<OrderbookSnapshot> {
        let book = self.orderbooks.read().get(stock_code).cloned();
        if let Some(ref b) = book {
            let age = b.timestamp.elapsed();
            if age > STALE_WARN_AGE {
                warn!(
                    stock_code,
                    age_seconds = format!("{:.2}", age.as_secs_f64()),
                    "stale orderbook data; feed may be delayed"
                );
            }
        }
        book
    }

    pub fn get_vi_status(&self, stock_code: &str) -> Option<ViStatus> {
        self.vi_status.read().get(stock_code).copied()
    }

    /// Whether any update arrived for the stock within `max_age`.
    pub fn is_data_fresh(&self, stock_code: &str, max_age: Duration) -> bool {
        self.last_update
            .read()
            .get(stock_code)
            .map(|t| t.elapsed() <= max_age)
            .unwrap_or(false)
    }

    // -------------------------------------------------------------------------
    // Utility
    // -------------------------------------------------------------------------

    /// Every stock code that has at least one price or book entry.
    pub fn tracked_stock_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self
            .prices
            .read()
            .keys()
            .chain(self.orderbooks.read().keys())
            .cloned()
            .collect();
        codes.sort();
        codes.dedup();
        codes
    }

    /// Combined serialisable view for journaling and diagnostics.
    pub fn snapshot(&self, stock_code: &str) -> CacheSnapshot {
        let price = self.prices.read().get(stock_code).copied();
        let book = self.orderbooks.read().get(stock_code).cloned();
        let vi = self.vi_status.read().get(stock_code).copied();

        CacheSnapshot {
            stock_code: stock_code.to_string(),
            price: price.map(|p| p.price),
            volume: price.map(|p| p.volume),
            change_pct: price.map(|p| p.change_pct),
            best_ask: book.as_ref().map(|b| b.ask_prices[0]),
            best_bid: book.as_ref().map(|b| b.bid_prices[0]),
            total_ask_volume: book.as_ref().map(|b| b.total_ask_volume),
            total_bid_volume: book.as_ref().map(|b| b.total_bid_volume),
            vi_state: vi.map(|v| v.state.to_string()).unwrap_or_else(|| "UNKNOWN".to_string()),
            data_fresh: self.is_data_fresh(stock_code, DEFAULT_FRESH_AGE),
        }
    }

    /// Drop everything (end-of-day).
    pub fn clear(&self) {
        self.prices.write().clear();
        self.orderbooks.write().clear();
        self.vi_status.write().clear();
        self.last_update.write().clear();
        info!("realtime cache cleared");
    }
}

impl Default for RealtimeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RealtimeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeCache")
            .field("prices", &self.prices.read().len())
            .field("orderbooks", &self.orderbooks.read().len())
            .field("vi_status", &self.vi_status.read().len())
            .finish()
    }
}

// =============================================================================
// Test helpers
// =============================================================================

/// Build an orderbook with a single populated level on each side. Used by
/// unit tests across the order and risk modules.
#[cfg(test)]
pub fn test_book(best_ask: f64, ask_vol: i64, best_bid: f64, bid_vol: i64) -> OrderbookSnapshot {
    let mut book = OrderbookSnapshot {
        ask_prices: [0.0; 10],
        ask_volumes: [0; 10],
        bid_prices: [0.0; 10],
        bid_volumes: [0; 10],
        total_ask_volume: ask_vol,
        total_bid_volume: bid_vol,
        timestamp: Instant::now(),
    };
    book.ask_prices[0] = best_ask;
    book.ask_volumes[0] = ask_vol;
    book.bid_prices[0] = best_bid;
    book.bid_volumes[0] = bid_vol;
    book
}
