// =============================================================================
// Market Data Hub — central aggregation point for all market data
// =============================================================================
//
// Wires websocket callbacks into the realtime cache and VI monitor, loads
// historical daily candles over REST at session prep, and answers
// `get_market_data()` with one aggregated snapshot per stock.
//
// Strategy code reads exclusively from this hub. No strategy ever calls the
// REST client for a quote, and none holds references into the hub's mutable
// internals.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{FixedOffset, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::rest::KisRestClient;
use crate::api::ws::{FieldMap, KisWsClient, TR_EXECUTION, TR_ORDERBOOK, TR_VI};
use crate::market::cache::{OrderbookSnapshot, RealtimeCache, DEFAULT_FRESH_AGE};
use crate::market::indicators::{self, IndicatorSet};
use crate::market::vi_monitor::{ViMonitor, ViState};
use crate::persistence::TickArchive;

/// Keep at most this many daily candles per stock.
const MAX_DAILY_CANDLES: usize = 250;

/// One daily OHLCV bar. `date` is the exchange business date (YYYYMMDD).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyCandle {
    pub date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// One completed minute bar fed by intraday aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinuteCandle {
    /// HHMMSS of bar close.
    pub time: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// Aggregated per-stock view handed to strategies.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub stock_code: String,

    pub current_price: f64,
    pub current_volume: i64,
    pub change_pct: f64,

    pub orderbook: Option<OrderbookSnapshot>,
    pub indicators: IndicatorSet,

    pub prev_day: Option<DailyCandle>,
    pub today_open: f64,

    pub minute_candles: Vec<MinuteCandle>,
    /// Chronological, oldest first.
    pub daily_candles: Vec<DailyCandle>,

    pub vi_state: ViState,
    pub vi_tradeable: bool,

    /// Updated within the last 3 seconds.
    pub data_fresh: bool,
    pub price_timestamp: Option<Instant>,
}

/// Central market data orchestrator.
pub struct MarketDataHub {
    cache: Arc<RealtimeCache>,
    vi_monitor: Arc<ViMonitor>,
    rest_client: Option<Arc<KisRestClient>>,
    tick_archive: Option<Arc<dyn TickArchive>>,

    historical: RwLock<HashMap<String, Vec<DailyCandle>>>,
    indicators: RwLock<HashMap<String, IndicatorSet>>,
    prev_day: RwLock<HashMap<String, DailyCandle>>,
    today_open: RwLock<HashMap<String, f64>>,
    minute_candles: RwLock<HashMap<String, Vec<MinuteCandle>>>,
}

impl MarketDataHub {
    pub fn new(
        cache: Arc<RealtimeCache>,
        vi_monitor: Arc<ViMonitor>,
        rest_client: Option<Arc<KisRestClient>>,
        tick_archive: Option<Arc<dyn TickArchive>>,
    ) -> Self {
        Self {
            cache,
            vi_monitor,
            rest_client,
            tick_archive,
            historical: RwLock::new(HashMap::new()),
            indicators: RwLock::new(HashMap::new()),
            prev_day: RwLock::new(HashMap::new()),
            today_open: RwLock::new(HashMap::new()),
            minute_candles: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Websocket wiring
    // -------------------------------------------------------------------------

    /// Register the hub's handlers for the trade, orderbook, and VI streams.
    pub fn register_websocket_callbacks(self: &Arc<Self>, ws: &KisWsClient) {
        let hub = Arc::clone(self);
        ws.register_callback(
            TR_EXECUTION,
            Arc::new(move |fields: FieldMap| hub.on_execution(&fields)),
        );

        let hub = Arc::clone(self);
        ws.register_callback(
            TR_ORDERBOOK,
            Arc::new(move |fields: FieldMap| hub.on_orderbook(&fields)),
        );

        let vi = Arc::clone(&self.vi_monitor);
        ws.register_callback(
            TR_VI,
            Arc::new(move |fields: FieldMap| {
                let code = fields.get("stock_code").cloned().unwrap_or_default();
                if !code.is_empty() {
                    vi.on_vi_data(&code, &fields);
                }
            }),
        );

        info!(
            registered = ?[TR_EXECUTION, TR_ORDERBOOK, TR_VI],
            "websocket callbacks registered"
        );
    }

    fn on_execution(&self, fields: &FieldMap) {
        let Some(code) = fields.get("stock_code").filter(|c| !c.is_empty()) else {
            return;
        };

        let price = field_f64(fields, "stck_prpr");
        let volume = field_i64(fields, "cntg_vol");
        let change_pct = field_f64(fields, "prdy_ctrt");
        self.cache.update_price(code, price, volume, change_pct);

        // Defer tick persistence to the archive sink; it batches internally.
        if let Some(ref archive) = self.tick_archive {
            let kst = FixedOffset::east_opt(9 * 3600).unwrap();
            let date = Utc::now().with_timezone(&kst).format("%Y%m%d").to_string();
            let payload = serde_json::to_value(fields).unwrap_or_default();
            archive.append_tick(code, &date, payload);
        }
    }

    fn on_orderbook(&self, fields: &FieldMap) {
        let Some(code) = fields.get("stock_code").filter(|c| !c.is_empty()) else {
            return;
        };
        self.cache.update_orderbook(code, book_from_fields(fields));
    }

    // -------------------------------------------------------------------------
    // Historical loading
    // -------------------------------------------------------------------------

    /// Fetch daily candles over REST, reverse them to chronological order,
    /// pre-compute indicators, and seed VI bounds from the previous close.
    ///
    /// Meant to run once per stock during session prep (08:30 KST).
    pub async fn load_historical_data(&self, stock_code: &str) {
        let Some(ref rest) = self.rest_client else {
            warn!(stock_code, "historical load skipped; no REST client configured");
            return;
        };

        let resp = match rest.get_daily_price(stock_code, "D").await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(stock_code, error = %e, "historical data load failed");
                return;
            }
        };

        let rows = resp["output2"]
            .as_array()
            .or_else(|| resp["output"].as_array())
            .cloned()
            .unwrap_or_default();

        if rows.is_empty() {
            warn!(stock_code, "historical load returned no candles");
            return;
        }

        // Broker returns newest-first; reverse to chronological and bound
        // the window.
        let mut daily: Vec<DailyCandle> = rows
            .iter()
            .rev()
            .map(|row| DailyCandle {
                date: row["stck_bsop_date"].as_str().unwrap_or("").to_string(),
                open: json_f64(&row["stck_oprc"]),
                high: json_f64(&row["stck_hgpr"]),
                low: json_f64(&row["stck_lwpr"]),
                close: json_f64(&row["stck_clpr"]),
                volume: json_f64(&row["acml_vol"]) as i64,
            })
            .collect();
        if daily.len() > MAX_DAILY_CANDLES {
            daily.drain(..daily.len() - MAX_DAILY_CANDLES);
        }

        let set = indicators::calculate_all(&daily);
        let last = daily.last().cloned();

        self.historical
            .write()
            .insert(stock_code.to_string(), daily);
        self.indicators.write().insert(stock_code.to_string(), set);

        if let Some(last) = last {
            self.vi_monitor.initialize_vi_prices(stock_code, last.close);
            self.prev_day.write().insert(stock_code.to_string(), last);
        }

        info!(
            stock_code,
            candle_count = self.historical.read()[stock_code].len(),
            "historical data loaded"
        );
    }

    /// Load several stocks sequentially (the rate limiter paces the calls).
    pub async fn load_historical_batch(&self, stock_codes: &[String]) {
        for code in stock_codes {
            self.load_historical_data(code).await;
        }
    }

    // -------------------------------------------------------------------------
    // Intraday accumulation
    // -------------------------------------------------------------------------

    /// Append a completed minute candle for a stock.
    pub fn append_minute_candle(&self, stock_code: &str, candle: MinuteCandle) {
        self.minute_candles
            .write()
            .entry(stock_code.to_string())
            .or_default()
            .push(candle);
    }

    /// Record today's opening price (set once at 09:00:00 KST).
    pub fn set_today_open(&self, stock_code: &str, open_price: f64) {
        self.today_open
            .write()
            .insert(stock_code.to_string(), open_price);
    }

    // -------------------------------------------------------------------------
    // Query interface
    // -------------------------------------------------------------------------

    /// Build the aggregated snapshot for a stock. No REST calls; everything
    /// comes from the in-memory cache and pre-loaded history.
    pub fn get_market_data(&self, stock_code: &str) -> MarketSnapshot {
        let price = self.cache.get_price(stock_code);
        let orderbook = self.cache.get_orderbook(stock_code);

        MarketSnapshot {
            stock_code: stock_code.to_string(),
            current_price: price.map(|p| p.price).unwrap_or(0.0),
            current_volume: price.map(|p| p.volume).unwrap_or(0),
            change_pct: price.map(|p| p.change_pct).unwrap_or(0.0),
            orderbook,
            indicators: self
                .indicators
                .read()
                .get(stock_code)
                .cloned()
                .unwrap_or_default(),
            prev_day: self.prev_day.read().get(stock_code).cloned(),
            today_open: self
                .today_open
                .read()
                .get(stock_code)
                .copied()
                .unwrap_or(0.0),
            minute_candles: self
                .minute_candles
                .read()
                .get(stock_code)
                .cloned()
                .unwrap_or_default(),
            daily_candles: self
                .historical
                .read()
                .get(stock_code)
                .cloned()
                .unwrap_or_default(),
            vi_state: self.vi_monitor.get_state(stock_code),
            vi_tradeable: self.vi_monitor.is_tradeable(stock_code),
            data_fresh: self.cache.is_data_fresh(stock_code, DEFAULT_FRESH_AGE),
            price_timestamp: price.map(|p| p.timestamp),
        }
    }

    /// Pre-computed indicators for a stock, if loaded.
    pub fn indicators(&self, stock_code: &str) -> Option<IndicatorSet> {
        self.indicators.read().get(stock_code).cloned()
    }

    /// True when both historical data and fresh realtime data exist.
    pub fn is_ready(&self, stock_code: &str) -> bool {
        self.historical.read().contains_key(stock_code)
            && self.cache.is_data_fresh(stock_code, DEFAULT_FRESH_AGE)
    }

    /// Re-compute indicators from the stored daily history.
    pub fn refresh_indicators(&self, stock_code: &str) {
        let set = {
            let historical = self.historical.read();
            historical.get(stock_code).map(|daily| indicators::calculate_all(daily))
        };
        if let Some(set) = set {
            self.indicators.write().insert(stock_code.to_string(), set);
        }
    }

    /// Clear intraday session data (end-of-day). Daily history and
    /// indicators survive.
    pub fn clear_session_data(&self) {
        self.minute_candles.write().clear();
        self.today_open.write().clear();
        self.cache.clear();
        info!("session data cleared");
    }

    /// Graceful teardown of owned sub-components.
    pub fn shutdown(&self) {
        self.vi_monitor.shutdown();
        self.cache.clear();
        info!("market data hub shut down");
    }
}

// -----------------------------------------------------------------------------
// Field helpers
// -----------------------------------------------------------------------------

fn field_f64(fields: &FieldMap, key: &str) -> f64 {
    fields.get(key).and_then(|s| s.parse().ok()).unwrap_or(0.0)
}

fn field_i64(fields: &FieldMap, key: &str) -> i64 {
    fields.get(key).and_then(|s| s.parse().ok()).unwrap_or(0)
}

fn json_f64(value: &serde_json::Value) -> f64 {
    match value {
        serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Build a 10-level book from a parsed H0STASP0 field map.
fn book_from_fields(fields: &FieldMap) -> OrderbookSnapshot {
    let mut book = OrderbookSnapshot {
        ask_prices: [0.0; 10],
        ask_volumes: [0; 10],
        bid_prices: [0.0; 10],
        bid_volumes: [0; 10],
        total_ask_volume: field_i64(fields, "total_askp_rsqn"),
        total_bid_volume: field_i64(fields, "total_bidp_rsqn"),
        timestamp: Instant::now(),
    };
    for i in 0..10 {
        book.ask_prices[i] = field_f64(fields, &format!("askp{}", i + 1));
        book.ask_volumes[i] = field_i64(fields, &format!("askp_rsqn{}", i + 1));
        book.bid_prices[i] = field_f64(fields, &format!("bidp{}", i + 1));
        book.bid_volumes[i] = field_i64(fields, &format!("bidp_rsqn{}", i + 1));
    }
    book
}

impl std::fmt::Debug for MarketDataHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataHub")
            .field("historical_stocks", &self.historical.read().len())
            .field("has_rest_client", &self.rest_client.is_some())
            .field("has_tick_archive", &self.tick_archive.is_some())
            .finish()
    }
}
