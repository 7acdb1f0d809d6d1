// =============================================================================
// Persistence contracts — repository and tick-archive seams
// =============================================================================
//
// The engine core does not own a database schema. It writes through these
// traits; the concrete backing store (SQL, Redis) lives outside the core and
// is injected at wire-up. The in-memory implementation backs tests and
// paper-only runs.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

/// Outbound persistence surface used by the engine.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Key-value system configuration.
    async fn get_config(&self, key: &str) -> Option<String>;
    async fn set_config(&self, key: &str, value: &str);

    /// Trade and journal rows.
    async fn insert_trade(&self, trade: Value);
    async fn insert_journal(&self, entry: Value);

    /// Daily performance stat upsert, keyed by date (YYYYMMDD).
    async fn upsert_daily_stat(&self, date: &str, stat: Value);

    /// Paper-account snapshot upsert.
    async fn upsert_paper_account(&self, snapshot: Value);

    /// Drawdown protocol event log.
    async fn insert_drawdown_log(&self, entry: Value);
}

/// Append-only sink for raw ticks, drained to bulk storage after market
/// close. Implementations buffer internally; this call must not block the
/// feed path.
pub trait TickArchive: Send + Sync {
    fn append_tick(&self, stock_code: &str, date: &str, payload: Value);
}

// -----------------------------------------------------------------------------
// In-memory implementation
// -----------------------------------------------------------------------------

/// Volatile store for tests and paper-only sessions.
#[derive(Default)]
pub struct MemoryStore {
    config: Mutex<HashMap<String, String>>,
    trades: Mutex<Vec<Value>>,
    journal: Mutex<Vec<Value>>,
    daily_stats: Mutex<HashMap<String, Value>>,
    paper_account: Mutex<Option<Value>>,
    drawdown_log: Mutex<Vec<Value>>,
    ticks: Mutex<Vec<(String, String, Value)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trade_count(&self) -> usize {
        self.trades.lock().len()
    }

    pub fn tick_count(&self) -> usize {
        self.ticks.lock().len()
    }

    pub fn drawdown_log_count(&self) -> usize {
        self.drawdown_log.lock().len()
    }
}

#[async_trait]
impl Repository for MemoryStore {
    async fn get_config(&self, key: &str) -> Option<String> {
        self.config.lock().get(key).cloned()
    }

    async fn set_config(&self, key: &str, value: &str) {
        self.config.lock().insert(key.to_string(), value.to_string());
    }

    async fn insert_trade(&self, trade: Value) {
        self.trades.lock().push(trade);
    }

    async fn insert_journal(&self, entry: Value) {
        self.journal.lock().push(entry);
    }

    async fn upsert_daily_stat(&self, date: &str, stat: Value) {
        self.daily_stats.lock().insert(date.to_string(), stat);
    }

    async fn upsert_paper_account(&self, snapshot: Value) {
        *self.paper_account.lock() = Some(snapshot);
    }

    async fn insert_drawdown_log(&self, entry: Value) {
        self.drawdown_log.lock().push(entry);
    }
}

impl TickArchive for MemoryStore {
    fn append_tick(&self, stock_code: &str, date: &str, payload: Value) {
        self.ticks
            .lock()
            .push((stock_code.to_string(), date.to_string(), payload));
        debug!(stock_code, date, "tick buffered");
    }
}
