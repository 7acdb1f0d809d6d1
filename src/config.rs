// =============================================================================
// Settings — environment-derived configuration
// =============================================================================
//
// All credentials and tunables come from environment variables (a local .env
// file is loaded by main before this runs). No interactive input is required;
// the engine is meant to run headless under a supervisor.
// =============================================================================

use serde::Serialize;

use crate::types::TradeMode;

/// Broker REST hosts. LIVE and PAPER accounts live on different ports.
pub const BASE_URL_LIVE: &str = "https://openapi.koreainvestment.com:9443";
pub const BASE_URL_PAPER: &str = "https://openapivts.koreainvestment.com:29443";

/// Realtime websocket endpoint (plain WS per broker docs).
pub const WS_URL: &str = "ws://ops.koreainvestment.com:21000";

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Application-wide configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    // --- Broker credentials --------------------------------------------------
    #[serde(skip_serializing)]
    pub app_key: String,
    #[serde(skip_serializing)]
    pub app_secret: String,
    /// First 8 digits of the account number.
    pub account_no: String,
    /// 2-digit account product code.
    pub account_product_code: String,

    // --- Mode ----------------------------------------------------------------
    pub trade_mode: TradeMode,

    // --- Persistence ---------------------------------------------------------
    pub db_url: String,
    pub redis_url: String,

    // --- Risk ----------------------------------------------------------------
    /// Total account capital in KRW.
    pub total_capital: i64,
    /// Daily loss limit as a fraction (0.03 = 3 %).
    pub daily_loss_limit: f64,
    /// Monthly loss limit as a fraction.
    pub monthly_loss_limit: f64,
    pub max_positions: u32,

    // --- Notification --------------------------------------------------------
    #[serde(skip_serializing)]
    pub slack_webhook_url: String,
    #[serde(skip_serializing)]
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,
}

impl Settings {
    /// Build settings from the process environment.
    pub fn from_env() -> Self {
        let trade_mode = match env_or("TRADE_MODE", "PAPER").to_uppercase().as_str() {
            "LIVE" => TradeMode::Live,
            _ => TradeMode::Paper,
        };

        Self {
            app_key: env_or("KIS_APP_KEY", ""),
            app_secret: env_or("KIS_APP_SECRET", ""),
            account_no: env_or("KIS_ACCOUNT_NO", ""),
            account_product_code: env_or("KIS_ACCOUNT_PROD_CODE", "01"),
            trade_mode,
            db_url: env_or("DB_URL", "sqlite://krx-engine.db"),
            redis_url: env_or("REDIS_URL", "redis://localhost:6379"),
            total_capital: env_parse("TOTAL_CAPITAL", 100_000_000),
            daily_loss_limit: env_parse("DAILY_LOSS_LIMIT", 0.03),
            monthly_loss_limit: env_parse("MONTHLY_LOSS_LIMIT", 0.06),
            max_positions: env_parse("MAX_POSITIONS", 5),
            slack_webhook_url: env_or("SLACK_WEBHOOK_URL", ""),
            telegram_bot_token: env_or("TELEGRAM_BOT_TOKEN", ""),
            telegram_chat_id: env_or("TELEGRAM_CHAT_ID", ""),
        }
    }

    /// REST base URL for the configured trade mode.
    pub fn base_url(&self) -> &'static str {
        match self.trade_mode {
            TradeMode::Live => BASE_URL_LIVE,
            TradeMode::Paper => BASE_URL_PAPER,
        }
    }
}
