// =============================================================================
// Shared types used across the KRX auto-trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Whether orders are routed to the real broker or the paper-trading engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeMode {
    Live,
    Paper,
}

impl Default for TradeMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for TradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "LIVE"),
            Self::Paper => write!(f, "PAPER"),
        }
    }
}

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Liquidity/quality bucket for a listed stock.
///
/// Grades carry hard single-name exposure caps: A=30 %, B=20 %, C=10 %,
/// D=0 % (trading prohibited).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StockGrade {
    A,
    B,
    C,
    D,
}

impl StockGrade {
    /// Hard per-stock exposure cap as a percentage of total capital.
    pub fn hard_cap_pct(self) -> f64 {
        match self {
            Self::A => 30.0,
            Self::B => 20.0,
            Self::C => 10.0,
            Self::D => 0.0,
        }
    }

    /// Maximum single-position fraction of capital used by the sizer.
    pub fn position_limit(self) -> f64 {
        match self {
            Self::A => 0.30,
            Self::B => 0.20,
            Self::C => 0.10,
            Self::D => 0.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
        }
    }
}

impl std::fmt::Display for StockGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StockGrade {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(Self::A),
            "B" => Ok(Self::B),
            "C" => Ok(Self::C),
            "D" => Ok(Self::D),
            other => Err(format!("unknown stock grade: {other}")),
        }
    }
}

/// Market regime classification driving risk allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketRegime {
    StrongBull,
    Bull,
    Sideways,
    Bear,
    StrongBear,
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StrongBull => write!(f, "STRONG_BULL"),
            Self::Bull => write!(f, "BULL"),
            Self::Sideways => write!(f, "SIDEWAYS"),
            Self::Bear => write!(f, "BEAR"),
            Self::StrongBear => write!(f, "STRONG_BEAR"),
        }
    }
}

/// Trade signal emitted by an external strategy.
///
/// Strategies read market snapshots from the data hub and hand one of these
/// to the order manager; they never touch broker clients directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub stock_code: String,
    pub side: OrderSide,
    pub strategy_code: String,
    /// Planned entry price per share in KRW.
    pub entry_price: i64,
    /// Stop-loss price per share in KRW.
    pub stop_loss: i64,
    pub grade: StockGrade,
    /// Signal conviction on a 1-5 scale; <= 2 is never traded.
    pub confidence: u8,
    /// Explicit quantity. Sells must set this; buys leave it `None` and let
    /// the sizer decide.
    #[serde(default)]
    pub quantity: Option<i64>,
    /// Advisory position size as % of capital (recomputed by the sizer).
    #[serde(default)]
    pub position_pct: f64,
    pub sector: String,
    /// Indicator values observed at signal time, for journaling.
    #[serde(default)]
    pub indicators_snapshot: serde_json::Value,
}

/// A currently-held position, tracked by the order manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub stock_code: String,
    pub quantity: i64,
    pub avg_entry_price: f64,
    pub total_cost: f64,
    pub strategy_code: String,
    pub stop_loss_price: i64,
    pub grade: StockGrade,
    pub sector: String,
    /// % of total capital this position represents (set at entry).
    pub position_pct: f64,
    pub mode: TradeMode,
    /// Epoch seconds of first fill.
    pub entry_time: f64,
    pub updated_at: f64,
}
