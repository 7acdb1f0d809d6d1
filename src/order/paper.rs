// =============================================================================
// Paper Trading Engine — simulated fills against the cached orderbook
// =============================================================================
//
// Fills are simulated from the latest cached book rather than an idealised
// mid price, so paper results resemble live ones:
//
//   - Buys consume the best ask; sells consume the best bid.
//   - fill_ratio = order quantity / best-level volume.
//   - ratio <= 20%: full instant fill at best price +- 0.1% base slippage.
//   - ratio  > 20%: only 20% of the best-level volume fills, with market
//     impact added on top: (ratio - 20%) * 5% extra slippage.
//
// Slippage moves against the order: up for buys, down for sells. A missing
// or degenerate book (zero price or volume) rejects with a reason.
//
// The engine also keeps a simple in-memory paper account: cash, positions
// at weighted average cost, and realized PnL.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::market::cache::RealtimeCache;
use crate::types::OrderSide;

/// Orders at or below this fraction of the best-level volume fill whole.
pub const MAX_INSTANT_FILL_RATIO: f64 = 0.20;
/// Extra slippage per unit of fill-ratio excess.
pub const MARKET_IMPACT_COEFF: f64 = 0.05;
/// Base slippage in percent.
pub const BASE_SLIPPAGE_PCT: f64 = 0.1;

/// How a simulated order filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FillType {
    FullInstant,
    PartialSimulated,
}

/// A successful simulated fill.
#[derive(Debug, Clone, Serialize)]
pub struct PaperFill {
    pub fill_type: FillType,
    pub fill_price: f64,
    pub fill_quantity: i64,
    pub remaining_quantity: i64,
    pub slippage_pct: f64,
    pub slippage_amount: f64,
    pub market_impact_pct: f64,
    pub requested_price: f64,
}

/// Outcome of a simulated order.
#[derive(Debug, Clone, Serialize)]
pub enum PaperExecution {
    Filled(PaperFill),
    Rejected { reason: String },
}

impl PaperExecution {
    pub fn fill(&self) -> Option<&PaperFill> {
        match self {
            Self::Filled(f) => Some(f),
            Self::Rejected { .. } => None,
        }
    }
}

/// Paper-account position at weighted average cost.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PaperPosition {
    pub quantity: i64,
    pub avg_price: f64,
    pub total_cost: f64,
    pub realized_pnl: f64,
}

struct PaperAccount {
    cash: f64,
    positions: HashMap<String, PaperPosition>,
}

/// Simulated matching engine over the realtime cache.
pub struct PaperTradingEngine {
    cache: Arc<RealtimeCache>,
    account: RwLock<PaperAccount>,
}

impl PaperTradingEngine {
    pub fn new(cache: Arc<RealtimeCache>) -> Self {
        info!(
            max_instant_fill_ratio = MAX_INSTANT_FILL_RATIO,
            market_impact_coeff = MARKET_IMPACT_COEFF,
            base_slippage_pct = BASE_SLIPPAGE_PCT,
            "paper trading engine initialised"
        );
        Self {
            cache,
            account: RwLock::new(PaperAccount {
                cash: 0.0,
                positions: HashMap::new(),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Simulate a fill for `quantity` shares against the cached book.
    pub fn execute_virtual_order(
        &self,
        stock_code: &str,
        side: OrderSide,
        quantity: i64,
        requested_price: f64,
    ) -> PaperExecution {
        let Some(book) = self.cache.get_orderbook(stock_code) else {
            warn!(stock_code, "paper fill impossible: no orderbook cached");
            return PaperExecution::Rejected {
                reason: format!("no orderbook data for {stock_code}"),
            };
        };

        let (best_price, best_volume) = match side {
            OrderSide::Buy => book.best_ask(),
            OrderSide::Sell => book.best_bid(),
        };

        if best_price <= 0.0 || best_volume <= 0 {
            warn!(
                stock_code,
                best_price, best_volume, "paper fill impossible: degenerate book level"
            );
            return PaperExecution::Rejected {
                reason: format!(
                    "degenerate book for {stock_code}: best price {best_price}, volume {best_volume}"
                ),
            };
        }

        let fill_ratio = quantity as f64 / best_volume as f64;
        let direction = match side {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        };

        let (fill_type, fill_quantity, market_impact_pct) = if fill_ratio > MAX_INSTANT_FILL_RATIO {
            let fill_quantity =
                ((best_volume as f64 * MAX_INSTANT_FILL_RATIO) as i64).max(1);
            let impact = (fill_ratio - MAX_INSTANT_FILL_RATIO) * MARKET_IMPACT_COEFF * 100.0;
            (FillType::PartialSimulated, fill_quantity, impact)
        } else {
            (FillType::FullInstant, quantity, 0.0)
        };

        let total_slippage_pct = BASE_SLIPPAGE_PCT + market_impact_pct;
        let fill_price = round2(best_price * (1.0 + direction * total_slippage_pct / 100.0));
        let remaining_quantity = quantity - fill_quantity;
        let slippage_amount = round2((fill_price - best_price).abs() * fill_quantity as f64);

        info!(
            stock_code,
            side = %side,
            fill_type = ?fill_type,
            requested_qty = quantity,
            fill_qty = fill_quantity,
            remaining_qty = remaining_quantity,
            best_price,
            fill_price,
            total_slippage_pct,
            market_impact_pct,
            "paper fill simulated"
        );

        self.apply_fill(stock_code, side, fill_price, fill_quantity);

        PaperExecution::Filled(PaperFill {
            fill_type,
            fill_price,
            fill_quantity,
            remaining_quantity,
            slippage_pct: total_slippage_pct,
            slippage_amount,
            market_impact_pct,
            requested_price,
        })
    }

    // -------------------------------------------------------------------------
    // Paper account
    // -------------------------------------------------------------------------

    fn apply_fill(&self, stock_code: &str, side: OrderSide, fill_price: f64, fill_quantity: i64) {
        let mut account = self.account.write();
        let trade_amount = fill_price * fill_quantity as f64;
        let position = account
            .positions
            .entry(stock_code.to_string())
            .or_default();

        match side {
            OrderSide::Buy => {
                let new_qty = position.quantity + fill_quantity;
                let new_cost = position.total_cost + trade_amount;
                position.quantity = new_qty;
                position.total_cost = new_cost;
                position.avg_price = if new_qty > 0 {
                    new_cost / new_qty as f64
                } else {
                    0.0
                };
                account.cash -= trade_amount;
            }
            OrderSide::Sell => {
                let pnl = (fill_price - position.avg_price) * fill_quantity as f64;
                position.quantity -= fill_quantity;
                position.realized_pnl += pnl;
                if position.quantity > 0 {
                    position.total_cost = position.avg_price * position.quantity as f64;
                } else {
                    position.total_cost = 0.0;
                    position.avg_price = 0.0;
                }
                account.cash += trade_amount;
            }
        }
    }

    pub fn get_paper_position(&self, stock_code: &str) -> Option<PaperPosition> {
        self.account.read().positions.get(stock_code).cloned()
    }

    pub fn paper_cash(&self) -> f64 {
        self.account.read().cash
    }

    /// Seed the paper cash balance (initialisation).
    pub fn set_paper_cash(&self, cash: f64) {
        self.account.write().cash = cash;
        info!(cash, "paper cash set");
    }

    /// Total equity: cash plus positions at the latest cached price,
    /// falling back to average cost when no price is cached.
    pub fn total_equity(&self) -> f64 {
        let account = self.account.read();
        let mut equity = account.cash;

        for (stock_code, position) in &account.positions {
            if position.quantity <= 0 {
                continue;
            }
            let price = self
                .cache
                .get_price(stock_code)
                .map(|p| p.price)
                .unwrap_or(position.avg_price);
            equity += price * position.quantity as f64;
        }
        equity
    }

    /// Wipe the paper account back to `initial_cash`.
    pub fn reset(&self, initial_cash: f64) {
        let mut account = self.account.write();
        account.positions.clear();
        account.cash = initial_cash;
        info!(initial_cash, "paper trading engine reset");
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl std::fmt::Debug for PaperTradingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let account = self.account.read();
        let open = account.positions.values().filter(|p| p.quantity > 0).count();
        f.debug_struct("PaperTradingEngine")
            .field("positions", &open)
            .field("cash", &account.cash)
            .finish()
    }
}
