pub mod manager;
pub mod paper;
pub mod pyramid;
pub mod state_machine;
pub mod tracker;

pub use manager::OrderManager;
pub use paper::PaperTradingEngine;
pub use pyramid::PyramidManager;
pub use state_machine::{Order, OrderState, OrderStateMachine};
pub use tracker::OrderTracker;
