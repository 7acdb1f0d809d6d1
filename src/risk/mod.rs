pub mod drawdown;
pub mod global_lock;
pub mod grade_allocator;
pub mod kill_switch;
pub mod manager;
pub mod margin_guard;
pub mod position_sizer;

pub use drawdown::{DrawdownLevel, DrawdownProtocol};
pub use global_lock::GlobalPositionLock;
pub use grade_allocator::GradeAllocator;
pub use kill_switch::DailyKillSwitch;
pub use manager::{RiskManager, RiskRejection, RiskVerdict};
pub use margin_guard::MarginGuard;
pub use position_sizer::{PositionSize, PositionSizer};
