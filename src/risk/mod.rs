// Risk management module
pub mod session;
pub mod sizing;

pub use session::{EntryBlock, RiskLimits, SessionState};
pub use sizing::PositionSizer;
