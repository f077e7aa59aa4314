// Position lifecycle module
pub mod exit_engine;
pub mod position_book;

pub use exit_engine::{
    ExitContext, ExitDecision, ExitEvaluation, ExitReason, ExitRule, PositionExitEngine, EXIT_RULES,
};
pub use position_book::{ClosedTrade, Position, PositionBook, PositionEntry, PositionSide, TrailState};
