// Trading strategy module
pub mod signals;
pub mod strikes;
pub mod trend_follow;

pub use signals::{SignalConfig, SignalEngine, SignalSnapshot};
pub use strikes::StrikeSelector;
pub use trend_follow::TrendFollowStrategy;

use crate::execution::{ExitContext, ExitEvaluation};
use crate::models::{EntrySignal, TrendCandle};
use crate::Result;

/// Base trait for all trading strategies
pub trait Strategy: Send + Sync {
    /// Get strategy name
    fn name(&self) -> &str;

    /// Minimum trend candles before an entry can be evaluated
    fn min_candles_required(&self) -> usize;

    /// Entry signal for the newest candle of `history`, if any.
    ///
    /// Returns `InsufficientHistory` while the history is still warming up.
    fn evaluate_entry(&self, history: &[TrendCandle]) -> Result<Option<EntrySignal>>;

    /// Run the exit rules for an open position
    fn evaluate_exit(&self, ctx: &ExitContext<'_>) -> ExitEvaluation;
}
