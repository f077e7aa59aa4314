// Candle construction: aggregation, trend smoothing, bounded history, trading hours
pub mod aggregator;
pub mod history;
pub mod market_hours;
pub mod session;
pub mod trend_candle;

pub use aggregator::CandleAggregator;
pub use history::{CandleHistory, CandleStore, SessionSnapshot};
pub use market_hours::MarketHours;
pub use session::{ClosedCandle, MarketSession};
pub use trend_candle::{trend_candle, TrendCandleConverter};
