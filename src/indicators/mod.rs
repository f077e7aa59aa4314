// Technical indicators over trend-candle history

pub mod adx;
pub mod moving_average;

pub use adx::{calculate_adx, wilder_smooth, AdxReading};
pub use moving_average::{calculate_ema, calculate_sma, trend_line};
