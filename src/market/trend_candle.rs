use crate::models::{Candle, TrendCandle};
use std::collections::HashMap;

/// Derive the next trend candle from the previous one (if any) and a raw candle.
///
/// Pure: the same previous candle and raw candle always give the same result.
pub fn trend_candle(prev: Option<&TrendCandle>, candle: &Candle) -> TrendCandle {
    let close = (candle.open + candle.high + candle.low + candle.close) / 4.0;
    let open = match prev {
        Some(p) => (p.open + p.close) / 2.0,
        None => (candle.open + candle.close) / 2.0,
    };

    TrendCandle {
        symbol: candle.symbol.clone(),
        open,
        high: candle.high.max(open).max(close),
        low: candle.low.min(open).min(close),
        close,
        timestamp: candle.start_time,
    }
}

/// Per-symbol trend candle recurrence. The only state is the last trend candle per symbol.
#[derive(Debug, Default)]
pub struct TrendCandleConverter {
    previous: HashMap<String, TrendCandle>,
}

impl TrendCandleConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn convert(&mut self, candle: &Candle) -> TrendCandle {
        let trend = self.peek(candle);
        self.seed(trend.clone());
        trend
    }

    /// Compute the next trend candle without advancing the recurrence
    pub fn peek(&self, candle: &Candle) -> TrendCandle {
        trend_candle(self.previous.get(&candle.symbol), candle)
    }

    /// Continue the recurrence from a known trend candle
    pub fn seed(&mut self, trend: TrendCandle) {
        self.previous.insert(trend.symbol.clone(), trend);
    }

    pub fn previous(&self, symbol: &str) -> Option<&TrendCandle> {
        self.previous.get(symbol)
    }

    pub fn reset(&mut self) {
        self.previous.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 4, 0, 0).unwrap()
    }

    fn raw(open: f64, high: f64, low: f64, close: f64, minute: i64) -> Candle {
        let start_time = start() + Duration::minutes(minute);
        Candle {
            symbol: "NIFTY_50".to_string(),
            open,
            high,
            low,
            close,
            volume: 0.0,
            start_time,
            end_time: start_time + Duration::minutes(1),
            tick_count: 1,
        }
    }

    #[test]
    fn test_first_candle_bootstrap() {
        let trend = trend_candle(None, &raw(100.0, 105.0, 99.0, 101.0, 0));
        assert_eq!(trend.open, 100.5);
        assert_eq!(trend.close, 101.25);
        assert_eq!(trend.high, 105.0);
        assert_eq!(trend.low, 99.0);
        assert_eq!(trend.timestamp, start());
    }

    #[test]
    fn test_subsequent_candle_uses_previous_trend() {
        let mut converter = TrendCandleConverter::new();
        let first = converter.convert(&raw(100.0, 105.0, 99.0, 101.0, 0));
        let second = converter.convert(&raw(101.0, 102.0, 100.0, 101.0, 1));

        assert_eq!(second.open, (first.open + first.close) / 2.0);
        assert_eq!(second.close, 101.0);
        // open 100.875 and close 101 lie inside the raw range
        assert_eq!(second.high, 102.0);
        assert_eq!(second.low, 100.0);
    }

    #[test]
    fn test_high_low_extend_to_open() {
        let prev = TrendCandle {
            symbol: "NIFTY_50".to_string(),
            open: 120.0,
            high: 125.0,
            low: 118.0,
            close: 124.0,
            timestamp: start(),
        };
        let trend = trend_candle(Some(&prev), &raw(100.0, 102.0, 99.0, 101.0, 1));
        assert_eq!(trend.open, 122.0);
        assert_eq!(trend.high, 122.0);
        assert_eq!(trend.low, 99.0);
    }

    #[test]
    fn test_deterministic_across_runs() {
        let raws: Vec<Candle> = (0..50)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.37).sin() * 5.0;
                raw(base, base + 1.3, base - 0.9, base + 0.4, i)
            })
            .collect();

        let run = || {
            let mut converter = TrendCandleConverter::new();
            raws.iter().map(|c| converter.convert(c)).collect::<Vec<_>>()
        };

        let a = run();
        let b = run();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.open.to_bits(), y.open.to_bits());
            assert_eq!(x.close.to_bits(), y.close.to_bits());
            assert_eq!(x.high.to_bits(), y.high.to_bits());
            assert_eq!(x.low.to_bits(), y.low.to_bits());
        }
    }

    #[test]
    fn test_peek_does_not_advance() {
        let mut converter = TrendCandleConverter::new();
        converter.convert(&raw(100.0, 105.0, 99.0, 101.0, 0));
        let candle = raw(101.0, 102.0, 100.0, 101.0, 1);

        let peeked = converter.peek(&candle);
        let converted = converter.convert(&candle);
        assert_eq!(peeked, converted);
    }
}
