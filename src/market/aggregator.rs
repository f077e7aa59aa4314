use crate::error::{BotError, Result};
use crate::models::{Candle, Tick};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Buckets ticks into fixed-interval OHLCV candles per symbol.
///
/// Buckets are aligned to the epoch grid (`floor(timestamp / interval)`), so
/// every emitted candle covers exactly one interval. Intervals without ticks
/// produce no candle.
pub struct CandleAggregator {
    interval: Duration,
    in_progress: HashMap<String, Candle>,
}

impl CandleAggregator {
    pub fn new(interval_secs: u64) -> Self {
        Self {
            interval: Duration::seconds(interval_secs.max(1) as i64),
            in_progress: HashMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start of the bucket containing `ts`
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.interval.num_seconds();
        let start = ts.timestamp().div_euclid(secs) * secs;
        DateTime::from_timestamp(start, 0).unwrap_or(ts)
    }

    /// Feed one tick. Returns the finalized candle when the tick opens a new bucket.
    ///
    /// Ticks older than the in-progress bucket are folded into it rather than dropped.
    pub fn process_tick(&mut self, tick: &Tick) -> Result<Option<Candle>> {
        if !tick.last_price.is_finite() || tick.last_price <= 0.0 {
            return Err(BotError::DataIntegrity(format!(
                "non-positive price {} for {}",
                tick.last_price, tick.symbol
            )));
        }
        let volume = if tick.volume.is_finite() && tick.volume > 0.0 {
            tick.volume
        } else {
            0.0
        };

        let current = match self.in_progress.get_mut(&tick.symbol) {
            Some(current) => current,
            None => {
                let candle = self.open_candle(tick, volume);
                self.in_progress.insert(tick.symbol.clone(), candle);
                return Ok(None);
            }
        };

        if tick.timestamp >= current.end_time {
            let next = self.open_candle(tick, volume);
            let finished = self.in_progress.insert(tick.symbol.clone(), next);
            return Ok(finished);
        }

        current.high = current.high.max(tick.last_price);
        current.low = current.low.min(tick.last_price);
        current.close = tick.last_price;
        current.volume += volume;
        current.tick_count += 1;

        Ok(None)
    }

    fn open_candle(&self, tick: &Tick, volume: f64) -> Candle {
        let start_time = self.bucket_start(tick.timestamp);
        Candle {
            symbol: tick.symbol.clone(),
            open: tick.last_price,
            high: tick.last_price,
            low: tick.last_price,
            close: tick.last_price,
            volume,
            start_time,
            end_time: start_time + self.interval,
            tick_count: 1,
        }
    }

    pub fn in_progress(&self, symbol: &str) -> Option<&Candle> {
        self.in_progress.get(symbol)
    }

    /// Drop every in-progress candle (used when a session is restored after a gap)
    pub fn discard_all(&mut self) -> usize {
        let n = self.in_progress.len();
        self.in_progress.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        // 2026-10-19 09:30:00 IST
        Utc.with_ymd_and_hms(2026, 10, 19, 4, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn tick(symbol: &str, price: f64, secs: i64) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            last_price: price,
            volume: 10.0,
            timestamp: at(secs),
        }
    }

    #[test]
    fn test_five_ticks_one_interval() {
        let mut agg = CandleAggregator::new(60);
        for (i, price) in [100.0, 102.0, 99.0, 105.0, 101.0].iter().enumerate() {
            assert!(agg.process_tick(&tick("NIFTY", *price, i as i64 * 10)).unwrap().is_none());
        }

        let candle = agg.process_tick(&tick("NIFTY", 103.0, 60)).unwrap().unwrap();
        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.high, 105.0);
        assert_eq!(candle.low, 99.0);
        assert_eq!(candle.close, 101.0);
        assert_eq!(candle.tick_count, 5);
        assert_eq!(candle.volume, 50.0);
        assert_eq!(candle.start_time, at(0));
        assert_eq!(candle.end_time, at(60));
    }

    #[test]
    fn test_new_candle_starts_with_boundary_tick() {
        let mut agg = CandleAggregator::new(60);
        agg.process_tick(&tick("NIFTY", 100.0, 5)).unwrap();
        agg.process_tick(&tick("NIFTY", 110.0, 60)).unwrap();

        let current = agg.in_progress("NIFTY").unwrap();
        assert_eq!(current.open, 110.0);
        assert_eq!(current.start_time, at(60));
        assert_eq!(current.tick_count, 1);
    }

    #[test]
    fn test_bucket_is_grid_aligned() {
        let mut agg = CandleAggregator::new(60);
        agg.process_tick(&tick("NIFTY", 100.0, 37)).unwrap();
        let current = agg.in_progress("NIFTY").unwrap();
        assert_eq!(current.start_time, at(0));
        assert_eq!(current.end_time, at(60));
    }

    #[test]
    fn test_late_tick_folds_into_current_candle() {
        let mut agg = CandleAggregator::new(60);
        agg.process_tick(&tick("NIFTY", 100.0, 65)).unwrap();
        assert!(agg.process_tick(&tick("NIFTY", 90.0, 30)).unwrap().is_none());

        let current = agg.in_progress("NIFTY").unwrap();
        assert_eq!(current.low, 90.0);
        assert_eq!(current.close, 90.0);
        assert_eq!(current.start_time, at(60));
    }

    #[test]
    fn test_rejects_non_positive_price() {
        let mut agg = CandleAggregator::new(60);
        let err = agg.process_tick(&tick("NIFTY", 0.0, 1)).unwrap_err();
        assert!(matches!(err, BotError::DataIntegrity(_)));
        assert!(agg.process_tick(&tick("NIFTY", -5.0, 1)).is_err());
        assert!(agg.in_progress("NIFTY").is_none());
    }

    #[test]
    fn test_symbols_are_independent() {
        let mut agg = CandleAggregator::new(60);
        agg.process_tick(&tick("NIFTY", 100.0, 0)).unwrap();
        agg.process_tick(&tick("BANKNIFTY", 500.0, 10)).unwrap();

        let closed = agg.process_tick(&tick("NIFTY", 101.0, 61)).unwrap().unwrap();
        assert_eq!(closed.symbol, "NIFTY");
        assert_eq!(agg.in_progress("BANKNIFTY").unwrap().open, 500.0);
    }

    #[test]
    fn test_windows_contiguous_for_continuous_stream() {
        let mut agg = CandleAggregator::new(60);
        let mut closed = Vec::new();
        for s in (0..600).step_by(7) {
            if let Some(c) = agg.process_tick(&tick("NIFTY", 100.0 + s as f64, s)).unwrap() {
                closed.push(c);
            }
        }

        assert!(closed.len() >= 9);
        for c in &closed {
            assert_eq!(c.end_time - c.start_time, Duration::seconds(60));
        }
        for pair in closed.windows(2) {
            assert_eq!(pair[0].end_time, pair[1].start_time);
        }
    }

    #[test]
    fn test_discard_all() {
        let mut agg = CandleAggregator::new(60);
        agg.process_tick(&tick("NIFTY", 100.0, 0)).unwrap();
        assert_eq!(agg.discard_all(), 1);
        assert!(agg.in_progress("NIFTY").is_none());
    }
}
