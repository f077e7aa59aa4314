use super::aggregator::CandleAggregator;
use super::history::{CandleStore, SessionSnapshot};
use super::trend_candle::TrendCandleConverter;
use crate::error::Result;
use crate::models::{Candle, Tick, TrendCandle};

/// Candle closed by a tick, with the trend candle appended to history
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedCandle {
    pub candle: Candle,
    pub trend: TrendCandle,
}

/// Tick → candle → trend candle → history. Sole writer of the candle store.
pub struct MarketSession {
    aggregator: CandleAggregator,
    converter: TrendCandleConverter,
    store: CandleStore,
}

impl MarketSession {
    pub fn new(interval_secs: u64, store: CandleStore) -> Self {
        Self {
            aggregator: CandleAggregator::new(interval_secs),
            converter: TrendCandleConverter::new(),
            store,
        }
    }

    pub fn store(&self) -> &CandleStore {
        &self.store
    }

    pub fn aggregator(&self) -> &CandleAggregator {
        &self.aggregator
    }

    /// Aggregate a tick. On candle close the trend candle is derived and
    /// appended to history before this returns.
    pub fn on_tick(&mut self, tick: &Tick) -> Result<Option<ClosedCandle>> {
        let Some(candle) = self.aggregator.process_tick(tick)? else {
            return Ok(None);
        };

        let trend = self.converter.peek(&candle);
        self.store.push(trend.clone())?;
        self.converter.seed(trend.clone());

        tracing::debug!(
            symbol = %candle.symbol,
            open = candle.open,
            high = candle.high,
            low = candle.low,
            close = candle.close,
            ticks = candle.tick_count,
            trend_close = trend.close,
            "candle closed"
        );

        Ok(Some(ClosedCandle { candle, trend }))
    }

    /// Rebuild histories from a snapshot and continue the trend recurrence from it.
    ///
    /// Symbols that already hold candles newer than the snapshot keep their
    /// history and their recurrence state.
    ///
    /// In-progress candles from the previous connection are dropped: they
    /// straddle the outage and would mix two sessions.
    pub fn restore(&mut self, snapshot: &SessionSnapshot) -> Result<usize> {
        let restored = self.store.restore(snapshot)?;
        let dropped = self.aggregator.discard_all();

        // Re-seed only where the snapshot became the newest history
        for (symbol, candles) in &snapshot.histories {
            if let Some(last) = candles.last() {
                if self.store.last(symbol)?.as_ref() == Some(last) {
                    self.converter.seed(last.clone());
                }
            }
        }

        tracing::info!(
            restored,
            symbols = snapshot.histories.len(),
            dropped_partial = dropped,
            "candle history restored"
        );
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 4, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn tick(price: f64, secs: i64) -> Tick {
        Tick {
            symbol: "NIFTY_50".to_string(),
            last_price: price,
            volume: 1.0,
            timestamp: at(secs),
        }
    }

    #[test]
    fn test_closed_candle_lands_in_history() {
        let store = CandleStore::new(100);
        let mut session = MarketSession::new(60, store.clone());

        assert!(session.on_tick(&tick(100.0, 0)).unwrap().is_none());
        let closed = session.on_tick(&tick(101.0, 60)).unwrap().unwrap();

        assert_eq!(closed.candle.close, 100.0);
        assert_eq!(closed.trend.timestamp, at(0));
        assert_eq!(store.candles("NIFTY_50").unwrap(), vec![closed.trend]);
    }

    #[test]
    fn test_restore_continues_recurrence() {
        let store = CandleStore::new(100);
        let mut live = MarketSession::new(60, store.clone());
        for m in 0..40 {
            live.on_tick(&tick(100.0 + m as f64, m * 60)).unwrap();
        }
        // Partial candle of minute 40 is in progress
        live.on_tick(&tick(150.0, 40 * 60 + 5)).unwrap();
        let snapshot = store.snapshot(at(0)).unwrap();
        assert_eq!(snapshot.candle_count(), 40);

        let mut resumed = MarketSession::new(60, CandleStore::new(100));
        assert_eq!(resumed.restore(&snapshot).unwrap(), 40);
        assert_eq!(resumed.store().candle_count("NIFTY_50").unwrap(), 40);

        // Same next candle as the uninterrupted session would have produced
        let last = snapshot.histories["NIFTY_50"].last().unwrap().clone();
        resumed.on_tick(&tick(141.0, 41 * 60)).unwrap();
        let next = resumed.on_tick(&tick(142.0, 42 * 60)).unwrap().unwrap();
        assert_eq!(next.trend.open, (last.open + last.close) / 2.0);
        assert_eq!(resumed.store().candle_count("NIFTY_50").unwrap(), 41);
    }

    #[test]
    fn test_restore_drops_partial_candle() {
        let store = CandleStore::new(100);
        let mut session = MarketSession::new(60, store.clone());
        session.on_tick(&tick(100.0, 0)).unwrap();
        session.on_tick(&tick(101.0, 60)).unwrap();
        let snapshot = store.snapshot(at(60)).unwrap();

        session.restore(&snapshot).unwrap();
        assert!(session.aggregator().in_progress("NIFTY_50").is_none());
    }

    #[test]
    fn test_older_snapshot_keeps_newer_history() {
        let store = CandleStore::new(100);
        let mut session = MarketSession::new(60, store.clone());
        for m in 0..6 {
            session.on_tick(&tick(100.0 + m as f64, m * 60)).unwrap();
        }
        let snapshot = store.snapshot(at(0)).unwrap();
        assert_eq!(snapshot.candle_count(), 5);

        // Ticks already queued before the disconnect close three more candles
        for m in 6..9 {
            session.on_tick(&tick(100.0 + m as f64, m * 60)).unwrap();
        }
        let newest = store.last("NIFTY_50").unwrap().unwrap();
        assert_eq!(store.candle_count("NIFTY_50").unwrap(), 8);

        session.restore(&snapshot).unwrap();
        assert_eq!(store.candle_count("NIFTY_50").unwrap(), 8);

        // Recurrence continues from the newest candle, not the snapshot's
        session.on_tick(&tick(120.0, 10 * 60)).unwrap();
        let next = session.on_tick(&tick(121.0, 11 * 60)).unwrap().unwrap();
        assert_eq!(next.trend.open, (newest.open + newest.close) / 2.0);
        assert_eq!(store.candle_count("NIFTY_50").unwrap(), 9);
    }
}
