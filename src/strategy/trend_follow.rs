use super::signals::{SignalConfig, SignalEngine};
use super::Strategy;
use crate::config::{Settings, StrategyKind};
use crate::error::Result;
use crate::execution::{ExitContext, ExitEvaluation, PositionExitEngine};
use crate::market::MarketHours;
use crate::models::{Direction, EntrySignal, TrendCandle};

/// Trend-line + strong candle + ADX entries, ordered-rule exits.
///
/// `TrendFollow` trades both directions, `LongOnly` only bullish signals.
#[derive(Debug, Clone)]
pub struct TrendFollowStrategy {
    kind: StrategyKind,
    signals: SignalEngine,
    exits: PositionExitEngine,
}

impl TrendFollowStrategy {
    pub fn new(kind: StrategyKind, signals: SignalEngine, exits: PositionExitEngine) -> Self {
        Self {
            kind,
            signals,
            exits,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let signals = SignalEngine::new(SignalConfig::from_settings(&settings.strategy));
        let hours = MarketHours::from_settings(&settings.market)?;
        let exits = PositionExitEngine::new(settings.exits.clone(), hours, signals.clone());
        Ok(Self::new(settings.strategy.kind, signals, exits))
    }

    fn allows(&self, direction: Direction) -> bool {
        match self.kind {
            StrategyKind::TrendFollow => true,
            StrategyKind::LongOnly => direction == Direction::Bullish,
        }
    }
}

impl Strategy for TrendFollowStrategy {
    fn name(&self) -> &str {
        match self.kind {
            StrategyKind::TrendFollow => "trend_follow",
            StrategyKind::LongOnly => "long_only",
        }
    }

    fn min_candles_required(&self) -> usize {
        self.signals.config().min_candles()
    }

    fn evaluate_entry(&self, history: &[TrendCandle]) -> Result<Option<EntrySignal>> {
        let snapshot = self.signals.analyze(history)?;
        let Some(latest) = history.last() else {
            return Ok(None);
        };

        tracing::debug!(
            symbol = %latest.symbol,
            price = snapshot.price,
            trend_line = snapshot.trend_line,
            adx = snapshot.adx.adx,
            plus_di = snapshot.adx.plus_di,
            minus_di = snapshot.adx.minus_di,
            body_pct = snapshot.body_pct,
            "indicators"
        );

        let signal = self
            .signals
            .entry_direction(&snapshot)
            .filter(|direction| self.allows(*direction))
            .map(|direction| EntrySignal {
                symbol: latest.symbol.clone(),
                direction,
                price: snapshot.price,
                trend_line: snapshot.trend_line,
                adx: snapshot.adx.adx,
                body_pct: snapshot.body_pct,
                timestamp: snapshot.timestamp,
            });
        Ok(signal)
    }

    fn evaluate_exit(&self, ctx: &ExitContext<'_>) -> ExitEvaluation {
        self.exits.evaluate(ctx)
    }
}
