use crate::config::StrategySettings;
use crate::error::{BotError, Result};
use crate::indicators::{calculate_adx, trend_line, AdxReading};
use crate::models::{Direction, TrendCandle};
use chrono::{DateTime, Utc};

/// Thresholds for trend-candle signal generation
#[derive(Debug, Clone, PartialEq)]
pub struct SignalConfig {
    pub trend_period: usize,
    pub adx_period: usize,
    pub adx_threshold: f64,
    /// Body/range ratio a candle must exceed to count as strong
    pub strong_candle_threshold: f64,
    /// Percent of the trend line price must clear before a reversal counts
    pub reversal_buffer_pct: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            trend_period: 9,
            adx_period: 14,
            adx_threshold: 20.0,
            strong_candle_threshold: 0.6,
            reversal_buffer_pct: 0.0,
        }
    }
}

impl SignalConfig {
    pub fn from_settings(settings: &StrategySettings) -> Self {
        Self {
            trend_period: settings.trend_period,
            adx_period: settings.adx_period,
            adx_threshold: settings.adx_threshold,
            strong_candle_threshold: settings.strong_candle_threshold,
            reversal_buffer_pct: settings.reversal_buffer_pct,
        }
    }

    /// Warm-up: ADX period plus the trend-line period
    pub fn min_candles(&self) -> usize {
        self.adx_period + self.trend_period
    }
}

/// Indicator readings for the latest candle of a history
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSnapshot {
    pub price: f64,
    pub trend_line: f64,
    pub adx: AdxReading,
    pub body_pct: f64,
    pub strong_up: bool,
    pub strong_down: bool,
    pub timestamp: DateTime<Utc>,
}

impl SignalSnapshot {
    pub fn above_trend(&self) -> bool {
        self.price > self.trend_line
    }

    pub fn below_trend(&self) -> bool {
        self.price < self.trend_line
    }
}

/// Trend line + candle strength + ADX over trend-candle history
#[derive(Debug, Clone, Default)]
pub struct SignalEngine {
    config: SignalConfig,
}

impl SignalEngine {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// Compute indicator readings for the newest candle
    pub fn analyze(&self, history: &[TrendCandle]) -> Result<SignalSnapshot> {
        let need = self.config.min_candles();
        let latest = match history.last() {
            Some(latest) if history.len() >= need => latest,
            _ => {
                return Err(BotError::InsufficientHistory {
                    have: history.len(),
                    need,
                })
            }
        };

        let closes: Vec<f64> = history.iter().map(|c| c.close).collect();
        let line = trend_line(&closes, self.config.trend_period).ok_or(
            BotError::InsufficientHistory {
                have: history.len(),
                need,
            },
        )?;
        let adx = calculate_adx(history, self.config.adx_period).ok_or(
            BotError::InsufficientHistory {
                have: history.len(),
                need,
            },
        )?;

        let body_pct = latest.body_pct();
        let strong = body_pct > self.config.strong_candle_threshold;

        Ok(SignalSnapshot {
            price: latest.close,
            trend_line: line,
            adx,
            body_pct,
            strong_up: strong && latest.is_green(),
            strong_down: strong && latest.is_red(),
            timestamp: latest.timestamp,
        })
    }

    /// Bullish: above trend, strong green, trending. Bearish mirrors it.
    pub fn entry_direction(&self, snapshot: &SignalSnapshot) -> Option<Direction> {
        if snapshot.adx.adx <= self.config.adx_threshold {
            return None;
        }
        if snapshot.above_trend() && snapshot.strong_up {
            Some(Direction::Bullish)
        } else if snapshot.below_trend() && snapshot.strong_down {
            Some(Direction::Bearish)
        } else {
            None
        }
    }

    /// Strong candle against the held direction that crosses the trend line
    pub fn is_reversal(&self, snapshot: &SignalSnapshot, held: Direction) -> bool {
        let buffer = snapshot.trend_line * self.config.reversal_buffer_pct / 100.0;
        match held {
            Direction::Bullish => {
                snapshot.strong_down && snapshot.price < snapshot.trend_line - buffer
            }
            Direction::Bearish => snapshot.strong_up && snapshot.price > snapshot.trend_line + buffer,
        }
    }
}
