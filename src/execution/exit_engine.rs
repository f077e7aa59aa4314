use chrono::{DateTime, Utc};
use std::fmt;

use super::position_book::{Position, TrailState};
use crate::config::ExitSettings;
use crate::market::MarketHours;
use crate::models::TrendCandle;
use crate::strategy::signals::SignalEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitReason {
    SessionClose,
    StopLoss,
    MinimumValue,
    ProfitTarget,
    TrailingStop,
    MaxHoldTime,
    LowGainHold,
    TechnicalReversal,
}

impl ExitReason {
    /// Risk and session-boundary exits that override every other rule
    pub fn is_mandatory(self) -> bool {
        matches!(self, Self::SessionClose | Self::StopLoss | Self::MinimumValue)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionClose => "SESSION_CLOSE",
            Self::StopLoss => "STOP_LOSS",
            Self::MinimumValue => "MINIMUM_VALUE",
            Self::ProfitTarget => "PROFIT_TARGET",
            Self::TrailingStop => "TRAILING_STOP",
            Self::MaxHoldTime => "MAX_HOLD_TIME",
            Self::LowGainHold => "LOW_GAIN_HOLD",
            Self::TechnicalReversal => "TECHNICAL_REVERSAL",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExitDecision {
    pub reason: ExitReason,
    pub price: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
}

/// One entry in the ordered rule table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitRule {
    SessionClose,
    StopLoss,
    MinimumValue,
    ProfitTarget,
    TrailingStop,
    TimeBased,
    TechnicalReversal,
}

/// Priority order; the first rule that fires wins
pub const EXIT_RULES: [ExitRule; 7] = [
    ExitRule::SessionClose,
    ExitRule::StopLoss,
    ExitRule::MinimumValue,
    ExitRule::ProfitTarget,
    ExitRule::TrailingStop,
    ExitRule::TimeBased,
    ExitRule::TechnicalReversal,
];

/// Read-only view handed to the engine for one evaluation
#[derive(Debug, Clone, Copy)]
pub struct ExitContext<'a> {
    pub position: &'a Position,
    /// Current valuation of the held instrument
    pub price: f64,
    pub now: DateTime<Utc>,
    /// Trend-candle history of the underlying symbol
    pub history: &'a [TrendCandle],
}

/// Result of one evaluation. `trail` is the trailing state to commit
/// whether or not a decision fired.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitEvaluation {
    pub decision: Option<ExitDecision>,
    pub trail: Option<TrailState>,
}

/// Ordered exit rules evaluated against an open position.
///
/// Evaluation has no side effects: placing the exit order and committing the
/// trailing state belong to the caller.
#[derive(Debug, Clone)]
pub struct PositionExitEngine {
    settings: ExitSettings,
    hours: MarketHours,
    signals: SignalEngine,
}

impl PositionExitEngine {
    pub fn new(settings: ExitSettings, hours: MarketHours, signals: SignalEngine) -> Self {
        Self {
            settings,
            hours,
            signals,
        }
    }

    pub fn settings(&self) -> &ExitSettings {
        &self.settings
    }

    pub fn evaluate(&self, ctx: &ExitContext<'_>) -> ExitEvaluation {
        let gain_pct = ctx.position.pnl_pct_at(ctx.price);
        let mut trail = ctx.position.trail;

        let reason = EXIT_RULES
            .iter()
            .find_map(|rule| self.check(*rule, ctx, gain_pct, &mut trail));

        let decision = reason.map(|reason| {
            let decision = ExitDecision {
                reason,
                price: ctx.price,
                pnl: ctx.position.pnl_at(ctx.price),
                pnl_pct: gain_pct,
            };
            tracing::debug!(
                symbol = %ctx.position.symbol,
                reason = %reason,
                mandatory = reason.is_mandatory(),
                price = ctx.price,
                pnl = decision.pnl,
                "exit rule fired"
            );
            decision
        });

        ExitEvaluation { decision, trail }
    }

    fn check(
        &self,
        rule: ExitRule,
        ctx: &ExitContext<'_>,
        gain_pct: f64,
        trail: &mut Option<TrailState>,
    ) -> Option<ExitReason> {
        let s = &self.settings;
        match rule {
            ExitRule::SessionClose => self
                .hours
                .past_session_cutoff(ctx.now)
                .then_some(ExitReason::SessionClose),
            ExitRule::StopLoss => (-gain_pct >= s.stop_loss_pct).then_some(ExitReason::StopLoss),
            ExitRule::MinimumValue => (ctx.price < s.min_price).then_some(ExitReason::MinimumValue),
            ExitRule::ProfitTarget => {
                (gain_pct >= s.profit_target_pct).then_some(ExitReason::ProfitTarget)
            }
            ExitRule::TrailingStop => {
                let (next, fired) = self.update_trail(*trail, gain_pct);
                *trail = next;
                fired.then_some(ExitReason::TrailingStop)
            }
            ExitRule::TimeBased => {
                let held = ctx.position.held_minutes(ctx.now);
                if held >= s.max_hold_mins {
                    Some(ExitReason::MaxHoldTime)
                } else if held >= s.intermediate_hold_mins && gain_pct < s.intermediate_min_gain_pct
                {
                    Some(ExitReason::LowGainHold)
                } else {
                    None
                }
            }
            ExitRule::TechnicalReversal => {
                if !s.technical_reversal {
                    return None;
                }
                // Too little history means no reversal opinion
                let snapshot = self.signals.analyze(ctx.history).ok()?;
                self.signals
                    .is_reversal(&snapshot, ctx.position.direction)
                    .then_some(ExitReason::TechnicalReversal)
            }
        }
    }

    /// Advance the trailing stop for the current gain.
    ///
    /// Returns the new state and whether the stop fired. The level never
    /// decreases, and an armed stop stays armed if the gain falls back under
    /// the activation threshold.
    pub fn update_trail(&self, trail: Option<TrailState>, gain_pct: f64) -> (Option<TrailState>, bool) {
        let step = self.settings.trail_step_pct;
        match trail {
            None if gain_pct >= self.settings.trail_activation_pct => {
                let armed = TrailState {
                    highest_gain_pct: gain_pct,
                    level_pct: gain_pct - step,
                };
                (Some(armed), false)
            }
            None => (None, false),
            Some(mut state) => {
                if gain_pct > state.highest_gain_pct {
                    state.highest_gain_pct = gain_pct;
                    state.level_pct = state.level_pct.max(gain_pct - step);
                }
                (Some(state), gain_pct <= state.level_pct)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::position_book::PositionSide;
    use crate::models::Direction;
    use crate::strategy::signals::tests::trending_history;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    /// Monday 09:30 IST
    fn market_open() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 4, 0, 0).unwrap()
    }

    fn engine() -> PositionExitEngine {
        PositionExitEngine::new(
            ExitSettings::default(),
            MarketHours::default(),
            SignalEngine::default(),
        )
    }

    fn position(entry: f64) -> Position {
        Position {
            id: Uuid::new_v4(),
            symbol: "NIFTY_50".to_string(),
            instrument: "NIFTY_5025000CE".to_string(),
            direction: Direction::Bullish,
            side: PositionSide::Long,
            lots: 1,
            multiplier: 75.0,
            entry_price: entry,
            current_price: entry,
            strike: None,
            opened_at: market_open(),
            entry_order_id: "OID".to_string(),
            trail: None,
        }
    }

    fn evaluate_at(
        engine: &PositionExitEngine,
        position: &Position,
        price: f64,
        now: DateTime<Utc>,
    ) -> ExitEvaluation {
        engine.evaluate(&ExitContext {
            position,
            price,
            now,
            history: &[],
        })
    }

    #[test]
    fn test_stop_loss_scenario() {
        let engine = engine();
        let position = position(50.0);
        let eval = evaluate_at(&engine, &position, 35.0, market_open() + Duration::minutes(5));

        let decision = eval.decision.unwrap();
        assert_eq!(decision.reason, ExitReason::StopLoss);
        assert_eq!(decision.pnl, -1125.0);
        assert_eq!(decision.pnl_pct, -30.0);
        assert!(decision.reason.is_mandatory());
    }

    #[test]
    fn test_mandatory_wins_over_reversal() {
        let engine = engine();
        let position = position(50.0);
        // Strong red bar under the trend line would also be a reversal
        let history = trending_history(30, 10.0, (25200.0, 25202.0, 25100.0, 25105.0));
        // 15:25 IST, past the cut-off
        let late = Utc.with_ymd_and_hms(2026, 10, 19, 9, 55, 0).unwrap();

        let eval = engine.evaluate(&ExitContext {
            position: &position,
            price: 32.5,
            now: late,
            history: &history,
        });
        assert_eq!(eval.decision.unwrap().reason, ExitReason::SessionClose);

        let eval = engine.evaluate(&ExitContext {
            position: &position,
            price: 32.5,
            now: market_open() + Duration::minutes(10),
            history: &history,
        });
        assert_eq!(eval.decision.unwrap().reason, ExitReason::StopLoss);

        let eval = engine.evaluate(&ExitContext {
            position: &position,
            price: 49.0,
            now: market_open() + Duration::minutes(10),
            history: &history,
        });
        assert_eq!(eval.decision.unwrap().reason, ExitReason::TechnicalReversal);
    }

    #[test]
    fn test_minimum_value() {
        let engine = engine();
        let position = position(2.5);
        // -24% loss stays above the stop, but the premium is below the floor
        let eval = evaluate_at(&engine, &position, 1.9, market_open());
        assert_eq!(eval.decision.unwrap().reason, ExitReason::MinimumValue);
    }

    #[test]
    fn test_profit_target() {
        let engine = engine();
        let position = position(50.0);
        let eval = evaluate_at(&engine, &position, 75.0, market_open());
        let decision = eval.decision.unwrap();
        assert_eq!(decision.reason, ExitReason::ProfitTarget);
        assert_eq!(decision.pnl, 1875.0);
    }

    #[test]
    fn test_trailing_stop_scenario() {
        let engine = engine();
        let mut position = position(50.0);
        let now = market_open() + Duration::minutes(15);

        // +30%: arms the trail at 20%
        let eval = evaluate_at(&engine, &position, 65.0, now);
        assert!(eval.decision.is_none());
        assert_eq!(
            eval.trail,
            Some(TrailState {
                highest_gain_pct: 30.0,
                level_pct: 20.0
            })
        );
        position.trail = eval.trail;

        // +40%: ratchets to 30%
        let eval = evaluate_at(&engine, &position, 70.0, now);
        assert!(eval.decision.is_none());
        assert_eq!(eval.trail.unwrap().level_pct, 30.0);
        position.trail = eval.trail;

        // +28%: below the level
        let eval = evaluate_at(&engine, &position, 64.0, now);
        let decision = eval.decision.unwrap();
        assert_eq!(decision.reason, ExitReason::TrailingStop);
        assert_eq!(decision.pnl, 1050.0);
    }

    #[test]
    fn test_trail_level_is_monotonic() {
        let engine = engine();
        let gains = [26.0, 31.0, 29.0, 35.0, 33.0, 40.0, 38.0, 44.0];
        let mut trail = None;
        let mut last_level = f64::MIN;
        for gain in gains {
            let (next, _) = engine.update_trail(trail, gain);
            let level = next.unwrap().level_pct;
            assert!(level >= last_level, "level dropped from {} to {}", last_level, level);
            last_level = level;
            trail = next;
        }
        assert_eq!(last_level, 34.0);
    }

    #[test]
    fn test_trail_stays_armed_below_activation() {
        let engine = engine();
        let (armed, fired) = engine.update_trail(None, 26.0);
        assert!(!fired);
        // Gain collapses under activation; the armed stop still fires
        let (_, fired) = engine.update_trail(armed, 12.0);
        assert!(fired);
    }

    #[test]
    fn test_trail_not_armed_below_activation() {
        let engine = engine();
        assert_eq!(engine.update_trail(None, 24.9), (None, false));
    }

    #[test]
    fn test_time_based_exits() {
        let engine = engine();
        let position = position(50.0);

        let eval = evaluate_at(&engine, &position, 52.0, market_open() + Duration::minutes(239));
        assert!(eval.decision.is_none());

        // 4% gain after 4 hours is not enough
        let eval = evaluate_at(&engine, &position, 52.0, market_open() + Duration::minutes(240));
        assert_eq!(eval.decision.unwrap().reason, ExitReason::LowGainHold);

        // 12% gain clears the intermediate check
        let eval = evaluate_at(&engine, &position, 56.0, market_open() + Duration::minutes(240));
        assert!(eval.decision.is_none());
    }

    #[test]
    fn test_max_hold() {
        let engine = PositionExitEngine::new(
            ExitSettings::default(),
            // Cut-off moved out of the way so the hold limit is reachable
            MarketHours::new(
                chrono_tz::Asia::Kolkata,
                chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                chrono::NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
                chrono::NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
            ),
            SignalEngine::default(),
        );
        let position = position(50.0);
        let eval = evaluate_at(&engine, &position, 56.0, market_open() + Duration::minutes(360));
        assert_eq!(eval.decision.unwrap().reason, ExitReason::MaxHoldTime);
    }

    #[test]
    fn test_short_position_pnl() {
        let engine = engine();
        let mut position = position(25_000.0);
        position.side = PositionSide::Short;
        position.direction = Direction::Bearish;

        // Underlying up 30% against a short
        let eval = evaluate_at(&engine, &position, 32_500.0, market_open());
        let decision = eval.decision.unwrap();
        assert_eq!(decision.reason, ExitReason::StopLoss);
        assert_eq!(decision.pnl, -7500.0 * 75.0);
    }

    #[test]
    fn test_reversal_disabled() {
        let engine = PositionExitEngine::new(
            ExitSettings {
                technical_reversal: false,
                ..ExitSettings::default()
            },
            MarketHours::default(),
            SignalEngine::default(),
        );
        let position = position(50.0);
        let history = trending_history(30, 10.0, (25200.0, 25202.0, 25100.0, 25105.0));
        let eval = engine.evaluate(&ExitContext {
            position: &position,
            price: 49.0,
            now: market_open(),
            history: &history,
        });
        assert!(eval.decision.is_none());
    }
}
