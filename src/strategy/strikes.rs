use crate::config::{OptionsSettings, StrikeSelection};
use crate::models::{Direction, OptionKind, StrikeMeta};

/// Picks the option contract to trade for a directional signal
#[derive(Debug, Clone)]
pub struct StrikeSelector {
    interval: f64,
    selection: StrikeSelection,
}

impl StrikeSelector {
    pub fn new(interval: f64, selection: StrikeSelection) -> Self {
        Self {
            interval,
            selection,
        }
    }

    pub fn from_settings(options: &OptionsSettings) -> Self {
        Self::new(options.strike_interval, options.selection)
    }

    /// Spot rounded to the nearest listed strike
    pub fn atm_strike(&self, spot: f64) -> f64 {
        (spot / self.interval).round() * self.interval
    }

    /// Calls for bullish signals, puts for bearish ones
    pub fn select(&self, underlying: &str, spot: f64, direction: Direction) -> StrikeMeta {
        let kind = match direction {
            Direction::Bullish => OptionKind::Call,
            Direction::Bearish => OptionKind::Put,
        };

        let atm = self.atm_strike(spot);
        // OTM calls sit above spot, OTM puts below
        let shift = match (self.selection, kind) {
            (StrikeSelection::Atm, _) => 0.0,
            (StrikeSelection::Otm, OptionKind::Call) | (StrikeSelection::Itm, OptionKind::Put) => {
                self.interval
            }
            (StrikeSelection::Otm, OptionKind::Put) | (StrikeSelection::Itm, OptionKind::Call) => {
                -self.interval
            }
        };
        let strike = atm + shift;

        StrikeMeta {
            underlying: underlying.to_string(),
            strike,
            kind,
            instrument: format!("{}{}{}", underlying, strike, kind.code()),
            spot_at_entry: spot,
        }
    }
}
