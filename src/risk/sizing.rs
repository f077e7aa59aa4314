use super::session::EntryBlock;
use crate::config::RiskSettings;

/// Lot sizing against the capital budget
#[derive(Debug, Clone)]
pub struct PositionSizer {
    capital: f64,
    max_risk_pct: f64,
    max_lots: u32,
}

impl PositionSizer {
    pub fn new(capital: f64, max_risk_pct: f64, max_lots: u32) -> Self {
        Self {
            capital,
            max_risk_pct,
            max_lots: max_lots.max(1),
        }
    }

    pub fn from_settings(risk: &RiskSettings) -> Self {
        Self::new(risk.capital, risk.max_risk_pct, risk.max_lots)
    }

    pub fn capital(&self) -> f64 {
        self.capital
    }

    /// Capital a single trade may commit
    pub fn budget(&self) -> f64 {
        self.capital * self.max_risk_pct / 100.0
    }

    /// Lots to trade at `price`, half of what the budget allows, clamped to
    /// `[1, max_lots]` and to what the free capital covers.
    pub fn lots_for(&self, price: f64, multiplier: f64, free_capital: f64) -> Result<u32, EntryBlock> {
        let lot_cost = price * multiplier;
        let available = self.budget().min(free_capital);
        if !(lot_cost > 0.0) || lot_cost > available {
            return Err(EntryBlock::InsufficientCapital {
                needed: lot_cost,
                available,
            });
        }

        let by_budget = ((self.budget() / lot_cost).floor() as u32 / 2).clamp(1, self.max_lots);
        let by_free = (free_capital / lot_cost).floor() as u32;
        Ok(by_budget.min(by_free))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_of_budget_clamped_to_max() {
        let sizer = PositionSizer::new(50_000.0, 75.0, 4);
        // Budget 37,500 buys ten 3,750 lots; half is 5, capped at 4
        assert_eq!(sizer.lots_for(50.0, 75.0, 50_000.0), Ok(4));
        // 200 x 75 = 15,000 per lot: two lots in budget, half is 1
        assert_eq!(sizer.lots_for(200.0, 75.0, 50_000.0), Ok(1));
    }

    #[test]
    fn test_at_least_one_lot_when_affordable() {
        let sizer = PositionSizer::new(50_000.0, 75.0, 4);
        // One 30,000 lot fits the budget; half of one rounds up to the minimum
        assert_eq!(sizer.lots_for(400.0, 75.0, 50_000.0), Ok(1));
    }

    #[test]
    fn test_unaffordable() {
        let sizer = PositionSizer::new(50_000.0, 75.0, 4);
        assert!(matches!(
            sizer.lots_for(600.0, 75.0, 50_000.0),
            Err(EntryBlock::InsufficientCapital { .. })
        ));
        // Fits the budget but not the capital still free
        assert!(matches!(
            sizer.lots_for(50.0, 75.0, 3_000.0),
            Err(EntryBlock::InsufficientCapital { .. })
        ));
    }

    #[test]
    fn test_free_capital_caps_lots() {
        let sizer = PositionSizer::new(50_000.0, 75.0, 4);
        assert_eq!(sizer.lots_for(50.0, 75.0, 8_000.0), Ok(2));
    }
}
