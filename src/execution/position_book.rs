use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use super::exit_engine::ExitReason;
use crate::models::{Direction, OrderSide, StrikeMeta};

/// Whether the held instrument profits from a rise or a fall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Option buys are always long; underlying bearish trades are short
    pub fn for_entry(direction: Direction, options_mode: bool) -> Self {
        match (options_mode, direction) {
            (true, _) | (false, Direction::Bullish) => Self::Long,
            (false, Direction::Bearish) => Self::Short,
        }
    }

    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn entry_order(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    pub fn exit_order(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }
}

/// Trailing-stop state in percentage points of gain
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailState {
    pub highest_gain_pct: f64,
    pub level_pct: f64,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub id: Uuid,
    /// Underlying symbol the signal was generated on
    pub symbol: String,
    /// Traded instrument: the symbol itself, or an option contract
    pub instrument: String,
    pub direction: Direction,
    pub side: PositionSide,
    pub lots: u32,
    pub multiplier: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub strike: Option<StrikeMeta>,
    pub opened_at: DateTime<Utc>,
    pub entry_order_id: String,
    pub trail: Option<TrailState>,
}

impl Position {
    /// Units traded: lots times the contract multiplier
    pub fn units(&self) -> f64 {
        self.lots as f64 * self.multiplier
    }

    /// Capital committed at entry
    pub fn cost_basis(&self) -> f64 {
        self.entry_price * self.units()
    }

    pub fn pnl_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.units() * self.side.sign()
    }

    pub fn pnl_pct_at(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) * 100.0 / self.entry_price * self.side.sign()
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.pnl_at(self.current_price)
    }

    pub fn held_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.opened_at).num_minutes()
    }
}

/// Everything needed to record a confirmed entry
#[derive(Debug, Clone)]
pub struct PositionEntry {
    pub symbol: String,
    pub instrument: String,
    pub direction: Direction,
    pub side: PositionSide,
    pub lots: u32,
    pub multiplier: f64,
    pub price: f64,
    pub strike: Option<StrikeMeta>,
    pub order_id: String,
}

#[derive(Debug, Clone)]
pub struct ClosedTrade {
    pub position_id: Uuid,
    pub symbol: String,
    pub instrument: String,
    pub direction: Direction,
    pub lots: u32,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub reason: ExitReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// Open positions keyed by underlying symbol, plus the closed-trade ledger.
///
/// At most one open position per symbol.
#[derive(Debug, Default)]
pub struct PositionBook {
    open: HashMap<String, Position>,
    closed: Vec<ClosedTrade>,
    total_pnl: f64,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_position_at(
        &mut self,
        entry: PositionEntry,
        opened_at: DateTime<Utc>,
    ) -> anyhow::Result<Uuid> {
        if self.open.contains_key(&entry.symbol) {
            anyhow::bail!("Already have open position for {}", entry.symbol);
        }
        if entry.lots == 0 {
            anyhow::bail!("Refusing zero-lot position for {}", entry.symbol);
        }

        let id = Uuid::new_v4();
        let position = Position {
            id,
            symbol: entry.symbol.clone(),
            instrument: entry.instrument,
            direction: entry.direction,
            side: entry.side,
            lots: entry.lots,
            multiplier: entry.multiplier,
            entry_price: entry.price,
            current_price: entry.price,
            strike: entry.strike,
            opened_at,
            entry_order_id: entry.order_id,
            trail: None,
        };

        tracing::info!(
            symbol = %position.symbol,
            instrument = %position.instrument,
            direction = %position.direction,
            lots = position.lots,
            price = position.entry_price,
            "📈 Opened position {}",
            id
        );
        self.open.insert(entry.symbol, position);
        Ok(id)
    }

    pub fn has_open_position(&self, symbol: &str) -> bool {
        self.open.contains_key(symbol)
    }

    pub fn get_open_position(&self, symbol: &str) -> Option<&Position> {
        self.open.get(symbol)
    }

    pub fn open_positions(&self) -> Vec<&Position> {
        self.open.values().collect()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Mark every position trading `instrument` to the latest price
    pub fn mark(&mut self, instrument: &str, price: f64) {
        for position in self.open.values_mut() {
            if position.instrument == instrument {
                position.current_price = price;
            }
        }
    }

    pub fn set_trail(&mut self, symbol: &str, trail: Option<TrailState>) -> anyhow::Result<()> {
        let position = self
            .open
            .get_mut(symbol)
            .ok_or_else(|| anyhow::anyhow!("No open position for {}", symbol))?;
        position.trail = trail;
        Ok(())
    }

    pub fn close_position_at(
        &mut self,
        symbol: &str,
        exit_price: f64,
        reason: ExitReason,
        closed_at: DateTime<Utc>,
    ) -> anyhow::Result<ClosedTrade> {
        let position = self
            .open
            .remove(symbol)
            .ok_or_else(|| anyhow::anyhow!("No open position for {}", symbol))?;

        let trade = ClosedTrade {
            position_id: position.id,
            symbol: position.symbol.clone(),
            instrument: position.instrument.clone(),
            direction: position.direction,
            lots: position.lots,
            entry_price: position.entry_price,
            exit_price,
            pnl: position.pnl_at(exit_price),
            pnl_pct: position.pnl_pct_at(exit_price),
            reason,
            opened_at: position.opened_at,
            closed_at,
        };
        self.total_pnl += trade.pnl;

        tracing::info!(
            symbol = %trade.symbol,
            reason = %trade.reason,
            exit_price,
            pnl = trade.pnl,
            pnl_pct = trade.pnl_pct,
            "📉 Closed position {}",
            trade.position_id
        );
        self.closed.push(trade.clone());
        Ok(trade)
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed
    }

    /// Realized P&L across all closed trades
    pub fn total_pnl(&self) -> f64 {
        self.total_pnl
    }

    /// Sum of cost bases of open positions
    pub fn capital_in_use(&self) -> f64 {
        self.open.values().map(Position::cost_basis).sum()
    }
}
