use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::HashMap;

use crate::config::RiskSettings;

/// Per-session trading limits
#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub max_daily_trades: u32,
    pub reentry_cooldown: Duration,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_daily_trades: 100,                  // Max 100 entries per day
            reentry_cooldown: Duration::minutes(5), // Wait after an exit before re-entering
        }
    }
}

impl RiskLimits {
    pub fn from_settings(risk: &RiskSettings) -> Self {
        Self {
            max_daily_trades: risk.max_daily_trades,
            reentry_cooldown: Duration::seconds(risk.reentry_cooldown_secs),
        }
    }

    /// Whether a new entry on `symbol` is allowed at `now`.
    ///
    /// Entries still in flight count against the daily cap.
    pub fn check(&self, state: &SessionState, symbol: &str, now: DateTime<Utc>) -> Result<(), EntryBlock> {
        if state.trades_today + state.pending_entries >= self.max_daily_trades {
            return Err(EntryBlock::DailyTradeLimit);
        }

        if let Some(exited_at) = state.last_exit(symbol) {
            let ready_at = exited_at + self.reentry_cooldown;
            if now < ready_at {
                return Err(EntryBlock::Cooldown { until: ready_at });
            }
        }

        Ok(())
    }
}

/// Why an entry was not taken
#[derive(Debug, Clone, PartialEq)]
pub enum EntryBlock {
    DailyTradeLimit,
    Cooldown { until: DateTime<Utc> },
    InsufficientCapital { needed: f64, available: f64 },
}

impl std::fmt::Display for EntryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DailyTradeLimit => write!(f, "daily trade limit reached"),
            Self::Cooldown { until } => write!(f, "re-entry cooldown until {}", until),
            Self::InsufficientCapital { needed, available } => {
                write!(f, "insufficient capital: need {:.2}, have {:.2}", needed, available)
            }
        }
    }
}

/// Counters owned by the orchestrator for one trading day.
///
/// Daily counters reset on a new trading day; cumulative statistics do not.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub trading_day: NaiveDate,
    pub trades_today: u32,
    pub daily_pnl: f64,
    pub capital_in_use: f64,
    /// Entry orders submitted but not yet answered
    pub pending_entries: u32,
    pub reserved_capital: f64,
    pub realized_pnl: f64,
    pub wins: u32,
    pub losses: u32,
    pub consecutive_losses: u32,
    last_exit: HashMap<String, DateTime<Utc>>,
}

impl SessionState {
    pub fn new(trading_day: NaiveDate) -> Self {
        Self {
            trading_day,
            trades_today: 0,
            daily_pnl: 0.0,
            capital_in_use: 0.0,
            pending_entries: 0,
            reserved_capital: 0.0,
            realized_pnl: 0.0,
            wins: 0,
            losses: 0,
            consecutive_losses: 0,
            last_exit: HashMap::new(),
        }
    }

    /// Reset daily counters if `day` is a new trading day. Returns true on rollover.
    pub fn roll_day(&mut self, day: NaiveDate) -> bool {
        if day == self.trading_day {
            return false;
        }
        tracing::info!(
            previous = %self.trading_day,
            day = %day,
            trades = self.trades_today,
            daily_pnl = self.daily_pnl,
            "🌅 New trading day, resetting daily counters"
        );
        self.trading_day = day;
        self.trades_today = 0;
        self.daily_pnl = 0.0;
        self.last_exit.clear();
        true
    }

    /// Hold capital for an entry order until it is answered
    pub fn reserve_entry(&mut self, cost: f64) {
        self.pending_entries += 1;
        self.reserved_capital += cost;
    }

    pub fn release_entry(&mut self, cost: f64) {
        self.pending_entries = self.pending_entries.saturating_sub(1);
        self.reserved_capital = (self.reserved_capital - cost).max(0.0);
    }

    /// Capital tied up in a position that is not a new trade today
    pub fn hold_capital(&mut self, cost: f64) {
        self.capital_in_use += cost;
    }

    pub fn record_entry(&mut self, cost: f64) {
        self.trades_today += 1;
        self.capital_in_use += cost;
    }

    pub fn record_exit(&mut self, symbol: &str, cost: f64, pnl: f64, at: DateTime<Utc>) {
        self.capital_in_use = (self.capital_in_use - cost).max(0.0);
        self.daily_pnl += pnl;
        self.realized_pnl += pnl;

        if pnl < 0.0 {
            self.losses += 1;
            self.consecutive_losses += 1;
        } else {
            self.wins += 1;
            self.consecutive_losses = 0;
        }

        self.last_exit.insert(symbol.to_string(), at);
    }

    pub fn last_exit(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.last_exit.get(symbol).copied()
    }

    pub fn free_capital(&self, capital: f64) -> f64 {
        (capital - self.capital_in_use - self.reserved_capital).max(0.0)
    }

    pub fn win_rate(&self) -> f64 {
        let closed = self.wins + self.losses;
        if closed == 0 {
            0.0
        } else {
            self.wins as f64 * 100.0 / closed as f64
        }
    }
}
