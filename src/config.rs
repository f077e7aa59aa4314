use crate::error::{BotError, Result};
use crate::feed::symbol_from_instrument_key;
use chrono::NaiveTime;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const TIME_FORMAT: &str = "%H:%M:%S";

/// Session-wide settings. Loaded once at startup and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
    pub feed: FeedSettings,
    pub market: MarketSettings,
    pub strategy: StrategySettings,
    pub exits: ExitSettings,
    pub risk: RiskSettings,
    pub api: ApiSettings,
    pub options: OptionsSettings,
    pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Provider instrument key, e.g. `NSE_INDEX|Nifty 50`
    pub id: String,
    /// Symbol used inside the bot. Derived from `id` when absent.
    pub symbol: Option<String>,
    /// Contract multiplier (lot size) used for P&L and order quantity
    pub multiplier: f64,
    /// Run entry strategies on this symbol. Option legs are quoted but not evaluated.
    pub evaluate: bool,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            symbol: None,
            multiplier: 75.0,
            evaluate: true,
        }
    }
}

impl InstrumentConfig {
    pub fn resolved_symbol(&self) -> String {
        self.symbol
            .clone()
            .unwrap_or_else(|| symbol_from_instrument_key(&self.id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeedSettings {
    pub url: String,
    pub instruments: Vec<InstrumentConfig>,
    pub candle_interval_secs: u64,
    pub history_capacity: usize,
    pub stale_after_secs: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub connect_timeout_secs: u64,
    /// Delay between a supervised teardown and the first reconnect attempt
    pub teardown_grace_ms: u64,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            url: "wss://feed.example.invalid/market-data".to_string(),
            instruments: vec![InstrumentConfig {
                id: "NSE_INDEX|Nifty 50".to_string(),
                ..InstrumentConfig::default()
            }],
            candle_interval_secs: 60,
            history_capacity: 100,
            stale_after_secs: 120,
            max_reconnect_attempts: 5,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            connect_timeout_secs: 15,
            teardown_grace_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MarketSettings {
    pub timezone: String,
    pub open: String,
    pub close: String,
    /// Local time after which every open position is force-closed
    pub session_cutoff: String,
    /// Ignore ticks that arrive outside market hours
    pub enforce_hours: bool,
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self {
            timezone: "Asia/Kolkata".to_string(),
            open: "09:15:00".to_string(),
            close: "15:30:00".to_string(),
            session_cutoff: "15:20:00".to_string(),
            enforce_hours: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Bullish and bearish entries
    TrendFollow,
    /// Bullish entries only
    LongOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StrategySettings {
    pub kind: StrategyKind,
    pub trend_period: usize,
    pub adx_period: usize,
    pub adx_threshold: f64,
    pub strong_candle_threshold: f64,
    /// Distance (percent of the trend line) price must clear before a reversal counts
    pub reversal_buffer_pct: f64,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            kind: StrategyKind::TrendFollow,
            trend_period: 9,
            adx_period: 14,
            adx_threshold: 20.0,
            strong_candle_threshold: 0.6,
            reversal_buffer_pct: 0.0,
        }
    }
}

/// Exit thresholds. Percentages are percentage points (30.0 = 30%).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExitSettings {
    pub stop_loss_pct: f64,
    pub min_price: f64,
    pub profit_target_pct: f64,
    pub trail_activation_pct: f64,
    pub trail_step_pct: f64,
    pub intermediate_hold_mins: i64,
    pub intermediate_min_gain_pct: f64,
    pub max_hold_mins: i64,
    pub technical_reversal: bool,
}

impl Default for ExitSettings {
    fn default() -> Self {
        Self {
            stop_loss_pct: 30.0,
            min_price: 2.0,
            profit_target_pct: 50.0,
            trail_activation_pct: 25.0,
            trail_step_pct: 10.0,
            intermediate_hold_mins: 240,
            intermediate_min_gain_pct: 10.0,
            max_hold_mins: 360,
            technical_reversal: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskSettings {
    pub capital: f64,
    /// Share of capital a single trade may commit, in percent
    pub max_risk_pct: f64,
    pub max_lots: u32,
    pub max_daily_trades: u32,
    pub reentry_cooldown_secs: i64,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            capital: 50_000.0,
            max_risk_pct: 75.0,
            max_lots: 4,
            max_daily_trades: 100,
            reentry_cooldown_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiSettings {
    /// Order endpoint. Orders are paper-traded when absent or `paper_trading` is set.
    pub order_url: Option<String>,
    /// Broker positions endpoint; open positions are recovered from it at startup
    pub positions_url: Option<String>,
    pub paper_trading: bool,
    /// Environment variable holding the bearer token
    pub token_env: String,
    pub max_requests_per_minute: usize,
    pub burst_per_second: u32,
    pub window_buffer_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub order_timeout_secs: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            order_url: None,
            positions_url: None,
            paper_trading: true,
            token_env: "TRENDBOT_ACCESS_TOKEN".to_string(),
            max_requests_per_minute: 50,
            burst_per_second: 5,
            window_buffer_ms: 1_000,
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 32_000,
            order_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrikeSelection {
    Atm,
    Otm,
    Itm,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OptionsSettings {
    pub enabled: bool,
    pub strike_interval: f64,
    pub selection: StrikeSelection,
}

impl Default for OptionsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            strike_interval: 50.0,
            selection: StrikeSelection::Atm,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotBackend {
    None,
    File,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistenceSettings {
    pub backend: SnapshotBackend,
    pub path: PathBuf,
    pub redis_url: String,
    pub redis_key: String,
    /// Warm histories from the stored snapshot at startup
    pub preload: bool,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            backend: SnapshotBackend::File,
            path: PathBuf::from("data/session_snapshot.json"),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            redis_key: "trendbot:snapshot".to_string(),
            preload: true,
        }
    }
}

impl Settings {
    /// Defaults, then an optional file, then `TRENDBOT__SECTION__KEY` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);

        if let Some(path) = path {
            tracing::info!("Loading settings from {}", path.display());
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("TRENDBOT")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let feed = &self.feed;
        if feed.instruments.is_empty() {
            return Err(config_err("feed.instruments must not be empty"));
        }
        if feed.instruments.iter().any(|i| i.id.trim().is_empty()) {
            return Err(config_err("feed.instruments entries need an id"));
        }
        if feed.instruments.iter().any(|i| i.multiplier <= 0.0) {
            return Err(config_err("instrument multiplier must be positive"));
        }
        if feed.candle_interval_secs == 0 {
            return Err(config_err("feed.candle_interval_secs must be positive"));
        }
        if feed.history_capacity == 0 || feed.stale_after_secs == 0 {
            return Err(config_err(
                "feed.history_capacity and feed.stale_after_secs must be positive",
            ));
        }

        let strategy = &self.strategy;
        if strategy.trend_period == 0 || strategy.adx_period == 0 {
            return Err(config_err("strategy periods must be positive"));
        }
        if !(0.0..=1.0).contains(&strategy.strong_candle_threshold) {
            return Err(config_err("strategy.strong_candle_threshold must be within [0, 1]"));
        }
        if feed.history_capacity < strategy.adx_period + strategy.trend_period {
            return Err(config_err(
                "feed.history_capacity is smaller than the strategy warm-up",
            ));
        }

        let exits = &self.exits;
        for (name, pct) in [
            ("exits.stop_loss_pct", exits.stop_loss_pct),
            ("exits.trail_activation_pct", exits.trail_activation_pct),
            ("exits.trail_step_pct", exits.trail_step_pct),
            ("risk.max_risk_pct", self.risk.max_risk_pct),
        ] {
            if !(pct > 0.0 && pct <= 100.0) {
                return Err(config_err(&format!("{} out of range: {}", name, pct)));
            }
        }
        if exits.profit_target_pct <= 0.0 {
            return Err(config_err("exits.profit_target_pct must be positive"));
        }
        if exits.max_hold_mins <= 0 || exits.intermediate_hold_mins > exits.max_hold_mins {
            return Err(config_err(
                "exits.intermediate_hold_mins must not exceed a positive exits.max_hold_mins",
            ));
        }

        if self.risk.capital <= 0.0 || self.risk.max_lots == 0 {
            return Err(config_err("risk.capital and risk.max_lots must be positive"));
        }
        if self.api.max_requests_per_minute == 0 || self.api.burst_per_second == 0 {
            return Err(config_err("api request budgets must be positive"));
        }
        if self.options.enabled && self.options.strike_interval <= 0.0 {
            return Err(config_err("options.strike_interval must be positive"));
        }

        self.market
            .timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| config_err(&format!("market.timezone: {}", e)))?;
        for (name, value) in [
            ("market.open", &self.market.open),
            ("market.close", &self.market.close),
            ("market.session_cutoff", &self.market.session_cutoff),
        ] {
            parse_time(value).map_err(|e| config_err(&format!("{}: {}", name, e)))?;
        }

        Ok(())
    }

    pub fn instrument_for_symbol(&self, symbol: &str) -> Option<&InstrumentConfig> {
        self.feed
            .instruments
            .iter()
            .find(|i| i.resolved_symbol() == symbol)
    }

    /// Contract multiplier for a symbol, falling back to the first configured instrument
    pub fn multiplier_for(&self, symbol: &str) -> f64 {
        self.instrument_for_symbol(symbol)
            .or_else(|| self.feed.instruments.first())
            .map(|i| i.multiplier)
            .unwrap_or(1.0)
    }
}

pub fn parse_time(value: &str) -> std::result::Result<NaiveTime, chrono::ParseError> {
    NaiveTime::parse_from_str(value, TIME_FORMAT)
}

fn config_err(msg: &str) -> BotError {
    BotError::Config(msg.to_string())
}

/// Source of session settings
pub trait SettingsProvider {
    fn load(&self) -> Result<Settings>;
}

/// Defaults layered with an optional file and environment overrides
#[derive(Debug, Clone, Default)]
pub struct LayeredSettings {
    pub path: Option<PathBuf>,
}

impl SettingsProvider for LayeredSettings {
    fn load(&self) -> Result<Settings> {
        Settings::load(self.path.as_deref())
    }
}
