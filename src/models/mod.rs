use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Single last-traded-price update for a symbol
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub last_price: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

/// OHLCV candle covering `[start_time, end_time)`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub tick_count: u32,
}

/// Smoothed candle derived from the previous trend candle and the current raw candle.
///
/// `timestamp` is the start time of the raw candle it was derived from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrendCandle {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub timestamp: DateTime<Utc>,
}

impl TrendCandle {
    pub fn is_green(&self) -> bool {
        self.close > self.open
    }

    pub fn is_red(&self) -> bool {
        self.close < self.open
    }

    /// Body as a fraction of the full range, 0 for a flat candle
    pub fn body_pct(&self) -> f64 {
        let range = self.high - self.low;
        if range > 0.0 {
            (self.close - self.open).abs() / range
        } else {
            0.0
        }
    }
}

/// Direction of an entry signal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    Bullish,
    Bearish,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Self::Bullish => Self::Bearish,
            Self::Bearish => Self::Bullish,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "BULLISH"),
            Self::Bearish => write!(f, "BEARISH"),
        }
    }
}

/// Entry signal produced by a strategy on candle close
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySignal {
    pub symbol: String,
    pub direction: Direction,
    pub price: f64,
    pub trend_line: f64,
    pub adx: f64,
    pub body_pct: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OptionKind {
    #[serde(rename = "CE")]
    Call,
    #[serde(rename = "PE")]
    Put,
}

impl OptionKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::Call => "CE",
            Self::Put => "PE",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "CE" => Some(Self::Call),
            "PE" => Some(Self::Put),
            _ => None,
        }
    }
}

/// Option contract a position was opened on
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrikeMeta {
    pub underlying: String,
    pub strike: f64,
    pub kind: OptionKind,
    pub instrument: String,
    pub spot_at_entry: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

/// Outbound order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub symbol: String,
    pub quantity: u32,
    pub price: f64,
    pub side: OrderSide,
    pub order_type: OrderType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Confirmed,
    Rejected,
    Pending,
}

/// Order API response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub fill_price: Option<f64>,
}

/// Open position as the broker reports it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BrokerPosition {
    pub instrument: String,
    /// Signed units, negative when short
    pub quantity: i64,
    pub average_price: f64,
}
