use thiserror::Error;

/// Errors raised anywhere in the feed → candle → signal → exit pipeline.
#[derive(Debug, Clone, Error)]
pub enum BotError {
    /// Timeouts, connection resets and other network failures worth retrying.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Provider answered with a 429-class response.
    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    /// Malformed tick, candle or feed record. The offending unit is dropped.
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    /// Not enough candles to evaluate. Callers skip evaluation.
    #[error("insufficient history: {have} candles, need {need}")]
    InsufficientHistory { have: usize, need: usize },

    /// Feed could not be re-established within the attempt budget.
    #[error("connectivity degraded after {attempts} attempts: {reason}")]
    ConnectivityDegraded { attempts: u32, reason: String },

    /// Credential missing, expired or refused by the provider.
    #[error("authentication error: {0}")]
    Auth(String),

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("shutdown requested")]
    Shutdown,
}

impl BotError {
    /// Errors the caller may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::RateLimited(_))
    }

    /// Errors that must stop the pipeline.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectivityDegraded { .. } | Self::Auth(_))
    }
}

impl From<serde_json::Error> for BotError {
    fn from(e: serde_json::Error) -> Self {
        Self::DataIntegrity(e.to_string())
    }
}

impl From<redis::RedisError> for BotError {
    fn from(e: redis::RedisError) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<std::io::Error> for BotError {
    fn from(e: std::io::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<config::ConfigError> for BotError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<reqwest::Error> for BotError {
    fn from(e: reqwest::Error) -> Self {
        match e.status().map(|s| s.as_u16()) {
            Some(429) => Self::RateLimited(e.to_string()),
            Some(401) | Some(403) => Self::Auth(e.to_string()),
            _ => Self::TransientNetwork(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BotError>;
