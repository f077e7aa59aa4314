use super::SnapshotStore;
use crate::error::{BotError, Result};
use crate::market::SessionSnapshot;
use crate::models::TrendCandle;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::BTreeMap;
use tokio::time::{timeout, Duration};

/// Snapshot in Redis.
///
/// Each symbol's candles live in the sorted set `{prefix}:{symbol}` scored by
/// timestamp; `{prefix}:symbols` lists the symbols and `{prefix}:taken_at`
/// holds the snapshot time.
pub struct RedisSnapshotStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisSnapshotStore {
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `prefix` - Key prefix for this bot's snapshot
    pub async fn new(redis_url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = Client::open(redis_url)?;

        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| BotError::Persistence("Redis connection timeout after 5 seconds".into()))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            prefix: prefix.into(),
        })
    }

    fn symbol_key(&self, symbol: &str) -> String {
        format!("{}:{}", self.prefix, symbol)
    }

    fn symbols_key(&self) -> String {
        format!("{}:symbols", self.prefix)
    }

    fn taken_at_key(&self) -> String {
        format!("{}:taken_at", self.prefix)
    }
}

#[async_trait]
impl SnapshotStore for RedisSnapshotStore {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let mut conn = self.conn.clone();

        // Replace the previous snapshot atomically
        let previous: Vec<String> = conn.smembers(self.symbols_key()).await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for symbol in &previous {
            pipe.del(self.symbol_key(symbol)).ignore();
        }
        pipe.del(self.symbols_key()).ignore();

        for (symbol, candles) in &snapshot.histories {
            let key = self.symbol_key(symbol);
            for candle in candles {
                let value = serde_json::to_string(candle)
                    .map_err(|e| BotError::Persistence(e.to_string()))?;
                pipe.zadd(&key, value, candle.timestamp.timestamp_millis())
                    .ignore();
            }
            pipe.sadd(self.symbols_key(), symbol).ignore();
        }
        pipe.set(self.taken_at_key(), snapshot.taken_at.to_rfc3339())
            .ignore();

        let _: () = pipe.query_async(&mut conn).await?;

        tracing::debug!(
            "Saved snapshot of {} candles across {} symbols to Redis",
            snapshot.candle_count(),
            snapshot.histories.len()
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<SessionSnapshot>> {
        let mut conn = self.conn.clone();

        let taken_at: Option<String> = conn.get(self.taken_at_key()).await?;
        let Some(taken_at) = taken_at else {
            return Ok(None);
        };
        let taken_at = DateTime::parse_from_rfc3339(&taken_at)
            .map_err(|e| BotError::Persistence(format!("bad taken_at: {}", e)))?
            .with_timezone(&Utc);

        let symbols: Vec<String> = conn.smembers(self.symbols_key()).await?;
        let mut histories = BTreeMap::new();
        for symbol in symbols {
            let raw: Vec<String> = conn.zrange(self.symbol_key(&symbol), 0, -1).await?;
            let candles = raw
                .iter()
                .map(|json| serde_json::from_str::<TrendCandle>(json))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| BotError::Persistence(e.to_string()))?;
            histories.insert(symbol, candles);
        }

        tracing::info!(
            "Loaded snapshot of {} symbols from Redis (taken {})",
            histories.len(),
            taken_at
        );
        Ok(Some(SessionSnapshot {
            taken_at,
            histories,
        }))
    }

    fn name(&self) -> &str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snapshot() -> SessionSnapshot {
        let start = Utc.with_ymd_and_hms(2026, 10, 19, 4, 0, 0).unwrap();
        let candles = (0..3)
            .map(|i| TrendCandle {
                symbol: "TEST_SNAPSHOT".to_string(),
                open: 100.0 + i as f64,
                high: 102.0 + i as f64,
                low: 99.0 + i as f64,
                close: 101.0 + i as f64 / 3.0,
                timestamp: start + chrono::Duration::minutes(i),
            })
            .collect();
        let mut histories = BTreeMap::new();
        histories.insert("TEST_SNAPSHOT".to_string(), candles);
        SessionSnapshot {
            taken_at: start,
            histories,
        }
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_connection_timeout() {
        let result = RedisSnapshotStore::new("redis://192.0.2.1:6379", "trendbot:test").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_save_and_load_snapshot() {
        let store = RedisSnapshotStore::new("redis://127.0.0.1:6379", "trendbot:test")
            .await
            .expect("Failed to connect to Redis");

        let original = snapshot();
        store.save(&original).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();

        assert_eq!(loaded, original);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_save_replaces_previous_symbols() {
        let store = RedisSnapshotStore::new("redis://127.0.0.1:6379", "trendbot:test-replace")
            .await
            .expect("Failed to connect to Redis");

        store.save(&snapshot()).await.unwrap();
        let empty = SessionSnapshot {
            taken_at: Utc::now(),
            histories: BTreeMap::new(),
        };
        store.save(&empty).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert!(loaded.histories.is_empty());
    }
}
