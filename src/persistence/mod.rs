// Session snapshot persistence
pub mod redis_store;

pub use redis_store::RedisSnapshotStore;

use crate::error::{BotError, Result};
use crate::market::SessionSnapshot;
use async_trait::async_trait;
use std::path::PathBuf;

/// Durable home for candle-history snapshots taken before a supervised
/// disconnect, read back to warm the next session.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()>;

    async fn load(&self) -> Result<Option<SessionSnapshot>>;

    fn name(&self) -> &str;
}

/// Snapshot as a single JSON document on disk
pub struct JsonFileSnapshotStore {
    path: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotStore for JsonFileSnapshotStore {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        // Write-then-rename so a crash never leaves a truncated snapshot
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec(snapshot)
            .map_err(|e| BotError::Persistence(format!("encode snapshot: {}", e)))?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        tracing::debug!(
            path = %self.path.display(),
            candles = snapshot.candle_count(),
            "snapshot written"
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<SessionSnapshot>> {
        let body = match tokio::fs::read(&self.path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot = serde_json::from_slice(&body)
            .map_err(|e| BotError::Persistence(format!("decode snapshot: {}", e)))?;
        Ok(Some(snapshot))
    }

    fn name(&self) -> &str {
        "json-file"
    }
}
