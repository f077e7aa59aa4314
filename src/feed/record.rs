use crate::config::InstrumentConfig;
use crate::error::{BotError, Result};
use crate::models::Tick;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// Per-tick record as published by the market-data feed
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedRecord {
    pub instrument_id: String,
    pub last_price: f64,
    #[serde(default)]
    pub volume: i64,
    /// Milliseconds since the Unix epoch. Receive time is used when absent.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// `NSE_INDEX|Nifty 50` → `NIFTY_50`
pub fn symbol_from_instrument_key(key: &str) -> String {
    let name = key.split_once('|').map(|(_, name)| name).unwrap_or(key);
    name.trim().replace(' ', "_").to_uppercase()
}

/// Maps provider instrument keys to bot symbols
#[derive(Debug, Clone, Default)]
pub struct InstrumentMap {
    by_key: HashMap<String, String>,
}

impl InstrumentMap {
    pub fn from_config(instruments: &[InstrumentConfig]) -> Self {
        Self {
            by_key: instruments
                .iter()
                .map(|i| (i.id.clone(), i.resolved_symbol()))
                .collect(),
        }
    }

    pub fn symbol(&self, key: &str) -> String {
        self.by_key
            .get(key)
            .cloned()
            .unwrap_or_else(|| symbol_from_instrument_key(key))
    }

    /// Instrument keys to subscribe to, in a stable order
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.by_key.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn to_tick(&self, record: &FeedRecord, received_at: DateTime<Utc>) -> Result<Tick> {
        if record.instrument_id.trim().is_empty() {
            return Err(BotError::DataIntegrity("record without instrumentId".into()));
        }
        if !record.last_price.is_finite() || record.last_price <= 0.0 {
            return Err(BotError::DataIntegrity(format!(
                "invalid lastPrice {} for {}",
                record.last_price, record.instrument_id
            )));
        }
        if record.volume < 0 {
            return Err(BotError::DataIntegrity(format!(
                "negative volume {} for {}",
                record.volume, record.instrument_id
            )));
        }
        let timestamp = match record.timestamp {
            Some(ms) => DateTime::from_timestamp_millis(ms).ok_or_else(|| {
                BotError::DataIntegrity(format!("timestamp {} out of range", ms))
            })?,
            None => received_at,
        };

        Ok(Tick {
            symbol: self.symbol(&record.instrument_id),
            last_price: record.last_price,
            volume: record.volume as f64,
            timestamp,
        })
    }
}

/// Decode one feed message into records.
///
/// Accepts a single record, an array of records, or the keyed envelope
/// `{"feeds": {"<instrument>": {"ltpc": {"ltp": .., "vol": .., "ltt": ..}}}}`.
/// Entries that fail to decode are returned as errors alongside the good ones
/// so the caller can drop and log them individually.
pub fn parse_message(text: &str) -> Vec<Result<FeedRecord>> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return vec![Err(BotError::DataIntegrity(format!("unparseable message: {}", e)))],
    };

    match value {
        Value::Array(items) => items.into_iter().map(decode_record).collect(),
        Value::Object(ref map) if map.contains_key("feeds") => match map.get("feeds") {
            Some(Value::Object(feeds)) => feeds
                .iter()
                .map(|(key, feed)| decode_envelope_entry(key, feed))
                .collect(),
            _ => vec![Err(BotError::DataIntegrity("feeds is not an object".into()))],
        },
        other => vec![decode_record(other)],
    }
}

fn decode_record(value: Value) -> Result<FeedRecord> {
    Ok(serde_json::from_value(value)?)
}

fn decode_envelope_entry(key: &str, feed: &Value) -> Result<FeedRecord> {
    let ltpc = feed
        .get("ltpc")
        .ok_or_else(|| BotError::DataIntegrity(format!("{} has no ltpc block", key)))?;
    let last_price = ltpc
        .get("ltp")
        .and_then(Value::as_f64)
        .ok_or_else(|| BotError::DataIntegrity(format!("{} has no ltp", key)))?;
    let volume = ltpc.get("vol").and_then(Value::as_i64).unwrap_or(0);
    let timestamp = ltpc.get("ltt").and_then(|v| match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    });

    Ok(FeedRecord {
        instrument_id: key.to_string(),
        last_price,
        volume,
        timestamp,
    })
}
