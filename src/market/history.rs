use crate::error::{BotError, Result};
use crate::models::TrendCandle;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock};

/// Bounded, strictly time-ordered trend candle history for one symbol
#[derive(Debug, Clone, PartialEq)]
pub struct CandleHistory {
    candles: VecDeque<TrendCandle>,
    capacity: usize,
}

impl CandleHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append a candle, evicting the oldest beyond capacity.
    ///
    /// Rejects candles that do not advance the timestamp.
    pub fn push(&mut self, candle: TrendCandle) -> Result<()> {
        if let Some(last) = self.candles.back() {
            if candle.timestamp <= last.timestamp {
                return Err(BotError::DataIntegrity(format!(
                    "{} candle at {} does not advance history (last {})",
                    candle.symbol, candle.timestamp, last.timestamp
                )));
            }
        }

        self.candles.push_back(candle);
        while self.candles.len() > self.capacity {
            self.candles.pop_front();
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&TrendCandle> {
        self.candles.back()
    }

    pub fn to_vec(&self) -> Vec<TrendCandle> {
        self.candles.iter().cloned().collect()
    }
}

/// Candle histories captured across a reconnect or a restart
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSnapshot {
    pub taken_at: DateTime<Utc>,
    pub histories: BTreeMap<String, Vec<TrendCandle>>,
}

impl SessionSnapshot {
    pub fn candle_count(&self) -> usize {
        self.histories.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.candle_count() == 0
    }

    /// Keep only candles whose timestamp falls on `day` under `to_day`
    pub fn retain_day<F>(&mut self, day: NaiveDate, to_day: F)
    where
        F: Fn(DateTime<Utc>) -> NaiveDate,
    {
        for candles in self.histories.values_mut() {
            candles.retain(|c| to_day(c.timestamp) == day);
        }
        self.histories.retain(|_, candles| !candles.is_empty());
    }
}

/// Shared per-symbol candle histories.
///
/// Cloning is cheap; all clones see the same data. The market session is the
/// only writer, everyone else reads.
#[derive(Clone)]
pub struct CandleStore {
    data: Arc<RwLock<HashMap<String, CandleHistory>>>,
    capacity: usize,
}

impl CandleStore {
    /// # Arguments
    /// * `capacity` - Maximum number of trend candles kept per symbol
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, candle: TrendCandle) -> Result<()> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.entry(candle.symbol.clone())
            .or_insert_with(|| CandleHistory::new(self.capacity))
            .push(candle)
    }

    /// All candles for a symbol, oldest first
    pub fn candles(&self, symbol: &str) -> Result<Vec<TrendCandle>> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.get(symbol).map(CandleHistory::to_vec).unwrap_or_default())
    }

    pub fn last(&self, symbol: &str) -> Result<Option<TrendCandle>> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.get(symbol).and_then(|h| h.last().cloned()))
    }

    pub fn candle_count(&self, symbol: &str) -> Result<usize> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.get(symbol).map(CandleHistory::len).unwrap_or(0))
    }

    pub fn symbols(&self) -> Result<Vec<String>> {
        let data = self.data.read().map_err(poisoned)?;
        let mut symbols: Vec<String> = data.keys().cloned().collect();
        symbols.sort();
        Ok(symbols)
    }

    pub fn snapshot(&self, taken_at: DateTime<Utc>) -> Result<SessionSnapshot> {
        let data = self.data.read().map_err(poisoned)?;
        let histories = data
            .iter()
            .filter(|(_, h)| !h.is_empty())
            .map(|(symbol, h)| (symbol.clone(), h.to_vec()))
            .collect();
        Ok(SessionSnapshot {
            taken_at,
            histories,
        })
    }

    /// Replace the histories of every symbol in the snapshot. Other symbols are left as they are.
    ///
    /// A symbol whose stored history already reaches the snapshot's last
    /// candle (or beyond) keeps its history: the snapshot is older than what
    /// the store has seen and would roll it back.
    ///
    /// Returns the number of candles restored.
    pub fn restore(&self, snapshot: &SessionSnapshot) -> Result<usize> {
        let current_last: HashMap<String, DateTime<Utc>> = {
            let data = self.data.read().map_err(poisoned)?;
            data.iter()
                .filter_map(|(symbol, h)| h.last().map(|c| (symbol.clone(), c.timestamp)))
                .collect()
        };

        let mut rebuilt = HashMap::with_capacity(snapshot.histories.len());
        for (symbol, candles) in &snapshot.histories {
            let Some(snapshot_last) = candles.last().map(|c| c.timestamp) else {
                continue;
            };
            if let Some(held) = current_last.get(symbol) {
                if *held >= snapshot_last {
                    tracing::info!(
                        symbol = %symbol,
                        held = %held,
                        snapshot = %snapshot_last,
                        "history newer than snapshot, keeping it"
                    );
                    continue;
                }
            }

            let mut history = CandleHistory::new(self.capacity);
            for candle in candles {
                if candle.symbol != *symbol {
                    return Err(BotError::DataIntegrity(format!(
                        "snapshot candle for {} filed under {}",
                        candle.symbol, symbol
                    )));
                }
                history.push(candle.clone())?;
            }
            rebuilt.insert(symbol.clone(), history);
        }

        let restored = rebuilt.values().map(CandleHistory::len).sum();
        let mut data = self.data.write().map_err(poisoned)?;
        data.extend(rebuilt);
        Ok(restored)
    }

    pub fn clear_symbol(&self, symbol: &str) -> Result<()> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.remove(symbol);
        Ok(())
    }

    pub fn clear_all(&self) -> Result<()> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.clear();
        Ok(())
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> BotError {
    BotError::DataIntegrity(format!("candle store lock poisoned: {}", e))
}
