use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::StorageError;
use crate::indicators::{IndicatorEntry, IndicatorSeries};
use crate::market_data::{Candle, CandleKey};
use crate::storage::StorageAdapter;

type IndicatorKey = (String, String, usize);

/// Process-local store, used when no database path is configured and in
/// tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    candles: RwLock<HashMap<CandleKey, BTreeMap<i64, Candle>>>,
    indicators: RwLock<HashMap<IndicatorKey, BTreeMap<i64, f64>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn candle_count(&self, key: &CandleKey) -> usize {
        self.candles.read().get(key).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl StorageAdapter for MemoryStore {
    async fn save_candles(&self, key: &CandleKey, candles: &[Candle]) -> Result<(), StorageError> {
        let mut all = self.candles.write();
        let series = all.entry(key.clone()).or_default();
        for candle in candles {
            series.insert(candle.open_time, candle.clone());
        }
        Ok(())
    }

    async fn load_candles(
        &self,
        key: &CandleKey,
        from: i64,
        to: i64,
    ) -> Result<Vec<Candle>, StorageError> {
        let all = self.candles.read();
        let Some(series) = all.get(key) else {
            return Ok(Vec::new());
        };
        Ok(series
            .range(from..)
            .map(|(_, c)| c)
            .filter(|c| c.close_time <= to)
            .cloned()
            .collect())
    }

    async fn save_indicator_results(
        &self,
        symbol: &str,
        series: &IndicatorSeries,
    ) -> Result<(), StorageError> {
        let key = (symbol.to_uppercase(), series.name.clone(), series.period);
        let mut all = self.indicators.write();
        let stored = all.entry(key).or_default();
        for entry in &series.entries {
            stored.insert(entry.timestamp, entry.value);
        }
        Ok(())
    }

    async fn query_indicator(
        &self,
        symbol: &str,
        indicator: &str,
        period: usize,
        from: i64,
        to: i64,
    ) -> Result<Vec<IndicatorEntry>, StorageError> {
        if from > to {
            return Ok(Vec::new());
        }
        let key = (symbol.to_uppercase(), indicator.to_string(), period);
        let all = self.indicators.read();
        Ok(all
            .get(&key)
            .map(|stored| {
                stored
                    .range(from..=to)
                    .map(|(&timestamp, &value)| IndicatorEntry { timestamp, value })
                    .collect()
            })
            .unwrap_or_default())
    }
}
