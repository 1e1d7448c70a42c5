use crate::error::AppError;
use crate::market::bucket::truncate_to_second;
use crate::market::types::{exchange_symbol_key, Candlestick, SymbolPrice};
use crate::storage::{CandlestickStorage, PriceStorage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;

pub const DEFAULT_SERIES_CAPACITY: usize = 1500;

/// Bounded per-(exchange, symbol) history plus a snapshot of the most recent
/// batch per symbol. The two maps have independent locks.
pub struct PriceCache {
    capacity: NonZeroUsize,
    series: Mutex<HashMap<String, LruCache<DateTime<Utc>, SymbolPrice>>>,
    last_prices: Mutex<HashMap<String, Vec<SymbolPrice>>>,
}

impl PriceCache {
    pub fn new(capacity: usize) -> Result<Self, AppError> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            AppError::InvalidArgument("cache capacity must be greater than zero".to_string())
        })?;

        Ok(Self {
            capacity,
            series: Mutex::new(HashMap::new()),
            last_prices: Mutex::new(HashMap::new()),
        })
    }

    /// Cached history for one pair, most recent first.
    pub fn exchange_symbol_prices(&self, exchange: &str, symbol: &str) -> Vec<SymbolPrice> {
        let series = self.series.lock();
        series
            .get(&exchange_symbol_key(exchange, symbol))
            .map(|entries| entries.iter().map(|(_, price)| price.clone()).collect())
            .unwrap_or_default()
    }

    pub fn cached_symbols(&self) -> usize {
        self.last_prices.lock().len()
    }
}

#[async_trait]
impl PriceStorage for PriceCache {
    async fn save_prices(&self, prices: &[SymbolPrice]) -> Result<(), AppError> {
        if prices.is_empty() {
            return Ok(());
        }

        {
            let mut series = self.series.lock();
            for price in prices {
                series
                    .entry(price.cache_key())
                    .or_insert_with(|| LruCache::new(self.capacity))
                    .put(truncate_to_second(price.timestamp), price.clone());
            }
        }

        let mut snapshot: HashMap<String, Vec<SymbolPrice>> = HashMap::new();
        for price in prices {
            snapshot
                .entry(price.symbol.clone())
                .or_default()
                .push(price.clone());
        }
        *self.last_prices.lock() = snapshot;

        Ok(())
    }

    async fn prices(&self, symbol: &str) -> Result<Vec<SymbolPrice>, AppError> {
        Ok(self
            .last_prices
            .lock()
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }
}

type CandleKey = (String, String, String);

/// Keeps only the newest candle per (exchange, symbol, interval).
#[derive(Default)]
pub struct CandlestickCache {
    latest: Mutex<HashMap<CandleKey, Candlestick>>,
}

impl CandlestickCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CandlestickStorage for CandlestickCache {
    async fn save_candlesticks(&self, candles: &[Candlestick]) -> Result<(), AppError> {
        let mut latest = self.latest.lock();
        for candle in candles {
            let key = (
                candle.exchange.clone(),
                candle.symbol.clone(),
                candle.interval.clone(),
            );
            let is_newer = latest
                .get(&key)
                .map_or(true, |current| current.close_time < candle.close_time);
            if is_newer {
                latest.insert(key, candle.clone());
            }
        }

        Ok(())
    }

    // Range history only lives in the durable store.
    async fn candlesticks(
        &self,
        _exchange: &str,
        _symbol: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<Candlestick>, AppError> {
        Ok(Vec::new())
    }

    async fn last_candlestick(
        &self,
        exchange: &str,
        symbol: &str,
        interval: &str,
    ) -> Result<Option<Candlestick>, AppError> {
        let key = (exchange.to_string(), symbol.to_string(), interval.to_string());
        Ok(self.latest.lock().get(&key).cloned())
    }
}
