use crate::error::AppError;
use crate::market::types::{Candlestick, SymbolPrice};
use crate::storage::{CandlestickStorage, PriceStorage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

/// Writes go to the cache, then the durable store. Reads prefer the cache and
/// fall back to the durable store when it is empty or fails.
pub struct PriceComposite {
    fast: Arc<dyn PriceStorage>,
    durable: Arc<dyn PriceStorage>,
}

impl PriceComposite {
    pub fn new(fast: Arc<dyn PriceStorage>, durable: Arc<dyn PriceStorage>) -> Self {
        Self { fast, durable }
    }
}

#[async_trait]
impl PriceStorage for PriceComposite {
    async fn save_prices(&self, prices: &[SymbolPrice]) -> Result<(), AppError> {
        if prices.is_empty() {
            return Ok(());
        }

        if let Err(error) = self.fast.save_prices(prices).await {
            warn!(%error, "fast price storage rejected batch");
            return Err(error);
        }
        if let Err(error) = self.durable.save_prices(prices).await {
            warn!(%error, "durable price storage rejected batch");
            return Err(error);
        }

        Ok(())
    }

    async fn prices(&self, symbol: &str) -> Result<Vec<SymbolPrice>, AppError> {
        match self.fast.prices(symbol).await {
            Ok(prices) if !prices.is_empty() => return Ok(prices),
            Ok(_) => {}
            Err(error) => warn!(symbol, %error, "fast price storage read failed"),
        }

        self.durable.prices(symbol).await
    }
}

pub struct CandlestickComposite {
    fast: Arc<dyn CandlestickStorage>,
    durable: Arc<dyn CandlestickStorage>,
}

impl CandlestickComposite {
    pub fn new(fast: Arc<dyn CandlestickStorage>, durable: Arc<dyn CandlestickStorage>) -> Self {
        Self { fast, durable }
    }
}

#[async_trait]
impl CandlestickStorage for CandlestickComposite {
    async fn save_candlesticks(&self, candles: &[Candlestick]) -> Result<(), AppError> {
        if candles.is_empty() {
            return Ok(());
        }

        self.fast.save_candlesticks(candles).await?;
        self.durable.save_candlesticks(candles).await
    }

    async fn candlesticks(
        &self,
        exchange: &str,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candlestick>, AppError> {
        match self.fast.candlesticks(exchange, symbol, from, to).await {
            Ok(candles) if !candles.is_empty() => return Ok(candles),
            Ok(_) => {}
            Err(error) => warn!(exchange, symbol, %error, "fast candlestick storage read failed"),
        }

        self.durable.candlesticks(exchange, symbol, from, to).await
    }

    async fn last_candlestick(
        &self,
        exchange: &str,
        symbol: &str,
        interval: &str,
    ) -> Result<Option<Candlestick>, AppError> {
        match self.fast.last_candlestick(exchange, symbol, interval).await {
            Ok(Some(candle)) => return Ok(Some(candle)),
            Ok(None) => {}
            Err(error) => warn!(exchange, symbol, %error, "fast candlestick storage read failed"),
        }

        self.durable.last_candlestick(exchange, symbol, interval).await
    }
}
