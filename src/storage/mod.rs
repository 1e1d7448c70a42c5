pub mod cache;
pub mod composite;

use crate::error::AppError;
use crate::market::types::{Candlestick, SymbolPrice};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use cache::{CandlestickCache, PriceCache};
pub use composite::{CandlestickComposite, PriceComposite};

/// Capability shared by the in-memory cache, the durable store and the
/// composite layering the two.
#[async_trait]
pub trait PriceStorage: Send + Sync {
    async fn save_prices(&self, prices: &[SymbolPrice]) -> Result<(), AppError>;

    /// Most recent batch of quotes for `symbol`, one entry per exchange.
    async fn prices(&self, symbol: &str) -> Result<Vec<SymbolPrice>, AppError>;
}

#[async_trait]
pub trait CandlestickStorage: Send + Sync {
    async fn save_candlesticks(&self, candles: &[Candlestick]) -> Result<(), AppError>;

    async fn candlesticks(
        &self,
        exchange: &str,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candlestick>, AppError>;

    async fn last_candlestick(
        &self,
        exchange: &str,
        symbol: &str,
        interval: &str,
    ) -> Result<Option<Candlestick>, AppError>;
}
