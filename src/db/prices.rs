use crate::error::AppError;
use crate::market::bucket::datetime_from_ms;
use crate::market::types::SymbolPrice;
use crate::storage::PriceStorage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};

fn map_price_row(row: &sqlx::sqlite::SqliteRow) -> Result<SymbolPrice, AppError> {
    let price_raw: String = row.try_get("price")?;
    let timestamp_ms: i64 = row.try_get("timestamp_ms")?;

    Ok(SymbolPrice {
        exchange: row.try_get("exchange")?,
        symbol: row.try_get("symbol")?,
        price: price_raw.parse::<Decimal>()?,
        timestamp: datetime_from_ms(timestamp_ms)?,
    })
}

/// Raw quotes as they arrived from the loader, one row per
/// (price, symbol, exchange, timestamp).
#[derive(Clone)]
pub struct PriceRepository {
    pool: SqlitePool,
}

impl PriceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_prices(&self, prices: &[SymbolPrice]) -> Result<(), AppError> {
        self.insert_prices_at(prices, Utc::now()).await
    }

    /// Rows sharing `ingested_at` form one batch for [`Self::latest_prices`].
    pub async fn insert_prices_at(
        &self,
        prices: &[SymbolPrice],
        ingested_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        if prices.is_empty() {
            return Ok(());
        }

        let ingested_at_ms = ingested_at.timestamp_millis();
        let mut tx = self.pool.begin().await?;
        for price in prices {
            sqlx::query(
                "INSERT OR IGNORE INTO prices (exchange, symbol, price, timestamp_ms, ingested_at_ms) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&price.exchange)
            .bind(&price.symbol)
            .bind(price.price.to_string())
            .bind(price.timestamp.timestamp_millis())
            .bind(ingested_at_ms)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    pub async fn latest_prices(&self, symbol: &str) -> Result<Vec<SymbolPrice>, AppError> {
        let rows = sqlx::query(
            "SELECT exchange, symbol, price, timestamp_ms FROM prices \
             WHERE symbol = ? AND ingested_at_ms = (SELECT MAX(ingested_at_ms) FROM prices WHERE symbol = ?) \
             ORDER BY exchange ASC, timestamp_ms DESC",
        )
        .bind(symbol)
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_price_row).collect()
    }

    pub async fn first_datetime(&self, symbol: &str) -> Result<Option<DateTime<Utc>>, AppError> {
        let first_ms = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MIN(timestamp_ms) FROM prices WHERE symbol = ?",
        )
        .bind(symbol)
        .fetch_one(&self.pool)
        .await?;

        first_ms.map(datetime_from_ms).transpose()
    }

    /// Samples with `from <= timestamp <= to`, oldest first.
    pub async fn symbol_prices(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SymbolPrice>, AppError> {
        let rows = sqlx::query(
            "SELECT exchange, symbol, price, timestamp_ms FROM prices \
             WHERE symbol = ? AND timestamp_ms BETWEEN ? AND ? \
             ORDER BY timestamp_ms ASC, id ASC",
        )
        .bind(symbol)
        .bind(from.timestamp_millis())
        .bind(to.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_price_row).collect()
    }

    /// Deletes `from <= timestamp < to`.
    pub async fn delete_prices(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            "DELETE FROM prices WHERE symbol = ? AND timestamp_ms >= ? AND timestamp_ms < ?",
        )
        .bind(symbol)
        .bind(from.timestamp_millis())
        .bind(to.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn delete_old_prices(&self, symbol: &str, to: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM prices WHERE symbol = ? AND timestamp_ms < ?")
            .bind(symbol)
            .bind(to.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn clear_old_prices(&self, to: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM prices WHERE timestamp_ms < ?")
            .bind(to.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PriceStorage for PriceRepository {
    async fn save_prices(&self, prices: &[SymbolPrice]) -> Result<(), AppError> {
        self.insert_prices(prices).await
    }

    async fn prices(&self, symbol: &str) -> Result<Vec<SymbolPrice>, AppError> {
        self.latest_prices(symbol).await
    }
}
