use crate::error::AppError;
use crate::market::bucket::datetime_from_ms;
use crate::market::types::PriceChange;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};

const SELECT_COLUMNS: &str =
    "SELECT symbol, exchange, timestamp_ms, coefficient_change, price, prev_price, created_at_ms FROM price_changes";

fn map_price_change_row(row: &sqlx::sqlite::SqliteRow) -> Result<PriceChange, AppError> {
    let price_raw: String = row.try_get("price")?;
    let prev_price_raw: String = row.try_get("prev_price")?;
    let timestamp_ms: i64 = row.try_get("timestamp_ms")?;
    let created_at_ms: i64 = row.try_get("created_at_ms")?;

    Ok(PriceChange {
        timestamp: datetime_from_ms(timestamp_ms)?,
        symbol: row.try_get("symbol")?,
        exchange: row.try_get("exchange")?,
        coefficient_of_change: row.try_get("coefficient_change")?,
        price: price_raw.parse::<Decimal>()?,
        previous_price: prev_price_raw.parse::<Decimal>()?,
        created_at: datetime_from_ms(created_at_ms)?,
    })
}

#[derive(Clone)]
pub struct PriceChangeRepository {
    pool: SqlitePool,
}

impl PriceChangeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Existing (symbol, exchange, timestamp) rows are kept untouched. Returns
    /// the number of rows actually inserted.
    pub async fn save(&self, changes: &[PriceChange]) -> Result<u64, AppError> {
        if changes.is_empty() {
            return Ok(0);
        }

        let mut inserted = 0;
        let mut tx = self.pool.begin().await?;
        for change in changes {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO price_changes (symbol, exchange, timestamp_ms, coefficient_change, price, prev_price, created_at_ms) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&change.symbol)
            .bind(&change.exchange)
            .bind(change.timestamp.timestamp_millis())
            .bind(change.coefficient_of_change)
            .bind(change.price.to_string())
            .bind(change.previous_price.to_string())
            .bind(change.created_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;

        Ok(inserted)
    }

    /// Rows with `from <= timestamp <= to` across all exchanges, oldest first.
    pub async fn list(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PriceChange>, AppError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE symbol = ? AND timestamp_ms BETWEEN ? AND ? ORDER BY timestamp_ms ASC, exchange ASC"
        ))
        .bind(symbol)
        .bind(from.timestamp_millis())
        .bind(to.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_price_change_row).collect()
    }

    /// Newest first.
    pub async fn changes(
        &self,
        exchange: &str,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PriceChange>, AppError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE exchange = ? AND symbol = ? AND timestamp_ms BETWEEN ? AND ? ORDER BY timestamp_ms DESC"
        ))
        .bind(exchange)
        .bind(symbol)
        .bind(from.timestamp_millis())
        .bind(to.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_price_change_row).collect()
    }

    pub async fn last_created_at(&self, symbol: &str) -> Result<Option<DateTime<Utc>>, AppError> {
        let last_ms = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(created_at_ms) FROM price_changes WHERE symbol = ?",
        )
        .bind(symbol)
        .fetch_one(&self.pool)
        .await?;

        last_ms.map(datetime_from_ms).transpose()
    }

    pub async fn first_timestamp(&self) -> Result<Option<DateTime<Utc>>, AppError> {
        let first_ms =
            sqlx::query_scalar::<_, Option<i64>>("SELECT MIN(timestamp_ms) FROM price_changes")
                .fetch_one(&self.pool)
                .await?;

        first_ms.map(datetime_from_ms).transpose()
    }

    pub async fn delete_old_rows(&self, to: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM price_changes WHERE timestamp_ms < ?")
            .bind(to.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
