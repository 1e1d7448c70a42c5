use crate::error::AppError;
use crate::market::bucket::datetime_from_ms;
use crate::market::types::{MetricKind, PriceAggregation};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

fn map_aggregation_row(row: &sqlx::sqlite::SqliteRow) -> Result<PriceAggregation, AppError> {
    let metric_raw: String = row.try_get("metric")?;
    let updated_at_ms: i64 = row.try_get("updated_at_ms")?;

    Ok(PriceAggregation {
        symbol: row.try_get("symbol")?,
        exchange: row.try_get("exchange")?,
        metric: MetricKind::parse_str(&metric_raw)?,
        bucket_key: row.try_get("bucket_key")?,
        value: row.try_get("value")?,
        updated_at: datetime_from_ms(updated_at_ms)?,
    })
}

#[derive(Clone)]
pub struct AggregationRepository {
    pool: SqlitePool,
}

impl AggregationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upserts on (symbol, exchange, metric, bucket_key); the latest value wins.
    pub async fn save(&self, rows: &[PriceAggregation]) -> Result<(), AppError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for aggregation in rows {
            sqlx::query(
                "INSERT INTO price_aggregation (symbol, exchange, metric, bucket_key, value, updated_at_ms) VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(symbol, exchange, metric, bucket_key) DO UPDATE SET value=excluded.value, updated_at_ms=excluded.updated_at_ms",
            )
            .bind(&aggregation.symbol)
            .bind(&aggregation.exchange)
            .bind(aggregation.metric.as_str())
            .bind(&aggregation.bucket_key)
            .bind(&aggregation.value)
            .bind(aggregation.updated_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    /// Row with the greatest bucket key for the pair; bucket keys sort
    /// chronologically as text.
    pub async fn last_row(
        &self,
        metric: MetricKind,
        symbol: &str,
    ) -> Result<Option<PriceAggregation>, AppError> {
        let row = sqlx::query(
            "SELECT symbol, exchange, metric, bucket_key, value, updated_at_ms FROM price_aggregation \
             WHERE metric = ? AND symbol = ? \
             ORDER BY bucket_key DESC, updated_at_ms DESC LIMIT 1",
        )
        .bind(metric.as_str())
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_aggregation_row).transpose()
    }

    pub async fn list(
        &self,
        metric: MetricKind,
        symbol: &str,
    ) -> Result<Vec<PriceAggregation>, AppError> {
        let rows = sqlx::query(
            "SELECT symbol, exchange, metric, bucket_key, value, updated_at_ms FROM price_aggregation \
             WHERE metric = ? AND symbol = ? \
             ORDER BY bucket_key ASC, exchange ASC",
        )
        .bind(metric.as_str())
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_aggregation_row).collect()
    }

    /// Deletes rows last written strictly before `to`.
    pub async fn delete_old_rows(&self, to: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM price_aggregation WHERE updated_at_ms < ?")
            .bind(to.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use chrono::{TimeDelta, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn row(exchange: &str, bucket_key: &str, value: &str, updated_at: DateTime<Utc>) -> PriceAggregation {
        PriceAggregation {
            symbol: "BTCUSDT".to_string(),
            exchange: exchange.to_string(),
            metric: MetricKind::ChangeCoefficientDay,
            bucket_key: bucket_key.to_string(),
            value: value.to_string(),
            updated_at,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_value_for_same_bucket() {
        let repo = AggregationRepository::new(memory_pool().await);
        repo.save(&[row("binance", "2024-03-01 00:00:00", "1.50", t0())])
            .await
            .expect("first save should succeed");
        repo.save(&[row(
            "binance",
            "2024-03-01 00:00:00",
            "2.25",
            t0() + TimeDelta::minutes(5),
        )])
        .await
        .expect("second save should succeed");

        let rows = repo
            .list(MetricKind::ChangeCoefficientDay, "BTCUSDT")
            .await
            .expect("list should succeed");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, "2.25");
        assert_eq!(rows[0].updated_at, t0() + TimeDelta::minutes(5));
    }

    #[tokio::test]
    async fn last_row_picks_greatest_bucket_per_metric() {
        let repo = AggregationRepository::new(memory_pool().await);
        assert!(repo
            .last_row(MetricKind::ChangeCoefficientDay, "BTCUSDT")
            .await
            .unwrap()
            .is_none());

        repo.save(&[
            row("binance", "2024-03-02 00:00:00", "1.00", t0()),
            row("kraken", "2024-03-01 00:00:00", "3.00", t0() + TimeDelta::hours(1)),
        ])
        .await
        .expect("save should succeed");

        let last = repo
            .last_row(MetricKind::ChangeCoefficientDay, "BTCUSDT")
            .await
            .expect("query should succeed")
            .expect("a row should exist");
        assert_eq!(last.bucket_key, "2024-03-02 00:00:00");

        assert!(repo
            .last_row(MetricKind::ChangeCoefficientWeek, "BTCUSDT")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delete_keeps_rows_written_at_the_cutoff() {
        let repo = AggregationRepository::new(memory_pool().await);
        repo.save(&[
            row("binance", "2024-03-01 00:00:00", "1.00", t0() - TimeDelta::seconds(1)),
            row("kraken", "2024-03-01 00:00:00", "1.00", t0()),
        ])
        .await
        .expect("save should succeed");

        let deleted = repo.delete_old_rows(t0()).await.expect("delete should succeed");

        assert_eq!(deleted, 1);
        let remaining = repo
            .list(MetricKind::ChangeCoefficientDay, "BTCUSDT")
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].exchange, "kraken");
    }
}
