use crate::error::AppError;
use crate::market::bucket::datetime_from_ms;
use crate::market::types::Candlestick;
use crate::storage::CandlestickStorage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};

const SELECT_COLUMNS: &str = "SELECT symbol, exchange, open_time_ms, close_time_ms, open_price, high_price, low_price, close_price, volume, number_trades, candle_interval, created_at_ms FROM candlesticks";

fn decimal_column(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Decimal, AppError> {
    let raw: String = row.try_get(column)?;
    Ok(raw.parse::<Decimal>()?)
}

fn map_candlestick_row(row: &sqlx::sqlite::SqliteRow) -> Result<Candlestick, AppError> {
    let open_time_ms: i64 = row.try_get("open_time_ms")?;
    let close_time_ms: i64 = row.try_get("close_time_ms")?;
    let created_at_ms: i64 = row.try_get("created_at_ms")?;

    Ok(Candlestick {
        symbol: row.try_get("symbol")?,
        exchange: row.try_get("exchange")?,
        open_time: datetime_from_ms(open_time_ms)?,
        close_time: datetime_from_ms(close_time_ms)?,
        open: decimal_column(row, "open_price")?,
        high: decimal_column(row, "high_price")?,
        low: decimal_column(row, "low_price")?,
        close: decimal_column(row, "close_price")?,
        volume: decimal_column(row, "volume")?,
        number_of_trades: row.try_get("number_trades")?,
        interval: row.try_get("candle_interval")?,
        created_at: datetime_from_ms(created_at_ms)?,
    })
}

#[derive(Clone)]
pub struct CandlestickRepository {
    pool: SqlitePool,
}

impl CandlestickRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CandlestickStorage for CandlestickRepository {
    async fn save_candlesticks(&self, candles: &[Candlestick]) -> Result<(), AppError> {
        if candles.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for candle in candles {
            sqlx::query(
                "INSERT OR IGNORE INTO candlesticks (symbol, exchange, open_time_ms, close_time_ms, open_price, high_price, low_price, close_price, volume, number_trades, candle_interval, created_at_ms) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&candle.symbol)
            .bind(&candle.exchange)
            .bind(candle.open_time.timestamp_millis())
            .bind(candle.close_time.timestamp_millis())
            .bind(candle.open.to_string())
            .bind(candle.high.to_string())
            .bind(candle.low.to_string())
            .bind(candle.close.to_string())
            .bind(candle.volume.to_string())
            .bind(candle.number_of_trades)
            .bind(&candle.interval)
            .bind(candle.created_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn candlesticks(
        &self,
        exchange: &str,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candlestick>, AppError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE exchange = ? AND symbol = ? AND close_time_ms BETWEEN ? AND ? ORDER BY close_time_ms ASC"
        ))
        .bind(exchange)
        .bind(symbol)
        .bind(from.timestamp_millis())
        .bind(to.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_candlestick_row).collect()
    }

    async fn last_candlestick(
        &self,
        exchange: &str,
        symbol: &str,
        interval: &str,
    ) -> Result<Option<Candlestick>, AppError> {
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE exchange = ? AND symbol = ? AND candle_interval = ? ORDER BY close_time_ms DESC LIMIT 1"
        ))
        .bind(exchange)
        .bind(symbol)
        .bind(interval)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_candlestick_row).transpose()
    }
}

#[cfg(test)]
pub(crate) fn sample_candle(exchange: &str, close_offset_mins: i64) -> Candlestick {
    use chrono::{TimeDelta, TimeZone};

    let open_time = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let close_time = open_time + TimeDelta::minutes(close_offset_mins);
    Candlestick {
        symbol: "BTCUSDT".to_string(),
        exchange: exchange.to_string(),
        open_time,
        close_time,
        open: Decimal::from(100),
        high: Decimal::from(110),
        low: Decimal::from(95),
        close: Decimal::from(105),
        volume: "12.5".parse().unwrap(),
        number_of_trades: 42,
        interval: "1m".to_string(),
        created_at: close_time,
    }
}
