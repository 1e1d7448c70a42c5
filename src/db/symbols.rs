use crate::error::AppError;
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct SymbolRepository {
    pool: SqlitePool,
}

impl SymbolRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Symbols quoted by at least `min_exchange_count` distinct exchanges in
    /// the raw price table.
    pub async fn popular_symbols(&self, min_exchange_count: u32) -> Result<Vec<String>, AppError> {
        let symbols = sqlx::query_scalar::<_, String>(
            "SELECT symbol FROM prices GROUP BY symbol HAVING COUNT(DISTINCT exchange) >= ? ORDER BY symbol ASC",
        )
        .bind(i64::from(min_exchange_count))
        .fetch_all(&self.pool)
        .await?;

        Ok(symbols)
    }

    /// Every symbol with raw prices or detected changes, most active first.
    pub async fn list(&self) -> Result<Vec<String>, AppError> {
        let symbols = sqlx::query_scalar::<_, String>(
            "SELECT symbol FROM ( \
                SELECT symbol FROM prices \
                UNION ALL \
                SELECT symbol FROM price_changes \
             ) GROUP BY symbol ORDER BY COUNT(*) DESC, symbol ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(symbols)
    }
}
