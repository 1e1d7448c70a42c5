pub mod aggregation;
pub mod candlesticks;
pub mod price_changes;
pub mod prices;
pub mod symbols;

use crate::error::AppError;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::Path;

pub use aggregation::AggregationRepository;
pub use candlesticks::CandlestickRepository;
pub use price_changes::PriceChangeRepository;
pub use prices::PriceRepository;
pub use symbols::SymbolRepository;

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn initialize_pool_from_path(path: &Path) -> Result<SqlitePool, AppError> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let connect_options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(connect_options).await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database; every connection to `:memory:` is a
/// separate database, so the pool must never open a second one.
#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite should initialize");

    run_migrations(&pool)
        .await
        .expect("migrations should apply to in-memory sqlite");

    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn unique_db_path() -> PathBuf {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock should be after unix epoch")
            .as_nanos();

        std::env::temp_dir()
            .join(format!("price-analyst-{timestamp}"))
            .join("analyst.db")
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db_path = unique_db_path();

        let pool = initialize_pool_from_path(&db_path)
            .await
            .expect("pool initialization should succeed");

        run_migrations(&pool)
            .await
            .expect("running migrations multiple times should succeed");

        for table in ["prices", "price_changes", "price_aggregation", "candlesticks"] {
            let rows = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&pool)
                .await
                .expect("table must exist and be queryable");
            assert_eq!(rows, 0, "{table} should start empty");
        }

        drop(pool);
        if let Some(dir) = db_path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
