use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decimal parse error: {0}")]
    Decimal(#[from] rust_decimal::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(#[from] chrono::ParseError),
    #[error("timestamp out of range: {0}")]
    TimestampRange(i64),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("cancelled while retrying")]
    Cancelled,
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: AppError,
    },
}
