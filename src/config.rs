use crate::error::AppError;
use crate::storage::cache::DEFAULT_SERIES_CAPACITY;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DB_PATH: &str = "price-analyst.db";
pub const DEFAULT_CALCULATE_INTERVAL_SECS: u64 = 300;
pub const MIN_CALCULATE_INTERVAL_SECS: u64 = 1;
pub const MAX_CALCULATE_INTERVAL_SECS: u64 = 86_400;
pub const DEFAULT_AGGREGATE_INTERVAL_SECS: u64 = 3_600;
pub const MIN_AGGREGATE_INTERVAL_SECS: u64 = 1;
pub const MAX_AGGREGATE_INTERVAL_SECS: u64 = 86_400;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3_600;
pub const MIN_CLEANUP_INTERVAL_SECS: u64 = 60;
pub const MAX_CLEANUP_INTERVAL_SECS: u64 = 86_400;
pub const DEFAULT_RETENTION_INTERVAL_SECS: u64 = 86_400;
pub const MIN_RETENTION_INTERVAL_SECS: u64 = 60;
pub const MAX_RETENTION_INTERVAL_SECS: u64 = 604_800;
pub const DEFAULT_MIN_EXCHANGES: u32 = 3;
pub const MIN_MIN_EXCHANGES: u32 = 1;
pub const MAX_MIN_EXCHANGES: u32 = 64;
pub const DEFAULT_CACHE_CAPACITY: usize = DEFAULT_SERIES_CAPACITY;
pub const MIN_CACHE_CAPACITY: usize = 1;
pub const MAX_CACHE_CAPACITY: usize = 100_000;
pub const DEFAULT_STDIN_FEED: bool = false;

const ENV_PREFIX: &str = "PRICE_ANALYST_";

#[derive(Debug, Clone, Default)]
pub struct PipelineArgs {
    pub db_path: Option<String>,
    pub calculate_interval_secs: Option<u64>,
    pub aggregate_interval_secs: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
    pub retention_interval_secs: Option<u64>,
    pub min_exchanges: Option<u32>,
    pub cache_capacity: Option<usize>,
    pub stdin_feed: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub db_path: PathBuf,
    pub calculate_interval: Duration,
    pub aggregate_interval: Duration,
    pub cleanup_interval: Duration,
    pub retention_interval: Duration,
    pub min_exchanges: u32,
    pub cache_capacity: usize,
    pub stdin_feed: bool,
}

fn parse_value<T: FromStr>(name: &str, raw: Option<String>) -> Result<Option<T>, AppError> {
    let Some(value) = raw
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    else {
        return Ok(None);
    };

    value
        .parse::<T>()
        .map(Some)
        .map_err(|_| AppError::InvalidArgument(format!("{ENV_PREFIX}{name} has invalid value '{value}'")))
}

fn checked_secs(name: &str, value: u64, min: u64, max: u64) -> Result<Duration, AppError> {
    if !(min..=max).contains(&value) {
        return Err(AppError::InvalidArgument(format!(
            "{name} must be between {min} and {max} seconds"
        )));
    }
    Ok(Duration::from_secs(value))
}

impl PipelineArgs {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    /// `lookup` receives variable names without the `PRICE_ANALYST_` prefix.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            db_path: parse_value("DB_PATH", lookup("DB_PATH"))?,
            calculate_interval_secs: parse_value(
                "CALCULATE_INTERVAL_SECS",
                lookup("CALCULATE_INTERVAL_SECS"),
            )?,
            aggregate_interval_secs: parse_value(
                "AGGREGATE_INTERVAL_SECS",
                lookup("AGGREGATE_INTERVAL_SECS"),
            )?,
            cleanup_interval_secs: parse_value(
                "CLEANUP_INTERVAL_SECS",
                lookup("CLEANUP_INTERVAL_SECS"),
            )?,
            retention_interval_secs: parse_value(
                "RETENTION_INTERVAL_SECS",
                lookup("RETENTION_INTERVAL_SECS"),
            )?,
            min_exchanges: parse_value("MIN_EXCHANGES", lookup("MIN_EXCHANGES"))?,
            cache_capacity: parse_value("CACHE_CAPACITY", lookup("CACHE_CAPACITY"))?,
            stdin_feed: parse_value("STDIN_FEED", lookup("STDIN_FEED"))?,
        })
    }

    pub fn normalize(self) -> Result<PipelineConfig, AppError> {
        let db_path = PathBuf::from(self.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()));

        let calculate_interval = checked_secs(
            "calculateIntervalSecs",
            self.calculate_interval_secs
                .unwrap_or(DEFAULT_CALCULATE_INTERVAL_SECS),
            MIN_CALCULATE_INTERVAL_SECS,
            MAX_CALCULATE_INTERVAL_SECS,
        )?;
        let aggregate_interval = checked_secs(
            "aggregateIntervalSecs",
            self.aggregate_interval_secs
                .unwrap_or(DEFAULT_AGGREGATE_INTERVAL_SECS),
            MIN_AGGREGATE_INTERVAL_SECS,
            MAX_AGGREGATE_INTERVAL_SECS,
        )?;
        let cleanup_interval = checked_secs(
            "cleanupIntervalSecs",
            self.cleanup_interval_secs
                .unwrap_or(DEFAULT_CLEANUP_INTERVAL_SECS),
            MIN_CLEANUP_INTERVAL_SECS,
            MAX_CLEANUP_INTERVAL_SECS,
        )?;
        let retention_interval = checked_secs(
            "retentionIntervalSecs",
            self.retention_interval_secs
                .unwrap_or(DEFAULT_RETENTION_INTERVAL_SECS),
            MIN_RETENTION_INTERVAL_SECS,
            MAX_RETENTION_INTERVAL_SECS,
        )?;

        let min_exchanges = self.min_exchanges.unwrap_or(DEFAULT_MIN_EXCHANGES);
        if !(MIN_MIN_EXCHANGES..=MAX_MIN_EXCHANGES).contains(&min_exchanges) {
            return Err(AppError::InvalidArgument(format!(
                "minExchanges must be between {MIN_MIN_EXCHANGES} and {MAX_MIN_EXCHANGES}"
            )));
        }

        let cache_capacity = self.cache_capacity.unwrap_or(DEFAULT_CACHE_CAPACITY);
        if !(MIN_CACHE_CAPACITY..=MAX_CACHE_CAPACITY).contains(&cache_capacity) {
            return Err(AppError::InvalidArgument(format!(
                "cacheCapacity must be between {MIN_CACHE_CAPACITY} and {MAX_CACHE_CAPACITY}"
            )));
        }

        Ok(PipelineConfig {
            db_path,
            calculate_interval,
            aggregate_interval,
            cleanup_interval,
            retention_interval,
            min_exchanges,
            cache_capacity,
            stdin_feed: self.stdin_feed.unwrap_or(DEFAULT_STDIN_FEED),
        })
    }
}
