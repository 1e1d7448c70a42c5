use crate::db::{AggregationRepository, PriceChangeRepository, SymbolRepository};
use crate::error::{AppError, RetryError};
use crate::market::bucket::{bucket_start, format_bucket_key, parse_bucket_key};
use crate::market::types::{MetricKind, PriceAggregation, PriceChange};
use crate::pipeline::retry::{retry_with_backoff, RetryPolicy};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const AGGREGATION_WINDOW: TimeDelta = TimeDelta::hours(24);

/// Two-decimal mean. A zero sum is reported as "0.00" so cancelling moves
/// never render as "-0.00".
pub fn format_average(values: &[f64]) -> String {
    let sum: f64 = values.iter().sum();
    if values.is_empty() || sum == 0.0 {
        return "0.00".to_string();
    }
    format!("{:.2}", sum / values.len() as f64)
}

pub fn build_aggregations(
    metric: MetricKind,
    symbol: &str,
    rows: &[PriceChange],
    updated_at: DateTime<Utc>,
) -> Vec<PriceAggregation> {
    let mut grouped: BTreeMap<(&str, DateTime<Utc>), Vec<f64>> = BTreeMap::new();
    for row in rows {
        let coefficient = if metric.uses_absolute_values() {
            row.coefficient_of_change.abs()
        } else {
            row.coefficient_of_change
        };
        grouped
            .entry((
                row.exchange.as_str(),
                bucket_start(metric.granularity(), row.timestamp),
            ))
            .or_default()
            .push(coefficient as f64);
    }

    let mut aggregations: Vec<PriceAggregation> = grouped
        .into_iter()
        .map(|((exchange, bucket), values)| PriceAggregation {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            metric,
            bucket_key: format_bucket_key(bucket),
            value: format_average(&values),
            updated_at,
        })
        .collect();

    if metric.uses_absolute_values() {
        let mut seen = HashSet::new();
        aggregations.retain(|aggregation| seen.insert(aggregation.unique_key()));
    }

    aggregations
}

#[derive(Clone)]
pub struct MetricAggregator {
    price_changes: PriceChangeRepository,
    aggregation: AggregationRepository,
    symbols: SymbolRepository,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl MetricAggregator {
    pub fn new(
        price_changes: PriceChangeRepository,
        aggregation: AggregationRepository,
        symbols: SymbolRepository,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            price_changes,
            aggregation,
            symbols,
            retry,
            cancel,
        }
    }

    /// One pass of `metric` over every known symbol. Returns the number of
    /// aggregation rows written.
    pub async fn run_metric(&self, metric: MetricKind, now: DateTime<Utc>) -> usize {
        let started = Instant::now();
        let symbols = match self.symbols.list().await {
            Ok(symbols) => symbols,
            Err(error) => {
                error!(metric = metric.as_str(), %error, "failed to list symbols");
                return 0;
            }
        };

        let mut written = 0;
        for symbol in &symbols {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.aggregate_symbol(metric, symbol, now).await {
                Ok(rows) => written += rows,
                Err(error) => {
                    warn!(metric = metric.as_str(), symbol = %symbol, %error, "aggregation skipped");
                }
            }
        }

        info!(
            metric = metric.as_str(),
            symbols = symbols.len(),
            rows = written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "aggregation pass finished"
        );
        written
    }

    async fn aggregate_symbol(
        &self,
        metric: MetricKind,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let Some(from) = self.watermark(metric, symbol).await? else {
            debug!(metric = metric.as_str(), symbol, "no price changes to aggregate yet");
            return Ok(0);
        };

        let rows = self
            .price_changes
            .list(symbol, from, from + AGGREGATION_WINDOW)
            .await?;
        let aggregations = build_aggregations(metric, symbol, &rows, now);
        if aggregations.is_empty() {
            return Ok(0);
        }

        let saved = retry_with_backoff(&self.retry, &self.cancel, "save_aggregations", || {
            self.aggregation.save(&aggregations)
        })
        .await;
        match saved {
            Ok(()) => Ok(aggregations.len()),
            Err(RetryError::Cancelled) => Ok(0),
            Err(RetryError::Exhausted { source, .. }) => Err(source),
        }
    }

    /// Start of the last bucket written for the pair, or the first change ever
    /// recorded when the pair has no rows yet.
    async fn watermark(
        &self,
        metric: MetricKind,
        symbol: &str,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        if let Some(last) = self.aggregation.last_row(metric, symbol).await? {
            return parse_bucket_key(&last.bucket_key).map(Some);
        }
        self.price_changes.first_timestamp().await
    }
}
