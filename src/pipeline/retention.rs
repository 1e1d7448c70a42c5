use crate::db::{AggregationRepository, PriceChangeRepository};
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{error, info};

pub const AGGREGATION_RETENTION: TimeDelta = TimeDelta::days(7);
pub const PRICE_CHANGE_RETENTION: TimeDelta = TimeDelta::days(7);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub aggregation_rows: u64,
    pub price_change_rows: u64,
}

#[derive(Clone)]
pub struct RetentionJanitor {
    aggregation: AggregationRepository,
    price_changes: PriceChangeRepository,
}

impl RetentionJanitor {
    pub fn new(aggregation: AggregationRepository, price_changes: PriceChangeRepository) -> Self {
        Self {
            aggregation,
            price_changes,
        }
    }

    /// Failures are logged; the next scheduled purge retries them.
    pub async fn purge(&self, now: DateTime<Utc>) -> RetentionReport {
        let mut report = RetentionReport::default();

        match self
            .aggregation
            .delete_old_rows(now - AGGREGATION_RETENTION)
            .await
        {
            Ok(deleted) => report.aggregation_rows = deleted,
            Err(error) => error!(%error, "failed to purge aggregation rows"),
        }

        match self
            .price_changes
            .delete_old_rows(now - PRICE_CHANGE_RETENTION)
            .await
        {
            Ok(deleted) => report.price_change_rows = deleted,
            Err(error) => error!(%error, "failed to purge price changes"),
        }

        info!(
            aggregation_rows = report.aggregation_rows,
            price_change_rows = report.price_change_rows,
            "retention purge finished"
        );
        report
    }
}
