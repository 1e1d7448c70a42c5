use crate::db::{PriceChangeRepository, PriceRepository, SymbolRepository};
use crate::error::{AppError, RetryError};
use crate::market::bucket::truncate_to_second;
use crate::market::types::{PriceChange, SymbolPrice};
use crate::pipeline::retry::{retry_with_backoff, RetryPolicy};
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Samples up to this far behind the watermark are re-read so late arrivals
/// still get a predecessor.
pub const WINDOW_SKEW: TimeDelta = TimeDelta::minutes(5);
pub const WINDOW_SPAN: TimeDelta = TimeDelta::hours(24);
pub const TAIL_RETENTION: TimeDelta = TimeDelta::minutes(15);
pub const COLD_START_LOOKBACK: TimeDelta = TimeDelta::days(10);
pub const RAW_PRICE_HORIZON: TimeDelta = TimeDelta::hours(1);

type SecondBuckets = BTreeMap<DateTime<Utc>, BTreeMap<String, Decimal>>;

/// Later samples for the same exchange within a second overwrite earlier ones.
pub fn group_by_second(samples: &[SymbolPrice]) -> SecondBuckets {
    let mut buckets = SecondBuckets::new();
    for sample in samples {
        buckets
            .entry(truncate_to_second(sample.timestamp))
            .or_default()
            .insert(sample.exchange.clone(), sample.price);
    }
    buckets
}

/// Compares each bucket against the bucket right before it. An exchange
/// missing from the previous bucket yields no change for that step.
pub fn compute_price_changes(
    symbol: &str,
    buckets: &SecondBuckets,
    created_at: DateTime<Utc>,
) -> Vec<PriceChange> {
    let mut changes = Vec::new();
    let mut previous: Option<&BTreeMap<String, Decimal>> = None;

    for (timestamp, current) in buckets {
        if let Some(previous) = previous {
            for (exchange, price) in current {
                if let Some(previous_price) = previous.get(exchange) {
                    changes.push(PriceChange::between(
                        symbol,
                        exchange,
                        *timestamp,
                        *price,
                        *previous_price,
                        created_at,
                    ));
                }
            }
        }
        previous = Some(current);
    }

    changes
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolCycle {
    pub windows: usize,
    pub changes: usize,
    pub watermark: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ChangeCalculator {
    prices: PriceRepository,
    price_changes: PriceChangeRepository,
    symbols: SymbolRepository,
    min_exchange_count: u32,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl ChangeCalculator {
    pub fn new(
        prices: PriceRepository,
        price_changes: PriceChangeRepository,
        symbols: SymbolRepository,
        min_exchange_count: u32,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            prices,
            price_changes,
            symbols,
            min_exchange_count,
            retry,
            cancel,
        }
    }

    pub async fn run_cycle(&self) -> Vec<(String, SymbolCycle)> {
        let started = Instant::now();
        let symbols = match self.symbols.popular_symbols(self.min_exchange_count).await {
            Ok(symbols) => symbols,
            Err(error) => {
                error!(%error, "failed to load popular symbols");
                return Vec::new();
            }
        };

        let mut summary = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            if self.cancel.is_cancelled() {
                break;
            }
            let cycle = self.process_symbol(&symbol, Utc::now()).await;
            debug!(
                symbol = %symbol,
                windows = cycle.windows,
                changes = cycle.changes,
                watermark = %cycle.watermark,
                "symbol processed"
            );
            summary.push((symbol, cycle));
        }

        info!(
            symbols = summary.len(),
            changes = summary.iter().map(|(_, cycle)| cycle.changes).sum::<usize>(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "price change cycle finished"
        );
        summary
    }

    pub async fn process_symbol(&self, symbol: &str, now: DateTime<Utc>) -> SymbolCycle {
        let mut from = self.resume_point(symbol, now).await;
        let mut windows = 0;
        let mut emitted = 0;

        loop {
            if self.cancel.is_cancelled() {
                return SymbolCycle {
                    windows,
                    changes: emitted,
                    watermark: from,
                };
            }

            let window_start = from - WINDOW_SKEW;
            let window_end = from + WINDOW_SPAN;
            let samples = match self.prices.symbol_prices(symbol, window_start, window_end).await {
                Ok(samples) => samples,
                Err(error) => {
                    warn!(symbol, %error, "failed to load price window");
                    break;
                }
            };

            if samples.is_empty() {
                if window_end < now {
                    from = window_end;
                    continue;
                }
                break;
            }

            let buckets = group_by_second(&samples);
            let to = buckets
                .keys()
                .next_back()
                .copied()
                .map_or(from, |last| last.max(from));
            let changes = compute_price_changes(symbol, &buckets, now);

            let mut inserted = 0;
            if !changes.is_empty() {
                let saved = retry_with_backoff(&self.retry, &self.cancel, "save_price_changes", || {
                    self.price_changes.save(&changes)
                })
                .await;
                match saved {
                    Ok(rows) => inserted = rows,
                    Err(RetryError::Cancelled) => {
                        return SymbolCycle {
                            windows,
                            changes: emitted,
                            watermark: from,
                        };
                    }
                    Err(error) => {
                        error!(symbol, %error, "failed to persist price changes");
                        break;
                    }
                }
            }
            windows += 1;
            emitted += usize::try_from(inserted).unwrap_or(usize::MAX);

            if let Err(error) = self.prices.delete_prices(symbol, window_start, to - WINDOW_SKEW).await {
                warn!(symbol, %error, "failed to delete consumed prices");
                break;
            }

            if to <= from {
                break;
            }
            from = to;
        }

        if let Err(error) = self.prices.delete_old_prices(symbol, from - TAIL_RETENTION).await {
            warn!(symbol, %error, "failed to trim price tail");
        }

        SymbolCycle {
            windows,
            changes: emitted,
            watermark: from,
        }
    }

    async fn resume_point(&self, symbol: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.price_changes.last_created_at(symbol).await {
            Ok(Some(last)) => return last,
            Ok(None) => {}
            Err(error) => warn!(symbol, %error, "failed to read last price change"),
        }

        match self.prices.first_datetime(symbol).await {
            Ok(Some(first)) => return first,
            Ok(None) => {}
            Err(error) => warn!(symbol, %error, "failed to read first price"),
        }

        now - COLD_START_LOOKBACK
    }

    /// Drops raw prices for every symbol older than the retention horizon,
    /// including symbols that never became popular.
    pub async fn clear_stale_prices(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let deleted = self.prices.clear_old_prices(now - RAW_PRICE_HORIZON).await?;
        debug!(deleted, "stale raw prices cleared");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::pipeline::retry::fast_policy;
    use chrono::{SubsecRound, TimeZone};

    struct Fixture {
        prices: PriceRepository,
        changes: PriceChangeRepository,
        calculator: ChangeCalculator,
    }

    async fn fixture(min_exchange_count: u32) -> Fixture {
        let pool = memory_pool().await;
        let prices = PriceRepository::new(pool.clone());
        let changes = PriceChangeRepository::new(pool.clone());
        let calculator = ChangeCalculator::new(
            prices.clone(),
            changes.clone(),
            SymbolRepository::new(pool),
            min_exchange_count,
            fast_policy(),
            CancellationToken::new(),
        );
        Fixture {
            prices,
            changes,
            calculator,
        }
    }

    fn quote(exchange: &str, price: i64, at: DateTime<Utc>) -> SymbolPrice {
        SymbolPrice::new(exchange, "BTCUSDT", Decimal::from(price), at)
    }

    #[test]
    fn groups_samples_by_second_with_last_write_winning() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let buckets = group_by_second(&[
            quote("binance", 100, t),
            quote("binance", 105, t + TimeDelta::milliseconds(900)),
            quote("kraken", 99, t + TimeDelta::milliseconds(10)),
            quote("binance", 101, t + TimeDelta::seconds(1)),
        ]);

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[&t]["binance"], Decimal::from(105));
        assert_eq!(buckets[&t]["kraken"], Decimal::from(99));
    }

    #[test]
    fn skips_exchanges_missing_from_previous_bucket() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let buckets = group_by_second(&[
            quote("binance", 100, t),
            quote("binance", 101, t + TimeDelta::seconds(1)),
            quote("kraken", 50, t + TimeDelta::seconds(1)),
            quote("kraken", 51, t + TimeDelta::seconds(2)),
        ]);

        let changes = compute_price_changes("BTCUSDT", &buckets, t);

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].exchange, "binance");
        assert_eq!(changes[0].timestamp, t + TimeDelta::seconds(1));
        assert_eq!(changes[0].coefficient_of_change, 99);
        assert_eq!(changes[1].exchange, "kraken");
        assert_eq!(changes[1].timestamp, t + TimeDelta::seconds(2));
        assert_eq!(changes[1].previous_price, Decimal::from(50));
    }

    #[tokio::test]
    async fn advances_watermark_to_last_processed_second() {
        let fx = fixture(1).await;
        let now = Utc::now().trunc_subsecs(0);
        let t = now - TimeDelta::minutes(2);
        fx.prices
            .insert_prices(&[
                quote("binance", 100, t),
                quote("binance", 101, t + TimeDelta::seconds(1)),
                quote("binance", 102, t + TimeDelta::seconds(2)),
            ])
            .await
            .expect("insert should succeed");

        let cycle = fx.calculator.process_symbol("BTCUSDT", now).await;

        assert_eq!(cycle.changes, 2);
        assert_eq!(cycle.watermark, t + TimeDelta::seconds(2));
        let stored = fx
            .changes
            .list("BTCUSDT", t, now)
            .await
            .expect("list should succeed");
        let coefficients: Vec<i64> = stored.iter().map(|c| c.coefficient_of_change).collect();
        assert_eq!(coefficients, vec![99, 98]);
    }

    #[tokio::test]
    async fn reprocessing_same_window_adds_nothing() {
        let fx = fixture(1).await;
        let now = Utc::now().trunc_subsecs(0);
        let t = now - TimeDelta::seconds(60);
        let batch = vec![
            quote("binance", 100, t),
            quote("binance", 101, t + TimeDelta::seconds(1)),
        ];
        fx.prices.insert_prices(&batch).await.expect("insert should succeed");

        fx.calculator.process_symbol("BTCUSDT", now).await;
        fx.prices.insert_prices(&batch).await.expect("re-insert should succeed");
        fx.calculator.process_symbol("BTCUSDT", now).await;

        let stored = fx
            .changes
            .list("BTCUSDT", t - TimeDelta::hours(1), now)
            .await
            .expect("list should succeed");
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn stores_glitch_with_zero_coefficient() {
        let fx = fixture(1).await;
        let now = Utc::now().trunc_subsecs(0);
        let t = now - TimeDelta::minutes(1);
        fx.prices
            .insert_prices(&[
                quote("binance", 1_000_000, t),
                quote("binance", 100, t + TimeDelta::seconds(1)),
            ])
            .await
            .expect("insert should succeed");

        fx.calculator.process_symbol("BTCUSDT", now).await;

        let stored = fx
            .changes
            .list("BTCUSDT", t, now)
            .await
            .expect("list should succeed");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].coefficient_of_change, 0);
        assert_eq!(stored[0].previous_price, Decimal::from(1_000_000));
    }

    #[tokio::test]
    async fn skips_empty_days_until_data() {
        let fx = fixture(1).await;
        let now = Utc::now().trunc_subsecs(0);
        let t = now - TimeDelta::minutes(10);
        // resume point comes from an old change row three days back
        fx.changes
            .save(&[PriceChange::between(
                "BTCUSDT",
                "binance",
                now - TimeDelta::days(3),
                Decimal::from(10),
                Decimal::from(10),
                now - TimeDelta::days(3),
            )])
            .await
            .expect("seed should succeed");
        fx.prices
            .insert_prices(&[quote("binance", 100, t), quote("binance", 101, t + TimeDelta::seconds(1))])
            .await
            .expect("insert should succeed");

        let cycle = fx.calculator.process_symbol("BTCUSDT", now).await;

        assert_eq!(cycle.changes, 1);
        assert_eq!(cycle.watermark, t + TimeDelta::seconds(1));
    }

    #[tokio::test]
    async fn consumed_prices_are_trimmed_behind_watermark() {
        let fx = fixture(1).await;
        let now = Utc::now().trunc_subsecs(0);
        let t = now - TimeDelta::minutes(40);
        fx.prices
            .insert_prices(&[
                quote("binance", 100, t),
                quote("binance", 101, t + TimeDelta::minutes(30)),
            ])
            .await
            .expect("insert should succeed");

        let cycle = fx.calculator.process_symbol("BTCUSDT", now).await;

        assert_eq!(cycle.watermark, t + TimeDelta::minutes(30));
        assert_eq!(
            fx.prices.first_datetime("BTCUSDT").await.unwrap(),
            Some(t + TimeDelta::minutes(30))
        );
    }

    #[tokio::test]
    async fn run_cycle_only_visits_popular_symbols() {
        let fx = fixture(2).await;
        let now = Utc::now().trunc_subsecs(0);
        let t = now - TimeDelta::minutes(1);
        fx.prices
            .insert_prices(&[
                quote("binance", 100, t),
                quote("kraken", 100, t),
                quote("binance", 101, t + TimeDelta::seconds(1)),
                quote("kraken", 102, t + TimeDelta::seconds(1)),
                SymbolPrice::new("binance", "ETHUSDT", Decimal::from(10), t),
                SymbolPrice::new("binance", "ETHUSDT", Decimal::from(11), t + TimeDelta::seconds(1)),
            ])
            .await
            .expect("insert should succeed");

        let summary = fx.calculator.run_cycle().await;

        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].0, "BTCUSDT");
        assert_eq!(summary[0].1.changes, 2);
    }

    #[tokio::test]
    async fn clears_stale_prices_for_all_symbols() {
        let fx = fixture(1).await;
        let now = Utc::now().trunc_subsecs(0);
        fx.prices
            .insert_prices(&[
                quote("binance", 100, now - TimeDelta::hours(2)),
                SymbolPrice::new("kraken", "ETHUSDT", Decimal::from(10), now - TimeDelta::hours(3)),
                quote("binance", 101, now - TimeDelta::minutes(5)),
            ])
            .await
            .expect("insert should succeed");

        let deleted = fx
            .calculator
            .clear_stale_prices(now)
            .await
            .expect("clear should succeed");

        assert_eq!(deleted, 2);
    }
}
