use crate::error::RetryError;
use crate::market::types::{parse_quote_batch, QuoteWire, SymbolPrice};
use crate::pipeline::retry::{retry_with_backoff, RetryPolicy};
use crate::storage::PriceStorage;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted: usize,
    pub rejected: usize,
}

/// Validates upstream quotes and writes the survivors through the tiered
/// price storage.
#[derive(Clone)]
pub struct QuoteIngestor {
    storage: Arc<dyn PriceStorage>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl QuoteIngestor {
    pub fn new(storage: Arc<dyn PriceStorage>, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            storage,
            retry,
            cancel,
        }
    }

    pub async fn ingest(&self, quotes: Vec<QuoteWire>) -> Result<IngestReport, RetryError> {
        let mut report = IngestReport::default();
        let mut prices = Vec::with_capacity(quotes.len());

        for quote in quotes {
            let exchange = quote.exchange.clone();
            let symbol = quote.symbol.clone();
            match SymbolPrice::try_from(quote) {
                Ok(price) => prices.push(price),
                Err(error) => {
                    report.rejected += 1;
                    warn!(exchange = %exchange, symbol = %symbol, %error, "dropping malformed quote");
                }
            }
        }

        if prices.is_empty() {
            return Ok(report);
        }

        retry_with_backoff(&self.retry, &self.cancel, "save_prices", || {
            self.storage.save_prices(&prices)
        })
        .await?;
        report.accepted = prices.len();

        Ok(report)
    }

    /// Reads one JSON array of quotes per line until EOF or cancellation.
    pub async fn run_line_feed<R>(&self, reader: R) -> IngestReport
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut total = IngestReport::default();

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = lines.next_line() => next,
            };

            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(error) => {
                    warn!(%error, "quote feed read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let mut payload = line.into_bytes();
            let quotes = match parse_quote_batch(&mut payload) {
                Ok(quotes) => quotes,
                Err(error) => {
                    warn!(%error, "dropping undecodable quote batch");
                    continue;
                }
            };

            match self.ingest(quotes).await {
                Ok(report) => {
                    total.accepted += report.accepted;
                    total.rejected += report.rejected;
                }
                Err(RetryError::Cancelled) => break,
                Err(error) => warn!(%error, "quote batch not stored"),
            }
        }

        info!(
            accepted = total.accepted,
            rejected = total.rejected,
            "quote feed closed"
        );
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::retry::fast_policy;
    use crate::storage::PriceCache;

    fn ingestor() -> (Arc<PriceCache>, QuoteIngestor) {
        let cache = Arc::new(PriceCache::new(64).expect("capacity is valid"));
        let ingestor = QuoteIngestor::new(cache.clone(), fast_policy(), CancellationToken::new());
        (cache, ingestor)
    }

    fn wire(exchange: &str, price: &str) -> QuoteWire {
        QuoteWire {
            exchange: exchange.to_string(),
            symbol: "BTCUSDT".to_string(),
            price: price.to_string(),
            timestamp_ms: 1_709_294_400_000,
        }
    }

    #[tokio::test]
    async fn drops_malformed_quotes_and_stores_the_rest() {
        let (cache, ingestor) = ingestor();

        let report = ingestor
            .ingest(vec![wire("binance", "100.5"), wire("kraken", "n/a"), wire("okx", "0")])
            .await
            .expect("ingest should succeed");

        assert_eq!(
            report,
            IngestReport {
                accepted: 1,
                rejected: 2,
            }
        );
        let stored = cache.prices("BTCUSDT").await.expect("read should succeed");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].exchange, "binance");
    }

    #[tokio::test]
    async fn line_feed_skips_undecodable_lines() {
        let (cache, ingestor) = ingestor();
        let feed = concat!(
            "[{\"exchange\":\"binance\",\"symbol\":\"BTCUSDT\",\"price\":\"100\",\"timestamp\":1709294400000}]\n",
            "not json\n",
            "\n",
            "[{\"exchange\":\"kraken\",\"symbol\":\"BTCUSDT\",\"price\":\"101\",\"timestamp\":1709294401000}]\n",
        );

        let report = ingestor.run_line_feed(feed.as_bytes()).await;

        assert_eq!(report.accepted, 2);
        let latest = cache.prices("BTCUSDT").await.expect("read should succeed");
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].exchange, "kraken");
        assert_eq!(cache.exchange_symbol_prices("binance", "BTCUSDT").len(), 1);
    }
}
