use crate::error::AppError;
use crate::market::bucket::datetime_from_ms;
use crate::market::types::{Candlestick, MetricKind, PriceAggregation, PriceChange, SymbolPrice};
use crate::state::AppState;
use crate::storage::{CandlestickStorage, PriceStorage};
use serde::Deserialize;

const MAX_RANGE_MS: i64 = 31 * 24 * 60 * 60 * 1_000;

fn normalize_symbol(raw: &str) -> Result<String, AppError> {
    let symbol = raw.trim().to_ascii_uppercase();
    if symbol.is_empty() || !symbol.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err(AppError::InvalidArgument(
            "symbol must be non-empty alphanumeric ASCII".to_string(),
        ));
    }
    Ok(symbol)
}

fn normalize_exchange(raw: &str) -> Result<String, AppError> {
    let exchange = raw.trim().to_ascii_lowercase();
    if exchange.is_empty() {
        return Err(AppError::InvalidArgument(
            "exchange must be non-empty".to_string(),
        ));
    }
    Ok(exchange)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceChangesArgs {
    pub exchange: String,
    pub symbol: String,
    pub from_ms: i64,
    pub to_ms: i64,
}

pub async fn price_changes(
    state: &AppState,
    args: PriceChangesArgs,
) -> Result<Vec<PriceChange>, AppError> {
    let exchange = normalize_exchange(&args.exchange)?;
    let symbol = normalize_symbol(&args.symbol)?;
    let span = args.to_ms.checked_sub(args.from_ms);
    if !matches!(span, Some(span) if (0..=MAX_RANGE_MS).contains(&span)) {
        return Err(AppError::InvalidArgument(format!(
            "range must be ordered and span at most {MAX_RANGE_MS} ms"
        )));
    }

    state
        .price_changes
        .changes(
            &exchange,
            &symbol,
            datetime_from_ms(args.from_ms)?,
            datetime_from_ms(args.to_ms)?,
        )
        .await
}

pub async fn latest_prices(state: &AppState, symbol: &str) -> Result<Vec<SymbolPrice>, AppError> {
    let symbol = normalize_symbol(symbol)?;
    state.price_storage.prices(&symbol).await
}

pub fn exchange_symbol_prices(
    state: &AppState,
    exchange: &str,
    symbol: &str,
) -> Result<Vec<SymbolPrice>, AppError> {
    let exchange = normalize_exchange(exchange)?;
    let symbol = normalize_symbol(symbol)?;
    Ok(state.price_cache.exchange_symbol_prices(&exchange, &symbol))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationsArgs {
    pub metric: String,
    pub symbol: String,
}

pub async fn aggregations(
    state: &AppState,
    args: AggregationsArgs,
) -> Result<Vec<PriceAggregation>, AppError> {
    let metric = MetricKind::parse_str(args.metric.trim())?;
    let symbol = normalize_symbol(&args.symbol)?;
    state.aggregation.list(metric, &symbol).await
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastCandlestickArgs {
    pub exchange: String,
    pub symbol: String,
    pub interval: String,
}

pub async fn last_candlestick(
    state: &AppState,
    args: LastCandlestickArgs,
) -> Result<Option<Candlestick>, AppError> {
    let exchange = normalize_exchange(&args.exchange)?;
    let symbol = normalize_symbol(&args.symbol)?;
    let interval = args.interval.trim();
    if interval.is_empty() {
        return Err(AppError::InvalidArgument(
            "interval must be non-empty".to_string(),
        ));
    }

    state
        .candlestick_storage
        .last_candlestick(&exchange, &symbol, interval)
        .await
}
