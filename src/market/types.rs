use crate::error::AppError;
use crate::market::bucket::{datetime_from_ms, BucketGranularity};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const COEFFICIENT_SCALE: i64 = 10_000;
pub const MAX_COEFFICIENT_MAGNITUDE: i64 = 100_000;

pub fn exchange_symbol_key(exchange: &str, symbol: &str) -> String {
    format!("{exchange}-{symbol}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolPrice {
    pub exchange: String,
    pub symbol: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl SymbolPrice {
    pub fn new(exchange: &str, symbol: &str, price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            price,
            timestamp,
        }
    }

    pub fn cache_key(&self) -> String {
        exchange_symbol_key(&self.exchange, &self.symbol)
    }
}

/// Quote as delivered by the upstream loader. Prices arrive as strings and are
/// validated before they reach storage.
#[derive(Debug, Clone, Deserialize)]
pub struct QuoteWire {
    pub exchange: String,
    pub symbol: String,
    pub price: String,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,
}

impl TryFrom<QuoteWire> for SymbolPrice {
    type Error = AppError;

    fn try_from(value: QuoteWire) -> Result<Self, Self::Error> {
        let exchange = value.exchange.trim().to_ascii_lowercase();
        if exchange.is_empty() {
            return Err(AppError::InvalidArgument(
                "quote exchange must be non-empty".to_string(),
            ));
        }

        let symbol = value.symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() || !symbol.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            return Err(AppError::InvalidArgument(
                "quote symbol must be non-empty alphanumeric ASCII".to_string(),
            ));
        }

        let price = value.price.trim().parse::<Decimal>()?;
        if price <= Decimal::ZERO {
            return Err(AppError::InvalidArgument(format!(
                "quote price must be positive, got {price}"
            )));
        }

        Ok(Self {
            exchange,
            symbol,
            price,
            timestamp: datetime_from_ms(value.timestamp_ms)?,
        })
    }
}

pub fn parse_quote_batch(payload: &mut [u8]) -> Result<Vec<QuoteWire>, AppError> {
    let batch: Vec<QuoteWire> = simd_json::serde::from_slice(payload)?;
    Ok(batch)
}

/// Signed basis-point change of `current` relative to itself. Out-of-range
/// results are zeroed rather than dropped.
pub fn coefficient_of_change(current: Decimal, previous: Decimal) -> i64 {
    if current <= Decimal::ZERO || previous <= Decimal::ZERO {
        return 0;
    }

    let coefficient = (current - previous)
        .checked_div(current)
        .and_then(|ratio| ratio.checked_mul(Decimal::from(COEFFICIENT_SCALE)))
        .and_then(|scaled| scaled.trunc().to_i64());

    match coefficient {
        Some(value) if value.abs() <= MAX_COEFFICIENT_MAGNITUDE => value,
        _ => 0,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceChange {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub exchange: String,
    pub coefficient_of_change: i64,
    pub price: Decimal,
    pub previous_price: Decimal,
    pub created_at: DateTime<Utc>,
}

impl PriceChange {
    pub fn between(
        symbol: &str,
        exchange: &str,
        timestamp: DateTime<Utc>,
        price: Decimal,
        previous_price: Decimal,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            coefficient_of_change: coefficient_of_change(price, previous_price),
            price,
            previous_price,
            created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricKind {
    #[serde(rename = "ChangeCoefficientOnHour")]
    ChangeCoefficientHour,
    #[serde(rename = "ChangeCoefficientOnDay")]
    ChangeCoefficientDay,
    #[serde(rename = "ChangeCoefficientOnWeek")]
    ChangeCoefficientWeek,
    #[serde(rename = "IndicatorChangeOnHour")]
    IndicatorChangeHour,
    #[serde(rename = "IndicatorChangeOnDay")]
    IndicatorChangeDay,
    #[serde(rename = "IndicatorChangeOnWeek")]
    IndicatorChangeWeek,
}

impl MetricKind {
    pub const ALL: [MetricKind; 6] = [
        Self::ChangeCoefficientHour,
        Self::ChangeCoefficientDay,
        Self::ChangeCoefficientWeek,
        Self::IndicatorChangeHour,
        Self::IndicatorChangeDay,
        Self::IndicatorChangeWeek,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChangeCoefficientHour => "ChangeCoefficientOnHour",
            Self::ChangeCoefficientDay => "ChangeCoefficientOnDay",
            Self::ChangeCoefficientWeek => "ChangeCoefficientOnWeek",
            Self::IndicatorChangeHour => "IndicatorChangeOnHour",
            Self::IndicatorChangeDay => "IndicatorChangeOnDay",
            Self::IndicatorChangeWeek => "IndicatorChangeOnWeek",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        Self::ALL
            .into_iter()
            .find(|metric| metric.as_str() == value)
            .ok_or_else(|| AppError::InvalidArgument(format!("unknown metric '{value}'")))
    }

    // The "hour" kinds bucket by minute; bucket cardinality depends on it.
    pub fn granularity(self) -> BucketGranularity {
        match self {
            Self::ChangeCoefficientHour | Self::IndicatorChangeHour => BucketGranularity::Minute,
            Self::ChangeCoefficientDay | Self::IndicatorChangeDay => BucketGranularity::Day,
            Self::ChangeCoefficientWeek | Self::IndicatorChangeWeek => {
                BucketGranularity::IsoWeekEnd
            }
        }
    }

    pub fn uses_absolute_values(self) -> bool {
        matches!(
            self,
            Self::IndicatorChangeHour | Self::IndicatorChangeDay | Self::IndicatorChangeWeek
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceAggregation {
    pub symbol: String,
    pub exchange: String,
    pub metric: MetricKind,
    pub bucket_key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

impl PriceAggregation {
    pub fn unique_key(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.symbol,
            self.exchange,
            self.metric.as_str(),
            self.bucket_key
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candlestick {
    pub symbol: String,
    pub exchange: String,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub number_of_trades: i64,
    pub interval: String,
    pub created_at: DateTime<Utc>,
}
