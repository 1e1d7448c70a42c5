use crate::db::{
    AggregationRepository, CandlestickRepository, PriceChangeRepository, PriceRepository,
    SymbolRepository,
};
use crate::error::AppError;
use crate::pipeline::PipelineHandle;
use crate::storage::{CandlestickCache, CandlestickComposite, PriceCache, PriceComposite};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

pub struct AppState {
    pub started_at: Instant,
    pub db_pool: SqlitePool,
    pub prices: PriceRepository,
    pub price_changes: PriceChangeRepository,
    pub aggregation: AggregationRepository,
    pub symbols: SymbolRepository,
    pub price_cache: Arc<PriceCache>,
    pub price_storage: Arc<PriceComposite>,
    pub candlestick_storage: Arc<CandlestickComposite>,
    pub pipeline: Mutex<Option<PipelineHandle>>,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, cache_capacity: usize) -> Result<Self, AppError> {
        let prices = PriceRepository::new(db_pool.clone());
        let price_cache = Arc::new(PriceCache::new(cache_capacity)?);
        let price_storage = Arc::new(PriceComposite::new(
            price_cache.clone(),
            Arc::new(prices.clone()),
        ));
        let candlestick_storage = Arc::new(CandlestickComposite::new(
            Arc::new(CandlestickCache::new()),
            Arc::new(CandlestickRepository::new(db_pool.clone())),
        ));

        Ok(Self {
            started_at: Instant::now(),
            prices,
            price_changes: PriceChangeRepository::new(db_pool.clone()),
            aggregation: AggregationRepository::new(db_pool.clone()),
            symbols: SymbolRepository::new(db_pool.clone()),
            price_cache,
            price_storage,
            candlestick_storage,
            pipeline: Mutex::new(None),
            db_pool,
        })
    }
}
