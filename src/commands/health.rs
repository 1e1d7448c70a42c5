use crate::state::AppState;
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub db: &'static str,
    pub cached_symbols: usize,
    pub pipeline_running: bool,
}

pub async fn build_health_response(
    started_at: Instant,
    pool: &SqlitePool,
    cached_symbols: usize,
    pipeline_running: bool,
) -> HealthResponse {
    let db_status = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(pool)
        .await
    {
        Ok(_) => "ok",
        Err(_) => "error",
    };

    HealthResponse {
        status: if db_status == "ok" { "ok" } else { "degraded" },
        uptime_ms: started_at.elapsed().as_millis(),
        db: db_status,
        cached_symbols,
        pipeline_running,
    }
}

pub async fn health(state: &AppState) -> HealthResponse {
    let pipeline_running = state.pipeline.lock().await.is_some();
    build_health_response(
        state.started_at,
        &state.db_pool,
        state.price_cache.cached_symbols(),
        pipeline_running,
    )
    .await
}
