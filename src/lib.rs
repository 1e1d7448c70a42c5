pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod market;
pub mod pipeline;
pub mod state;
pub mod storage;

use commands::pipeline::{start_pipeline, stop_pipeline};
use config::PipelineConfig;
use db::initialize_pool_from_path;
use error::AppError;
use pipeline::ingest::QuoteIngestor;
use pipeline::retry::RetryPolicy;
use state::AppState;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runs the pipeline until `shutdown` is cancelled, then waits for every task
/// to finish its current unit of work.
pub async fn run(config: PipelineConfig, shutdown: CancellationToken) -> Result<(), AppError> {
    let db_pool = initialize_pool_from_path(&config.db_path).await?;
    info!(db_path = %config.db_path.display(), "database ready");

    let state = AppState::new(db_pool, config.cache_capacity)?;
    let session = start_pipeline(&state, &config, &shutdown).await;
    info!(
        tasks = session.tasks,
        calculate_interval_secs = session.calculate_interval_secs,
        aggregate_interval_secs = session.aggregate_interval_secs,
        min_exchanges = session.min_exchanges,
        "price analyst running"
    );

    let feed = config.stdin_feed.then(|| {
        let ingestor = QuoteIngestor::new(
            state.price_storage.clone(),
            RetryPolicy::default(),
            shutdown.child_token(),
        );
        tokio::spawn(async move {
            ingestor
                .run_line_feed(BufReader::new(tokio::io::stdin()))
                .await;
        })
    });

    shutdown.cancelled().await;
    info!("shutdown requested");

    stop_pipeline(&state).await;
    if let Some(feed) = feed {
        if let Err(error) = feed.await {
            warn!(%error, "quote feed ended abnormally");
        }
    }
    state.db_pool.close().await;

    Ok(())
}
