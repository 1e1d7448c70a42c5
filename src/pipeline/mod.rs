pub mod aggregator;
pub mod change_calculator;
pub mod ingest;
pub mod retention;
pub mod retry;

use crate::config::PipelineConfig;
use crate::market::types::MetricKind;
use crate::state::AppState;
use aggregator::MetricAggregator;
use change_calculator::ChangeCalculator;
use chrono::Utc;
use futures_util::future::join_all;
use retention::RetentionJanitor;
use retry::RetryPolicy;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs `job` every `period` until `cancel` fires. The interval is reset after
/// each run so a slow job never triggers back-to-back catch-up runs.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    run_at_start: bool,
    cancel: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if run_at_start && !cancel.is_cancelled() {
            job().await;
        }

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    job().await;
                    ticker.reset();
                }
            }
        }

        debug!(task = name, "periodic task stopped");
    })
}

pub struct PipelineHandle {
    cancellation_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        for result in join_all(self.tasks).await {
            if let Err(error) = result {
                error!(%error, "pipeline task ended abnormally");
            }
        }
    }
}

/// Spawns the calculator, its raw-price cleanup, one aggregator per metric
/// kind and the retention janitor. All tasks stop when `cancel` fires.
pub fn spawn_pipeline(
    state: &AppState,
    config: &PipelineConfig,
    cancel: CancellationToken,
) -> PipelineHandle {
    let retry = RetryPolicy::default();
    let mut tasks = Vec::with_capacity(MetricKind::ALL.len() + 3);

    let calculator = ChangeCalculator::new(
        state.prices.clone(),
        state.price_changes.clone(),
        state.symbols.clone(),
        config.min_exchanges,
        retry,
        cancel.clone(),
    );

    let cycle_calculator = calculator.clone();
    tasks.push(spawn_periodic(
        "change_calculator",
        config.calculate_interval,
        true,
        cancel.clone(),
        move || {
            let calculator = cycle_calculator.clone();
            async move {
                calculator.run_cycle().await;
            }
        },
    ));

    tasks.push(spawn_periodic(
        "raw_price_cleanup",
        config.cleanup_interval,
        false,
        cancel.clone(),
        move || {
            let calculator = calculator.clone();
            async move {
                if let Err(error) = calculator.clear_stale_prices(Utc::now()).await {
                    warn!(%error, "raw price cleanup failed");
                }
            }
        },
    ));

    let aggregator = MetricAggregator::new(
        state.price_changes.clone(),
        state.aggregation.clone(),
        state.symbols.clone(),
        retry,
        cancel.clone(),
    );
    for metric in MetricKind::ALL {
        let aggregator = aggregator.clone();
        tasks.push(spawn_periodic(
            metric.as_str(),
            config.aggregate_interval,
            false,
            cancel.clone(),
            move || {
                let aggregator = aggregator.clone();
                async move {
                    aggregator.run_metric(metric, Utc::now()).await;
                }
            },
        ));
    }

    let janitor = RetentionJanitor::new(state.aggregation.clone(), state.price_changes.clone());
    tasks.push(spawn_periodic(
        "retention",
        config.retention_interval,
        false,
        cancel.clone(),
        move || {
            let janitor = janitor.clone();
            async move {
                janitor.purge(Utc::now()).await;
            }
        },
    ));

    info!(tasks = tasks.len(), "pipeline started");
    PipelineHandle {
        cancellation_token: cancel,
        tasks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineArgs;
    use crate::db::memory_pool;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn periodic_task_runs_at_start_and_stops_on_cancel() {
        let runs = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = runs.clone();

        let handle = spawn_periodic(
            "counter",
            Duration::from_millis(10),
            true,
            cancel.clone(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(55)).await;
        cancel.cancel();
        handle.await.expect("task should stop cleanly");

        let observed = runs.load(Ordering::SeqCst);
        assert!(observed >= 2, "expected repeated runs, got {observed}");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), observed);
    }

    #[tokio::test]
    async fn pipeline_schedules_each_metric_once_and_shuts_down() {
        let state = AppState::new(memory_pool().await, 16).expect("state should build");
        let config = PipelineArgs::default()
            .normalize()
            .expect("defaults should be valid");

        let handle = spawn_pipeline(&state, &config, CancellationToken::new());
        assert_eq!(handle.task_count(), MetricKind::ALL.len() + 3);

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("shutdown should complete promptly");
    }
}
