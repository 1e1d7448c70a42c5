use crate::config::PipelineConfig;
use crate::pipeline::spawn_pipeline;
use crate::state::AppState;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSession {
    pub tasks: usize,
    pub calculate_interval_secs: u64,
    pub aggregate_interval_secs: u64,
    pub min_exchanges: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStopResult {
    pub stopped: bool,
}

/// Replaces any running pipeline. The new one runs until [`stop_pipeline`]
/// or until `parent` is cancelled.
pub async fn start_pipeline(
    state: &AppState,
    config: &PipelineConfig,
    parent: &CancellationToken,
) -> PipelineSession {
    let existing_handle = {
        let mut pipeline_slot = state.pipeline.lock().await;
        pipeline_slot.take()
    };
    if let Some(handle) = existing_handle {
        handle.shutdown().await;
    }

    let handle = spawn_pipeline(state, config, parent.child_token());
    let session = PipelineSession {
        tasks: handle.task_count(),
        calculate_interval_secs: config.calculate_interval.as_secs(),
        aggregate_interval_secs: config.aggregate_interval.as_secs(),
        min_exchanges: config.min_exchanges,
    };

    {
        let mut pipeline_slot = state.pipeline.lock().await;
        *pipeline_slot = Some(handle);
    }

    session
}

pub async fn stop_pipeline(state: &AppState) -> PipelineStopResult {
    let existing_handle = {
        let mut pipeline_slot = state.pipeline.lock().await;
        pipeline_slot.take()
    };

    let stopped = if let Some(handle) = existing_handle {
        handle.shutdown().await;
        true
    } else {
        false
    };

    PipelineStopResult { stopped }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineArgs;
    use crate::db::memory_pool;
    use crate::market::types::MetricKind;

    #[tokio::test]
    async fn start_replaces_and_stop_clears_the_pipeline() {
        let state = AppState::new(memory_pool().await, 8).expect("state should build");
        let config = PipelineArgs::default()
            .normalize()
            .expect("defaults should be valid");
        let root = CancellationToken::new();

        let first = start_pipeline(&state, &config, &root).await;
        let second = start_pipeline(&state, &config, &root).await;
        assert_eq!(first.tasks, MetricKind::ALL.len() + 3);
        assert_eq!(second.tasks, first.tasks);

        assert!(stop_pipeline(&state).await.stopped);
        assert!(!stop_pipeline(&state).await.stopped);
    }
}
