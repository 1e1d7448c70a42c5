use price_analyst_lib::config::PipelineArgs;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "price_analyst=info,price_analyst_lib=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let config = match PipelineArgs::from_env().and_then(PipelineArgs::normalize) {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received");
                signal_token.cancel();
            }
            Err(error) => error!(%error, "failed to listen for interrupt"),
        }
    });

    match price_analyst_lib::run(config, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "price analyst stopped");
            ExitCode::FAILURE
        }
    }
}
