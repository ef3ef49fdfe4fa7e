use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use event_ingester::config::Config;
use event_ingester::metrics::{router, serve, setup_metrics_recorder};
use event_ingester::service::IngesterService;

fn setup_tracing(json: bool) {
    let registry = tracing_subscriber::registry();
    if json {
        registry
            .with(fmt::layer().json().with_filter(EnvFilter::from_default_env()))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_filter(EnvFilter::from_default_env()),
            )
            .init();
    }
}

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let router = router(setup_metrics_recorder()?);
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Metrics server stopped: {e}");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;

    setup_tracing(config.log_json);
    info!("Starting event ingester");

    let server_handle = start_server(&config)?;
    info!("Started metrics server on {}", config.bind_address());

    let result = IngesterService::new(config).run().await;
    server_handle.abort();

    if let Err(e) = &result {
        error!("Event ingester failed: {e:#}");
    }
    result
}
