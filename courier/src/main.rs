use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use courier::config::EngineConfig;
use courier::database::{self, repositories::SqlxDeadLetterRepository};
use courier::delivery::{DeliveryService, DestinationRegistry, WebhookPublisher};
use courier::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration (also loads .env)
    let config = EngineConfig::load()?;

    // Keep the guard alive so buffered file logs are flushed on exit
    let (logging_config, _log_guard) = logging::init_logging(&config.logging)?;
    let background = CancellationToken::new();
    logging_config.start_retention_cleanup(background.child_token());

    // Database
    let pool = database::connect(&config.database_url).await?;

    // One webhook publisher shared by every configured destination
    let publisher = Arc::new(WebhookPublisher::new());
    let mut registry = DestinationRegistry::new();
    for destination in config.destinations.iter().cloned() {
        tracing::info!(
            destination = %destination.name,
            kind = %destination.kind,
            "Registering destination"
        );
        registry.register(destination, publisher.clone())?;
    }
    if registry.is_empty() {
        tracing::warn!("No destinations configured; every submission will be rejected");
    }

    let repo = Arc::new(SqlxDeadLetterRepository::new(pool.clone()));
    let service = DeliveryService::new(&config, registry, repo)?;
    service.start();

    tracing::info!("courier started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    let report = service.shutdown().await;
    tracing::info!(
        clean = report.clean,
        interrupted = report.interrupted,
        drained = report.drained,
        "Delivery engine stopped"
    );

    background.cancel();
    pool.close().await;

    Ok(())
}
