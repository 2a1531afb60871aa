use anyhow::Result;
use std::sync::Arc;
use tally_agent::config::AgentConfig;
use tally_agent::runner::{CollectionLoop, LoopTiming};
use tally_agent::uploader::Uploader;
use tally_collector::host::HostCollector;
use tally_collector::runtime::RuntimeCollector;
use tally_collector::snapshot::MetricSnapshot;
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/agent.toml".to_string());
    let config = AgentConfig::load(&config_path)?;

    let directive = if config.debug { "tally=debug" } else { "tally=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    tracing::info!(
        transport = ?config.transport,
        server = %config.server_endpoint,
        signed = config.sign_key.as_deref().is_some_and(|k| !k.is_empty()),
        encrypted = config.crypto_public_key.is_some(),
        "tally-agent starting"
    );

    let uploader = Arc::new(Uploader::from_config(&config)?);
    let collection = CollectionLoop::new(
        Arc::new(MetricSnapshot::new()),
        Box::new(RuntimeCollector::new()?),
        uploader,
        LoopTiming::from_config(&config),
    )
    .with_extra(Box::new(HostCollector::new()));

    collection
        .run(async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;

    tracing::info!("tally-agent stopped");
    Ok(())
}
