//! Herald - index provider daemon
//!
//! Maintains a signed advertisement chain for provider-supplied content
//! batches and publishes it to indexer nodes.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use herald_core::engine::ProviderInfo;
use herald_core::{Config, EngineBuilder, MemDatastore, ReframeListener};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long shutdown may take before the process exits forcibly.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Parse CLI arguments and build config
    let config = Config::from_cli()?;

    init_logging(&config.log_level);

    tracing::info!("Starting herald provider...");

    run_daemon(config).await?;

    Ok(())
}

async fn run_daemon(config: Config) -> Result<(), Box<dyn Error>> {
    let ds = MemDatastore::shared();
    let engine = Arc::new(
        EngineBuilder::from_config(&config)?
            .with_datastore(Arc::clone(&ds))
            .build()?,
    );
    engine.start().await?;

    let reframe_addrs = if config.reframe.addrs.is_empty() {
        vec![format!("/ip4/127.0.0.1/tcp/{}", config.listen_port)]
    } else {
        config.reframe.addrs.clone()
    };
    // Reframe ads default to the node identity unless the config names
    // another provider.
    let reframe_provider = match &config.reframe.provider_id {
        Some(id) => id.parse()?,
        None => engine.provider_id(),
    };
    let provider_info = ProviderInfo {
        id: reframe_provider,
        addrs: reframe_addrs
            .iter()
            .map(|a| a.parse())
            .collect::<Result<_, _>>()?,
    };

    let listener = ReframeListener::new(
        Arc::clone(&engine) as Arc<dyn herald_core::Provider>,
        ds,
        Duration::from_secs(config.reframe.cid_ttl_secs),
        config.reframe.chunk_size,
        config.reframe.snapshot_size,
        provider_info,
        engine.metrics().clone(),
    )
    .await?;

    tracing::info!(
        "provider {} running; publisher kind {:?}",
        engine.provider_id(),
        config.ingest.publisher_kind
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl+C, shutting down...");

    listener.close().await;
    match tokio::time::timeout(SHUTDOWN_DEADLINE, engine.shutdown()).await {
        Ok(result) => result?,
        Err(_) => {
            tracing::error!("shutdown deadline exceeded, exiting forcibly");
            std::process::exit(1);
        }
    }

    tracing::info!("Provider stopped");
    Ok(())
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
