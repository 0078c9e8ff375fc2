//! taskrelay - HTTP Server Entry Point
//!
//! Starts the HTTP server that exposes the orchestrator API.

use taskrelay::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskrelay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: agents={}, tools={}, model={}",
        config.agent_registry_path.display(),
        config.mcp_config_path.display(),
        if config.api_key.is_some() { config.default_model.as_str() } else { "(offline)" }
    );

    api::serve(config).await?;

    Ok(())
}
