mod api;
mod bootstrap;
mod config;
mod error;
mod ledger;
mod payments;
mod peer;
mod processor;
mod retry;
mod server;
mod transport;
mod wire;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,payment_gateway=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("❌ Could not listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    dotenv::dotenv().ok();

    // Initialize tracing
    init_tracing();

    info!("🚀 Starting Payment Gateway");

    let config = config::Config::from_env().context("loading configuration")?;
    let endpoint = config.listen_endpoint();

    let app = bootstrap::initialize_app_state(&config)
        .await
        .context("initializing application state")?;

    let listener = endpoint
        .bind()
        .await
        .with_context(|| format!("binding {}", endpoint))?;

    server::run_server(listener, app.state, shutdown_signal()).await?;

    for task in app.background {
        task.abort();
    }
    info!("👋 Server stopped");

    Ok(())
}
