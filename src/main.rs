mod api;
mod bootstrap;
mod config;
mod error;
mod execution;
mod ledger;
mod matching;
mod middleware;
mod reconcile;
mod recovery;
mod server;
#[cfg(test)]
mod testing;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AgentConfig;
use crate::server::HttpConfig;

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,reconciler=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting lost & found reconciliation agent");

    // Configuration faults are fatal: exit non-zero before touching the ledger
    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("❌ {}", e);
            std::process::exit(1);
        }
    };

    let agent = bootstrap::initialize_agent(&config)
        .await
        .context("agent initialization failed")?;

    let app = server::create_app(
        agent.state,
        &HttpConfig {
            cors_origins: config.cors_origins.clone(),
            manual_trigger_per_minute: config.manual_trigger_per_minute,
        },
    );

    server::run_server(app, &config.bind_address).await?;

    for task in agent.tasks {
        task.abort();
    }
    Ok(())
}
