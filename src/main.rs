use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mlserve::config::Config;
use mlserve::features::{MemoryKv, MemoryTable};
use mlserve::registry::InMemoryRegistry;
use mlserve::server;

/// Real-time ML inference server
#[derive(Parser)]
#[command(name = "mlserve")]
#[command(version, about, long_about = None)]
struct Args {
    /// Override the listen address from the environment/config
    #[arg(long)]
    listen_addr: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mlserve=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "configuration error");
            return ExitCode::FAILURE;
        }
    };
    if let Some(addr) = args.listen_addr {
        config.listen_addr = addr;
        if let Err(err) = config.validate() {
            tracing::error!(error = %err, "configuration error");
            return ExitCode::FAILURE;
        }
    }

    // Backend selection (a production deployment wires real registry and
    // feature-store clients here; the in-process ones make the binary
    // self-contained).
    let registry = Arc::new(InMemoryRegistry::new());
    let tier1 = Arc::new(MemoryKv::new(config.feature_cache_capacity));
    let tier2 = Arc::new(MemoryTable::new());

    match server::run(config, registry, tier1, tier2).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "server exited with error");
            ExitCode::FAILURE
        }
    }
}
