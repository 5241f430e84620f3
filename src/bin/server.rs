// TokenHub - Main Server Binary
// Run with: cargo run --bin tokenhub-server

//! Thin wrapper around the library: load environment, initialize logging,
//! validate configuration, and hand off to `tokenhub::run`. Exits 0 on a
//! clean shutdown and 1 on a fatal init error.

use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tokenhub::Config;

#[derive(Debug, Parser)]
#[command(name = "tokenhub-server", about = "LLM routing reverse proxy")]
struct Args {
    /// Path to the operator credentials file (mode 0600 JSON).
    #[arg(long, env = "TOKENHUB_CREDENTIALS_FILE")]
    credentials_file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() {
    // The .env file is optional; real deployments set the environment
    // through the process supervisor.
    let _ = dotenv();

    let args = Args::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    if args.credentials_file.is_some() {
        config.credentials_file = args.credentials_file;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting TokenHub");
    if config.otel_enabled {
        info!(
            endpoint = config.otel_endpoint.as_deref().unwrap_or("unset"),
            service = %config.otel_service,
            "otel flags accepted; spans export via the tracing pipeline"
        );
    }

    if let Err(e) = tokenhub::run(config).await {
        error!(error = %e, "fatal");
        eprintln!("fatal: {e:#}");
        std::process::exit(1);
    }
}
