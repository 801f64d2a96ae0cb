//! Consent Gateway - transparent OAuth interception with per-user
//! capability consent.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use consent_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env before anything reads the environment
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Validate) => run_validate(&cli),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Load and validate the configuration, reporting the outcome.
fn run_validate(cli: &Cli) -> ExitCode {
    match load_config(cli) {
        Ok(config) => {
            println!("Configuration valid");
            println!("  listen: {}:{}", config.server.host, config.server.port);
            println!("  public_url: {}", config.server.public_url);
            println!(
                "  upstream: {}",
                config.upstream.authorization_endpoint
            );
            println!("  capabilities: {}", config.capabilities.len());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Configuration invalid: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the gateway server
async fn run_server(cli: Cli) -> ExitCode {
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        "Starting consent gateway"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}

/// Load configuration, apply CLI overrides, and validate.
fn load_config(cli: &Cli) -> consent_gateway::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    config.validate()?;
    Ok(config)
}
