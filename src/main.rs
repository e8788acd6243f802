//! OIDC Gateway - multi-tenant OpenID Connect authentication in front of your services.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use oidc_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    provider::ProviderConfig,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Check { resolve }) => run_check(&cli, resolve).await,
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

fn load_config(cli: &Cli) -> Option<Config> {
    match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            Some(config)
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

/// Validate configuration
async fn run_check(cli: &Cli, resolve: bool) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    let mut failed = false;
    for descriptor in config.enabled_providers() {
        if descriptor.discovery_uri.is_some() && !resolve {
            println!("~ {} (discovery, use --resolve to check endpoints)", descriptor.name);
            continue;
        }
        match ProviderConfig::from_descriptor(descriptor) {
            Ok(_) => println!("✅ {}", descriptor.name),
            Err(e) => {
                failed = true;
                eprintln!("❌ {e}");
            }
        }
    }

    if resolve {
        match Gateway::new(config.clone()).await {
            Ok(gateway) => {
                let registry = gateway.composite().registry();
                let expected = config.enabled_providers().count();
                println!("\n{}/{expected} provider(s) ready", registry.len());
                failed |= registry.len() != expected;
            }
            Err(e) => {
                eprintln!("❌ {e}");
                failed = true;
            }
        }
    }

    if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

/// Run the gateway server
async fn run_server(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        providers = config.enabled_providers().count(),
        "Starting OIDC Gateway"
    );

    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Run with graceful shutdown
    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
