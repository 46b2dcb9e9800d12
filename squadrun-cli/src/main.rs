mod cli;
mod commands;
mod config;
mod error;
mod secrets;

use crate::{
    cli::{Args, Commands, OutputFormat},
    commands::CommandExecutor,
    config::AppConfig,
    secrets::FileSecretStore,
};
use anyhow::{Context, Result};
use clap::Parser;
use session_auth::SessionClient;
use std::{process, sync::Arc};
use tracing::{Level, debug, error};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let output = args.output;
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args).await {
        match output {
            OutputFormat::Json | OutputFormat::JsonCompact => {
                let error_json = serde_json::json!({
                    "status": "error",
                    "message": format!("{e:#}"),
                });
                println!("{error_json}");
            }
            OutputFormat::Pretty => {
                error!("Application error: {:#}", e);
                eprintln!("Error: {e:#}");
            }
        }
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = AppConfig::load(args.config.as_deref()).with_context(|| match &args.config {
        Some(path) => format!("Failed to load configuration from {}", path.display()),
        None => "Failed to load configuration".to_string(),
    })?;

    // Configuration management never touches the session
    if let Commands::Config { show, reset } = args.command {
        if reset {
            AppConfig::reset(args.config.as_deref()).context("Failed to reset configuration")?;
            println!("✓ Configuration reset to defaults");
        } else if show {
            println!("{}", config.show()?);
        } else {
            println!("Use --show to display current configuration or --reset to reset to defaults");
        }
        return Ok(());
    }

    let auth_config = config
        .auth_config(args.api_base_url.as_deref())
        .context("Invalid session configuration")?;

    let secrets_path = config
        .secrets_path()
        .context("Failed to locate the secrets file")?;
    debug!(path = %secrets_path.display(), "Using secrets file");

    let client = SessionClient::builder(auth_config)
        .secret_store(Arc::new(FileSecretStore::new(secrets_path)))
        .bootstrap()
        .await
        .context("Failed to start the session client")?;

    let executor = CommandExecutor::new(client, args.output);

    match args.command {
        Commands::Login { username, password } => executor.login(&username, &password).await?,
        Commands::Register {
            username,
            email,
            password,
        } => executor.register(&username, &email, &password).await?,
        Commands::Whoami => executor.whoami().await?,
        Commands::Status => executor.status()?,
        Commands::Get { path } => executor.get(&path).await?,
        Commands::Logout => executor.logout().await?,
        Commands::Config { .. } => unreachable!("handled before bootstrap"),
    }

    Ok(())
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::WARN.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(verbose)
                .with_writer(std::io::stderr),
        )
        .init();
}
