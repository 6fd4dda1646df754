//! Marketplace CLI
//!
//! Command-line front end for the marketplace API:
//! 1. Loads `marketplace.toml` (or defaults)
//! 2. Opens the session store (file-backed when `[session] path` is set)
//! 3. Runs one command through the authenticated client, refreshing an
//!    expired access credential transparently
//! 4. Prints the result as JSON on stdout; logs go to stderr

mod commands;
mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Marketplace API client.
#[derive(Parser)]
#[command(name = "marketplace")]
#[command(about = "Talk to the marketplace API with automatic session refresh")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file (default: ./marketplace.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with email and password
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "MARKETPLACE_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Create an account
    Register {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long, env = "MARKETPLACE_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Forget the stored session
    Logout,

    /// Show the signed-in user
    Whoami,

    /// Send an authenticated request
    Request {
        /// HTTP method (GET, POST, PUT, PATCH, DELETE)
        method: String,
        /// Path relative to the API base URL, e.g. /products/
        path: String,
        /// JSON request body
        #[arg(long)]
        data: Option<String>,
        /// Query parameter as KEY=VALUE (repeatable)
        #[arg(short, long = "query")]
        query: Vec<String>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let (config_path, explicit) = Config::resolve_path(cli.config.as_deref());
    debug!(path = %config_path.display(), explicit, "loading configuration");

    let config = Config::load(&config_path, explicit)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        base_url = %config.api.base_url,
        timeout_secs = config.api.timeout_secs,
        refresh_timeout_secs = config.api.refresh_timeout_secs,
        session = config.session.path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "memory".into()),
        "configuration loaded"
    );

    let client = commands::build_client(&config)?;

    let output = match cli.command {
        Commands::Login { email, password } => commands::login(&client, &email, &password).await,
        Commands::Register {
            username,
            email,
            password,
        } => commands::register(&client, &username, &email, &password).await,
        Commands::Logout => Ok(commands::logout(&client)),
        Commands::Whoami => commands::whoami(&client).await,
        Commands::Request {
            method,
            path,
            data,
            query,
        } => commands::request(&client, &method, &path, data.as_deref(), &query).await,
    };

    // a failed command may still have refreshed or cleared the session
    client.flush().await;
    let output = output?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
