//! homeserver-auth - Matrix homeserver discovery and sign-in
//!
#![doc = "homeserver-auth - Matrix homeserver discovery and sign-in"]
#![doc = "Main entry point for the homeserver-auth command-line tool."]

use anyhow::Result;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use homeserver_auth::cli::{Cli, Commands};
use homeserver_auth::commands;
use homeserver_auth::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize tracing
    init_tracing(cli.verbose, cli.json_logs);

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Discover { domain, json } => {
            tracing::info!("Starting discovery for {}", domain);
            commands::discovery::discover(&config, &domain, json).await?;
            Ok(())
        }
        Commands::Candidates { homeserver } => {
            commands::discovery::candidates(&homeserver);
            Ok(())
        }
        Commands::LoginMode {
            server,
            register,
            json,
        } => {
            tracing::info!("Inspecting login mode of {}", server);
            commands::login::login_mode(config, &server, register, json).await?;
            Ok(())
        }
        Commands::Login {
            server,
            username,
            password,
            device_name,
            json,
        } => {
            tracing::info!("Starting password login to {}", server);
            commands::login::login(
                config,
                &server,
                &username,
                &password,
                device_name.as_deref(),
                json,
            )
            .await?;
            Ok(())
        }
        Commands::OidcUrl {
            server,
            login_hint,
            register,
        } => {
            tracing::info!("Requesting OIDC authorization URL from {}", server);
            commands::login::oidc_url(config, &server, login_hint.as_deref(), register).await?;
            Ok(())
        }
        Commands::QrDecode { file, json } => {
            commands::qr::qr_decode(&file, json)?;
            Ok(())
        }
    }
}

/// Initialize tracing subscriber with environment filter
///
/// Logs go to stderr so command output on stdout stays machine readable.
fn init_tracing(verbose: bool, json_logs: bool) {
    let default_filter = if verbose {
        "homeserver_auth=debug"
    } else {
        "homeserver_auth=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json_logs {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
