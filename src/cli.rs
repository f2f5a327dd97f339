//! Command-line interface definition for homeserver-auth
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands for homeserver discovery, login, and QR payload
//! inspection.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// homeserver-auth - Matrix homeserver discovery and sign-in
///
/// Inspect what a homeserver supports and sign in with a password or
/// through OIDC.
#[derive(Parser, Debug, Clone)]
#[command(name = "homeserver-auth")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Base directory for session data
    #[arg(long)]
    pub session_dir: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for homeserver-auth
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Fetch and show a domain's client well-known document
    Discover {
        /// Domain to query (e.g. example.com)
        domain: String,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// List the domains probed for a homeserver's remote settings
    Candidates {
        /// Homeserver name or URL
        homeserver: String,
    },

    /// Show the login mode of a homeserver
    LoginMode {
        /// Server name or URL
        server: String,

        /// Check for account registration instead of login
        #[arg(long)]
        register: bool,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Log in with a username and password
    Login {
        /// Server name or URL
        server: String,

        /// Matrix user name or ID
        #[arg(short, long)]
        username: String,

        /// Password
        #[arg(short, long)]
        password: String,

        /// Display name for the new device
        #[arg(long)]
        device_name: Option<String>,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Print an OIDC authorization URL for a homeserver
    OidcUrl {
        /// Server name or URL
        server: String,

        /// Login hint passed to the authorization server
        #[arg(long)]
        login_hint: Option<String>,

        /// Request the registration page
        #[arg(long)]
        register: bool,
    },

    /// Decode a QR login payload from a file
    QrDecode {
        /// File holding the raw payload bytes
        file: PathBuf,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/config.yaml".to_string()),
            verbose: false,
            json_logs: false,
            session_dir: None,
            command: Commands::Candidates {
                homeserver: "matrix.org".to_string(),
            },
        }
    }
}
