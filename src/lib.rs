//! homeserver-auth - Matrix homeserver discovery and authentication library
//!
//! This library decides how a user signs in to a Matrix homeserver, applies
//! per-server policy and remote overrides, and drives every login path to a
//! persisted session.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `auth`: Homeserver model, authentication orchestrator, QR login, browser flow
//! - `client`: Protocol client boundary and the reference HTTP client
//! - `well_known`: Client discovery and policy documents
//! - `remote_settings`: Per-homeserver overrides and the policy gate
//! - `session`: Session directories and session materialization
//! - `qr_code`: QR login payload codec
//! - `settings`: Shared application settings
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli` / `commands`: Command-line interface and handlers
//!
//! # Example
//!
//! ```no_run
//! use homeserver_auth::auth::AuthenticationFlow;
//! use homeserver_auth::{commands, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config/config.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     let service = commands::build_service(config)?;
//!     service.configure("matrix.org", AuthenticationFlow::Login).await?;
//!     println!("{:?}", service.homeserver().login_mode);
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cli;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod qr_code;
pub mod remote_settings;
pub mod session;
pub mod settings;
pub mod well_known;

// Re-export commonly used types
pub use auth::{AuthenticationFlow, AuthenticationService, LoginHomeserver, LoginMode};
pub use config::Config;
pub use error::{AuthenticationError, HomeserverAuthError, Result};
pub use settings::AppSettings;

#[cfg(test)]
pub mod test_utils;
