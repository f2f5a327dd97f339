//! Command handlers for the CLI
//!
//! This module provides the handlers invoked by the CLI entrypoint:
//!
//! - `discovery` -- well-known lookups and remote settings candidates
//! - `login` -- login mode inspection, password login, OIDC URLs
//! - `qr` -- QR login payload decoding
//!
//! Handlers wire the library components together with the reference HTTP
//! client and print their results.

use std::sync::Arc;

use crate::auth::AuthenticationService;
use crate::client::http::HttpClientFactory;
use crate::config::Config;
use crate::error::Result;
use crate::session::DirectoryUserSessionStore;
use crate::settings::AppSettings;
use crate::well_known::WellKnownResolver;

pub mod discovery;
pub mod login;
pub mod qr;

/// Build an authentication service backed by the HTTP client
///
/// # Errors
///
/// Returns error if an HTTP client cannot be constructed.
pub fn build_service(config: Config) -> Result<Arc<AuthenticationService>> {
    let factory = HttpClientFactory::new(&config.discovery)?;
    let resolver = WellKnownResolver::new(&config.discovery)?;
    let settings = Arc::new(AppSettings::new(config));

    Ok(Arc::new(AuthenticationService::new(
        settings,
        Arc::new(factory),
        Arc::new(DirectoryUserSessionStore::new()),
        Arc::new(resolver),
    )))
}
