//! Login commands for homeserver-auth
//!
//! Each command configures an [`AuthenticationService`] for a server and
//! then inspects its login mode, logs in with a password, or prints an
//! OIDC authorization URL.
//!
//! [`AuthenticationService`]: crate::auth::AuthenticationService

use serde_json::json;

use crate::auth::{AuthenticationFlow, LoginMode};
use crate::commands::build_service;
use crate::config::Config;
use crate::error::Result;

/// Human-readable login mode
pub fn describe_login_mode(mode: LoginMode) -> &'static str {
    match mode {
        LoginMode::Unknown => "unknown",
        LoginMode::Password => "password",
        LoginMode::Oidc {
            supports_create_prompt: true,
        } => "oidc (registration available)",
        LoginMode::Oidc {
            supports_create_prompt: false,
        } => "oidc",
        LoginMode::Unsupported => "unsupported",
    }
}

fn flow_for(register: bool) -> AuthenticationFlow {
    if register {
        AuthenticationFlow::Register
    } else {
        AuthenticationFlow::Login
    }
}

/// Configure `server` and print its login mode
///
/// # Errors
///
/// Returns the classified authentication error when the server cannot be
/// used for the requested flow.
pub async fn login_mode(config: Config, server: &str, register: bool, json: bool) -> Result<()> {
    let service = build_service(config)?;
    service.configure(server, flow_for(register)).await?;

    let homeserver = service.homeserver();
    if json {
        let value = json!({
            "address": homeserver.address,
            "login_mode": describe_login_mode(homeserver.login_mode),
            "supports_oidc": homeserver.login_mode.supports_oidc_flow(),
            "supports_registration": homeserver.login_mode.supports_registration(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Homeserver: {}", homeserver.address);
        println!("Login mode: {}", describe_login_mode(homeserver.login_mode));
    }
    Ok(())
}

/// Log in to `server` with a password and print the new session
///
/// # Errors
///
/// Returns the classified authentication error on failure.
pub async fn login(
    config: Config,
    server: &str,
    username: &str,
    password: &str,
    device_name: Option<&str>,
    json: bool,
) -> Result<()> {
    let service = build_service(config)?;
    service.configure(server, AuthenticationFlow::Login).await?;

    if !matches!(service.homeserver().login_mode, LoginMode::Password) {
        tracing::warn!(
            "{} prefers {}, trying password login anyway",
            server,
            describe_login_mode(service.homeserver().login_mode)
        );
    }

    let session = service.login(username, password, device_name, None).await?;
    if json {
        let value = json!({
            "user_id": session.user_id,
            "device_id": session.device_id,
            "homeserver": session.homeserver,
            "data_path": session.directories.data_path,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Logged in as {} (device {})", session.user_id, session.device_id);
        println!("Session data: {}", session.directories.data_path.display());
    }
    Ok(())
}

/// Print an OIDC authorization URL for `server`
///
/// # Errors
///
/// Returns the classified authentication error on failure.
pub async fn oidc_url(
    config: Config,
    server: &str,
    login_hint: Option<&str>,
    register: bool,
) -> Result<()> {
    let service = build_service(config)?;
    service.configure(server, flow_for(register)).await?;

    let data = service.url_for_oidc_login(login_hint).await?;
    tracing::debug!("Pending authorization state {}", data.state());
    println!("{}", data.login_url());
    Ok(())
}
