//! OAuth 2.0 building blocks for next-generation Matrix authentication
//!
//! Homeservers delegating authentication advertise their authorization
//! server through `GET /_matrix/client/v1/auth_metadata` (MSC2965). This
//! module fetches that metadata, registers the client (RFC 7591), builds the
//! authorization URL with PKCE, parses the redirect, and exchanges the
//! authorization code.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::client::{OidcConfiguration, OidcError, OidcPrompt};

/// Stable authorization metadata path
pub const AUTH_METADATA_PATH: &str = "/_matrix/client/v1/auth_metadata";

/// Unstable MSC2965 authorization metadata path
pub const UNSTABLE_AUTH_METADATA_PATH: &str =
    "/_matrix/client/unstable/org.matrix.msc2965/auth_metadata";

const API_SCOPE: &str = "urn:matrix:org.matrix.msc2967.client:api:*";
const DEVICE_SCOPE_PREFIX: &str = "urn:matrix:org.matrix.msc2967.client:device:";

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Authorization server metadata (RFC 8414)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_methods_supported: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_values_supported: Option<Vec<String>>,
}

impl AuthorizationServerMetadata {
    /// Supported `prompt` values
    pub fn prompts(&self) -> Vec<OidcPrompt> {
        self.prompt_values_supported
            .iter()
            .flatten()
            .map(|value| OidcPrompt::parse(value))
            .collect()
    }
}

/// Fetch the authorization server metadata of a homeserver
///
/// The stable endpoint is tried first, then the unstable one.
///
/// # Errors
///
/// Returns [`OidcError::NotSupported`] when neither endpoint serves usable
/// metadata.
pub async fn fetch_auth_metadata(
    http: &reqwest::Client,
    homeserver: &Url,
) -> Result<AuthorizationServerMetadata, OidcError> {
    for path in [AUTH_METADATA_PATH, UNSTABLE_AUTH_METADATA_PATH] {
        let Ok(url) = homeserver.join(path) else {
            continue;
        };
        let response = match http.get(url.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Auth metadata request to {} failed: {}", url, e);
                continue;
            }
        };
        if !response.status().is_success() {
            tracing::debug!("Auth metadata at {} returned {}", url, response.status());
            continue;
        }
        match response.json::<AuthorizationServerMetadata>().await {
            Ok(metadata) => return Ok(metadata),
            Err(e) => tracing::warn!("Ignoring undecodable auth metadata at {}: {}", url, e),
        }
    }
    Err(OidcError::NotSupported)
}

// ---------------------------------------------------------------------------
// Client registration
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
}

/// Dynamic client registration body for a native application
pub fn registration_request(config: &OidcConfiguration) -> serde_json::Value {
    let mut body = serde_json::json!({
        "application_type": "native",
        "redirect_uris": [config.redirect_uri],
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
        "token_endpoint_auth_method": "none",
    });
    let fields = [
        ("client_name", &config.client_name),
        ("client_uri", &config.client_uri),
        ("logo_uri", &config.logo_uri),
        ("tos_uri", &config.tos_uri),
        ("policy_uri", &config.policy_uri),
    ];
    for (key, value) in fields {
        if let Some(value) = value {
            body[key] = serde_json::Value::String(value.clone());
        }
    }
    body
}

/// Client id to use with `metadata`'s issuer
///
/// A static registration for the issuer wins; otherwise the client
/// registers itself.
///
/// # Errors
///
/// Returns [`OidcError::Registration`] when registration is needed but
/// unavailable or refused.
pub async fn resolve_client_id(
    http: &reqwest::Client,
    metadata: &AuthorizationServerMetadata,
    config: &OidcConfiguration,
) -> Result<String, OidcError> {
    if let Some(client_id) = config.static_registrations.get(&metadata.issuer) {
        tracing::debug!("Using static registration for {}", metadata.issuer);
        return Ok(client_id.clone());
    }

    let Some(endpoint) = &metadata.registration_endpoint else {
        return Err(OidcError::Registration(format!(
            "{} has no registration endpoint and no static registration",
            metadata.issuer
        )));
    };

    let response = http
        .post(endpoint)
        .json(&registration_request(config))
        .send()
        .await
        .map_err(|e| OidcError::Registration(format!("registration request failed: {e}")))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(OidcError::Registration(format!(
            "registration endpoint returned {status}: {body}"
        )));
    }

    let registration: RegistrationResponse = response
        .json()
        .await
        .map_err(|e| OidcError::Registration(format!("invalid registration response: {e}")))?;
    tracing::info!("Registered client {} with {}", registration.client_id, metadata.issuer);
    Ok(registration.client_id)
}

// ---------------------------------------------------------------------------
// Authorization request
// ---------------------------------------------------------------------------

/// Scope granting API access for `device_id`
pub fn scope_for_device(device_id: &str, additional_scopes: &[String]) -> String {
    let mut scopes = vec![API_SCOPE.to_string(), format!("{DEVICE_SCOPE_PREFIX}{device_id}")];
    scopes.extend(additional_scopes.iter().cloned());
    scopes.join(" ")
}

/// Parameters of one authorization request
#[derive(Debug, Clone)]
pub struct AuthorizationParams<'a> {
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub scope: &'a str,
    pub state: &'a str,
    pub code_challenge: &'a str,
    pub prompt: Option<&'a OidcPrompt>,
    pub login_hint: Option<&'a str>,
}

/// Build the authorization URL
///
/// # Errors
///
/// Returns [`OidcError::MetadataInvalid`] when the authorization endpoint is
/// not a URL.
pub fn build_authorization_url(
    metadata: &AuthorizationServerMetadata,
    params: &AuthorizationParams<'_>,
) -> Result<Url, OidcError> {
    let mut url = Url::parse(&metadata.authorization_endpoint).map_err(|e| {
        OidcError::MetadataInvalid(format!("invalid authorization endpoint URL: {e}"))
    })?;

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("response_type", "code");
        query.append_pair("response_mode", "query");
        query.append_pair("client_id", params.client_id);
        query.append_pair("redirect_uri", params.redirect_uri);
        query.append_pair("scope", params.scope);
        query.append_pair("state", params.state);
        query.append_pair("code_challenge", params.code_challenge);
        query.append_pair("code_challenge_method", "S256");
        if let Some(prompt) = params.prompt {
            query.append_pair("prompt", prompt.as_str());
        }
        if let Some(login_hint) = params.login_hint {
            query.append_pair("login_hint", login_hint);
        }
    }

    Ok(url)
}

// ---------------------------------------------------------------------------
// Callback and token exchange
// ---------------------------------------------------------------------------

/// Authorization code carried by a successful redirect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationCode {
    pub code: String,
    pub state: String,
}

/// Parse the redirect back to the application
///
/// # Errors
///
/// - [`OidcError::Cancelled`] for `error=access_denied`
/// - [`OidcError::Generic`] for any other `error`
/// - [`OidcError::InvalidCallbackUrl`] when `code` or `state` is missing
pub fn parse_callback(callback_url: &Url) -> Result<AuthorizationCode, OidcError> {
    let params: HashMap<String, String> = callback_url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if let Some(error) = params.get("error") {
        if error == "access_denied" {
            return Err(OidcError::Cancelled);
        }
        let description = params
            .get("error_description")
            .map(|d| format!(": {d}"))
            .unwrap_or_default();
        return Err(OidcError::Generic(format!(
            "authorization failed with {error}{description}"
        )));
    }

    match (params.get("code"), params.get("state")) {
        (Some(code), Some(state)) => Ok(AuthorizationCode {
            code: code.clone(),
            state: state.clone(),
        }),
        _ => Err(OidcError::InvalidCallbackUrl),
    }
}

/// Token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Exchange an authorization code for tokens
///
/// # Errors
///
/// Returns [`OidcError::Generic`] when the request fails or the token
/// endpoint rejects the code.
pub async fn exchange_code(
    http: &reqwest::Client,
    metadata: &AuthorizationServerMetadata,
    code: &str,
    redirect_uri: &str,
    client_id: &str,
    code_verifier: &str,
) -> Result<TokenResponse, OidcError> {
    let params = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", client_id),
        ("code_verifier", code_verifier),
    ];

    let response = http
        .post(&metadata.token_endpoint)
        .form(&params)
        .send()
        .await
        .map_err(|e| OidcError::Generic(format!("token exchange request failed: {e}")))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(OidcError::Generic(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    response
        .json()
        .await
        .map_err(|e| OidcError::Generic(format!("failed to parse token response: {e}")))
}
