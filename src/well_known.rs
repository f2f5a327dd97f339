//! Client well-known discovery
//!
//! This module fetches and interprets the Matrix client discovery document
//! served at `/.well-known/matrix/client`, and the server operator's policy
//! document served at `/.well-known/element/element.json`.
//!
//! # Lookup rules
//!
//! 1. [`candidate_domains`] derives the domains to probe for a homeserver,
//!    most specific first.
//! 2. [`WellKnownLookup::fetch_client_well_known`] fetches one domain's
//!    document. Network failures, non-success responses, and undecodable
//!    bodies all yield `None`; callers treat that as "no override".
//! 3. OIDC information is read from the stable `m.authentication` key first
//!    and the unstable `org.matrix.msc2965.authentication` key second. The
//!    first block carrying an `issuer` wins; blocks are never merged.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::auth::homeserver::extract_domain;
use crate::config::DiscoveryConfig;
use crate::error::{HomeserverAuthError, Result};

/// Path of the client discovery document
pub const CLIENT_WELL_KNOWN_PATH: &str = "/.well-known/matrix/client";

/// Path of the server operator's policy document
pub const ELEMENT_WELL_KNOWN_PATH: &str = "/.well-known/element/element.json";

const STABLE_AUTHENTICATION_KEY: &str = "m.authentication";
const UNSTABLE_AUTHENTICATION_KEY: &str = "org.matrix.msc2965.authentication";
const CALL_KEY: &str = "org.matrix.msc3401.call";
const HOMESERVER_KEY: &str = "m.homeserver";

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// OIDC issuer advertised by a domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OidcAuthentication {
    pub issuer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Snapshot of a domain's client discovery document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientWellKnown {
    /// `m.homeserver.base_url`
    pub homeserver_base_url: Option<String>,
    pub oidc_authentication: Option<OidcAuthentication>,
    /// `org.matrix.msc3401.call.url`, when it parses as a URL
    pub call_service_url: Option<Url>,
}

impl ClientWellKnown {
    /// Decode a discovery document
    ///
    /// Unknown keys are ignored and malformed optional blocks are treated as
    /// absent. Only a body that is not a JSON object is an error.
    ///
    /// # Errors
    ///
    /// Returns the JSON error when the body is not a JSON object.
    pub fn from_slice(bytes: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        let document: Map<String, Value> = serde_json::from_slice(bytes)?;

        let homeserver_base_url = document
            .get(HOMESERVER_KEY)
            .and_then(|block| block.get("base_url"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let call_service_url = document
            .get(CALL_KEY)
            .and_then(|block| block.get("url"))
            .and_then(Value::as_str)
            .and_then(|url| Url::parse(url).ok());

        Ok(Self {
            homeserver_base_url,
            oidc_authentication: oidc_authentication(&document),
            call_service_url,
        })
    }
}

fn oidc_authentication(document: &Map<String, Value>) -> Option<OidcAuthentication> {
    for key in [STABLE_AUTHENTICATION_KEY, UNSTABLE_AUTHENTICATION_KEY] {
        let Some(block) = document.get(key).and_then(Value::as_object) else {
            continue;
        };
        let Some(issuer) = block.get("issuer").and_then(Value::as_str) else {
            continue;
        };
        return Some(OidcAuthentication {
            issuer: issuer.to_string(),
            client_id: block
                .get("client_id")
                .and_then(Value::as_str)
                .map(str::to_string),
        });
    }
    None
}

/// Server operator policy document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementWellKnown {
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforce_element_pro: Option<bool>,
}

impl ElementWellKnown {
    /// Whether the operator requires a different client application
    pub fn enforces_element_pro(&self) -> bool {
        self.enforce_element_pro == Some(true)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Domains to probe for a homeserver, most specific first
///
/// The host of `homeserver` comes first. When the host has more than two
/// labels, the host without its first label follows, so
/// `matrix.example.com` also probes `example.com`.
///
/// # Examples
///
/// ```
/// use homeserver_auth::well_known::candidate_domains;
///
/// assert_eq!(
///     candidate_domains("https://matrix.example.com"),
///     vec!["matrix.example.com".to_string(), "example.com".to_string()]
/// );
/// assert_eq!(candidate_domains("example.com"), vec!["example.com".to_string()]);
/// ```
pub fn candidate_domains(homeserver: &str) -> Vec<String> {
    let host = extract_domain(homeserver);
    if host.is_empty() {
        return Vec::new();
    }

    let mut domains = vec![host.clone()];
    if host.parse::<IpAddr>().is_ok() {
        return domains;
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() > 2 && labels.iter().all(|label| !label.is_empty()) {
        domains.push(labels[1..].join("."));
    }
    domains
}

/// Strip one trailing path separator from a URL
///
/// URLs with a query or fragment, and URLs ending in a doubled separator,
/// are returned unchanged. Applying the function twice gives the same
/// result as applying it once.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use homeserver_auth::well_known::normalize_url;
///
/// let url = Url::parse("https://call.example.com/").unwrap();
/// assert_eq!(normalize_url(&url), "https://call.example.com");
/// ```
pub fn normalize_url(url: &Url) -> String {
    let text = url.as_str();
    if url.query().is_some() || url.fragment().is_some() {
        return text.to_string();
    }
    match text.strip_suffix('/') {
        Some(stripped) if !stripped.ends_with('/') => stripped.to_string(),
        _ => text.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// Fetches discovery documents for a domain
#[async_trait::async_trait]
pub trait WellKnownLookup: Send + Sync {
    /// Fetch and decode `/.well-known/matrix/client` for `domain`
    async fn fetch_client_well_known(&self, domain: &str) -> Option<ClientWellKnown>;

    /// OIDC issuer advertised by `domain`
    async fn fetch_oidc_configuration(&self, domain: &str) -> Option<OidcAuthentication> {
        self.fetch_client_well_known(domain)
            .await
            .and_then(|document| document.oidc_authentication)
    }
}

/// reqwest-backed [`WellKnownLookup`]
#[derive(Debug, Clone)]
pub struct WellKnownResolver {
    http: reqwest::Client,
    scheme: String,
}

impl WellKnownResolver {
    /// Build a resolver using the discovery settings
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &DiscoveryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(HomeserverAuthError::from)?;
        Ok(Self::with_client(http, &config.scheme))
    }

    pub fn with_client(http: reqwest::Client, scheme: &str) -> Self {
        Self {
            http,
            scheme: scheme.to_string(),
        }
    }

    /// Discovery document URL for `domain`
    pub fn client_well_known_url(&self, domain: &str) -> Option<Url> {
        Url::parse(&format!("{}://{}{}", self.scheme, domain, CLIENT_WELL_KNOWN_PATH)).ok()
    }
}

#[async_trait::async_trait]
impl WellKnownLookup for WellKnownResolver {
    async fn fetch_client_well_known(&self, domain: &str) -> Option<ClientWellKnown> {
        let Some(url) = self.client_well_known_url(domain) else {
            tracing::debug!("Cannot build a well-known URL for {:?}", domain);
            return None;
        };

        let response = match self.http.get(url.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Well-known fetch from {} failed: {}", url, e);
                return None;
            }
        };

        if !response.status().is_success() {
            tracing::debug!("Well-known fetch from {} returned {}", url, response.status());
            return None;
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!("Failed to read well-known body from {}: {}", url, e);
                return None;
            }
        };

        match ClientWellKnown::from_slice(&body) {
            Ok(document) => Some(document),
            Err(e) => {
                tracing::warn!("Ignoring undecodable well-known document at {}: {}", url, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(value: serde_json::Value) -> ClientWellKnown {
        ClientWellKnown::from_slice(value.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_candidate_domains_strips_first_label() {
        assert_eq!(
            candidate_domains("https://matrix.example.com"),
            vec!["matrix.example.com".to_string(), "example.com".to_string()]
        );
    }

    #[test]
    fn test_candidate_domains_two_labels_single_candidate() {
        assert_eq!(
            candidate_domains("https://example.com/"),
            vec!["example.com".to_string()]
        );
    }

    #[test]
    fn test_candidate_domains_bare_host_with_port() {
        assert_eq!(
            candidate_domains("a.b.example.org:8448"),
            vec!["a.b.example.org".to_string(), "b.example.org".to_string()]
        );
    }

    #[test]
    fn test_candidate_domains_ip_address_not_split() {
        assert_eq!(
            candidate_domains("http://127.0.0.1:8008"),
            vec!["127.0.0.1".to_string()]
        );
    }

    #[test]
    fn test_candidate_domains_empty_input() {
        assert!(candidate_domains("").is_empty());
    }

    #[test]
    fn test_normalize_url_strips_single_trailing_slash() {
        let url = Url::parse("https://call.example.com/room/").unwrap();
        assert_eq!(normalize_url(&url), "https://call.example.com/room");
    }

    #[test]
    fn test_normalize_url_is_idempotent() {
        for input in [
            "https://call.example.com/",
            "https://call.example.com/a/b/",
            "https://call.example.com/a//",
            "https://call.example.com/a?x=1/",
        ] {
            let once = normalize_url(&Url::parse(input).unwrap());
            let twice = normalize_url(&Url::parse(&once).unwrap());
            assert_eq!(once, twice, "normalization not idempotent for {}", input);
        }
    }

    #[test]
    fn test_normalize_url_keeps_query() {
        let url = Url::parse("https://call.example.com/?room=1").unwrap();
        assert_eq!(normalize_url(&url), "https://call.example.com/?room=1");
    }

    #[test]
    fn test_stable_authentication_wins() {
        let document = decode(json!({
            "m.authentication": { "issuer": "https://stable.example/", "client_id": "stable" },
            "org.matrix.msc2965.authentication": { "issuer": "https://unstable.example/" }
        }));
        let oidc = document.oidc_authentication.unwrap();
        assert_eq!(oidc.issuer, "https://stable.example/");
        assert_eq!(oidc.client_id.as_deref(), Some("stable"));
    }

    #[test]
    fn test_unstable_authentication_used_when_stable_missing() {
        let document = decode(json!({
            "org.matrix.msc2965.authentication": { "issuer": "https://unstable.example/" }
        }));
        let oidc = document.oidc_authentication.unwrap();
        assert_eq!(oidc.issuer, "https://unstable.example/");
        assert_eq!(oidc.client_id, None);
    }

    #[test]
    fn test_stable_block_without_issuer_falls_through_without_merging() {
        let document = decode(json!({
            "m.authentication": { "client_id": "orphan" },
            "org.matrix.msc2965.authentication": { "issuer": "https://unstable.example/" }
        }));
        let oidc = document.oidc_authentication.unwrap();
        assert_eq!(oidc.issuer, "https://unstable.example/");
        assert_eq!(oidc.client_id, None);
    }

    #[test]
    fn test_call_url_extracted() {
        let document = decode(json!({
            "m.homeserver": { "base_url": "https://matrix.example.com" },
            "org.matrix.msc3401.call": { "url": "https://call.example.com/" }
        }));
        assert_eq!(
            document.homeserver_base_url.as_deref(),
            Some("https://matrix.example.com")
        );
        assert_eq!(
            document.call_service_url.unwrap().as_str(),
            "https://call.example.com/"
        );
    }

    #[test]
    fn test_call_block_without_url_is_absent() {
        let document = decode(json!({ "org.matrix.msc3401.call": {} }));
        assert!(document.call_service_url.is_none());
    }

    #[test]
    fn test_non_object_document_is_error() {
        assert!(ClientWellKnown::from_slice(b"[1, 2]").is_err());
        assert!(ClientWellKnown::from_slice(b"<html>").is_err());
    }

    #[test]
    fn test_element_well_known_enforcement() {
        let doc: ElementWellKnown =
            serde_json::from_str(r#"{"version": 1, "enforce_element_pro": true}"#).unwrap();
        assert!(doc.enforces_element_pro());

        let doc: ElementWellKnown = serde_json::from_str(r#"{"version": 1}"#).unwrap();
        assert!(!doc.enforces_element_pro());
    }

    #[test]
    fn test_resolver_builds_url_with_scheme() {
        let resolver = WellKnownResolver::with_client(reqwest::Client::new(), "http");
        assert_eq!(
            resolver
                .client_well_known_url("127.0.0.1:8080")
                .unwrap()
                .as_str(),
            "http://127.0.0.1:8080/.well-known/matrix/client"
        );
    }
}
