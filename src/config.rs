//! Configuration management for homeserver-auth
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.
//! The resulting [`Config`] is the static half of the application settings;
//! the mutable remote overrides live in [`crate::settings::AppSettings`].

use crate::client::OidcConfiguration;
use crate::error::{HomeserverAuthError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for homeserver-auth
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Servers offered to the user, the first one is the default
    #[serde(default = "default_account_providers")]
    pub account_providers: Vec<String>,

    /// Whether servers outside `account_providers` may be used
    #[serde(default = "default_true")]
    pub allow_other_account_providers: bool,

    /// OIDC client metadata and static registrations
    #[serde(default)]
    pub oidc: OidcConfig,

    /// Embedded browser flow settings
    #[serde(default)]
    pub web_flow: WebFlowConfig,

    /// Discovery and transport settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Remote settings policy behaviour
    #[serde(default)]
    pub remote_settings: RemoteSettingsConfig,

    /// Session storage settings
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_account_providers() -> Vec<String> {
    vec!["matrix.org".to_string()]
}

fn default_true() -> bool {
    true
}

/// OIDC client configuration
///
/// Describes this application to authorization servers during dynamic
/// client registration and carries pre-registered client ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcConfig {
    /// Human-readable client name
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Redirect URI using the application's custom scheme
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,

    /// Client home page
    #[serde(default = "default_client_uri")]
    pub client_uri: String,

    /// Client logo
    #[serde(default)]
    pub logo_uri: Option<String>,

    /// Terms of service
    #[serde(default)]
    pub tos_uri: Option<String>,

    /// Privacy policy
    #[serde(default)]
    pub policy_uri: Option<String>,

    /// Pre-registered client ids keyed by issuer URL
    #[serde(default)]
    pub static_registrations: HashMap<String, String>,
}

fn default_client_name() -> String {
    "homeserver-auth".to_string()
}

fn default_redirect_uri() -> String {
    "hsauth://oidc".to_string()
}

fn default_client_uri() -> String {
    "https://github.com/homeserver-auth/homeserver-auth".to_string()
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            client_name: default_client_name(),
            redirect_uri: default_redirect_uri(),
            client_uri: default_client_uri(),
            logo_uri: None,
            tos_uri: None,
            policy_uri: None,
            static_registrations: HashMap::new(),
        }
    }
}

impl OidcConfig {
    /// Build the configuration handed to the protocol client
    pub fn to_configuration(&self) -> OidcConfiguration {
        OidcConfiguration {
            client_name: Some(self.client_name.clone()),
            redirect_uri: self.redirect_uri.clone(),
            client_uri: Some(self.client_uri.clone()),
            logo_uri: self.logo_uri.clone(),
            tos_uri: self.tos_uri.clone(),
            policy_uri: self.policy_uri.clone(),
            static_registrations: self.static_registrations.clone(),
        }
    }
}

/// Embedded browser flow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebFlowConfig {
    /// Host suffixes the authorization page may navigate to
    #[serde(default = "default_allowed_domains")]
    pub allowed_domains: Vec<String>,

    /// User agent sent with the authorization page request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_allowed_domains() -> Vec<String> {
    vec!["matrix.org".to_string()]
}

fn default_user_agent() -> String {
    format!("homeserver-auth/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for WebFlowConfig {
    fn default() -> Self {
        Self {
            allowed_domains: default_allowed_domains(),
            user_agent: default_user_agent(),
        }
    }
}

/// Discovery and transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// URL scheme used for well-known lookups of bare server names
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Per-request timeout (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Upper bound for a full candidate-domain probe (seconds)
    #[serde(default = "default_probe_budget")]
    pub probe_budget_seconds: u64,

    /// Reject servers that do not advertise sliding sync
    #[serde(default = "default_true")]
    pub require_sliding_sync: bool,
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_probe_budget() -> u64 {
    20
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            request_timeout_seconds: default_request_timeout(),
            probe_budget_seconds: default_probe_budget(),
            require_sliding_sync: true,
        }
    }
}

impl DiscoveryConfig {
    /// Per-request timeout as a [`Duration`]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Probe budget as a [`Duration`]
    pub fn probe_budget(&self) -> Duration {
        Duration::from_secs(self.probe_budget_seconds)
    }
}

/// Remote settings configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteSettingsConfig {
    /// Treat an undecodable policy document as a rejection
    #[serde(default)]
    pub fail_closed_on_malformed_policy: bool,
}

/// Session storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Base directory for per-attempt session directories
    ///
    /// Defaults to the platform data directory when unset.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
}

impl SessionConfig {
    /// Resolve the session base directory
    pub fn resolve_base_dir(&self) -> PathBuf {
        if let Some(dir) = &self.base_dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("org", "homeserver-auth", "homeserver-auth")
            .map(|dirs| dirs.data_dir().join("sessions"))
            .unwrap_or_else(|| std::env::temp_dir().join("homeserver-auth").join("sessions"))
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Returns
    ///
    /// Returns the loaded and merged configuration
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    /// Parse a configuration file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is not valid YAML
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(HomeserverAuthError::from)?;
        let config: Config = serde_yaml::from_str(&contents).map_err(HomeserverAuthError::from)?;
        tracing::debug!("Loaded configuration from {}", path);
        Ok(config)
    }

    fn apply_env_vars(&mut self) {
        if let Ok(providers) = std::env::var("HSAUTH_ACCOUNT_PROVIDERS") {
            let providers: Vec<String> = providers
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if providers.is_empty() {
                tracing::warn!("Ignoring empty HSAUTH_ACCOUNT_PROVIDERS");
            } else {
                self.account_providers = providers;
            }
        }

        if let Ok(allow) = std::env::var("HSAUTH_ALLOW_OTHER_PROVIDERS") {
            if let Ok(value) = allow.parse() {
                self.allow_other_account_providers = value;
            } else {
                tracing::warn!("Invalid HSAUTH_ALLOW_OTHER_PROVIDERS: {}", allow);
            }
        }

        if let Ok(redirect_uri) = std::env::var("HSAUTH_OIDC_REDIRECT_URI") {
            self.oidc.redirect_uri = redirect_uri;
        }

        if let Ok(scheme) = std::env::var("HSAUTH_DISCOVERY_SCHEME") {
            self.discovery.scheme = scheme.to_lowercase();
        }

        if let Ok(timeout) = std::env::var("HSAUTH_REQUEST_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse() {
                self.discovery.request_timeout_seconds = value;
            } else {
                tracing::warn!("Invalid HSAUTH_REQUEST_TIMEOUT_SECONDS: {}", timeout);
            }
        }

        if let Ok(dir) = std::env::var("HSAUTH_SESSION_DIR") {
            self.session.base_dir = Some(PathBuf::from(dir));
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            tracing::debug!("Verbose mode enabled");
        }

        if let Some(dir) = &cli.session_dir {
            self.session.base_dir = Some(PathBuf::from(dir));
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        if self.account_providers.is_empty() {
            return Err(HomeserverAuthError::Config(
                "account_providers must list at least one server".to_string(),
            )
            .into());
        }

        if self.account_providers.iter().any(|p| p.trim().is_empty()) {
            return Err(HomeserverAuthError::Config(
                "account_providers cannot contain empty entries".to_string(),
            )
            .into());
        }

        let redirect = url::Url::parse(&self.oidc.redirect_uri).map_err(|e| {
            HomeserverAuthError::Config(format!(
                "oidc.redirect_uri is not a valid URI ({}): {}",
                self.oidc.redirect_uri, e
            ))
        })?;
        if redirect.scheme() == "http" || redirect.scheme() == "https" {
            return Err(HomeserverAuthError::Config(
                "oidc.redirect_uri must use the application's custom scheme".to_string(),
            )
            .into());
        }

        let valid_schemes = ["http", "https"];
        if !valid_schemes.contains(&self.discovery.scheme.as_str()) {
            return Err(HomeserverAuthError::Config(format!(
                "Invalid discovery scheme: {}. Must be one of: {}",
                self.discovery.scheme,
                valid_schemes.join(", ")
            ))
            .into());
        }

        if self.discovery.request_timeout_seconds == 0 {
            return Err(HomeserverAuthError::Config(
                "discovery.request_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if self.discovery.probe_budget_seconds == 0 {
            return Err(HomeserverAuthError::Config(
                "discovery.probe_budget_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if self.web_flow.allowed_domains.is_empty() {
            return Err(HomeserverAuthError::Config(
                "web_flow.allowed_domains must list at least one domain".to_string(),
            )
            .into());
        }

        Ok(())
    }

    /// The default account provider
    pub fn default_account_provider(&self) -> &str {
        self.account_providers
            .first()
            .map(String::as_str)
            .unwrap_or("matrix.org")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            account_providers: default_account_providers(),
            allow_other_account_providers: true,
            oidc: OidcConfig::default(),
            web_flow: WebFlowConfig::default(),
            discovery: DiscoveryConfig::default(),
            remote_settings: RemoteSettingsConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn test_cli() -> crate::cli::Cli {
        crate::cli::Cli {
            config: None,
            verbose: false,
            json_logs: false,
            session_dir: None,
            command: crate::cli::Commands::Candidates {
                homeserver: "matrix.org".to_string(),
            },
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.account_providers, vec!["matrix.org".to_string()]);
        assert!(config.allow_other_account_providers);
        assert_eq!(config.oidc.redirect_uri, "hsauth://oidc");
        assert_eq!(config.discovery.scheme, "https");
    }

    #[test]
    fn test_config_validation_success() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_empty_providers() {
        let mut config = Config::default();
        config.account_providers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_web_redirect() {
        let mut config = Config::default();
        config.oidc.redirect_uri = "https://app.example/callback".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("custom scheme"));
    }

    #[test]
    fn test_config_validation_invalid_scheme() {
        let mut config = Config::default();
        config.discovery.scheme = "ftp".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_timeout() {
        let mut config = Config::default();
        config.discovery.request_timeout_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
account_providers:
  - corp.example
  - matrix.org
allow_other_account_providers: false
oidc:
  client_name: Corp Chat
  redirect_uri: "corpchat://oidc"
  static_registrations:
    "https://auth.corp.example/": "client-123"
web_flow:
  allowed_domains: [corp.example]
discovery:
  probe_budget_seconds: 5
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.default_account_provider(), "corp.example");
        assert!(!config.allow_other_account_providers);
        assert_eq!(config.oidc.client_name, "Corp Chat");
        assert_eq!(
            config
                .oidc
                .static_registrations
                .get("https://auth.corp.example/")
                .map(String::as_str),
            Some("client-123")
        );
        assert_eq!(config.discovery.probe_budget(), Duration::from_secs(5));
        assert_eq!(config.discovery.request_timeout_seconds, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_oidc_to_configuration_copies_metadata() {
        let mut oidc = OidcConfig::default();
        oidc.tos_uri = Some("https://example.com/tos".to_string());
        let configuration = oidc.to_configuration();
        assert_eq!(configuration.redirect_uri, "hsauth://oidc");
        assert_eq!(configuration.client_name.as_deref(), Some("homeserver-auth"));
        assert_eq!(configuration.tos_uri.as_deref(), Some("https://example.com/tos"));
        assert!(configuration.static_registrations.is_empty());
    }

    #[test]
    fn test_session_base_dir_prefers_configured_value() {
        let session = SessionConfig {
            base_dir: Some(PathBuf::from("/tmp/hsauth-sessions")),
        };
        assert_eq!(session.resolve_base_dir(), PathBuf::from("/tmp/hsauth-sessions"));
    }

    #[test]
    #[serial]
    fn test_load_nonexistent_file_uses_defaults() {
        let config = Config::load("nonexistent.yaml", &test_cli()).unwrap();
        assert_eq!(config.default_account_provider(), "matrix.org");
    }

    #[test]
    #[serial]
    fn test_apply_env_vars_overrides_providers() {
        std::env::set_var("HSAUTH_ACCOUNT_PROVIDERS", "a.example, b.example,");
        std::env::set_var("HSAUTH_ALLOW_OTHER_PROVIDERS", "false");

        let mut config = Config::default();
        config.apply_env_vars();

        std::env::remove_var("HSAUTH_ACCOUNT_PROVIDERS");
        std::env::remove_var("HSAUTH_ALLOW_OTHER_PROVIDERS");

        assert_eq!(
            config.account_providers,
            vec!["a.example".to_string(), "b.example".to_string()]
        );
        assert!(!config.allow_other_account_providers);
    }

    #[test]
    #[serial]
    fn test_cli_session_dir_override() {
        let mut cli = test_cli();
        cli.session_dir = Some("/tmp/override".to_string());
        let config = Config::load("nonexistent.yaml", &cli).unwrap();
        assert_eq!(config.session.resolve_base_dir(), PathBuf::from("/tmp/override"));
    }
}
