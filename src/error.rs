//! Error types for homeserver-auth
//!
//! This module defines the error taxonomy surfaced by the authentication
//! engine, using `thiserror` for ergonomic error handling. Errors raised by
//! the protocol client live next to the client trait in [`crate::client`].

use thiserror::Error;

/// Crate-level error type for configuration, IO and transport plumbing
///
/// Domain operations return [`AuthenticationError`]; this enum covers the
/// ambient failures of the binary, configuration loading and helpers.
#[derive(Error, Debug)]
pub enum HomeserverAuthError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

/// Classified failure of an authentication operation
///
/// Every variant is something the caller can act on: show a message, offer
/// a different login path, or retry with another server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationError {
    /// The server advertises no usable login mechanism
    #[error("This server does not support login")]
    LoginNotSupported,

    /// The server cannot create accounts through this client
    #[error("This server does not support registration")]
    RegistrationNotSupported,

    /// The server's discovery document could not be decoded
    #[error("The server's well-known file is invalid: {0}")]
    InvalidWellKnown(String),

    /// The server lacks the sync protocol this client requires
    #[error("This server does not support sliding sync")]
    SlidingSyncNotAvailable,

    /// The server operator requires a different client application
    #[error("{server_name} requires a different client application")]
    ElementProRequired {
        /// Display name of the server that imposed the policy
        server_name: String,
    },

    /// The address does not point at a reachable homeserver
    #[error("The homeserver address is invalid")]
    InvalidHomeserverAddress,

    /// OIDC negotiation failed
    #[error("OIDC error: {0}")]
    Oidc(OidcErrorKind),

    /// Login failed for an unclassified reason
    #[error("Failed logging in")]
    FailedLoggingIn,

    /// Username or password rejected
    #[error("Invalid username or password")]
    InvalidCredentials,

    /// The account has been deactivated
    #[error("This account has been deactivated")]
    AccountDeactivated,

    /// The server issued a refresh token for a password session
    #[error("Session token refresh is not supported")]
    SessionTokenRefreshNotSupported,

    /// QR-code login failed
    #[error("QR code login error: {0}")]
    QrCode(QrCodeErrorKind),

    /// A newer `configure` call replaced this attempt
    #[error("The operation was superseded by a newer request")]
    Superseded,
}

impl AuthenticationError {
    /// Whether the failure blocks the current path and needs the user to
    /// pick a different server or login method
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            AuthenticationError::LoginNotSupported
                | AuthenticationError::RegistrationNotSupported
                | AuthenticationError::ElementProRequired { .. }
                | AuthenticationError::QrCode(QrCodeErrorKind::ProviderNotAllowed { .. })
        )
    }
}

/// OIDC failure kinds
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OidcErrorKind {
    /// No authorization URL could be produced
    #[error("failed to build the authorization URL")]
    UrlFailure,

    /// The server does not offer OIDC
    #[error("OIDC is not supported by this server")]
    NotSupported,

    /// The user backed out of the authorization page
    #[error("the user cancelled the authorization")]
    UserCancellation,
}

/// QR-code login failure kinds
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QrCodeErrorKind {
    #[error("the QR code could not be decoded")]
    InvalidQrCode,

    #[error("the other device is not signed in")]
    DeviceNotSignedIn,

    #[error("{scanned_provider} is not one of the allowed providers: {}", allowed_providers.join(", "))]
    ProviderNotAllowed {
        scanned_provider: String,
        allowed_providers: Vec<String>,
    },

    #[error("the login was cancelled")]
    Cancelled,

    #[error("the secure channel could not be verified")]
    ConnectionInsecure,

    #[error("the login was declined on the other device")]
    Declined,

    #[error("the server does not support device linking")]
    LinkingNotSupported,

    #[error("the QR code has expired")]
    Expired,

    #[error("the other device is not supported")]
    DeviceNotSupported,

    #[error("unknown QR login failure")]
    Unknown,
}

/// Failure raised by the remote settings policy gate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteSettingsError {
    /// The server's policy document requires a different client application
    #[error("{server_name} requires a different client application")]
    ElementProRequired { server_name: String },
}

impl From<RemoteSettingsError> for AuthenticationError {
    fn from(error: RemoteSettingsError) -> Self {
        match error {
            RemoteSettingsError::ElementProRequired { server_name } => {
                AuthenticationError::ElementProRequired { server_name }
            }
        }
    }
}

/// Result type alias for homeserver-auth plumbing
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
