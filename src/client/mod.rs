//! Protocol client capability boundary
//!
//! This module defines the [`Client`] trait the authentication engine uses
//! to talk to a Matrix homeserver, together with the factory that builds
//! clients and the handler that drives a QR-code login. Concrete
//! implementations live in submodules:
//!
//! - [`http::HttpClient`] -- reference client over the Matrix
//!   client-server REST API.
//! - `crate::test_utils::FakeClient` -- in-process fake used in tests
//!   (cfg(test) only).
//!
//! # Design
//!
//! The engine never inspects protocol internals. Everything it needs from a
//! server (login capabilities, OIDC authorization URLs, raw well-known
//! documents) comes through this trait, and every failure is reported with
//! one of the typed errors below so the orchestrator can classify it.
//!
//! # Canonical Import Path
//!
//! ```no_run
//! use homeserver_auth::client::{Client, ClientFactory};
//! ```

pub mod http;
pub mod oauth;
pub mod pkce;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use url::Url;

use crate::qr_code::QrCodeData;
use crate::session::SessionDirectories;
use crate::settings::AppSettings;

// ---------------------------------------------------------------------------
// OIDC configuration
// ---------------------------------------------------------------------------

/// Client metadata and registrations used for one OIDC negotiation
///
/// `static_registrations` maps an issuer URL to a pre-registered client id.
/// When the issuer of the server is not listed, the client falls back to
/// dynamic client registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OidcConfiguration {
    pub client_name: Option<String>,
    pub redirect_uri: String,
    pub client_uri: Option<String>,
    pub logo_uri: Option<String>,
    pub tos_uri: Option<String>,
    pub policy_uri: Option<String>,
    pub static_registrations: HashMap<String, String>,
}

/// `prompt` values an authorization server may support
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OidcPrompt {
    /// Ask the server to show its registration page
    Create,
    Login,
    Consent,
    Other(String),
}

impl OidcPrompt {
    /// Parse a `prompt_values_supported` entry
    pub fn parse(value: &str) -> Self {
        match value {
            "create" => OidcPrompt::Create,
            "login" => OidcPrompt::Login,
            "consent" => OidcPrompt::Consent,
            other => OidcPrompt::Other(other.to_string()),
        }
    }

    /// Wire form of the prompt
    pub fn as_str(&self) -> &str {
        match self {
            OidcPrompt::Create => "create",
            OidcPrompt::Login => "login",
            OidcPrompt::Consent => "consent",
            OidcPrompt::Other(value) => value,
        }
    }
}

/// Login capabilities advertised by a homeserver
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HomeserverLoginDetails {
    /// Homeserver base URL the details were fetched from
    pub url: String,
    pub supports_oidc_login: bool,
    pub supported_oidc_prompts: Vec<OidcPrompt>,
    pub supports_password_login: bool,
}

/// One pending OIDC authorization request
///
/// Must be handed back to [`Client::abort_oidc_auth`] if the user leaves the
/// authorization page without completing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcAuthorizationData {
    login_url: Url,
    state: String,
}

impl OidcAuthorizationData {
    pub fn new(login_url: Url, state: impl Into<String>) -> Self {
        Self {
            login_url,
            state: state.into(),
        }
    }

    /// URL to open in the browser surface
    pub fn login_url(&self) -> &Url {
        &self.login_url
    }

    /// Opaque `state` value binding the callback to this request
    pub fn state(&self) -> &str {
        &self.state
    }
}

/// Credentials of a logged-in device
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub device_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub homeserver_url: String,
    /// Whether the session was obtained through OIDC
    pub oidc: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("homeserver_url", &self.homeserver_url)
            .field("oidc", &self.oidc)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Matrix `errcode` values the engine distinguishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatrixErrorKind {
    Forbidden,
    UserDeactivated,
    UnknownToken,
    LimitExceeded,
    Other(String),
}

impl MatrixErrorKind {
    pub fn from_errcode(errcode: &str) -> Self {
        match errcode {
            "M_FORBIDDEN" => MatrixErrorKind::Forbidden,
            "M_USER_DEACTIVATED" => MatrixErrorKind::UserDeactivated,
            "M_UNKNOWN_TOKEN" => MatrixErrorKind::UnknownToken,
            "M_LIMIT_EXCEEDED" => MatrixErrorKind::LimitExceeded,
            other => MatrixErrorKind::Other(other.to_string()),
        }
    }
}

/// Failure of a request made through a live client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Matrix API error {status} ({kind:?}): {message}")]
    MatrixApi {
        kind: MatrixErrorKind,
        status: u16,
        message: String,
    },

    #[error("The client is not logged in")]
    NotLoggedIn,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Generic(String),
}

/// Failure to construct a client for an address
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientBuildError {
    /// The server's well-known document exists but cannot be decoded
    #[error("Failed to deserialize the well-known document: {0}")]
    WellKnownDeserialization(String),

    /// The server does not support the required sync protocol
    #[error("Sliding sync is not available: {0}")]
    SlidingSyncVersion(String),

    #[error("The address is not a valid server name: {0}")]
    InvalidServerName(String),

    #[error("The server could not be reached: {0}")]
    ServerUnreachable(String),

    #[error("{0}")]
    Generic(String),
}

/// OIDC failures raised by the client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OidcError {
    #[error("OIDC is not supported by the server")]
    NotSupported,

    #[error("The authorization server metadata is invalid: {0}")]
    MetadataInvalid(String),

    #[error("Client registration failed: {0}")]
    Registration(String),

    #[error("The callback URL is invalid")]
    InvalidCallbackUrl,

    #[error("The callback does not match a pending authorization")]
    InvalidState,

    #[error("The user cancelled the authorization")]
    Cancelled,

    #[error("{0}")]
    Generic(String),
}

/// QR login failures reported by a [`QrLoginHandler`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HumanQrLoginError {
    #[error("The login was cancelled")]
    Cancelled,
    #[error("The secure channel is not secure")]
    ConnectionInsecure,
    #[error("The login was declined")]
    Declined,
    #[error("The homeserver does not support device linking")]
    LinkingNotSupported,
    #[error("The login request expired")]
    Expired,
    #[error("The other device does not support sliding sync")]
    SlidingSyncNotAvailable,
    #[error("The other device is not signed in")]
    OtherDeviceNotSignedIn,
    #[error("Unknown failure")]
    Unknown,
    #[error("The rendezvous session was not found")]
    NotFound,
    #[error("The OIDC metadata is invalid")]
    OidcMetadataInvalid,
    #[error("The check code was already sent")]
    CheckCodeAlreadySent,
    #[error("The check code cannot be sent")]
    CheckCodeCannotBeSent,
}

// ---------------------------------------------------------------------------
// QR login handler
// ---------------------------------------------------------------------------

/// Progress reported by a QR login handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrLoginProgressUpdate {
    Starting,
    EstablishingSecureChannel {
        check_code: u8,
        check_code_string: String,
    },
    WaitingForToken {
        user_code: String,
    },
    SyncingSecrets,
    Done,
}

/// Receives progress updates while a QR login runs
pub trait QrLoginProgressListener: Send + Sync {
    fn on_update(&self, update: QrLoginProgressUpdate);
}

/// Drives the cross-device QR login handshake for one scanned code
#[async_trait::async_trait]
pub trait QrLoginHandler: Send + Sync {
    /// Run the handshake, reporting every step to `listener`
    ///
    /// # Errors
    ///
    /// Returns a [`HumanQrLoginError`] describing why the handshake stopped.
    async fn scan(
        &self,
        data: &QrCodeData,
        listener: Arc<dyn QrLoginProgressListener>,
    ) -> std::result::Result<(), HumanQrLoginError>;
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Capabilities of a protocol client bound to one homeserver
#[async_trait::async_trait]
pub trait Client: Send + Sync + fmt::Debug {
    /// Login mechanisms the homeserver supports
    async fn homeserver_login_details(&self) -> HomeserverLoginDetails;

    /// Start an OIDC authorization request
    ///
    /// # Errors
    ///
    /// Returns an [`OidcError`] when metadata discovery, registration, or URL
    /// construction fails.
    async fn url_for_oidc(
        &self,
        config: &OidcConfiguration,
        prompt: Option<OidcPrompt>,
        login_hint: Option<&str>,
        device_id: Option<&str>,
        additional_scopes: Option<&[String]>,
    ) -> std::result::Result<OidcAuthorizationData, OidcError>;

    /// Forget a pending authorization request
    async fn abort_oidc_auth(&self, data: &OidcAuthorizationData);

    /// Complete an authorization request from the redirect URL
    async fn login_with_oidc_callback(&self, callback_url: &Url)
        -> std::result::Result<(), OidcError>;

    /// Log in with a username and password
    async fn login(
        &self,
        username: &str,
        password: &str,
        initial_device_name: Option<&str>,
        device_id: Option<&str>,
    ) -> std::result::Result<(), ClientError>;

    /// Create a handler for a scanned QR code
    fn new_login_with_qr_code_handler(&self, config: &OidcConfiguration)
        -> Arc<dyn QrLoginHandler>;

    /// Credentials of the logged-in device
    fn session(&self) -> std::result::Result<Session, ClientError>;

    async fn logout(&self) -> std::result::Result<(), ClientError>;

    /// Server name the client was built for, when known
    fn server(&self) -> Option<String>;

    /// Homeserver base URL
    fn homeserver(&self) -> String;

    /// Raw bytes of the server operator's policy document
    async fn element_well_known(&self) -> std::result::Result<Vec<u8>, ClientError>;

    /// Raw bytes of the client discovery document
    async fn client_well_known(&self) -> std::result::Result<Vec<u8>, ClientError>;
}

/// Builds protocol clients for an address
#[async_trait::async_trait]
pub trait ClientFactory: Send + Sync {
    /// Build a client storing its state in `directories`
    ///
    /// # Errors
    ///
    /// Returns a [`ClientBuildError`] classifying why the address is
    /// unusable.
    async fn make_client(
        &self,
        address: &str,
        directories: &SessionDirectories,
        passphrase: &str,
        settings: &AppSettings,
    ) -> std::result::Result<Arc<dyn Client>, ClientBuildError>;
}
