//! Reference [`Client`] over the Matrix client-server REST API
//!
//! [`HttpClientFactory`] resolves an address to a homeserver base URL,
//! checks that the server speaks the required sync protocol, and hands out
//! [`HttpClient`]s. The client implements password login, OIDC login with
//! PKCE and dynamic client registration, logout, and raw well-known
//! fetches. Cross-device QR login is not available over plain HTTP and is
//! reported as such.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng as _;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::client::oauth::{
    self, AuthorizationParams, AuthorizationServerMetadata,
};
use crate::client::pkce;
use crate::client::{
    Client, ClientBuildError, ClientError, ClientFactory, HomeserverLoginDetails,
    HumanQrLoginError, MatrixErrorKind, OidcAuthorizationData, OidcConfiguration, OidcError,
    OidcPrompt, QrLoginHandler, QrLoginProgressListener, Session,
};
use crate::config::DiscoveryConfig;
use crate::error::{HomeserverAuthError, Result};
use crate::qr_code::QrCodeData;
use crate::session::SessionDirectories;
use crate::settings::AppSettings;
use crate::well_known::{ClientWellKnown, CLIENT_WELL_KNOWN_PATH, ELEMENT_WELL_KNOWN_PATH};

/// Unstable feature flag advertising simplified sliding sync
pub const SLIDING_SYNC_FEATURE: &str = "org.matrix.simplified_msc3575";

const VERSIONS_PATH: &str = "/_matrix/client/versions";
const LOGIN_PATH: &str = "/_matrix/client/v3/login";
const LOGOUT_PATH: &str = "/_matrix/client/v3/logout";
const WHOAMI_PATH: &str = "/_matrix/client/v3/account/whoami";

#[derive(Debug, Deserialize)]
struct VersionsResponse {
    #[serde(default)]
    versions: Vec<String>,
    #[serde(default)]
    unstable_features: HashMap<String, bool>,
}

#[derive(Debug, Deserialize)]
struct LoginFlows {
    #[serde(default)]
    flows: Vec<LoginFlow>,
}

#[derive(Debug, Deserialize)]
struct LoginFlow {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    user_id: String,
    access_token: String,
    device_id: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhoamiResponse {
    user_id: String,
    #[serde(default)]
    device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MatrixErrorBody {
    #[serde(default)]
    errcode: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Turn a non-success response into a [`ClientError::MatrixApi`]
async fn matrix_error(response: reqwest::Response) -> ClientError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let parsed: Option<MatrixErrorBody> = serde_json::from_str(&body).ok();
    let (errcode, message) = match parsed {
        Some(MatrixErrorBody { errcode, error }) => (
            errcode.unwrap_or_else(|| "M_UNKNOWN".to_string()),
            error.unwrap_or_default(),
        ),
        None => ("M_UNKNOWN".to_string(), body),
    };
    ClientError::MatrixApi {
        kind: MatrixErrorKind::from_errcode(&errcode),
        status,
        message,
    }
}

fn transport(error: reqwest::Error) -> ClientError {
    ClientError::Transport(error.to_string())
}

// ---------------------------------------------------------------------------
// HttpClientFactory
// ---------------------------------------------------------------------------

/// Builds [`HttpClient`]s
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    http: reqwest::Client,
    scheme: String,
    require_sliding_sync: bool,
}

impl HttpClientFactory {
    /// Build a factory from the discovery settings
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &DiscoveryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(HomeserverAuthError::from)?;
        Ok(Self::with_client(http, &config.scheme, config.require_sliding_sync))
    }

    pub fn with_client(http: reqwest::Client, scheme: &str, require_sliding_sync: bool) -> Self {
        Self {
            http,
            scheme: scheme.to_string(),
            require_sliding_sync,
        }
    }

    /// Resolve `address` to a homeserver base URL and server name
    async fn resolve(&self, address: &str) -> std::result::Result<(Url, Option<String>), ClientBuildError> {
        let address = address.trim();
        if address.contains("://") {
            // A URL names the homeserver directly; there is no server name.
            let url = Url::parse(address)
                .map_err(|e| ClientBuildError::InvalidServerName(format!("{address}: {e}")))?;
            return Ok((url, None));
        }

        let origin = Url::parse(&format!("{}://{}", self.scheme, address))
            .map_err(|e| ClientBuildError::InvalidServerName(format!("{address}: {e}")))?;
        if origin.path() != "/" || origin.query().is_some() {
            return Err(ClientBuildError::InvalidServerName(address.to_string()));
        }

        let well_known_url = origin
            .join(CLIENT_WELL_KNOWN_PATH)
            .map_err(|e| ClientBuildError::Generic(e.to_string()))?;
        let server = Some(address.to_lowercase());

        let response = match self.http.get(well_known_url.clone()).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::debug!("No well-known at {} ({})", well_known_url, response.status());
                return Ok((origin, server));
            }
            Err(e) => {
                tracing::debug!("Well-known request to {} failed: {}", well_known_url, e);
                return Ok((origin, server));
            }
        };

        let body = response
            .bytes()
            .await
            .map_err(|e| ClientBuildError::ServerUnreachable(e.to_string()))?;
        let document = ClientWellKnown::from_slice(&body)
            .map_err(|e| ClientBuildError::WellKnownDeserialization(e.to_string()))?;

        match document.homeserver_base_url {
            Some(base_url) => {
                let url = Url::parse(&base_url)
                    .map_err(|e| ClientBuildError::WellKnownDeserialization(format!("m.homeserver.base_url: {e}")))?;
                Ok((url, server))
            }
            None => Ok((origin, server)),
        }
    }

    async fn check_versions(&self, homeserver: &Url) -> std::result::Result<(), ClientBuildError> {
        let url = homeserver
            .join(VERSIONS_PATH)
            .map_err(|e| ClientBuildError::Generic(e.to_string()))?;
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ClientBuildError::ServerUnreachable(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(ClientBuildError::ServerUnreachable(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        let versions: VersionsResponse = response
            .json()
            .await
            .map_err(|e| ClientBuildError::ServerUnreachable(format!("{url}: {e}")))?;
        tracing::debug!("{} supports versions {:?}", homeserver, versions.versions);

        let sliding_sync = versions
            .unstable_features
            .get(SLIDING_SYNC_FEATURE)
            .copied()
            .unwrap_or(false);
        if self.require_sliding_sync && !sliding_sync {
            return Err(ClientBuildError::SlidingSyncVersion(format!(
                "{homeserver} does not advertise {SLIDING_SYNC_FEATURE}"
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClientFactory for HttpClientFactory {
    async fn make_client(
        &self,
        address: &str,
        directories: &SessionDirectories,
        _passphrase: &str,
        _settings: &AppSettings,
    ) -> std::result::Result<Arc<dyn Client>, ClientBuildError> {
        let (homeserver, server) = self.resolve(address).await?;
        self.check_versions(&homeserver).await?;
        directories
            .create()
            .await
            .map_err(|e| ClientBuildError::Generic(format!("cannot create session directory: {e}")))?;

        tracing::info!("Built client for {} at {}", address, homeserver);
        Ok(Arc::new(HttpClient::new(
            self.http.clone(),
            homeserver,
            server,
            &self.scheme,
        )))
    }
}

// ---------------------------------------------------------------------------
// HttpClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PendingAuthorization {
    metadata: AuthorizationServerMetadata,
    client_id: String,
    redirect_uri: String,
    verifier: String,
    device_id: String,
}

#[derive(Debug, Default)]
struct HttpClientState {
    session: Option<Session>,
    pending: HashMap<String, PendingAuthorization>,
}

/// [`Client`] speaking the Matrix client-server API through reqwest
#[derive(Debug)]
pub struct HttpClient {
    http: reqwest::Client,
    homeserver: Url,
    server: Option<String>,
    scheme: String,
    state: Mutex<HttpClientState>,
}

impl HttpClient {
    pub fn new(http: reqwest::Client, homeserver: Url, server: Option<String>, scheme: &str) -> Self {
        Self {
            http,
            homeserver,
            server,
            scheme: scheme.to_string(),
            state: Mutex::new(HttpClientState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, HttpClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn endpoint(&self, path: &str) -> std::result::Result<Url, ClientError> {
        self.homeserver
            .join(path)
            .map_err(|e| ClientError::Generic(format!("invalid endpoint {path}: {e}")))
    }

    /// Origin serving the well-known documents
    fn well_known_url(&self, path: &str) -> std::result::Result<Url, ClientError> {
        let base = match &self.server {
            Some(server) => Url::parse(&format!("{}://{}", self.scheme, server))
                .map_err(|e| ClientError::Generic(e.to_string()))?,
            None => self.homeserver.clone(),
        };
        base.join(path)
            .map_err(|e| ClientError::Generic(format!("invalid well-known path {path}: {e}")))
    }

    async fn fetch_bytes(&self, url: Url) -> std::result::Result<Vec<u8>, ClientError> {
        let response = self.http.get(url.clone()).send().await.map_err(transport)?;
        if !response.status().is_success() {
            return Err(ClientError::Transport(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        Ok(response.bytes().await.map_err(transport)?.to_vec())
    }

    async fn supports_password_login(&self) -> bool {
        let Ok(url) = self.endpoint(LOGIN_PATH) else {
            return false;
        };
        let response = match self.http.get(url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::debug!("Login flows request returned {}", response.status());
                return false;
            }
            Err(e) => {
                tracing::debug!("Login flows request failed: {}", e);
                return false;
            }
        };
        match response.json::<LoginFlows>().await {
            Ok(flows) => flows.flows.iter().any(|flow| flow.kind == "m.login.password"),
            Err(e) => {
                tracing::debug!("Undecodable login flows: {}", e);
                false
            }
        }
    }

    async fn whoami(&self, access_token: &str) -> std::result::Result<WhoamiResponse, ClientError> {
        let response = self
            .http
            .get(self.endpoint(WHOAMI_PATH)?)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Err(matrix_error(response).await);
        }
        response.json().await.map_err(transport)
    }
}

fn generate_device_id() -> String {
    rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(10)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect()
}

#[async_trait::async_trait]
impl Client for HttpClient {
    async fn homeserver_login_details(&self) -> HomeserverLoginDetails {
        let (supports_password_login, metadata) = tokio::join!(
            self.supports_password_login(),
            oauth::fetch_auth_metadata(&self.http, &self.homeserver)
        );

        let (supports_oidc_login, supported_oidc_prompts) = match metadata {
            Ok(metadata) => (true, metadata.prompts()),
            Err(_) => (false, Vec::new()),
        };

        HomeserverLoginDetails {
            url: self.homeserver(),
            supports_oidc_login,
            supported_oidc_prompts,
            supports_password_login,
        }
    }

    async fn url_for_oidc(
        &self,
        config: &OidcConfiguration,
        prompt: Option<OidcPrompt>,
        login_hint: Option<&str>,
        device_id: Option<&str>,
        additional_scopes: Option<&[String]>,
    ) -> std::result::Result<OidcAuthorizationData, OidcError> {
        let metadata = oauth::fetch_auth_metadata(&self.http, &self.homeserver).await?;
        pkce::verify_s256_support(&metadata)?;
        let client_id = oauth::resolve_client_id(&self.http, &metadata, config).await?;

        let device_id = device_id.map_or_else(generate_device_id, str::to_string);
        let scope = oauth::scope_for_device(&device_id, additional_scopes.unwrap_or(&[]));
        let state = pkce::generate_state();
        let challenge = pkce::generate();

        let url = oauth::build_authorization_url(
            &metadata,
            &AuthorizationParams {
                client_id: &client_id,
                redirect_uri: &config.redirect_uri,
                scope: &scope,
                state: &state,
                code_challenge: &challenge.challenge,
                prompt: prompt.as_ref(),
                login_hint,
            },
        )?;

        self.lock_state().pending.insert(
            state.clone(),
            PendingAuthorization {
                metadata,
                client_id,
                redirect_uri: config.redirect_uri.clone(),
                verifier: challenge.verifier,
                device_id,
            },
        );
        Ok(OidcAuthorizationData::new(url, state))
    }

    async fn abort_oidc_auth(&self, data: &OidcAuthorizationData) {
        if self.lock_state().pending.remove(data.state()).is_some() {
            tracing::debug!("Dropped pending authorization {}", data.state());
        }
    }

    async fn login_with_oidc_callback(
        &self,
        callback_url: &Url,
    ) -> std::result::Result<(), OidcError> {
        let code = oauth::parse_callback(callback_url)?;
        let pending = self
            .lock_state()
            .pending
            .remove(&code.state)
            .ok_or(OidcError::InvalidState)?;

        let token = oauth::exchange_code(
            &self.http,
            &pending.metadata,
            &code.code,
            &pending.redirect_uri,
            &pending.client_id,
            &pending.verifier,
        )
        .await?;

        let whoami = self
            .whoami(&token.access_token)
            .await
            .map_err(|e| OidcError::Generic(format!("whoami failed: {e}")))?;

        self.lock_state().session = Some(Session {
            user_id: whoami.user_id,
            device_id: whoami.device_id.unwrap_or(pending.device_id),
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            homeserver_url: self.homeserver(),
            oidc: true,
        });
        Ok(())
    }

    async fn login(
        &self,
        username: &str,
        password: &str,
        initial_device_name: Option<&str>,
        device_id: Option<&str>,
    ) -> std::result::Result<(), ClientError> {
        let mut body = json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": username },
            "password": password,
        });
        if let Some(name) = initial_device_name {
            body["initial_device_display_name"] = json!(name);
        }
        if let Some(device_id) = device_id {
            body["device_id"] = json!(device_id);
        }

        let response = self
            .http
            .post(self.endpoint(LOGIN_PATH)?)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Err(matrix_error(response).await);
        }
        let login: LoginResponse = response.json().await.map_err(transport)?;

        self.lock_state().session = Some(Session {
            user_id: login.user_id,
            device_id: login.device_id,
            access_token: login.access_token,
            refresh_token: login.refresh_token,
            homeserver_url: self.homeserver(),
            oidc: false,
        });
        Ok(())
    }

    fn new_login_with_qr_code_handler(&self, _config: &OidcConfiguration) -> Arc<dyn QrLoginHandler> {
        Arc::new(UnsupportedQrLoginHandler)
    }

    fn session(&self) -> std::result::Result<Session, ClientError> {
        self.lock_state().session.clone().ok_or(ClientError::NotLoggedIn)
    }

    async fn logout(&self) -> std::result::Result<(), ClientError> {
        let session = self.session()?;
        let response = self
            .http
            .post(self.endpoint(LOGOUT_PATH)?)
            .bearer_auth(&session.access_token)
            .json(&json!({}))
            .send()
            .await
            .map_err(transport)?;

        // The local session is dropped even if the server refuses.
        self.lock_state().session = None;
        if !response.status().is_success() {
            return Err(matrix_error(response).await);
        }
        Ok(())
    }

    fn server(&self) -> Option<String> {
        self.server.clone()
    }

    fn homeserver(&self) -> String {
        self.homeserver.as_str().trim_end_matches('/').to_string()
    }

    async fn element_well_known(&self) -> std::result::Result<Vec<u8>, ClientError> {
        self.fetch_bytes(self.well_known_url(ELEMENT_WELL_KNOWN_PATH)?).await
    }

    async fn client_well_known(&self) -> std::result::Result<Vec<u8>, ClientError> {
        self.fetch_bytes(self.well_known_url(CLIENT_WELL_KNOWN_PATH)?).await
    }
}

/// QR handler for clients without a rendezvous transport
#[derive(Debug)]
struct UnsupportedQrLoginHandler;

#[async_trait::async_trait]
impl QrLoginHandler for UnsupportedQrLoginHandler {
    async fn scan(
        &self,
        _data: &QrCodeData,
        _listener: Arc<dyn QrLoginProgressListener>,
    ) -> std::result::Result<(), HumanQrLoginError> {
        tracing::warn!("Cross-device login is not supported by the HTTP client");
        Err(HumanQrLoginError::LinkingNotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_shape() {
        let id = generate_device_id();
        assert_eq!(id.len(), 10);
        assert!(id.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_homeserver_has_no_trailing_slash() {
        let client = HttpClient::new(
            reqwest::Client::new(),
            Url::parse("https://matrix.example.com/").unwrap(),
            Some("example.com".to_string()),
            "https",
        );
        assert_eq!(client.homeserver(), "https://matrix.example.com");
        assert_eq!(
            client.well_known_url(ELEMENT_WELL_KNOWN_PATH).unwrap().as_str(),
            "https://example.com/.well-known/element/element.json"
        );
    }

    #[test]
    fn test_new_client_is_logged_out() {
        let client = HttpClient::new(
            reqwest::Client::new(),
            Url::parse("https://matrix.example.com").unwrap(),
            None,
            "https",
        );
        assert_eq!(client.session(), Err(ClientError::NotLoggedIn));
    }
}
