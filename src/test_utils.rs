//! Test utilities for homeserver-auth
//!
//! In-process fakes standing in for the protocol client, the client
//! factory, well-known lookups, the session store, and the browser data
//! store, plus small assertion helpers.
//!
//! # Usage
//!
//! ```ignore
//! let client = FakeClient::builder().oidc(true).build();
//! let factory = FakeClientFactory::new().with_client("example.com", client.clone());
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use url::Url;

use crate::auth::browser_flow::BrowsingDataStore;
use crate::client::{
    Client, ClientBuildError, ClientError, ClientFactory, HomeserverLoginDetails,
    HumanQrLoginError, OidcAuthorizationData, OidcConfiguration, OidcError, OidcPrompt,
    QrLoginHandler, QrLoginProgressListener, QrLoginProgressUpdate, Session,
};
use crate::error::AuthenticationError;
use crate::qr_code::QrCodeData;
use crate::session::{SessionDirectories, SessionStoreError, UserSession, UserSessionStore};
use crate::settings::AppSettings;
use crate::well_known::{ClientWellKnown, OidcAuthentication, WellKnownLookup};

/// Create a temporary directory for testing
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temporary directory")
}

/// Assert that an authentication result failed with `expected`
pub fn assert_auth_error<T: std::fmt::Debug>(
    result: Result<T, AuthenticationError>,
    expected: AuthenticationError,
) {
    match result {
        Ok(value) => panic!("Expected error {:?}, got Ok({:?})", expected, value),
        Err(error) => assert_eq!(error, expected),
    }
}

fn session_for(user_id: &str, homeserver: &str, refresh_token: bool, oidc: bool) -> Session {
    Session {
        user_id: user_id.to_string(),
        device_id: "FAKEDEVICE".to_string(),
        access_token: "fake-access-token".to_string(),
        refresh_token: refresh_token.then(|| "fake-refresh-token".to_string()),
        homeserver_url: homeserver.to_string(),
        oidc,
    }
}

// ---------------------------------------------------------------------------
// FakeClient
// ---------------------------------------------------------------------------

/// Scriptable [`Client`]
#[derive(Debug)]
pub struct FakeClient {
    server: Option<String>,
    homeserver: String,
    login_details: HomeserverLoginDetails,
    element_well_known: Result<Vec<u8>, ClientError>,
    client_well_known: Result<Vec<u8>, ClientError>,
    oidc_url_failures: AtomicUsize,
    oidc_callback_result: Result<(), OidcError>,
    login_result: Result<(), ClientError>,
    login_user: String,
    password_refresh_token: bool,
    session: Arc<Mutex<Option<Session>>>,
    qr_handler: Arc<FakeQrHandler>,
    oidc_requests: Mutex<Vec<(OidcConfiguration, Option<OidcPrompt>, Option<String>)>>,
    aborted: Mutex<Vec<OidcAuthorizationData>>,
    logout_calls: AtomicUsize,
}

impl FakeClient {
    pub fn builder() -> FakeClientBuilder {
        FakeClientBuilder::default()
    }

    /// Configurations passed to `url_for_oidc`, with prompt and login hint
    pub fn oidc_requests(&self) -> Vec<(OidcConfiguration, Option<OidcPrompt>, Option<String>)> {
        self.oidc_requests.lock().unwrap().clone()
    }

    pub fn aborted(&self) -> Vec<OidcAuthorizationData> {
        self.aborted.lock().unwrap().clone()
    }

    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Client for FakeClient {
    async fn homeserver_login_details(&self) -> HomeserverLoginDetails {
        self.login_details.clone()
    }

    async fn url_for_oidc(
        &self,
        config: &OidcConfiguration,
        prompt: Option<OidcPrompt>,
        login_hint: Option<&str>,
        _device_id: Option<&str>,
        _additional_scopes: Option<&[String]>,
    ) -> Result<OidcAuthorizationData, OidcError> {
        let attempt = {
            let mut requests = self.oidc_requests.lock().unwrap();
            requests.push((config.clone(), prompt, login_hint.map(str::to_string)));
            requests.len()
        };
        if attempt <= self.oidc_url_failures.load(Ordering::SeqCst) {
            return Err(OidcError::Registration("scripted failure".to_string()));
        }
        let url = Url::parse(&format!(
            "https://auth.example.com/authorize?redirect_uri={}&state=state-{}",
            config.redirect_uri, attempt
        ))
        .unwrap();
        Ok(OidcAuthorizationData::new(url, format!("state-{}", attempt)))
    }

    async fn abort_oidc_auth(&self, data: &OidcAuthorizationData) {
        self.aborted.lock().unwrap().push(data.clone());
    }

    async fn login_with_oidc_callback(&self, _callback_url: &Url) -> Result<(), OidcError> {
        self.oidc_callback_result.clone()?;
        *self.session.lock().unwrap() =
            Some(session_for(&self.login_user, &self.homeserver, true, true));
        Ok(())
    }

    async fn login(
        &self,
        _username: &str,
        _password: &str,
        _initial_device_name: Option<&str>,
        _device_id: Option<&str>,
    ) -> Result<(), ClientError> {
        self.login_result.clone()?;
        *self.session.lock().unwrap() = Some(session_for(
            &self.login_user,
            &self.homeserver,
            self.password_refresh_token,
            false,
        ));
        Ok(())
    }

    fn new_login_with_qr_code_handler(&self, _config: &OidcConfiguration) -> Arc<dyn QrLoginHandler> {
        self.qr_handler.clone()
    }

    fn session(&self) -> Result<Session, ClientError> {
        self.session.lock().unwrap().clone().ok_or(ClientError::NotLoggedIn)
    }

    async fn logout(&self) -> Result<(), ClientError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        *self.session.lock().unwrap() = None;
        Ok(())
    }

    fn server(&self) -> Option<String> {
        self.server.clone()
    }

    fn homeserver(&self) -> String {
        self.homeserver.clone()
    }

    async fn element_well_known(&self) -> Result<Vec<u8>, ClientError> {
        self.element_well_known.clone()
    }

    async fn client_well_known(&self) -> Result<Vec<u8>, ClientError> {
        self.client_well_known.clone()
    }
}

/// Builder for [`FakeClient`]
pub struct FakeClientBuilder {
    server: Option<String>,
    homeserver: String,
    login_details: HomeserverLoginDetails,
    element_well_known: Result<Vec<u8>, ClientError>,
    client_well_known: Result<Vec<u8>, ClientError>,
    oidc_url_failures: usize,
    oidc_callback_result: Result<(), OidcError>,
    login_result: Result<(), ClientError>,
    login_user: String,
    password_refresh_token: bool,
    logged_in: bool,
    qr_updates: Vec<QrLoginProgressUpdate>,
    qr_result: Result<(), HumanQrLoginError>,
}

impl Default for FakeClientBuilder {
    fn default() -> Self {
        Self {
            server: Some("example.com".to_string()),
            homeserver: "https://matrix.example.com".to_string(),
            login_details: HomeserverLoginDetails {
                url: "https://matrix.example.com".to_string(),
                ..Default::default()
            },
            element_well_known: Err(ClientError::Transport("404".to_string())),
            client_well_known: Err(ClientError::Transport("404".to_string())),
            oidc_url_failures: 0,
            oidc_callback_result: Ok(()),
            login_result: Ok(()),
            login_user: "@user:example.com".to_string(),
            password_refresh_token: false,
            logged_in: false,
            qr_updates: Vec::new(),
            qr_result: Ok(()),
        }
    }
}

impl FakeClientBuilder {
    pub fn server(mut self, server: Option<&str>) -> Self {
        self.server = server.map(str::to_string);
        self
    }

    pub fn homeserver(mut self, homeserver: &str) -> Self {
        self.homeserver = homeserver.to_string();
        self
    }

    /// Advertise OIDC, optionally with the `create` prompt
    pub fn oidc(mut self, create_prompt: bool) -> Self {
        self.login_details.supports_oidc_login = true;
        self.login_details.supported_oidc_prompts = if create_prompt {
            vec![OidcPrompt::Consent, OidcPrompt::Create]
        } else {
            vec![OidcPrompt::Consent]
        };
        self
    }

    pub fn password(mut self) -> Self {
        self.login_details.supports_password_login = true;
        self
    }

    pub fn element_well_known(self, value: serde_json::Value) -> Self {
        self.element_well_known_bytes(value.to_string().into_bytes())
    }

    pub fn element_well_known_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.element_well_known = Ok(bytes);
        self
    }

    pub fn client_well_known(mut self, value: serde_json::Value) -> Self {
        self.client_well_known = Ok(value.to_string().into_bytes());
        self
    }

    /// Fail the first `count` calls to `url_for_oidc`
    pub fn fail_oidc_urls(mut self, count: usize) -> Self {
        self.oidc_url_failures = count;
        self
    }

    pub fn oidc_callback_error(mut self, error: OidcError) -> Self {
        self.oidc_callback_result = Err(error);
        self
    }

    pub fn login_error(mut self, error: ClientError) -> Self {
        self.login_result = Err(error);
        self
    }

    pub fn password_refresh_token(mut self) -> Self {
        self.password_refresh_token = true;
        self
    }

    /// Start with a session for `user_id`
    pub fn logged_in(mut self, user_id: &str) -> Self {
        self.login_user = user_id.to_string();
        self.logged_in = true;
        self
    }

    pub fn qr_updates(mut self, updates: Vec<QrLoginProgressUpdate>) -> Self {
        self.qr_updates = updates;
        self
    }

    pub fn qr_error(mut self, error: HumanQrLoginError) -> Self {
        self.qr_result = Err(error);
        self
    }

    pub fn build(self) -> Arc<FakeClient> {
        let session = Arc::new(Mutex::new(self.logged_in.then(|| {
            session_for(&self.login_user, &self.homeserver, false, false)
        })));
        let qr_handler = Arc::new(FakeQrHandler {
            updates: self.qr_updates,
            result: self.qr_result,
            session: Arc::clone(&session),
            signed_in: session_for(&self.login_user, &self.homeserver, true, true),
        });
        Arc::new(FakeClient {
            server: self.server,
            homeserver: self.homeserver,
            login_details: self.login_details,
            element_well_known: self.element_well_known,
            client_well_known: self.client_well_known,
            oidc_url_failures: AtomicUsize::new(self.oidc_url_failures),
            oidc_callback_result: self.oidc_callback_result,
            login_result: self.login_result,
            login_user: self.login_user,
            password_refresh_token: self.password_refresh_token,
            session,
            qr_handler,
            oidc_requests: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
            logout_calls: AtomicUsize::new(0),
        })
    }
}

/// [`QrLoginHandler`] replaying scripted progress
#[derive(Debug)]
pub struct FakeQrHandler {
    updates: Vec<QrLoginProgressUpdate>,
    result: Result<(), HumanQrLoginError>,
    session: Arc<Mutex<Option<Session>>>,
    signed_in: Session,
}

#[async_trait::async_trait]
impl QrLoginHandler for FakeQrHandler {
    async fn scan(
        &self,
        _data: &QrCodeData,
        listener: Arc<dyn QrLoginProgressListener>,
    ) -> Result<(), HumanQrLoginError> {
        for update in &self.updates {
            listener.on_update(update.clone());
            tokio::task::yield_now().await;
        }
        self.result.clone()?;
        *self.session.lock().unwrap() = Some(self.signed_in.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeClientFactory
// ---------------------------------------------------------------------------

/// [`ClientFactory`] returning scripted clients per address
#[derive(Default)]
pub struct FakeClientFactory {
    clients: HashMap<String, Result<Arc<FakeClient>, ClientBuildError>>,
    delays: HashMap<String, Duration>,
    requests: Mutex<Vec<(String, SessionDirectories)>>,
}

impl FakeClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(mut self, address: &str, client: Arc<FakeClient>) -> Self {
        self.clients.insert(address.to_string(), Ok(client));
        self
    }

    pub fn with_error(mut self, address: &str, error: ClientBuildError) -> Self {
        self.clients.insert(address.to_string(), Err(error));
        self
    }

    pub fn with_delay(mut self, address: &str, delay: Duration) -> Self {
        self.delays.insert(address.to_string(), delay);
        self
    }

    /// Addresses requested so far, with the directories they were given
    pub fn requests(&self) -> Vec<(String, SessionDirectories)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ClientFactory for FakeClientFactory {
    async fn make_client(
        &self,
        address: &str,
        directories: &SessionDirectories,
        _passphrase: &str,
        _settings: &AppSettings,
    ) -> Result<Arc<dyn Client>, ClientBuildError> {
        self.requests
            .lock()
            .unwrap()
            .push((address.to_string(), directories.clone()));
        if let Some(delay) = self.delays.get(address) {
            tokio::time::sleep(*delay).await;
        }
        let _ = directories.create().await;
        match self.clients.get(address) {
            Some(Ok(client)) => Ok(client.clone() as Arc<dyn Client>),
            Some(Err(error)) => Err(error.clone()),
            None => Err(ClientBuildError::ServerUnreachable(address.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// FakeWellKnown
// ---------------------------------------------------------------------------

/// [`WellKnownLookup`] serving documents from memory
#[derive(Default)]
pub struct FakeWellKnown {
    documents: HashMap<String, ClientWellKnown>,
    requested: Mutex<Vec<String>>,
}

impl FakeWellKnown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_call_url(mut self, domain: &str, url: &str) -> Self {
        self.documents
            .entry(domain.to_string())
            .or_default()
            .call_service_url = Some(Url::parse(url).unwrap());
        self
    }

    pub fn with_oidc(mut self, domain: &str, issuer: &str, client_id: Option<&str>) -> Self {
        self.documents
            .entry(domain.to_string())
            .or_default()
            .oidc_authentication = Some(OidcAuthentication {
            issuer: issuer.to_string(),
            client_id: client_id.map(str::to_string),
        });
        self
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl WellKnownLookup for FakeWellKnown {
    async fn fetch_client_well_known(&self, domain: &str) -> Option<ClientWellKnown> {
        self.requested.lock().unwrap().push(domain.to_string());
        self.documents.get(domain).cloned()
    }
}

// ---------------------------------------------------------------------------
// FakeSessionStore / RecordingDataStore
// ---------------------------------------------------------------------------

/// In-memory [`UserSessionStore`]
#[derive(Default)]
pub struct FakeSessionStore {
    fail: bool,
    stored: Mutex<Vec<SessionDirectories>>,
}

impl FakeSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn stored(&self) -> Vec<SessionDirectories> {
        self.stored.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl UserSessionStore for FakeSessionStore {
    async fn user_session(
        &self,
        client: Arc<dyn Client>,
        directories: &SessionDirectories,
        _passphrase: &str,
    ) -> Result<UserSession, SessionStoreError> {
        if self.fail {
            return Err(SessionStoreError::Storage("scripted failure".to_string()));
        }
        let session = client.session()?;
        self.stored.lock().unwrap().push(directories.clone());
        Ok(UserSession {
            user_id: session.user_id,
            device_id: session.device_id,
            homeserver: session.homeserver_url,
            directories: directories.clone(),
            client,
        })
    }
}

/// [`BrowsingDataStore`] counting purges
#[derive(Debug, Default)]
pub struct RecordingDataStore {
    purges: AtomicUsize,
}

impl RecordingDataStore {
    pub fn purges(&self) -> usize {
        self.purges.load(Ordering::SeqCst)
    }
}

impl BrowsingDataStore for RecordingDataStore {
    fn purge(&self) {
        self.purges.fetch_add(1, Ordering::SeqCst);
    }
}
