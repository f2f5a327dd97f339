//! Authentication orchestrator
//!
//! [`AuthenticationService`] is the single entry point for signing a user
//! in. It owns the current homeserver, the live protocol client, and the
//! session directories of the current attempt.
//!
//! # Flow
//!
//! 1. [`configure`](AuthenticationService::configure) builds a client for an
//!    address, applies the remote settings gate, and classifies the login
//!    mode.
//! 2. The caller then picks one of:
//!    - [`login`](AuthenticationService::login) with a password,
//!    - [`url_for_oidc_login`](AuthenticationService::url_for_oidc_login)
//!      followed by
//!      [`login_with_oidc_callback`](AuthenticationService::login_with_oidc_callback),
//!    - [`login_with_qr_code`](AuthenticationService::login_with_qr_code),
//!      which configures its own client from the scanned code.
//! 3. Success yields a [`UserSession`] from the session store.
//!
//! A `configure` that is overtaken by a newer one completes with
//! [`AuthenticationError::Superseded`] and leaves no trace in the state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use url::Url;

use crate::auth::homeserver::{extract_domain, AuthenticationFlow, LoginHomeserver, LoginMode};
use crate::auth::qr_login::{map_qr_login_error, QrLoginProgress, QrLoginProgressPublisher, QrProgressSink};
use crate::client::{
    Client, ClientBuildError, ClientError, ClientFactory, HomeserverLoginDetails, MatrixErrorKind,
    OidcAuthorizationData, OidcError, OidcPrompt,
};
use crate::error::{AuthenticationError, OidcErrorKind, QrCodeErrorKind};
use crate::qr_code::QrCodeData;
use crate::remote_settings::RemoteSettingsHook;
use crate::session::{generate_passphrase, SessionDirectories, UserSession, UserSessionStore};
use crate::settings::AppSettings;
use crate::well_known::WellKnownLookup;

/// Classify the login mechanisms a homeserver advertises
///
/// OIDC wins over password; a server offering neither is unsupported.
pub fn classify_login_mode(details: &HomeserverLoginDetails) -> LoginMode {
    if details.supports_oidc_login {
        LoginMode::Oidc {
            supports_create_prompt: details.supported_oidc_prompts.contains(&OidcPrompt::Create),
        }
    } else if details.supports_password_login {
        LoginMode::Password
    } else {
        LoginMode::Unsupported
    }
}

fn map_client_build_error(error: ClientBuildError) -> AuthenticationError {
    match error {
        ClientBuildError::WellKnownDeserialization(message) => {
            tracing::error!("The server has an invalid well-known file: {}", message);
            AuthenticationError::InvalidWellKnown(message)
        }
        ClientBuildError::SlidingSyncVersion(message) => {
            tracing::info!("The server is not configured for sliding sync: {}", message);
            AuthenticationError::SlidingSyncNotAvailable
        }
        other => {
            tracing::error!("Failed configuring a server: {}", other);
            AuthenticationError::InvalidHomeserverAddress
        }
    }
}

fn map_password_login_error(error: &ClientError) -> AuthenticationError {
    match error {
        ClientError::MatrixApi {
            kind: MatrixErrorKind::Forbidden,
            ..
        } => AuthenticationError::InvalidCredentials,
        ClientError::MatrixApi {
            kind: MatrixErrorKind::UserDeactivated,
            ..
        } => AuthenticationError::AccountDeactivated,
        _ => AuthenticationError::FailedLoggingIn,
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct LiveClient {
    client: Arc<dyn Client>,
    directories: SessionDirectories,
}

#[derive(Debug)]
struct ServiceState {
    client: Option<LiveClient>,
    flow: AuthenticationFlow,
    directories: SessionDirectories,
}

/// One client construction, tagged with the generation it started in
struct Attempt {
    generation: u64,
    directories: SessionDirectories,
}

// ---------------------------------------------------------------------------
// AuthenticationService
// ---------------------------------------------------------------------------

/// Coordinates homeserver discovery and every login path
pub struct AuthenticationService {
    settings: Arc<AppSettings>,
    client_factory: Arc<dyn ClientFactory>,
    session_store: Arc<dyn UserSessionStore>,
    well_known: Arc<dyn WellKnownLookup>,
    remote_settings: RemoteSettingsHook,
    session_base_dir: PathBuf,
    passphrase: String,
    homeserver: watch::Sender<LoginHomeserver>,
    state: Mutex<ServiceState>,
    generation: AtomicU64,
}

impl std::fmt::Debug for AuthenticationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationService")
            .field("homeserver", &*self.homeserver.borrow())
            .field("session_base_dir", &self.session_base_dir)
            .finish()
    }
}

impl AuthenticationService {
    /// Create a service starting at the default account provider
    ///
    /// # Arguments
    ///
    /// * `settings` - Shared application settings
    /// * `client_factory` - Builds protocol clients
    /// * `session_store` - Materializes sessions after login
    /// * `well_known` - Well-known lookups for OIDC discovery and remote settings
    pub fn new(
        settings: Arc<AppSettings>,
        client_factory: Arc<dyn ClientFactory>,
        session_store: Arc<dyn UserSessionStore>,
        well_known: Arc<dyn WellKnownLookup>,
    ) -> Self {
        let session_base_dir = settings.config().session.resolve_base_dir();
        let remote_settings = RemoteSettingsHook::new(&settings, Arc::clone(&well_known));
        let (homeserver, _) = watch::channel(Self::default_homeserver(&settings));

        Self {
            client_factory,
            session_store,
            well_known,
            remote_settings,
            passphrase: generate_passphrase(),
            homeserver,
            state: Mutex::new(ServiceState {
                client: None,
                flow: AuthenticationFlow::Login,
                directories: SessionDirectories::new(&session_base_dir),
            }),
            generation: AtomicU64::new(0),
            session_base_dir,
            settings,
        }
    }

    fn default_homeserver(settings: &AppSettings) -> LoginHomeserver {
        LoginHomeserver::new(settings.default_account_provider(), LoginMode::Unknown)
    }

    fn lock_state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Current homeserver
    pub fn homeserver(&self) -> LoginHomeserver {
        self.homeserver.borrow().clone()
    }

    /// Observe homeserver changes; the current value is seen first
    pub fn subscribe_homeserver(&self) -> watch::Receiver<LoginHomeserver> {
        self.homeserver.subscribe()
    }

    pub fn flow(&self) -> AuthenticationFlow {
        self.lock_state().flow
    }

    /// Directories the next session will be stored in
    pub fn session_directories(&self) -> SessionDirectories {
        self.lock_state().directories.clone()
    }

    pub fn settings(&self) -> &Arc<AppSettings> {
        &self.settings
    }

    pub fn remote_settings(&self) -> &RemoteSettingsHook {
        &self.remote_settings
    }

    fn live_client(&self) -> Option<LiveClient> {
        self.lock_state().client.clone()
    }

    // -----------------------------------------------------------------------
    // Configure
    // -----------------------------------------------------------------------

    /// Point the service at a homeserver
    ///
    /// # Arguments
    ///
    /// * `address` - Server name or URL entered by the user
    /// * `flow` - Whether the user is signing in or registering
    ///
    /// # Errors
    ///
    /// - [`AuthenticationError::LoginNotSupported`] or
    ///   [`AuthenticationError::RegistrationNotSupported`] when the server
    ///   cannot serve `flow`
    /// - [`AuthenticationError::InvalidWellKnown`],
    ///   [`AuthenticationError::SlidingSyncNotAvailable`],
    ///   [`AuthenticationError::ElementProRequired`], or
    ///   [`AuthenticationError::InvalidHomeserverAddress`] when no usable
    ///   client can be built
    /// - [`AuthenticationError::Superseded`] when a newer call started
    ///   before this one finished
    pub async fn configure(
        &self,
        address: &str,
        flow: AuthenticationFlow,
    ) -> Result<(), AuthenticationError> {
        tracing::info!("Configuring homeserver {} for {:?}", address, flow);
        let attempt = self.begin_attempt().await;
        let outcome = self.configure_attempt(address, flow, &attempt).await;

        let installed = {
            let mut state = self.lock_state();
            if self.generation.load(Ordering::SeqCst) != attempt.generation {
                tracing::debug!("Discarding configuration of {}: superseded", address);
                Err(AuthenticationError::Superseded)
            } else {
                outcome.map(|(client, login_mode)| {
                    state.client = Some(LiveClient {
                        client,
                        directories: attempt.directories.clone(),
                    });
                    state.flow = flow;
                    self.homeserver
                        .send_replace(LoginHomeserver::new(address, login_mode));
                    login_mode
                })
            }
        };

        match installed {
            Ok(login_mode) => {
                tracing::info!("Configured {} with login mode {:?}", address, login_mode);
                Ok(())
            }
            Err(error) => {
                self.discard_attempt(&attempt).await;
                Err(error)
            }
        }
    }

    async fn configure_attempt(
        &self,
        address: &str,
        flow: AuthenticationFlow,
        attempt: &Attempt,
    ) -> Result<(Arc<dyn Client>, LoginMode), AuthenticationError> {
        let client = self.build_client(address, &attempt.directories).await?;
        let details = client.homeserver_login_details().await;
        let login_mode = classify_login_mode(&details);

        match flow {
            AuthenticationFlow::Login if login_mode == LoginMode::Unsupported => {
                Err(AuthenticationError::LoginNotSupported)
            }
            AuthenticationFlow::Register if !login_mode.supports_registration() => {
                Err(AuthenticationError::RegistrationNotSupported)
            }
            _ => Ok((client, login_mode)),
        }
    }

    /// Rotate the session directories and start a new generation
    async fn begin_attempt(&self) -> Attempt {
        let (attempt, stale) = {
            let mut state = self.lock_state();
            let fresh = SessionDirectories::new(&self.session_base_dir);
            let stale = std::mem::replace(&mut state.directories, fresh.clone());
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            (
                Attempt {
                    generation,
                    directories: fresh,
                },
                stale,
            )
        };
        stale.delete().await;
        attempt
    }

    /// Remove the directories of an attempt that produced no client
    async fn discard_attempt(&self, attempt: &Attempt) {
        {
            let mut state = self.lock_state();
            if state.directories == attempt.directories {
                state.directories = SessionDirectories::new(&self.session_base_dir);
            }
        }
        attempt.directories.delete().await;
    }

    async fn build_client(
        &self,
        address: &str,
        directories: &SessionDirectories,
    ) -> Result<Arc<dyn Client>, AuthenticationError> {
        let client = self
            .client_factory
            .make_client(address, directories, &self.passphrase, &self.settings)
            .await
            .map_err(map_client_build_error)?;
        self.remote_settings
            .initialize_cache(client.as_ref(), &self.settings)
            .await?;
        Ok(client)
    }

    // -----------------------------------------------------------------------
    // OIDC
    // -----------------------------------------------------------------------

    /// Start an OIDC authorization for the configured homeserver
    ///
    /// The issuer advertised by the homeserver's well-known document is
    /// tried first, with its client id as the only static registration. If
    /// that fails, or nothing is advertised, the configured OIDC settings
    /// are used as they are.
    ///
    /// # Errors
    ///
    /// Returns `Oidc(UrlFailure)` when no client is configured or both
    /// attempts fail.
    pub async fn url_for_oidc_login(
        &self,
        login_hint: Option<&str>,
    ) -> Result<OidcAuthorizationData, AuthenticationError> {
        let Some(live) = self.live_client() else {
            return Err(AuthenticationError::Oidc(OidcErrorKind::UrlFailure));
        };

        let homeserver = self.homeserver();
        let prompt = (self.flow() == AuthenticationFlow::Register
            && homeserver.login_mode.supports_registration())
        .then_some(OidcPrompt::Create);
        let static_configuration = self.settings.oidc_configuration();

        let domain = extract_domain(&homeserver.address);
        if let Some(discovered) = self.well_known.fetch_oidc_configuration(&domain).await {
            tracing::info!(
                "Discovered OIDC issuer {} for {} (client id {})",
                discovered.issuer,
                domain,
                discovered.client_id.as_deref().unwrap_or("none")
            );
            let mut configuration = static_configuration.clone();
            configuration.static_registrations = match discovered.client_id {
                Some(client_id) => HashMap::from([(discovered.issuer.clone(), client_id)]),
                None => {
                    tracing::warn!("No client id advertised for {}, dynamic registration required", discovered.issuer);
                    HashMap::new()
                }
            };

            match live
                .client
                .url_for_oidc(&configuration, prompt.clone(), login_hint, None, None)
                .await
            {
                Ok(data) => return Ok(data),
                Err(e) => tracing::warn!(
                    "OIDC with the discovered configuration failed, using static settings: {}",
                    e
                ),
            }
        }

        live.client
            .url_for_oidc(&static_configuration, prompt, login_hint, None, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to get URL for OIDC login: {}", e);
                AuthenticationError::Oidc(OidcErrorKind::UrlFailure)
            })
    }

    /// Forget a pending authorization, best effort
    pub async fn abort_oidc_login(&self, data: &OidcAuthorizationData) {
        let Some(live) = self.live_client() else {
            return;
        };
        tracing::info!("Aborting OIDC login");
        live.client.abort_oidc_auth(data).await;
    }

    /// Complete an OIDC authorization from its redirect
    ///
    /// # Errors
    ///
    /// Returns `Oidc(UserCancellation)` if the user backed out, and
    /// [`AuthenticationError::FailedLoggingIn`] for every other failure.
    pub async fn login_with_oidc_callback(
        &self,
        callback_url: &Url,
    ) -> Result<UserSession, AuthenticationError> {
        let Some(live) = self.live_client() else {
            return Err(AuthenticationError::FailedLoggingIn);
        };

        match live.client.login_with_oidc_callback(callback_url).await {
            Ok(()) => self.user_session(live.client, &live.directories).await,
            Err(OidcError::Cancelled) => {
                Err(AuthenticationError::Oidc(OidcErrorKind::UserCancellation))
            }
            Err(e) => {
                tracing::error!("Login with OIDC failed: {}", e);
                Err(AuthenticationError::FailedLoggingIn)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Password
    // -----------------------------------------------------------------------

    /// Log in with a username and password
    ///
    /// # Errors
    ///
    /// - [`AuthenticationError::InvalidCredentials`] for rejected credentials
    /// - [`AuthenticationError::AccountDeactivated`] for deactivated accounts
    /// - [`AuthenticationError::SessionTokenRefreshNotSupported`] when the
    ///   server issued a refresh token; the device is logged out again
    /// - [`AuthenticationError::FailedLoggingIn`] otherwise
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        initial_device_name: Option<&str>,
        device_id: Option<&str>,
    ) -> Result<UserSession, AuthenticationError> {
        let Some(live) = self.live_client() else {
            return Err(AuthenticationError::FailedLoggingIn);
        };

        if let Err(e) = live
            .client
            .login(username, password, initial_device_name, device_id)
            .await
        {
            tracing::error!("Failed logging in: {}", e);
            return Err(map_password_login_error(&e));
        }

        let has_refresh_token = live
            .client
            .session()
            .ok()
            .and_then(|session| session.refresh_token)
            .is_some();
        if has_refresh_token {
            tracing::warn!("Refresh token issued for a password session, logging out");
            if let Err(e) = live.client.logout().await {
                tracing::debug!("Logout after refused session failed: {}", e);
            }
            return Err(AuthenticationError::SessionTokenRefreshNotSupported);
        }

        self.user_session(live.client, &live.directories).await
    }

    // -----------------------------------------------------------------------
    // QR code
    // -----------------------------------------------------------------------

    /// Log in by scanning the QR code shown on a signed-in device
    ///
    /// The code is validated before anything touches the network; invalid
    /// codes, codes from devices that are not signed in, and codes for
    /// servers outside the allowed providers fail immediately. The rest of
    /// the login runs in the background.
    pub fn login_with_qr_code(self: &Arc<Self>, bytes: &[u8]) -> QrLoginProgressPublisher {
        let (sink, publisher) = QrProgressSink::new();

        let data = match self.validate_qr_code(bytes) {
            Ok(data) => data,
            Err(error) => {
                sink.fail(error);
                return publisher;
            }
        };

        let service = Arc::clone(self);
        tokio::spawn(async move {
            match service.run_qr_login(data, Arc::clone(&sink)).await {
                Ok(session) => sink.progress(QrLoginProgress::SignedIn(session)),
                Err(error) => sink.fail(error),
            }
        });

        publisher
    }

    fn validate_qr_code(&self, bytes: &[u8]) -> Result<QrCodeData, AuthenticationError> {
        let data = QrCodeData::from_bytes(bytes).map_err(|e| {
            tracing::error!("QR code decode error: {}", e);
            AuthenticationError::QrCode(QrCodeErrorKind::InvalidQrCode)
        })?;

        let Some(server_name) = data.server_name() else {
            tracing::error!("The QR code is from a device that is not yet signed in");
            return Err(AuthenticationError::QrCode(QrCodeErrorKind::DeviceNotSignedIn));
        };

        let providers = self.settings.account_providers();
        if !self.settings.allow_other_account_providers()
            && !providers.iter().any(|p| p == server_name)
        {
            tracing::error!("The scanned device's server is not allowed: {}", server_name);
            return Err(AuthenticationError::QrCode(
                QrCodeErrorKind::ProviderNotAllowed {
                    scanned_provider: server_name.to_string(),
                    allowed_providers: providers.to_vec(),
                },
            ));
        }

        Ok(data)
    }

    async fn run_qr_login(
        &self,
        data: QrCodeData,
        sink: Arc<QrProgressSink>,
    ) -> Result<UserSession, AuthenticationError> {
        let attempt = self.begin_attempt().await;
        let result = self.qr_login_attempt(&data, sink, &attempt).await;
        if result.is_err() {
            self.discard_attempt(&attempt).await;
        }
        result
    }

    async fn qr_login_attempt(
        &self,
        data: &QrCodeData,
        sink: Arc<QrProgressSink>,
        attempt: &Attempt,
    ) -> Result<UserSession, AuthenticationError> {
        let server_name = data.server_name().unwrap_or_default().to_string();

        let client = self
            .build_client(&server_name, &attempt.directories)
            .await
            .map_err(|error| match error {
                AuthenticationError::ElementProRequired { .. } => error,
                other => {
                    tracing::error!("QR code login could not reach {}: {}", server_name, other);
                    AuthenticationError::QrCode(QrCodeErrorKind::Unknown)
                }
            })?;

        let handler = client.new_login_with_qr_code_handler(&self.settings.oidc_configuration());
        handler
            .scan(data, sink)
            .await
            .map_err(|e| map_qr_login_error(&e))?;

        self.user_session(client, &attempt.directories).await
    }

    // -----------------------------------------------------------------------
    // Reset / sessions
    // -----------------------------------------------------------------------

    /// Return to the default homeserver and drop the client
    ///
    /// A configuration still in flight is superseded and the unused session
    /// directories are removed.
    pub async fn reset(&self) {
        let stale = {
            let mut state = self.lock_state();
            self.generation.fetch_add(1, Ordering::SeqCst);
            state.flow = AuthenticationFlow::Login;
            state.client = None;
            self.homeserver
                .send_replace(Self::default_homeserver(&self.settings));
            std::mem::replace(
                &mut state.directories,
                SessionDirectories::new(&self.session_base_dir),
            )
        };
        stale.delete().await;
    }

    async fn user_session(
        &self,
        client: Arc<dyn Client>,
        directories: &SessionDirectories,
    ) -> Result<UserSession, AuthenticationError> {
        let session = self
            .session_store
            .user_session(client, directories, &self.passphrase)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create the user session: {}", e);
                AuthenticationError::FailedLoggingIn
            })?;

        // The session now owns these directories; the next attempt gets a fresh unit.
        let mut state = self.lock_state();
        if &state.directories == directories {
            state.directories = SessionDirectories::new(&self.session_base_dir);
        }
        Ok(session)
    }
}
