//! Embedded-browser OIDC flow
//!
//! [`OidcBrowserFlow`] is the navigation policy for a web surface showing
//! an authorization page. It loads the page, lets navigation proceed within
//! the allowed domains, and intercepts the redirect back to the application.
//!
//! [`OidcBrowserCoordinator`] binds a flow to an
//! [`AuthenticationService`]: an intercepted redirect completes the login,
//! and cancelling aborts the pending authorization on the server first.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use url::Url;

use crate::auth::service::AuthenticationService;
use crate::client::OidcAuthorizationData;
use crate::error::{AuthenticationError, OidcErrorKind};
use crate::session::UserSession;

/// Error shown when navigation leaves the allowed domains
pub const UNTRUSTED_DOMAIN_ERROR: &str = "Navigation blocked to untrusted domain";

/// Ephemeral cookie/storage jar backing the web surface
pub trait BrowsingDataStore: Send + Sync {
    /// Remove every cookie and cached item
    fn purge(&self);
}

/// Lifecycle of the authorization page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserFlowState {
    Idle,
    Loading,
    Loaded,
    Errored(String),
    /// The redirect back to the application was captured
    Redirected(Url),
}

/// Answer to a navigation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationPolicy {
    Allow,
    Cancel,
}

/// Request the web surface should load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub url: Url,
    pub user_agent: String,
}

// ---------------------------------------------------------------------------
// OidcBrowserFlow
// ---------------------------------------------------------------------------

/// Navigation policy for one authorization page
pub struct OidcBrowserFlow {
    authorization_url: Url,
    redirect_uri: String,
    allowed_domains: Vec<String>,
    user_agent: String,
    data_store: Arc<dyn BrowsingDataStore>,
    state: BrowserFlowState,
}

impl std::fmt::Debug for OidcBrowserFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcBrowserFlow")
            .field("authorization_url", &self.authorization_url.as_str())
            .field("redirect_uri", &self.redirect_uri)
            .field("allowed_domains", &self.allowed_domains)
            .field("state", &self.state)
            .finish()
    }
}

impl OidcBrowserFlow {
    /// Create a flow for `authorization_url`
    ///
    /// # Arguments
    ///
    /// * `authorization_url` - Page to load
    /// * `redirect_uri` - Redirect the server sends the user back to
    /// * `allowed_domains` - Domains navigation may visit, subdomains included
    /// * `user_agent` - User agent sent with the authorization request
    /// * `data_store` - Ephemeral data store purged after interception
    pub fn new(
        authorization_url: Url,
        redirect_uri: impl Into<String>,
        allowed_domains: Vec<String>,
        user_agent: impl Into<String>,
        data_store: Arc<dyn BrowsingDataStore>,
    ) -> Self {
        Self {
            authorization_url,
            redirect_uri: redirect_uri.into(),
            allowed_domains: allowed_domains
                .into_iter()
                .map(|d| d.trim_matches('.').to_lowercase())
                .collect(),
            user_agent: user_agent.into(),
            data_store,
            state: BrowserFlowState::Idle,
        }
    }

    pub fn state(&self) -> &BrowserFlowState {
        &self.state
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    pub fn is_loading(&self) -> bool {
        self.state == BrowserFlowState::Loading
    }

    /// Captured redirect, once intercepted
    pub fn callback_url(&self) -> Option<&Url> {
        match &self.state {
            BrowserFlowState::Redirected(url) => Some(url),
            _ => None,
        }
    }

    /// Error currently shown, if any
    pub fn error(&self) -> Option<&str> {
        match &self.state {
            BrowserFlowState::Errored(message) => Some(message),
            _ => None,
        }
    }

    /// Start loading the authorization page
    ///
    /// Clears any previous error.
    pub fn load_authorization_page(&mut self) -> AuthorizationRequest {
        if self.callback_url().is_none() {
            self.state = BrowserFlowState::Loading;
        }
        tracing::debug!("Loading authorization page {}", self.authorization_url);
        AuthorizationRequest {
            url: self.authorization_url.clone(),
            user_agent: self.user_agent.clone(),
        }
    }

    pub fn retry(&mut self) -> AuthorizationRequest {
        self.load_authorization_page()
    }

    /// Decide whether the surface may navigate to `url`
    ///
    /// Only a URL whose scheme starts the redirect URI is intercepted; the
    /// authorization URL itself carries the redirect URI as a query
    /// parameter and must not match.
    pub fn decide_policy(&mut self, url: &Url) -> NavigationPolicy {
        if self.callback_url().is_some() {
            return NavigationPolicy::Cancel;
        }

        if self.redirect_uri.starts_with(&format!("{}:", url.scheme())) {
            tracing::info!("Intercepted the OIDC redirect");
            self.state = BrowserFlowState::Redirected(url.clone());
            self.data_store.purge();
            return NavigationPolicy::Cancel;
        }

        if let Some(host) = url.host_str() {
            if !self.is_allowed_host(host) {
                tracing::error!("Blocked navigation to untrusted domain: {}", host);
                self.state = BrowserFlowState::Errored(UNTRUSTED_DOMAIN_ERROR.to_string());
                return NavigationPolicy::Cancel;
            }
        }

        NavigationPolicy::Allow
    }

    fn is_allowed_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_lowercase();
        self.allowed_domains.iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    pub fn did_finish(&mut self) {
        if self.state == BrowserFlowState::Loading {
            self.state = BrowserFlowState::Loaded;
        }
    }

    pub fn did_fail(&mut self, error: &str) {
        if self.callback_url().is_some() {
            return;
        }
        tracing::error!("Navigation failed: {}", error);
        self.state = BrowserFlowState::Errored(error.to_string());
    }

    /// A navigation failed before committing
    ///
    /// Cancelled navigations are expected after an interception and are
    /// ignored.
    pub fn did_fail_provisional(&mut self, error: &str, cancelled: bool) {
        if cancelled {
            return;
        }
        self.did_fail(error);
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// How a browser login ended
#[derive(Debug, Clone)]
pub enum CoordinatorResult {
    Success(UserSession),
    Cancel,
}

/// Failure message to present to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertInfo {
    pub title: String,
    pub message: String,
}

/// Result of routing one navigation
#[derive(Debug, Clone)]
pub enum NavigationOutcome {
    Allow,
    /// Navigation stopped with the given error
    Blocked(String),
    /// The redirect was intercepted and the login completed
    Finished(CoordinatorResult),
}

/// Drives one browser-based OIDC login to completion
pub struct OidcBrowserCoordinator {
    service: Arc<AuthenticationService>,
    data: OidcAuthorizationData,
    flow: Mutex<OidcBrowserFlow>,
    loading: watch::Sender<bool>,
    alert: Mutex<Option<AlertInfo>>,
}

impl std::fmt::Debug for OidcBrowserCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcBrowserCoordinator")
            .field("flow", &*self.lock_flow())
            .finish()
    }
}

impl OidcBrowserCoordinator {
    /// Create a coordinator for an authorization started on `service`
    ///
    /// The redirect URI is read from the authorization URL so interception
    /// matches what the server will send; the configured redirect URI is
    /// used when the URL does not carry one.
    pub fn new(
        service: Arc<AuthenticationService>,
        data: OidcAuthorizationData,
        data_store: Arc<dyn BrowsingDataStore>,
    ) -> Self {
        let config = service.settings().config();
        let redirect_uri = data
            .login_url()
            .query_pairs()
            .find(|(key, _)| key == "redirect_uri")
            .map(|(_, value)| value.into_owned())
            .unwrap_or_else(|| config.oidc.redirect_uri.clone());

        let flow = OidcBrowserFlow::new(
            data.login_url().clone(),
            redirect_uri,
            config.web_flow.allowed_domains.clone(),
            config.web_flow.user_agent.clone(),
            data_store,
        );
        let (loading, _) = watch::channel(false);

        Self {
            service,
            data,
            flow: Mutex::new(flow),
            loading,
            alert: Mutex::new(None),
        }
    }

    /// The navigation policy, for forwarding surface events
    pub fn flow(&self) -> MutexGuard<'_, OidcBrowserFlow> {
        self.lock_flow()
    }

    fn lock_flow(&self) -> MutexGuard<'_, OidcBrowserFlow> {
        self.flow.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the authorization page
    pub fn start(&self) -> AuthorizationRequest {
        self.lock_flow().load_authorization_page()
    }

    /// Observe whether the callback is being processed
    pub fn subscribe_loading(&self) -> watch::Receiver<bool> {
        self.loading.subscribe()
    }

    /// Alert raised by the last failed callback
    pub fn alert(&self) -> Option<AlertInfo> {
        self.alert
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Route a navigation request from the surface
    pub async fn process_navigation(&self, url: &Url) -> NavigationOutcome {
        let (policy, callback, error) = {
            let mut flow = self.lock_flow();
            let policy = flow.decide_policy(url);
            (
                policy,
                flow.callback_url().cloned(),
                flow.error().map(str::to_string),
            )
        };

        match (policy, callback) {
            (NavigationPolicy::Allow, _) => NavigationOutcome::Allow,
            (NavigationPolicy::Cancel, Some(callback)) => {
                NavigationOutcome::Finished(self.handle_callback(&callback).await)
            }
            (NavigationPolicy::Cancel, None) => {
                NavigationOutcome::Blocked(error.unwrap_or_else(|| UNTRUSTED_DOMAIN_ERROR.to_string()))
            }
        }
    }

    /// Complete the login from an intercepted redirect
    pub async fn handle_callback(&self, callback_url: &Url) -> CoordinatorResult {
        self.loading.send_replace(true);
        tracing::info!("Processing OIDC callback");
        let result = self.service.login_with_oidc_callback(callback_url).await;
        self.loading.send_replace(false);

        match result {
            Ok(session) => {
                tracing::info!("Logged in as {}", session.user_id);
                CoordinatorResult::Success(session)
            }
            Err(AuthenticationError::Oidc(OidcErrorKind::UserCancellation)) => {
                tracing::info!("User cancelled the login");
                CoordinatorResult::Cancel
            }
            Err(e) => {
                tracing::error!("OIDC login failed: {}", e);
                *self.alert.lock().unwrap_or_else(PoisonError::into_inner) = Some(AlertInfo {
                    title: "Authentication Failed".to_string(),
                    message: "Unable to complete login. Please try again.".to_string(),
                });
                CoordinatorResult::Cancel
            }
        }
    }

    /// The user closed the surface
    pub async fn cancel(&self) -> CoordinatorResult {
        tracing::info!("User cancelled authentication");
        self.service.abort_oidc_login(&self.data).await;
        CoordinatorResult::Cancel
    }
}
