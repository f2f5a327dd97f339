//! Application settings shared by the authentication engine
//!
//! [`AppSettings`] pairs the static [`Config`] with the values the remote
//! settings cache may override at runtime. It is created once and injected
//! as `Arc<AppSettings>` into every component that needs it.

use tokio::sync::watch;

use crate::client::OidcConfiguration;
use crate::config::Config;

/// Static configuration plus remotely overridable values
#[derive(Debug)]
pub struct AppSettings {
    config: Config,
    call_service_base_url_override: watch::Sender<Option<String>>,
}

impl AppSettings {
    pub fn new(config: Config) -> Self {
        let (call_service_base_url_override, _) = watch::channel(None);
        Self {
            config,
            call_service_base_url_override,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn account_providers(&self) -> &[String] {
        &self.config.account_providers
    }

    pub fn default_account_provider(&self) -> &str {
        self.config.default_account_provider()
    }

    pub fn allow_other_account_providers(&self) -> bool {
        self.config.allow_other_account_providers
    }

    /// The statically configured OIDC parameters
    pub fn oidc_configuration(&self) -> OidcConfiguration {
        self.config.oidc.to_configuration()
    }

    /// Current call service URL override, if any
    pub fn call_service_base_url_override(&self) -> Option<String> {
        self.call_service_base_url_override.borrow().clone()
    }

    /// Replace the call service URL override in one step
    ///
    /// Observers registered through
    /// [`subscribe_call_service_base_url_override`](Self::subscribe_call_service_base_url_override)
    /// are notified when the value changes.
    pub fn set_call_service_base_url_override(&self, url: Option<String>) {
        let previous = self.call_service_base_url_override.send_replace(url.clone());
        if previous != url {
            tracing::debug!("Call service URL override changed: {:?}", url);
        }
    }

    pub fn subscribe_call_service_base_url_override(&self) -> watch::Receiver<Option<String>> {
        self.call_service_base_url_override.subscribe()
    }
}

impl Default for AppSettings {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
