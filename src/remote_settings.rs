//! Per-homeserver remote settings
//!
//! The hook keeps [`AppSettings`] overrides in sync with what the current
//! homeserver advertises, and enforces the server operator's policy
//! document before a client is handed to the rest of the engine.
//!
//! Lifecycle:
//!
//! - [`RemoteSettingsHook::initialize_cache`] runs right after a client is
//!   built. It refreshes the call service URL and applies the policy gate.
//! - [`RemoteSettingsHook::update_cache`] refreshes the call service URL for
//!   an existing client.
//! - [`RemoteSettingsHook::load_cache`] probes well-known documents for a
//!   homeserver without a client, in the background.
//! - [`RemoteSettingsHook::reset`] clears the overrides.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::auth::homeserver::display_address;
use crate::client::Client;
use crate::error::RemoteSettingsError;
use crate::settings::AppSettings;
use crate::well_known::{
    candidate_domains, normalize_url, ClientWellKnown, ElementWellKnown, WellKnownLookup,
};

/// Keeps remote overrides for the current homeserver
pub struct RemoteSettingsHook {
    settings: Weak<AppSettings>,
    lookup: Arc<dyn WellKnownLookup>,
    probe_budget: Duration,
    fail_closed_on_malformed_policy: bool,
}

impl std::fmt::Debug for RemoteSettingsHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSettingsHook")
            .field("probe_budget", &self.probe_budget)
            .field(
                "fail_closed_on_malformed_policy",
                &self.fail_closed_on_malformed_policy,
            )
            .finish()
    }
}

impl RemoteSettingsHook {
    /// Create a hook bound to `settings`
    ///
    /// Only a weak reference is kept; once the settings owner is dropped,
    /// [`update_cache`](Self::update_cache) becomes a no-op.
    pub fn new(settings: &Arc<AppSettings>, lookup: Arc<dyn WellKnownLookup>) -> Self {
        let config = settings.config();
        Self {
            settings: Arc::downgrade(settings),
            lookup,
            probe_budget: config.discovery.probe_budget(),
            fail_closed_on_malformed_policy: config.remote_settings.fail_closed_on_malformed_policy,
        }
    }

    /// Refresh overrides from `client` and apply the policy gate
    ///
    /// # Errors
    ///
    /// Returns [`RemoteSettingsError::ElementProRequired`] when the server's
    /// policy document requires a different client application.
    pub async fn initialize_cache(
        &self,
        client: &dyn Client,
        settings: &AppSettings,
    ) -> std::result::Result<(), RemoteSettingsError> {
        self.update_call_service_url(client, settings).await;

        let bytes = match client.element_well_known().await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!("No policy document for {}: {}", client.homeserver(), e);
                return Ok(());
            }
        };

        match serde_json::from_slice::<ElementWellKnown>(&bytes) {
            Ok(document) if document.enforces_element_pro() => {
                let server_name = client.server().unwrap_or_else(|| client.homeserver());
                let server_name = display_address(&server_name);
                tracing::warn!("{} requires a different client application", server_name);
                Err(RemoteSettingsError::ElementProRequired { server_name })
            }
            Ok(_) => Ok(()),
            Err(e) if self.fail_closed_on_malformed_policy => {
                let server_name = display_address(&client.server().unwrap_or_else(|| client.homeserver()));
                tracing::warn!(
                    "Rejecting {} because its policy document is malformed: {}",
                    server_name,
                    e
                );
                Err(RemoteSettingsError::ElementProRequired { server_name })
            }
            Err(e) => {
                tracing::debug!("Ignoring undecodable policy document: {}", e);
                Ok(())
            }
        }
    }

    /// Refresh the call service URL from `client`, best effort
    pub async fn update_cache(&self, client: &dyn Client) {
        let Some(settings) = self.settings.upgrade() else {
            tracing::warn!("Settings are no longer available, skipping remote settings update");
            return;
        };
        self.update_call_service_url(client, &settings).await;
    }

    /// Probe the well-known documents of `homeserver` in the background
    ///
    /// Candidate domains are tried in order and probing stops at the first
    /// document carrying a call service URL. The whole probe is bounded by
    /// the configured budget. Failures are only logged.
    pub fn load_cache(&self, homeserver: &str, settings: &Arc<AppSettings>) -> CacheProbe {
        let candidates = candidate_domains(homeserver);
        let lookup = Arc::clone(&self.lookup);
        let settings = Arc::downgrade(settings);
        let budget = self.probe_budget;
        let homeserver = homeserver.to_string();

        let handle = tokio::spawn(async move {
            let probe = async {
                for domain in &candidates {
                    let Some(document) = lookup.fetch_client_well_known(domain).await else {
                        continue;
                    };
                    if let Some(url) = document.call_service_url {
                        return Some((domain.clone(), normalize_url(&url)));
                    }
                }
                None
            };

            let (domain, url) = match tokio::time::timeout(budget, probe).await {
                Ok(Some(found)) => found,
                Ok(None) => {
                    tracing::debug!("No call service URL advertised for {}", homeserver);
                    return None;
                }
                Err(_) => {
                    tracing::warn!("Remote settings probe for {} timed out", homeserver);
                    return None;
                }
            };

            let settings = settings.upgrade()?;
            settings.set_call_service_base_url_override(Some(url.clone()));
            tracing::info!("Call service URL override loaded from {} -> {}", domain, url);
            Some(url)
        });

        CacheProbe { handle }
    }

    /// Clear every override
    pub fn reset(&self, settings: &AppSettings) {
        settings.set_call_service_base_url_override(None);
    }

    async fn update_call_service_url(&self, client: &dyn Client, settings: &AppSettings) {
        let bytes = match client.client_well_known().await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to load the client well-known document: {}", e);
                return;
            }
        };

        let url = ClientWellKnown::from_slice(&bytes)
            .ok()
            .and_then(|document| document.call_service_url);
        let Some(url) = url else {
            tracing::warn!("No call service URL found in the client well-known document");
            return;
        };

        let normalized = normalize_url(&url);
        tracing::info!("Call service URL override set to {}", normalized);
        settings.set_call_service_base_url_override(Some(normalized));
    }
}

/// Handle to a background [`RemoteSettingsHook::load_cache`] probe
#[derive(Debug)]
pub struct CacheProbe {
    handle: JoinHandle<Option<String>>,
}

impl CacheProbe {
    /// Stop probing
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Wait for the probe, returning the URL it applied
    pub async fn finished(self) -> Option<String> {
        self.handle.await.ok().flatten()
    }
}
