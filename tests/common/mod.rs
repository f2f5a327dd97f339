use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use homeserver_auth::client::http::{HttpClientFactory, SLIDING_SYNC_FEATURE};
use homeserver_auth::session::DirectoryUserSessionStore;
use homeserver_auth::well_known::{ClientWellKnown, WellKnownLookup};
use homeserver_auth::{AppSettings, AuthenticationService, Config};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

/// Lookup that never finds a discovery document
#[allow(dead_code)]
pub struct NoWellKnown;

#[async_trait::async_trait]
impl WellKnownLookup for NoWellKnown {
    async fn fetch_client_well_known(&self, _domain: &str) -> Option<ClientWellKnown> {
        None
    }
}

/// Service wired to the HTTP client, storing sessions under `sessions`
#[allow(dead_code)]
pub fn http_service(sessions: &TempDir) -> Arc<AuthenticationService> {
    let mut config = Config::default();
    config.discovery.scheme = "http".to_string();
    config.session.base_dir = Some(sessions.path().to_path_buf());

    let factory = HttpClientFactory::with_client(reqwest::Client::new(), "http", true);
    Arc::new(AuthenticationService::new(
        Arc::new(AppSettings::new(config)),
        Arc::new(factory),
        Arc::new(DirectoryUserSessionStore::new()),
        Arc::new(NoWellKnown),
    ))
}

/// Mount a versions response advertising sliding sync
#[allow(dead_code)]
pub async fn mount_versions(server: &MockServer, sliding_sync: bool) {
    Mock::given(method("GET"))
        .and(path("/_matrix/client/versions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "versions": ["v1.10", "v1.11"],
            "unstable_features": { SLIDING_SYNC_FEATURE: sliding_sync }
        })))
        .mount(server)
        .await;
}

/// Mount login flows offering password login
#[allow(dead_code)]
pub async fn mount_password_flows(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "flows": [{ "type": "m.login.password" }]
        })))
        .mount(server)
        .await;
}
