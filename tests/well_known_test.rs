//! Integration tests for client well-known discovery
//!
//! Tests verify:
//! - The stable authentication block wins over the unstable one
//! - The unstable block is used when the stable one has no issuer
//! - Missing, failing, and undecodable documents yield no document
//! - The call service URL is read and normalized

use homeserver_auth::well_known::{normalize_url, WellKnownLookup, WellKnownResolver};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn resolver() -> WellKnownResolver {
    WellKnownResolver::with_client(reqwest::Client::new(), "http")
}

fn domain(server: &MockServer) -> String {
    server.address().to_string()
}

async fn serve_document(server: &MockServer, template: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/.well-known/matrix/client"))
        .respond_with(template)
        .mount(server)
        .await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stable_authentication_block_wins() {
    let server = MockServer::start().await;
    serve_document(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({
            "m.homeserver": { "base_url": "https://matrix.example.com" },
            "m.authentication": { "issuer": "https://auth.example.com/", "client_id": "stable" },
            "org.matrix.msc2965.authentication": { "issuer": "https://old.example.com/" }
        })),
    )
    .await;

    let document = resolver()
        .fetch_client_well_known(&domain(&server))
        .await
        .expect("document should be found");

    assert_eq!(
        document.homeserver_base_url.as_deref(),
        Some("https://matrix.example.com")
    );
    let oidc = document.oidc_authentication.expect("issuer should be found");
    assert_eq!(oidc.issuer, "https://auth.example.com/");
    assert_eq!(oidc.client_id.as_deref(), Some("stable"));
}

#[tokio::test]
async fn test_unstable_block_used_when_stable_has_no_issuer() {
    let server = MockServer::start().await;
    serve_document(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({
            "m.authentication": { "client_id": "orphan" },
            "org.matrix.msc2965.authentication": { "issuer": "https://auth.example.com/" }
        })),
    )
    .await;

    let oidc = resolver()
        .fetch_oidc_configuration(&domain(&server))
        .await
        .expect("unstable issuer should be found");

    assert_eq!(oidc.issuer, "https://auth.example.com/");
    assert_eq!(oidc.client_id, None);
}

#[tokio::test]
async fn test_missing_document_yields_none() {
    let server = MockServer::start().await;
    serve_document(&server, ResponseTemplate::new(404)).await;

    assert!(resolver()
        .fetch_client_well_known(&domain(&server))
        .await
        .is_none());
}

#[tokio::test]
async fn test_undecodable_document_yields_none() {
    let server = MockServer::start().await;
    serve_document(&server, ResponseTemplate::new(200).set_body_string("<html>")).await;

    assert!(resolver()
        .fetch_client_well_known(&domain(&server))
        .await
        .is_none());
}

#[tokio::test]
async fn test_unreachable_domain_yields_none() {
    // Nothing listens on the discard port.
    assert!(resolver()
        .fetch_client_well_known("127.0.0.1:9")
        .await
        .is_none());
}

#[tokio::test]
async fn test_call_service_url_is_normalized() {
    let server = MockServer::start().await;
    serve_document(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({
            "org.matrix.msc3401.call": { "url": "https://call.example.com/" }
        })),
    )
    .await;

    let document = resolver()
        .fetch_client_well_known(&domain(&server))
        .await
        .expect("document should be found");

    let url = document.call_service_url.expect("call URL should parse");
    assert_eq!(normalize_url(&url), "https://call.example.com");
    assert!(document.oidc_authentication.is_none());
}
