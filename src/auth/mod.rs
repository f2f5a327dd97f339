//! Authentication module for homeserver-auth
//!
//! This module contains the homeserver model, the authentication
//! orchestrator, the QR-code login state machine, and the embedded-browser
//! OIDC flow.

pub mod browser_flow;
pub mod homeserver;
pub mod qr_login;
pub mod service;

pub use browser_flow::{
    BrowserFlowState, BrowsingDataStore, CoordinatorResult, NavigationOutcome, NavigationPolicy,
    OidcBrowserCoordinator, OidcBrowserFlow,
};
pub use homeserver::{display_address, extract_domain, AuthenticationFlow, LoginHomeserver, LoginMode};
pub use qr_login::{QrLoginEvent, QrLoginProgress, QrLoginProgressPublisher};
pub use service::{classify_login_mode, AuthenticationService};
