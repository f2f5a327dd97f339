//! Homeserver identity and login capabilities

use url::Url;

/// Login mechanism a homeserver offers this client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoginMode {
    /// Not yet determined
    #[default]
    Unknown,
    Password,
    Oidc {
        /// The authorization server accepts `prompt=create`
        supports_create_prompt: bool,
    },
    Unsupported,
}

impl LoginMode {
    pub fn supports_oidc_flow(&self) -> bool {
        matches!(self, LoginMode::Oidc { .. })
    }

    /// Whether accounts can be created through this client
    pub fn supports_registration(&self) -> bool {
        matches!(
            self,
            LoginMode::Oidc {
                supports_create_prompt: true
            }
        )
    }
}

/// Whether the user is signing in or creating an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthenticationFlow {
    #[default]
    Login,
    Register,
}

/// A homeserver as presented to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginHomeserver {
    /// Display form of the address, e.g. `matrix.example.com`
    pub address: String,
    pub login_mode: LoginMode,
}

impl LoginHomeserver {
    /// Create a homeserver, normalising `address` for display
    ///
    /// # Examples
    ///
    /// ```
    /// use homeserver_auth::auth::homeserver::{LoginHomeserver, LoginMode};
    ///
    /// let hs = LoginHomeserver::new(" https://Matrix.Example.com/ ", LoginMode::Password);
    /// assert_eq!(hs.address, "matrix.example.com");
    /// ```
    pub fn new(address: &str, login_mode: LoginMode) -> Self {
        Self {
            address: display_address(address),
            login_mode,
        }
    }
}

/// Display form of a server address
///
/// Surrounding whitespace, the scheme prefix, and a trailing `/` are removed
/// and the result is lower-cased.
pub fn display_address(address: &str) -> String {
    let lowered = address.trim().to_lowercase();
    let without_scheme = lowered
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(&lowered);
    without_scheme
        .strip_suffix('/')
        .unwrap_or(without_scheme)
        .to_string()
}

/// Host part of a server address
///
/// Addresses that parse as URLs with a host yield that host. Anything else
/// has its scheme, then its port, then its path removed.
///
/// # Examples
///
/// ```
/// use homeserver_auth::auth::homeserver::extract_domain;
///
/// assert_eq!(extract_domain("https://matrix.example.com/_matrix"), "matrix.example.com");
/// assert_eq!(extract_domain("example.com:8448"), "example.com");
/// ```
pub fn extract_domain(address: &str) -> String {
    let trimmed = address.trim();
    if let Ok(url) = Url::parse(trimmed) {
        if let Some(host) = url.host_str() {
            return host.to_string();
        }
    }

    let without_scheme = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    let without_port = without_scheme.split(':').next().unwrap_or(without_scheme);
    let without_path = without_port.split('/').next().unwrap_or(without_port);
    without_path.to_string()
}
