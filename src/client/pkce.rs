//! PKCE S256 challenges and state nonces for the OIDC authorization flow
//!
//! # How PKCE works
//!
//! 1. A random `code_verifier` is generated for every authorization request.
//! 2. Its SHA-256 digest, base64url-encoded, is sent as the `code_challenge`
//!    together with `code_challenge_method=S256`.
//! 3. The verifier is presented when the authorization code is exchanged,
//!    proving the exchange comes from the client that started the request.
//!
//! See RFC 7636 <https://www.rfc-editor.org/rfc/rfc7636>.

use base64::Engine as _;
use rand::RngCore as _;
use sha2::{Digest, Sha256};

use crate::client::oauth::AuthorizationServerMetadata;
use crate::client::OidcError;

/// A PKCE S256 verifier and its derived challenge
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// 32 random bytes, base64url without padding (43 characters)
    pub verifier: String,
    /// base64url(SHA-256(verifier)), without padding
    pub challenge: String,
    /// Always `"S256"`
    pub method: String,
}

/// Generate a fresh S256 challenge
///
/// # Examples
///
/// ```
/// use homeserver_auth::client::pkce::generate;
///
/// let pkce = generate();
/// assert_eq!(pkce.method, "S256");
/// assert_eq!(pkce.verifier.len(), 43);
/// ```
pub fn generate() -> PkceChallenge {
    let mut random_bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut random_bytes);
    let verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes);

    PkceChallenge {
        challenge: challenge_for(&verifier),
        verifier,
        method: "S256".to_string(),
    }
}

fn challenge_for(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.as_slice())
}

/// Random `state` nonce binding a callback to its authorization request
///
/// 16 random bytes encoded as base64url without padding.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Check that the authorization server accepts S256 challenges
///
/// A server that does not list `code_challenge_methods_supported` is
/// rejected as well.
///
/// # Errors
///
/// Returns [`OidcError::MetadataInvalid`] when `S256` is not advertised.
pub fn verify_s256_support(metadata: &AuthorizationServerMetadata) -> Result<(), OidcError> {
    let supported = metadata
        .code_challenge_methods_supported
        .as_deref()
        .unwrap_or(&[]);

    if supported.iter().any(|m| m == "S256") {
        Ok(())
    } else {
        Err(OidcError::MetadataInvalid(
            "PKCE S256 not supported by authorization server".to_string(),
        ))
    }
}
