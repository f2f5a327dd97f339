//! Session directories and session materialization
//!
//! Every client construction gets a fresh [`SessionDirectories`] unit so a
//! failed or abandoned attempt never leaks state into the next one. Once a
//! login succeeds the [`UserSessionStore`] turns the logged-in client into a
//! [`UserSession`] rooted in those directories.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::client::{Client, ClientError};

/// File written into the data directory of a materialized session
pub const SESSION_METADATA_FILE: &str = "session.json";

// ---------------------------------------------------------------------------
// SessionDirectories
// ---------------------------------------------------------------------------

/// Data and cache directories owned by one login attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDirectories {
    pub data_path: PathBuf,
    pub cache_path: PathBuf,
}

impl SessionDirectories {
    /// Allocate a new, uniquely named unit under `base`
    ///
    /// Nothing is created on disk until [`create`](Self::create) is called.
    pub fn new(base: &Path) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            data_path: base.join(&id),
            cache_path: base.join("caches").join(&id),
        }
    }

    /// Create both directories
    ///
    /// # Errors
    ///
    /// Returns the IO error if a directory cannot be created.
    pub async fn create(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.data_path).await?;
        tokio::fs::create_dir_all(&self.cache_path).await?;
        Ok(())
    }

    /// Remove both directories, ignoring ones that were never created
    pub async fn delete(&self) {
        for path in [&self.data_path, &self.cache_path] {
            match tokio::fs::remove_dir_all(path).await {
                Ok(()) => tracing::debug!("Removed session directory {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!("Failed to remove session directory {}: {}", path.display(), e)
                }
            }
        }
    }
}

/// Random passphrase protecting session stores
///
/// 32 random bytes, standard base64 encoded.
pub fn generate_passphrase() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

// ---------------------------------------------------------------------------
// UserSession
// ---------------------------------------------------------------------------

/// A logged-in user bound to its client and directories
#[derive(Debug, Clone)]
pub struct UserSession {
    pub user_id: String,
    pub device_id: String,
    pub homeserver: String,
    pub directories: SessionDirectories,
    pub client: Arc<dyn Client>,
}

/// Failure to materialize a session
#[derive(Error, Debug)]
pub enum SessionStoreError {
    #[error("The client has no session: {0}")]
    NoSession(#[from] ClientError),

    #[error("Session storage error: {0}")]
    Storage(String),
}

/// Turns a logged-in client into a [`UserSession`]
#[async_trait::async_trait]
pub trait UserSessionStore: Send + Sync {
    /// Materialize the session of `client`
    ///
    /// # Errors
    ///
    /// Returns [`SessionStoreError`] when the client is not logged in or the
    /// session cannot be persisted.
    async fn user_session(
        &self,
        client: Arc<dyn Client>,
        directories: &SessionDirectories,
        passphrase: &str,
    ) -> std::result::Result<UserSession, SessionStoreError>;
}

/// Non-secret description of a stored session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub user_id: String,
    pub device_id: String,
    pub homeserver_url: String,
    pub oidc: bool,
    /// Truncated SHA-256 of the store passphrase, for unlock checks
    pub passphrase_check: String,
    pub created_at: DateTime<Utc>,
}

fn passphrase_check(passphrase: &str) -> String {
    Sha256::digest(passphrase.as_bytes())
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// [`UserSessionStore`] writing [`SessionMetadata`] into the data directory
#[derive(Debug, Clone, Default)]
pub struct DirectoryUserSessionStore;

impl DirectoryUserSessionStore {
    pub fn new() -> Self {
        Self
    }

    /// Read the metadata of a stored session
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or cannot be decoded.
    ///
    /// # Examples
    ///
    /// ```
    /// use homeserver_auth::session::{DirectoryUserSessionStore, SessionDirectories};
    ///
    /// # tokio_test::block_on(async {
    /// let dirs = SessionDirectories::new(&std::env::temp_dir().join("hsauth-doc"));
    /// assert!(DirectoryUserSessionStore::read_metadata(&dirs).await.is_err());
    /// # })
    /// ```
    pub async fn read_metadata(
        directories: &SessionDirectories,
    ) -> std::result::Result<SessionMetadata, SessionStoreError> {
        let path = directories.data_path.join(SESSION_METADATA_FILE);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| SessionStoreError::Storage(format!("{}: {}", path.display(), e)))?;
        serde_json::from_slice(&bytes).map_err(|e| SessionStoreError::Storage(e.to_string()))
    }
}

#[async_trait::async_trait]
impl UserSessionStore for DirectoryUserSessionStore {
    async fn user_session(
        &self,
        client: Arc<dyn Client>,
        directories: &SessionDirectories,
        passphrase: &str,
    ) -> std::result::Result<UserSession, SessionStoreError> {
        let session = client.session()?;

        let metadata = SessionMetadata {
            user_id: session.user_id.clone(),
            device_id: session.device_id.clone(),
            homeserver_url: session.homeserver_url.clone(),
            oidc: session.oidc,
            passphrase_check: passphrase_check(passphrase),
            created_at: Utc::now(),
        };

        tokio::fs::create_dir_all(&directories.data_path)
            .await
            .map_err(|e| SessionStoreError::Storage(e.to_string()))?;
        let bytes = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| SessionStoreError::Storage(e.to_string()))?;
        let path = directories.data_path.join(SESSION_METADATA_FILE);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| SessionStoreError::Storage(format!("{}: {}", path.display(), e)))?;

        tracing::info!(
            user_id = %session.user_id,
            device_id = %session.device_id,
            "Session stored at {}",
            directories.data_path.display()
        );

        Ok(UserSession {
            user_id: session.user_id,
            device_id: session.device_id,
            homeserver: session.homeserver_url,
            directories: directories.clone(),
            client,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeClient;

    #[test]
    fn test_directories_are_unique_per_attempt() {
        let base = Path::new("/tmp/sessions");
        let first = SessionDirectories::new(base);
        let second = SessionDirectories::new(base);
        assert_ne!(first, second);
        assert!(first.data_path.starts_with(base));
        assert!(first.cache_path.starts_with(base.join("caches")));
    }

    #[tokio::test]
    async fn test_create_then_delete_removes_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = SessionDirectories::new(tmp.path());
        dirs.create().await.unwrap();
        assert!(dirs.data_path.is_dir());
        assert!(dirs.cache_path.is_dir());

        dirs.delete().await;
        assert!(!dirs.data_path.exists());
        assert!(!dirs.cache_path.exists());
    }

    #[tokio::test]
    async fn test_delete_of_missing_directories_is_silent() {
        let tmp = tempfile::tempdir().unwrap();
        SessionDirectories::new(tmp.path()).delete().await;
    }

    #[test]
    fn test_passphrase_is_32_random_bytes() {
        let first = generate_passphrase();
        let second = generate_passphrase();
        assert_ne!(first, second);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&first)
            .unwrap();
        assert_eq!(decoded.len(), 32);
    }

    #[tokio::test]
    async fn test_directory_store_writes_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = SessionDirectories::new(tmp.path());
        let client = FakeClient::builder().logged_in("@alice:example.com").build();

        let session = DirectoryUserSessionStore::new()
            .user_session(client, &dirs, "secret")
            .await
            .unwrap();
        assert_eq!(session.user_id, "@alice:example.com");

        let metadata = DirectoryUserSessionStore::read_metadata(&dirs).await.unwrap();
        assert_eq!(metadata.user_id, "@alice:example.com");
        assert_eq!(metadata.passphrase_check, passphrase_check("secret"));
        assert_ne!(metadata.passphrase_check, passphrase_check("other"));
    }

    #[tokio::test]
    async fn test_directory_store_requires_logged_in_client() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = SessionDirectories::new(tmp.path());
        let client = FakeClient::builder().build();

        let result = DirectoryUserSessionStore::new()
            .user_session(client, &dirs, "secret")
            .await;
        assert!(matches!(result, Err(SessionStoreError::NoSession(_))));
    }
}
