//! Token storage backends.

use crate::error::{AuthError, AuthResult};
use crate::tokens::OAuthTokens;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Durable storage for OAuth tokens, keyed by server name.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Load tokens for a server.
    async fn load(&self, server: &str) -> AuthResult<Option<OAuthTokens>>;

    /// Store tokens for a server, replacing any previous entry.
    async fn save(&self, server: &str, tokens: OAuthTokens) -> AuthResult<()>;

    /// Remove tokens for a server.
    ///
    /// Returns `true` if tokens were removed, `false` if none existed.
    async fn remove(&self, server: &str) -> AuthResult<bool>;

    /// List servers with stored tokens.
    async fn list(&self) -> AuthResult<Vec<String>>;
}

/// Process-local token store.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<String, OAuthTokens>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self, server: &str) -> AuthResult<Option<OAuthTokens>> {
        Ok(self.tokens.read().await.get(server).cloned())
    }

    async fn save(&self, server: &str, tokens: OAuthTokens) -> AuthResult<()> {
        self.tokens.write().await.insert(server.to_string(), tokens);
        Ok(())
    }

    async fn remove(&self, server: &str) -> AuthResult<bool> {
        Ok(self.tokens.write().await.remove(server).is_some())
    }

    async fn list(&self) -> AuthResult<Vec<String>> {
        Ok(self.tokens.read().await.keys().cloned().collect())
    }
}

/// Token store backed by a JSON file.
///
/// Provides thread-safe access with automatic file permission management on
/// Unix systems.
pub struct FileTokenStore {
    /// Path to the token file.
    path: PathBuf,
    /// In-memory cache of the file contents.
    cache: RwLock<Option<HashMap<String, OAuthTokens>>>,
}

impl FileTokenStore {
    /// Create a store at the default path.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be determined.
    pub fn new() -> AuthResult<Self> {
        let path = crate::default_token_path().ok_or(AuthError::NoDataDir)?;
        Ok(Self::with_path(path))
    }

    /// Create a store with a custom path.
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            cache: RwLock::new(None),
        }
    }

    /// Get the path to the token file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn all(&self) -> AuthResult<HashMap<String, OAuthTokens>> {
        {
            let cache = self.cache.read().await;
            if let Some(data) = &*cache {
                return Ok(data.clone());
            }
        }

        let data = self.read_all().await?;
        *self.cache.write().await = Some(data.clone());
        Ok(data)
    }

    async fn read_all(&self) -> AuthResult<HashMap<String, OAuthTokens>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| AuthError::Read {
                path: self.path.clone(),
                source,
            })?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }

        // Entries are validated one by one so a bad entry does not hide the rest.
        let raw: HashMap<String, serde_json::Value> =
            serde_json::from_str(&content).map_err(|source| AuthError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        let mut result = HashMap::new();

        for (server, value) in raw {
            match serde_json::from_value::<OAuthTokens>(value) {
                Ok(tokens) => {
                    result.insert(server, tokens);
                }
                Err(e) => {
                    warn!(server = %server, error = %e, "Skipping invalid token entry");
                }
            }
        }

        Ok(result)
    }

    async fn write_all(&self, data: &HashMap<String, OAuthTokens>) -> AuthResult<()> {
        let write_error = |source| AuthError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_error)?;
        }

        let content = serde_json::to_string_pretty(data)?;
        tokio::fs::write(&self.path, &content)
            .await
            .map_err(write_error)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.path, perms)
                .await
                .map_err(|source| AuthError::Permissions {
                    path: self.path.clone(),
                    source,
                })?;
        }

        *self.cache.write().await = Some(data.clone());
        debug!(path = ?self.path, "Wrote token file");
        Ok(())
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self, server: &str) -> AuthResult<Option<OAuthTokens>> {
        Ok(self.all().await?.get(server).cloned())
    }

    async fn save(&self, server: &str, tokens: OAuthTokens) -> AuthResult<()> {
        debug!(server = %server, "Saving tokens");
        let mut all = self.all().await?;
        all.insert(server.to_string(), tokens);
        self.write_all(&all).await
    }

    async fn remove(&self, server: &str) -> AuthResult<bool> {
        debug!(server = %server, "Removing tokens");
        let mut all = self.all().await?;
        let existed = all.remove(server).is_some();
        if existed {
            self.write_all(&all).await?;
        }
        Ok(existed)
    }

    async fn list(&self) -> AuthResult<Vec<String>> {
        Ok(self.all().await?.keys().cloned().collect())
    }
}

impl std::fmt::Debug for FileTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTokenStore")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (FileTokenStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FileTokenStore::with_path(dir.path().join("tokens.json"));
        (store, dir)
    }

    fn tokens(access: &str) -> OAuthTokens {
        OAuthTokens::bearer(access)
            .with_refresh_token("refresh")
            .with_expires_at(4_000_000_000)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _dir) = test_store();

        store.save("github", tokens("a1")).await.unwrap();

        let loaded = store.load("github").await.unwrap();
        assert_eq!(loaded, Some(tokens("a1")));
    }

    #[tokio::test]
    async fn test_load_missing() {
        let (store, _dir) = test_store();
        assert_eq!(store.load("nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove() {
        let (store, _dir) = test_store();
        store.save("github", tokens("a1")).await.unwrap();

        assert!(store.remove("github").await.unwrap());
        assert!(!store.remove("github").await.unwrap());
        assert_eq!(store.load("github").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list() {
        let (store, _dir) = test_store();
        store.save("github", tokens("a1")).await.unwrap();
        store.save("linear", tokens("a2")).await.unwrap();

        let mut servers = store.list().await.unwrap();
        servers.sort();
        assert_eq!(servers, vec!["github", "linear"]);
    }

    #[tokio::test]
    async fn test_persistence_across_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.json");

        {
            let store = FileTokenStore::with_path(path.clone());
            store.save("github", tokens("a1")).await.unwrap();
        }

        let store = FileTokenStore::with_path(path);
        assert_eq!(store.load("github").await.unwrap(), Some(tokens("a1")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (store, _dir) = test_store();
        store.save("github", tokens("a1")).await.unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_invalid_entry_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.json");
        tokio::fs::write(
            &path,
            r#"{
                "valid": {"access_token": "a1"},
                "invalid": {"nope": true}
            }"#,
        )
        .await
        .unwrap();

        let store = FileTokenStore::with_path(path);
        assert!(store.load("valid").await.unwrap().is_some());
        assert!(store.load("invalid").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.json");
        tokio::fs::write(&path, "[1, 2, 3]").await.unwrap();

        let store = FileTokenStore::with_path(path);
        let err = store.load("github").await.unwrap_err();
        assert!(matches!(err, AuthError::Corrupt { .. }));
        assert!(err.to_string().contains("corrupt"));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryTokenStore::new();
        store.save("github", tokens("a1")).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["github".to_string()]);
        assert!(store.remove("github").await.unwrap());
        assert!(store.load("github").await.unwrap().is_none());
    }
}
