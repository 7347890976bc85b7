//! OAuth token storage for tether.
//!
//! Tokens obtained for remote tool servers are kept per server name behind the
//! [`TokenStore`] trait. Two backends ship with the crate:
//!
//! - [`MemoryTokenStore`]: process-local, used by tests and as the provider's cache
//! - [`FileTokenStore`]: a JSON file in the platform data directory
//!
//! # Storage Location
//!
//! The file store defaults to:
//! - Linux: `~/.local/share/tether/tokens.json`
//! - macOS: `~/Library/Application Support/tether/tokens.json`
//! - Windows: `%APPDATA%/tether/tokens.json`
//!
//! The file is created with restrictive permissions (0600 on Unix).
//!
//! # Example
//!
//! ```no_run
//! use tether_auth::{FileTokenStore, OAuthTokens, TokenStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = FileTokenStore::new()?;
//!     store.save("github", OAuthTokens::bearer("gho_...")).await?;
//!
//!     if let Some(tokens) = store.load("github").await? {
//!         println!("token expires at {:?}", tokens.expires_at);
//!     }
//!     Ok(())
//! }
//! ```

mod error;
mod storage;
mod tokens;

pub use error::{AuthError, AuthResult};
pub use storage::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use tokens::OAuthTokens;

/// Get the default token file path for the current platform.
///
/// Returns `None` if the data directory cannot be determined.
pub fn default_token_path() -> Option<std::path::PathBuf> {
    dirs::data_dir().map(|p| p.join("tether").join("tokens.json"))
}

/// Get the current time in seconds since Unix epoch.
pub fn current_time_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
