//! OAuth token value type.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tokens granted for one server.
///
/// Treated as a capability value: whoever holds the access token can call the
/// server with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix timestamp (seconds) when the access token expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuthTokens {
    /// Create a bearer token without expiry or refresh token.
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            token_type: default_token_type(),
            scope: None,
        }
    }

    /// Set the refresh token.
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Set an absolute expiry.
    pub fn with_expires_at(mut self, expires_at: u64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether the token expires within `buffer` of `now` (unix seconds).
    ///
    /// Tokens without an expiry never expire.
    pub fn is_expired_within(&self, now: u64, buffer: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now.saturating_add(buffer.as_secs()),
            None => false,
        }
    }

    /// Value for an `Authorization` header.
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_expiry_is_never_expired() {
        let tokens = OAuthTokens::bearer("abc");
        assert!(!tokens.is_expired_within(u64::MAX - 10, Duration::from_secs(300)));
    }

    #[test]
    fn test_expiry_buffer() {
        let tokens = OAuthTokens::bearer("abc").with_expires_at(1_000);
        assert!(!tokens.is_expired_within(600, Duration::from_secs(300)));
        assert!(tokens.is_expired_within(701, Duration::from_secs(300)));
        assert!(tokens.is_expired_within(1_000, Duration::ZERO));
    }

    #[test]
    fn test_token_type_defaults_to_bearer() {
        let tokens: OAuthTokens = serde_json::from_str(r#"{"access_token": "a"}"#).unwrap();
        assert_eq!(tokens.token_type, "Bearer");
        assert_eq!(tokens.authorization_header(), "Bearer a");
    }

    #[test]
    fn test_optional_fields_skipped() {
        let json = serde_json::to_string(&OAuthTokens::bearer("a")).unwrap();
        assert!(!json.contains("refresh_token"));
        assert!(!json.contains("expires_at"));
        assert!(!json.contains("scope"));
    }
}
