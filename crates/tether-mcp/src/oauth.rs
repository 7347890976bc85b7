//! OAuth 2.0 authorization-code flow with PKCE for remote servers.
//!
//! One [`OAuthProvider`] is shared by every server that declares an `oauth`
//! block. Tokens live in an in-memory cache in front of an injected
//! [`TokenStore`]; expired tokens are refreshed once no matter how many
//! callers ask at the same time.

use crate::callback::OAuthCallbackServer;
use crate::config::OAuthConfig;
use crate::error::{McpError, McpResult};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use futures::future::{BoxFuture, FutureExt, Shared};
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tether_auth::{current_time_secs, OAuthTokens, TokenStore};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Tokens closer than this to expiry are treated as expired.
pub const EXPIRY_BUFFER: Duration = Duration::from_secs(5 * 60);

/// How long the interactive flow waits for the browser redirect.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Opens a URL for the user. Defaults to the platform browser.
pub type BrowserLauncher = Arc<dyn Fn(&str) -> std::io::Result<()> + Send + Sync>;

type TokenCache = Arc<RwLock<HashMap<String, OAuthTokens>>>;
type RefreshFuture = Shared<BoxFuture<'static, Result<OAuthTokens, String>>>;

/// An authorization URL waiting for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub url: String,
    /// Opaque value the redirect must echo back.
    pub state: String,
    pub redirect_uri: String,
}

/// Flow state kept between `authorize` and `exchange_code`.
#[derive(Debug, Clone)]
struct PendingAuthorization {
    verifier: Option<String>,
    redirect_uri: String,
}

/// Token endpoint response body.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_tokens(self, previous_refresh: Option<String>) -> OAuthTokens {
        OAuthTokens {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: self
                .expires_in
                .map(|secs| current_time_secs().saturating_add(secs)),
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scope: self.scope,
        }
    }
}

/// Generate a PKCE code verifier.
pub fn generate_code_verifier() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// S256 code challenge for `verifier`.
pub fn generate_code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Generate an OAuth `state` parameter.
pub fn generate_state() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build the authorization URL.
pub fn build_auth_url(
    config: &OAuthConfig,
    redirect_uri: &str,
    state: &str,
    code_challenge: Option<&str>,
) -> String {
    let separator = if config.authorization_url.contains('?') {
        '&'
    } else {
        '?'
    };
    let mut url = format!(
        "{}{separator}response_type=code&client_id={}&redirect_uri={}&state={}",
        config.authorization_url,
        urlencoding::encode(&config.client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(state),
    );
    if let Some(challenge) = code_challenge {
        url.push_str(&format!(
            "&code_challenge={}&code_challenge_method=S256",
            urlencoding::encode(challenge)
        ));
    }
    if !config.scopes.is_empty() {
        url.push_str(&format!(
            "&scope={}",
            urlencoding::encode(&config.scopes.join(" "))
        ));
    }
    url
}

/// POST a form to the token endpoint.
async fn token_request(
    http: &reqwest::Client,
    config: &OAuthConfig,
    mut form: Vec<(&str, String)>,
) -> Result<TokenResponse, String> {
    form.push(("client_id", config.client_id.clone()));
    if let Some(secret) = &config.client_secret {
        form.push(("client_secret", secret.clone()));
    }

    let response = http
        .post(&config.token_url)
        .header("Accept", "application/json")
        .form(&form)
        .send()
        .await
        .map_err(|e| format!("Token request failed: {e}"))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(format!("Token endpoint returned {status}: {text}"));
    }

    response
        .json()
        .await
        .map_err(|e| format!("Invalid token response: {e}"))
}

/// Shared OAuth token manager.
pub struct OAuthProvider {
    store: Arc<dyn TokenStore>,
    cache: TokenCache,
    pending: std::sync::Mutex<HashMap<String, PendingAuthorization>>,
    refreshes: Arc<std::sync::Mutex<HashMap<String, RefreshFuture>>>,
    http: reqwest::Client,
    launcher: Option<BrowserLauncher>,
    auth_timeout: Duration,
}

impl OAuthProvider {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self {
            store,
            cache: Arc::new(RwLock::new(HashMap::new())),
            pending: std::sync::Mutex::new(HashMap::new()),
            refreshes: Arc::new(std::sync::Mutex::new(HashMap::new())),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            launcher: None,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }

    /// Replace the browser opener.
    pub fn with_browser_launcher<F>(mut self, launcher: F) -> Self
    where
        F: Fn(&str) -> std::io::Result<()> + Send + Sync + 'static,
    {
        self.launcher = Some(Arc::new(launcher));
        self
    }

    /// Bound the wait for the browser redirect.
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingAuthorization>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached tokens, falling back to the durable store.
    async fn load(&self, server: &str) -> McpResult<Option<OAuthTokens>> {
        if let Some(tokens) = self.cache.read().await.get(server) {
            return Ok(Some(tokens.clone()));
        }
        let stored = self.store.load(server).await?;
        if let Some(tokens) = &stored {
            self.cache
                .write()
                .await
                .insert(server.to_string(), tokens.clone());
        }
        Ok(stored)
    }

    async fn save(&self, server: &str, tokens: &OAuthTokens) -> McpResult<()> {
        self.store.save(server, tokens.clone()).await?;
        self.cache
            .write()
            .await
            .insert(server.to_string(), tokens.clone());
        Ok(())
    }

    /// Drop every local trace of a server's tokens.
    async fn forget(&self, server: &str) -> McpResult<()> {
        self.cache.write().await.remove(server);
        self.pending().remove(server);
        self.store.remove(server).await?;
        Ok(())
    }

    /// Whether any tokens are stored, valid or not.
    pub async fn has_tokens(&self, server: &str) -> bool {
        matches!(self.load(server).await, Ok(Some(_)))
    }

    /// Build an authorization URL redirecting to the configured port.
    pub fn authorize(&self, server: &str, config: &OAuthConfig) -> AuthorizationRequest {
        self.authorize_with_redirect(server, config, OAuthConfig::redirect_uri(config.redirect_port))
    }

    fn authorize_with_redirect(
        &self,
        server: &str,
        config: &OAuthConfig,
        redirect_uri: String,
    ) -> AuthorizationRequest {
        let state = generate_state();
        let verifier = config.use_pkce.then(generate_code_verifier);
        let challenge = verifier.as_deref().map(generate_code_challenge);
        let url = build_auth_url(config, &redirect_uri, &state, challenge.as_deref());

        self.pending().insert(
            server.to_string(),
            PendingAuthorization {
                verifier,
                redirect_uri: redirect_uri.clone(),
            },
        );
        debug!(server = %server, pkce = config.use_pkce, "Prepared authorization request");

        AuthorizationRequest {
            url,
            state,
            redirect_uri,
        }
    }

    /// Exchange an authorization code for tokens and persist them.
    pub async fn exchange_code(
        &self,
        server: &str,
        config: &OAuthConfig,
        code: &str,
    ) -> McpResult<OAuthTokens> {
        let pending = self.pending().remove(server);
        let (verifier, redirect_uri) = match pending {
            Some(p) => (p.verifier, p.redirect_uri),
            None if config.use_pkce => {
                return Err(McpError::AuthFailed(format!(
                    "No authorization in progress for '{server}'"
                )))
            }
            None => (None, OAuthConfig::redirect_uri(config.redirect_port)),
        };

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri),
        ];
        if let Some(verifier) = verifier {
            form.push(("code_verifier", verifier));
        }

        let tokens = token_request(&self.http, config, form)
            .await
            .map_err(McpError::AuthFailed)?
            .into_tokens(None);
        self.save(server, &tokens).await?;
        info!(server = %server, "Stored OAuth tokens");
        Ok(tokens)
    }

    /// Run the interactive browser flow unless usable tokens already exist.
    ///
    /// The callback listener is released on every exit path.
    pub async fn authenticate(&self, server: &str, config: &OAuthConfig) -> McpResult<OAuthTokens> {
        if let Some(tokens) = self.get_valid_tokens(server, config).await? {
            return Ok(tokens);
        }

        let listener = OAuthCallbackServer::bind(config.redirect_port).await?;
        let request = self.authorize_with_redirect(server, config, listener.redirect_uri());

        info!(server = %server, url = %request.url, "Opening browser for authorization");
        let opened = match &self.launcher {
            Some(launch) => launch(&request.url),
            None => open::that(&request.url),
        };
        if let Err(e) = opened {
            warn!(server = %server, error = %e, url = %request.url, "Could not open a browser; visit the URL manually");
        }

        let code = listener
            .wait_for_code(Some(&request.state), self.auth_timeout)
            .await;
        listener.stop().await;

        let code = match code {
            Ok(code) => code,
            Err(e) => {
                self.pending().remove(server);
                return Err(e);
            }
        };
        self.exchange_code(server, config, &code).await
    }

    /// Tokens that stay valid for at least [`EXPIRY_BUFFER`].
    ///
    /// Expired tokens are refreshed once; when that is impossible the stale
    /// entry is removed and `None` is returned.
    pub async fn get_valid_tokens(
        &self,
        server: &str,
        config: &OAuthConfig,
    ) -> McpResult<Option<OAuthTokens>> {
        let Some(tokens) = self.load(server).await? else {
            return Ok(None);
        };
        if !tokens.is_expired_within(current_time_secs(), EXPIRY_BUFFER) {
            return Ok(Some(tokens));
        }

        if tokens.refresh_token.is_none() {
            info!(server = %server, "Token expired and no refresh token is available");
            self.forget(server).await?;
            return Ok(None);
        }

        match self.refresh_token(server, config).await {
            Ok(tokens) => Ok(Some(tokens)),
            Err(e) => {
                warn!(server = %server, error = %e, "Token refresh failed; discarding stored tokens");
                self.forget(server).await?;
                Ok(None)
            }
        }
    }

    /// Access token for `server`, if one is usable.
    pub async fn get_access_token(
        &self,
        server: &str,
        config: &OAuthConfig,
    ) -> McpResult<Option<String>> {
        Ok(self
            .get_valid_tokens(server, config)
            .await?
            .map(|t| t.access_token))
    }

    /// Exchange the refresh token for new tokens.
    ///
    /// Concurrent callers for the same server share one token request.
    pub async fn refresh_token(&self, server: &str, config: &OAuthConfig) -> McpResult<OAuthTokens> {
        let refresh = {
            let existing = self
                .refreshes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(server)
                .cloned();
            match existing {
                Some(refresh) => refresh,
                None => {
                    let refresh_token = self
                        .load(server)
                        .await?
                        .and_then(|t| t.refresh_token)
                        .ok_or_else(|| {
                            McpError::AuthFailed(format!("No refresh token stored for '{server}'"))
                        })?;
                    let mut refreshes = self.refreshes.lock().unwrap_or_else(|e| e.into_inner());
                    refreshes
                        .entry(server.to_string())
                        .or_insert_with(|| self.refresh_future(server, config, refresh_token))
                        .clone()
                }
            }
        };

        refresh.await.map_err(McpError::AuthFailed)
    }

    fn refresh_future(
        &self,
        server: &str,
        config: &OAuthConfig,
        refresh_token: String,
    ) -> RefreshFuture {
        let http = self.http.clone();
        let config = config.clone();
        let store = self.store.clone();
        let cache = self.cache.clone();
        let refreshes = self.refreshes.clone();
        let server = server.to_string();

        async move {
            debug!(server = %server, "Refreshing OAuth token");
            let form = vec![
                ("grant_type", "refresh_token".to_string()),
                ("refresh_token", refresh_token.clone()),
            ];
            let result = async {
                let tokens = token_request(&http, &config, form)
                    .await?
                    .into_tokens(Some(refresh_token));
                store
                    .save(&server, tokens.clone())
                    .await
                    .map_err(|e| e.to_string())?;
                cache.write().await.insert(server.clone(), tokens.clone());
                Ok(tokens)
            }
            .await;

            refreshes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&server);
            if result.is_ok() {
                info!(server = %server, "Refreshed OAuth token");
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Revoke tokens remotely (best effort) and always clear them locally.
    pub async fn revoke_access(&self, server: &str, config: &OAuthConfig) -> McpResult<()> {
        let tokens = self.load(server).await.unwrap_or_else(|e| {
            warn!(server = %server, error = %e, "Could not read stored tokens");
            None
        });

        if let (Some(tokens), Some(url)) = (&tokens, &config.revocation_url) {
            let mut form = vec![
                ("token", tokens.access_token.clone()),
                ("token_type_hint", "access_token".to_string()),
                ("client_id", config.client_id.clone()),
            ];
            if let Some(secret) = &config.client_secret {
                form.push(("client_secret", secret.clone()));
            }
            match self.http.post(url).form(&form).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(server = %server, "Revoked token remotely")
                }
                Ok(response) => {
                    warn!(server = %server, status = %response.status(), "Revocation endpoint rejected the request")
                }
                Err(e) => warn!(server = %server, error = %e, "Revocation request failed"),
            }
        }

        self.forget(server).await?;
        info!(server = %server, "Cleared OAuth tokens");
        Ok(())
    }
}
