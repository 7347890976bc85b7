//! Interactive OAuth flow with a scripted browser.

use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_mcp::{
    ClientSettings, McpClient, McpError, MemoryTokenStore, OAuthConfig, OAuthProvider,
    ServerConfig, ServerStatus, TokenStore,
};
use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A "browser" that follows the authorization URL straight to the redirect.
///
/// `reply` builds the callback query from the request's `state`. The port
/// of every redirect is recorded.
fn browser<F>(ports: Arc<Mutex<Vec<u16>>>, reply: F) -> impl Fn(&str) -> std::io::Result<()>
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    move |auth_url: &str| {
        let url = Url::parse(auth_url).expect("authorization url");
        let param = |key: &str| {
            url.query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default()
        };
        let redirect = Url::parse(&param("redirect_uri")).expect("redirect uri");
        ports.lock().unwrap().push(redirect.port().unwrap_or_default());

        let callback = format!("{redirect}?{}", reply(&param("state")));
        tokio::spawn(async move {
            let _ = reqwest::get(callback).await;
        });
        Ok(())
    }
}

fn oauth(server: &MockServer) -> OAuthConfig {
    OAuthConfig::new(
        format!("{}/authorize", server.uri()),
        format!("{}/token", server.uri()),
        "tether-test",
    )
    .with_redirect_port(0)
}

fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

async fn token_endpoint(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=ABC"))
        .and(body_string_contains("code_verifier="))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "at-1",
            "refresh_token": "rt-1",
            "expires_in": 3600,
            "token_type": "Bearer"
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_authenticate_end_to_end() {
    let idp = MockServer::start().await;
    token_endpoint(&idp).await;

    let store = Arc::new(MemoryTokenStore::new());
    let ports = Arc::new(Mutex::new(Vec::new()));
    let provider = OAuthProvider::new(store.clone()).with_browser_launcher(browser(
        ports.clone(),
        |state| format!("code=ABC&state={state}"),
    ));
    let config = oauth(&idp);

    let tokens = provider.authenticate("remote", &config).await.unwrap();
    assert_eq!(tokens.access_token, "at-1");
    assert_eq!(tokens.refresh_token.as_deref(), Some("rt-1"));
    assert!(tokens.expires_at.is_some());

    let stored = store.load("remote").await.unwrap().unwrap();
    assert_eq!(stored, tokens);

    let port = ports.lock().unwrap()[0];
    assert_ne!(port, 0);
    assert!(port_is_free(port));

    // Valid tokens short-circuit the browser.
    let again = provider.authenticate("remote", &config).await.unwrap();
    assert_eq!(again.access_token, "at-1");
    assert_eq!(ports.lock().unwrap().len(), 1);

    idp.verify().await;
}

#[tokio::test]
async fn test_denied_authorization_releases_port() {
    let idp = MockServer::start().await;
    let ports = Arc::new(Mutex::new(Vec::new()));
    let provider = OAuthProvider::new(Arc::new(MemoryTokenStore::new())).with_browser_launcher(
        browser(ports.clone(), |_| "error=access_denied".to_string()),
    );

    let err = provider
        .authenticate("remote", &oauth(&idp))
        .await
        .unwrap_err();
    match err {
        McpError::AuthFailed(message) => assert!(message.contains("access_denied")),
        other => panic!("expected AuthFailed, got {other:?}"),
    }

    assert!(port_is_free(ports.lock().unwrap()[0]));
    assert!(!provider.has_tokens("remote").await);
}

#[tokio::test]
async fn test_forged_state_is_rejected() {
    let idp = MockServer::start().await;
    let ports = Arc::new(Mutex::new(Vec::new()));
    let provider = OAuthProvider::new(Arc::new(MemoryTokenStore::new())).with_browser_launcher(
        browser(ports.clone(), |_| "code=ABC&state=forged".to_string()),
    );

    let err = provider
        .authenticate("remote", &oauth(&idp))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::AuthFailed(_)));
    assert!(port_is_free(ports.lock().unwrap()[0]));
}

#[tokio::test]
async fn test_unopenable_browser_times_out() {
    let idp = MockServer::start().await;
    let provider = OAuthProvider::new(Arc::new(MemoryTokenStore::new()))
        .with_browser_launcher(|_: &str| {
            Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no browser",
            ))
        })
        .with_auth_timeout(Duration::from_millis(200));

    let err = provider
        .authenticate("remote", &oauth(&idp))
        .await
        .unwrap_err();
    match err {
        McpError::AuthFailed(message) => assert!(message.contains("Timed out")),
        other => panic!("expected AuthFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_client_sends_bearer_token() {
    let idp = MockServer::start().await;
    token_endpoint(&idp).await;

    let provider = Arc::new(
        OAuthProvider::new(Arc::new(MemoryTokenStore::new())).with_browser_launcher(browser(
            Arc::new(Mutex::new(Vec::new())),
            |state| format!("code=ABC&state={state}"),
        )),
    );
    let config = oauth(&idp);

    // Rejects anything but the issued token.
    let app = Router::new().route(
        "/mcp",
        get(|headers: HeaderMap| async move {
            match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                Some("Bearer at-1") => StatusCode::METHOD_NOT_ALLOWED,
                _ => StatusCode::UNAUTHORIZED,
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let server = ServerConfig::http(format!("http://{addr}/mcp")).with_oauth(config.clone());

    let client = McpClient::new(ClientSettings::default()).with_oauth(provider.clone());

    // No tokens yet: fails fast without touching the network.
    let err = client
        .start_server("remote", server.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::AuthRequired { .. }));
    client.stop_server("remote").await;

    provider.authenticate("remote", &config).await.unwrap();

    // The probe passes with the token. This endpoint never answers
    // initialize, which the client tolerates.
    client.start_server("remote", server).await.unwrap();
    assert_eq!(
        client.get_server_status("remote").await.status,
        ServerStatus::Connected
    );
    client.stop_all().await;
}
