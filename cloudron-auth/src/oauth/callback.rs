//! Callback handling: code exchange, profile fetch and identity assembly.

use chrono::Duration;
use log::*;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::identity::{to_service_identity, AccountProfile, ProfileProjection, ServiceIdentity};
use super::login::LoginRequest;
use super::state::{LoginStyle, StateCodec};
use super::token::{check_token_ttl, TokenPayload, TokenResponse, DEFAULT_TOKEN_TTL_MS};
use crate::error::{
    config_error, exchange_kind, profile_fetch_error, state_error, token_exchange_error, Error,
    ErrorKind, ExchangeErrorKind, RawResponse, StateErrorKind,
};
use crate::provider::ProviderConfig;

/// Query parameters Cloudron appends to the callback URL.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub code: String,
    pub state: String,
}

/// Form body for the authorization code exchange.
#[derive(Serialize)]
struct TokenExchangeRequest<'a> {
    code: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'a str,
}

/// Options handed to the host together with the service data.
#[derive(Debug, Clone, Serialize)]
pub struct HostOptions {
    pub profile: ProfileProjection,
}

/// Result of a successful callback, in the shape the host's account layer expects:
/// `{ serviceData, options: { profile: { name, username } } }`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedLogin {
    /// Credential token recovered from the state.
    #[serde(skip)]
    pub credential_token: String,
    #[serde(skip)]
    pub login_style: LoginStyle,
    /// Page to return to, for redirect-style logins.
    #[serde(skip)]
    pub redirect_url: Option<String>,
    pub service_data: ServiceIdentity,
    pub options: HostOptions,
}

impl CompletedLogin {
    pub fn new(
        credential_token: String,
        login_style: LoginStyle,
        redirect_url: Option<String>,
        service_data: ServiceIdentity,
    ) -> Self {
        let profile = service_data.profile_projection();
        Self {
            credential_token,
            login_style,
            redirect_url,
            service_data,
            options: HostOptions { profile },
        }
    }
}

/// Completes Cloudron logins on the trusted backend.
///
/// Runs a linear sequence for each callback: config check, state check, token
/// exchange, profile fetch, identity assembly. Nothing is retried and no partial
/// identity is ever returned.
pub struct CallbackExchanger {
    config: Option<ProviderConfig>,
    client: reqwest::Client,
    token_ttl: Duration,
}

impl CallbackExchanger {
    /// Create an exchanger.
    ///
    /// `client` bounds every provider call with its timeout; build it with
    /// `HttpClientBuilder`.
    pub fn new(config: Option<ProviderConfig>, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            token_ttl: Duration::milliseconds(DEFAULT_TOKEN_TTL_MS),
        }
    }

    /// Override the locally assumed access token lifetime.
    ///
    /// Fails with `ConfigurationMissing` unless the lifetime is positive and
    /// small enough to add to the current time.
    pub fn with_token_ttl(mut self, token_ttl: Duration) -> Result<Self, Error> {
        self.token_ttl = check_token_ttl(token_ttl)?;
        Ok(self)
    }

    /// Complete a login for a request issued by this process.
    ///
    /// The returned state must equal the request's state exactly.
    pub async fn complete_for(
        &self,
        request: &LoginRequest,
        query: &CallbackQuery,
    ) -> Result<CompletedLogin, Error> {
        if !request.matches_state(&query.state) {
            warn!("Callback state does not match the login request");
            return Err(state_error(
                StateErrorKind::Mismatch,
                "Callback state does not match the login request",
            ));
        }
        self.complete(query).await
    }

    /// Complete a login from the provider callback.
    pub async fn complete(&self, query: &CallbackQuery) -> Result<CompletedLogin, Error> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| config_error("No Cloudron provider configuration registered"))?;

        let state = StateCodec::new(config.client_secret().clone())
            .decode(&query.state)
            .inspect_err(|e| warn!("Rejected Cloudron callback state: {:?}", e.error_kind))?;

        let tokens = self.exchange_code(config, &query.code).await?;
        let profile = self.fetch_profile(config, &tokens.access_token).await?;
        let service_data = to_service_identity(tokens, &profile)
            .inspect_err(|_| error!("Cloudron profile has no id; cannot identify the user"))?;

        info!("Completed Cloudron login for account {}", service_data.id);

        Ok(CompletedLogin::new(
            state.credential_token,
            state.login_style,
            state.redirect_url,
            service_data,
        ))
    }

    /// Exchange an authorization code for tokens.
    async fn exchange_code(
        &self,
        config: &ProviderConfig,
        code: &str,
    ) -> Result<TokenResponse, Error> {
        let request = TokenExchangeRequest {
            code,
            client_id: config.client_id(),
            client_secret: config.client_secret().expose_secret(),
            grant_type: "authorization_code",
        };

        debug!("Exchanging Cloudron OAuth code for tokens");

        let (status, body) = send(self.client.post(config.token_endpoint()).form(&request))
            .await
            .map_err(|(kind, e)| {
                warn!("Failed to exchange Cloudron OAuth code: {}", kind);
                Error {
                    source: Some(Box::new(e)),
                    error_kind: ErrorKind::TokenExchangeFailed(kind),
                    response: None,
                }
            })?;
        let raw = RawResponse {
            status,
            body: body.clone(),
        };

        if !(200..300).contains(&status) {
            warn!("Cloudron token endpoint answered with status {}", status);
            return Err(token_exchange_error(
                ExchangeErrorKind::Status(status),
                &format!("Token endpoint answered with status {}", status),
            )
            .with_response(Some(raw)));
        }

        let payload: TokenPayload = serde_json::from_str(&body).map_err(|e| {
            warn!("Failed to parse Cloudron token response: {}", e);
            Error {
                source: Some(Box::new(e)),
                error_kind: ErrorKind::TokenExchangeFailed(ExchangeErrorKind::InvalidResponse),
                response: Some(raw.clone()),
            }
        })?;

        if let Some(provider_error) = payload.error_message() {
            warn!("Cloudron OAuth error: {}", provider_error);
            return Err(token_exchange_error(
                ExchangeErrorKind::Provider(provider_error),
                "Token endpoint reported an error",
            )
            .with_response(Some(raw)));
        }

        let tokens = payload.into_tokens(self.token_ttl).map_err(|e| {
            warn!("Unusable Cloudron token response: {}", e);
            e.with_response(Some(raw))
        })?;

        info!("Successfully exchanged Cloudron OAuth code for tokens");
        Ok(tokens)
    }

    /// Fetch the profile of the user owning `access_token`.
    async fn fetch_profile(
        &self,
        config: &ProviderConfig,
        access_token: &SecretString,
    ) -> Result<AccountProfile, Error> {
        debug!("Fetching Cloudron account profile");

        let (status, body) = send(
            self.client
                .get(config.profile_endpoint())
                .bearer_auth(access_token.expose_secret()),
        )
        .await
        .map_err(|(kind, e)| {
            warn!("Failed to fetch Cloudron profile: {}", kind);
            Error {
                source: Some(Box::new(e)),
                error_kind: ErrorKind::ProfileFetchFailed(kind),
                response: None,
            }
        })?;
        let raw = RawResponse {
            status,
            body: body.clone(),
        };

        if !(200..300).contains(&status) {
            warn!("Cloudron profile endpoint answered with status {}", status);
            return Err(profile_fetch_error(
                ExchangeErrorKind::Status(status),
                &format!("Profile endpoint answered with status {}", status),
            )
            .with_response(Some(raw)));
        }

        serde_json::from_str(&body).map_err(|e| {
            warn!("Failed to parse Cloudron profile: {}", e);
            Error {
                source: Some(Box::new(e)),
                error_kind: ErrorKind::ProfileFetchFailed(ExchangeErrorKind::InvalidResponse),
                response: Some(raw),
            }
        })
    }
}

/// Send a request and read the whole body.
async fn send(
    request: reqwest::RequestBuilder,
) -> Result<(u16, String), (ExchangeErrorKind, reqwest::Error)> {
    let response = request.send().await.map_err(|e| (exchange_kind(&e), e))?;
    let status = response.status().as_u16();
    let body = response.text().await.map_err(|e| (exchange_kind(&e), e))?;
    Ok((status, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpClientBuilder;
    use crate::oauth::{CompletionCallback, LoginInitiator, LoginLaunch, LoginOptions, Redirector};
    use mockito::{Matcher, Server, ServerGuard};
    use serde_json::json;
    use std::sync::Arc;
    use url::Url;

    struct NoopRedirector;

    impl Redirector for NoopRedirector {
        fn launch(&self, _launch: LoginLaunch, _on_complete: CompletionCallback) {}
    }

    fn provider_config(origin: &str) -> ProviderConfig {
        ProviderConfig::new("c1", SecretString::from("s1".to_string()), origin).unwrap()
    }

    fn login_request(origin: &str) -> LoginRequest {
        let root = Url::parse("http://localhost:3000/").unwrap();
        LoginInitiator::new(Some(provider_config(origin)), &root, Arc::new(NoopRedirector))
            .request(&LoginOptions::default())
            .unwrap()
    }

    fn exchanger(origin: &str) -> CallbackExchanger {
        let client = HttpClientBuilder::new().build().unwrap();
        CallbackExchanger::new(Some(provider_config(origin)), client)
    }

    fn query(request: &LoginRequest) -> CallbackQuery {
        CallbackQuery {
            code: "abc".to_string(),
            state: request.state.clone(),
        }
    }

    async fn mock_token(server: &mut ServerGuard, body: serde_json::Value) -> mockito::Mock {
        server
            .mock("POST", "/api/v1/oauth/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("code".into(), "abc".into()),
                Matcher::UrlEncoded("client_id".into(), "c1".into()),
                Matcher::UrlEncoded("client_secret".into(), "s1".into()),
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_complete_success() {
        let mut server = Server::new_async().await;
        let token_mock = mock_token(&mut server, json!({ "access_token": "tok123" })).await;
        let profile_mock = server
            .mock("GET", "/api/v1/profile")
            .match_header("authorization", "Bearer tok123")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "id": 7, "username": "bob", "displayName": "Bob" }).to_string())
            .create_async()
            .await;

        let request = login_request(&server.url());
        let login = exchanger(&server.url())
            .complete(&query(&request))
            .await
            .unwrap();

        token_mock.assert_async().await;
        profile_mock.assert_async().await;
        assert_eq!(login.service_data.access_token.expose_secret(), "tok123");
        assert!(login.service_data.expires_at > chrono::Utc::now());
        assert_eq!(login.credential_token, request.credential_token);
        assert_eq!(login.login_style, LoginStyle::Popup);
        assert_eq!(login.options.profile.name.as_deref(), Some("Bob"));
    }

    #[tokio::test]
    async fn test_provider_error_skips_profile_fetch() {
        let mut server = Server::new_async().await;
        mock_token(&mut server, json!({ "error": "invalid_grant" })).await;
        let profile_mock = server
            .mock("GET", "/api/v1/profile")
            .expect(0)
            .create_async()
            .await;

        let request = login_request(&server.url());
        let err = exchanger(&server.url())
            .complete(&query(&request))
            .await
            .unwrap_err();

        profile_mock.assert_async().await;
        assert_eq!(
            err.error_kind,
            ErrorKind::TokenExchangeFailed(ExchangeErrorKind::Provider("invalid_grant".to_string()))
        );
        assert!(err.response.unwrap().body.contains("invalid_grant"));
    }

    #[tokio::test]
    async fn test_token_endpoint_status_error_keeps_body() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/api/v1/oauth/token")
            .with_status(401)
            .with_body("unauthorized client")
            .create_async()
            .await;

        let request = login_request(&server.url());
        let err = exchanger(&server.url())
            .complete(&query(&request))
            .await
            .unwrap_err();

        assert_eq!(
            err.error_kind,
            ErrorKind::TokenExchangeFailed(ExchangeErrorKind::Status(401))
        );
        let response = err.response.unwrap();
        assert_eq!(response.status, 401);
        assert_eq!(response.body, "unauthorized client");
    }

    #[tokio::test]
    async fn test_token_response_without_access_token() {
        let mut server = Server::new_async().await;
        mock_token(&mut server, json!({ "token_type": "Bearer" })).await;

        let request = login_request(&server.url());
        let err = exchanger(&server.url())
            .complete(&query(&request))
            .await
            .unwrap_err();

        assert_eq!(
            err.error_kind,
            ErrorKind::TokenExchangeFailed(ExchangeErrorKind::InvalidResponse)
        );
    }

    #[tokio::test]
    async fn test_malformed_token_body() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/api/v1/oauth/token")
            .with_status(200)
            .with_body("<html>not json</html>")
            .create_async()
            .await;

        let request = login_request(&server.url());
        let err = exchanger(&server.url())
            .complete(&query(&request))
            .await
            .unwrap_err();

        assert_eq!(
            err.error_kind,
            ErrorKind::TokenExchangeFailed(ExchangeErrorKind::InvalidResponse)
        );
        assert_eq!(err.response.unwrap().body, "<html>not json</html>");
    }

    #[tokio::test]
    async fn test_profile_status_error() {
        let mut server = Server::new_async().await;
        mock_token(&mut server, json!({ "access_token": "tok" })).await;
        server
            .mock("GET", "/api/v1/profile")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let request = login_request(&server.url());
        let err = exchanger(&server.url())
            .complete(&query(&request))
            .await
            .unwrap_err();

        assert_eq!(
            err.error_kind,
            ErrorKind::ProfileFetchFailed(ExchangeErrorKind::Status(500))
        );
        assert_eq!(err.response.unwrap().body, "boom");
    }

    #[tokio::test]
    async fn test_malformed_profile() {
        let mut server = Server::new_async().await;
        mock_token(&mut server, json!({ "access_token": "tok" })).await;
        server
            .mock("GET", "/api/v1/profile")
            .with_status(200)
            .with_body("[1, 2, 3]")
            .create_async()
            .await;

        let request = login_request(&server.url());
        let err = exchanger(&server.url())
            .complete(&query(&request))
            .await
            .unwrap_err();

        assert_eq!(
            err.error_kind,
            ErrorKind::ProfileFetchFailed(ExchangeErrorKind::InvalidResponse)
        );
    }

    #[tokio::test]
    async fn test_profile_without_id() {
        let mut server = Server::new_async().await;
        mock_token(&mut server, json!({ "access_token": "tok" })).await;
        server
            .mock("GET", "/api/v1/profile")
            .with_status(200)
            .with_body(json!({ "username": "bob" }).to_string())
            .create_async()
            .await;

        let request = login_request(&server.url());
        let err = exchanger(&server.url())
            .complete(&query(&request))
            .await
            .unwrap_err();

        assert_eq!(err.error_kind, ErrorKind::InvalidIdentity);
    }

    #[tokio::test]
    async fn test_forged_state_is_rejected_before_any_call() {
        let mut server = Server::new_async().await;
        let token_mock = server
            .mock("POST", "/api/v1/oauth/token")
            .expect(0)
            .create_async()
            .await;

        let err = exchanger(&server.url())
            .complete(&CallbackQuery {
                code: "abc".to_string(),
                state: "forged".to_string(),
            })
            .await
            .unwrap_err();

        token_mock.assert_async().await;
        assert!(matches!(err.error_kind, ErrorKind::StateMismatch(_)));
    }

    #[tokio::test]
    async fn test_complete_for_rejects_other_attempts_state() {
        let mut server = Server::new_async().await;
        let token_mock = server
            .mock("POST", "/api/v1/oauth/token")
            .expect(0)
            .create_async()
            .await;

        let request = login_request(&server.url());
        let other = login_request(&server.url());
        let err = exchanger(&server.url())
            .complete_for(&request, &query(&other))
            .await
            .unwrap_err();

        token_mock.assert_async().await;
        assert_eq!(
            err.error_kind,
            ErrorKind::StateMismatch(StateErrorKind::Mismatch)
        );
    }

    #[tokio::test]
    async fn test_missing_config() {
        let client = HttpClientBuilder::new().build().unwrap();
        let err = CallbackExchanger::new(None, client)
            .complete(&CallbackQuery {
                code: "abc".to_string(),
                state: "whatever".to_string(),
            })
            .await
            .unwrap_err();

        assert_eq!(err.error_kind, ErrorKind::ConfigurationMissing);
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_failure() {
        // Nothing listens on port 1.
        let origin = "http://127.0.0.1:1";
        let request = login_request(origin);
        let err = exchanger(origin)
            .complete(&query(&request))
            .await
            .unwrap_err();

        assert_eq!(
            err.error_kind,
            ErrorKind::TokenExchangeFailed(ExchangeErrorKind::Network)
        );
        assert!(err.response.is_none());
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unresponsive_provider_times_out() {
        // Connections are queued in the backlog but never answered.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let origin = format!("http://{}", listener.local_addr().unwrap());

        let client = HttpClientBuilder::new()
            .with_timeout(std::time::Duration::from_millis(300))
            .build()
            .unwrap();
        let request = login_request(&origin);
        let err = CallbackExchanger::new(Some(provider_config(&origin)), client)
            .complete(&query(&request))
            .await
            .unwrap_err();

        assert_eq!(
            err.error_kind,
            ErrorKind::TokenExchangeFailed(ExchangeErrorKind::Timeout)
        );
        drop(listener);
    }

    #[tokio::test]
    async fn test_custom_token_ttl() {
        let mut server = Server::new_async().await;
        mock_token(&mut server, json!({ "access_token": "tok", "refresh_token": "ref" })).await;
        server
            .mock("GET", "/api/v1/profile")
            .with_status(200)
            .with_body(json!({ "id": "uid-1" }).to_string())
            .create_async()
            .await;

        let request = login_request(&server.url());
        let login = exchanger(&server.url())
            .with_token_ttl(Duration::minutes(5))
            .unwrap()
            .complete(&query(&request))
            .await
            .unwrap();

        let remaining = login.service_data.expires_at - chrono::Utc::now();
        assert!(remaining <= Duration::minutes(5));
        assert!(remaining > Duration::minutes(4));
        assert_eq!(
            login
                .service_data
                .refresh_token
                .as_ref()
                .map(|t| t.expose_secret().as_str()),
            Some("ref")
        );
    }

    #[test]
    fn test_token_ttl_must_be_positive_and_bounded() {
        for ttl in [
            Duration::zero(),
            Duration::milliseconds(-1000),
            Duration::milliseconds(i64::MAX),
        ] {
            let err = exchanger("https://p.example")
                .with_token_ttl(ttl)
                .err()
                .unwrap();
            assert_eq!(err.error_kind, ErrorKind::ConfigurationMissing);
        }
    }

    /// Answers the first connection as the token endpoint. With `stall_profile`
    /// the listener stays open without accepting, so the profile request hangs;
    /// otherwise it is closed and the profile request is refused.
    async fn token_only_provider(stall_profile: bool) -> (String, tokio::task::JoinHandle<()>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = format!("http://{}", listener.local_addr().unwrap());

        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let listener = if stall_profile {
                Some(listener)
            } else {
                drop(listener);
                None
            };

            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !String::from_utf8_lossy(&received).contains("grant_type=authorization_code") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }

            let body = json!({ "access_token": "tok" }).to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();

            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            drop(listener);
        });

        (origin, task)
    }

    #[tokio::test]
    async fn test_stalled_profile_endpoint_times_out() {
        let (origin, provider) = token_only_provider(true).await;

        let client = HttpClientBuilder::new()
            .with_timeout(std::time::Duration::from_millis(500))
            .build()
            .unwrap();
        let request = login_request(&origin);
        let err = CallbackExchanger::new(Some(provider_config(&origin)), client)
            .complete(&query(&request))
            .await
            .unwrap_err();

        assert_eq!(
            err.error_kind,
            ErrorKind::ProfileFetchFailed(ExchangeErrorKind::Timeout)
        );
        assert!(err.response.is_none());
        assert!(err.is_retryable());
        provider.abort();
    }

    #[tokio::test]
    async fn test_unreachable_profile_endpoint_is_network_failure() {
        let (origin, provider) = token_only_provider(false).await;

        let client = HttpClientBuilder::new()
            .with_timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap();
        let request = login_request(&origin);
        let err = CallbackExchanger::new(Some(provider_config(&origin)), client)
            .complete(&query(&request))
            .await
            .unwrap_err();

        assert_eq!(
            err.error_kind,
            ErrorKind::ProfileFetchFailed(ExchangeErrorKind::Network)
        );
        assert!(err.response.is_none());
        provider.abort();
    }
}
