//! Cloudron provider configuration and endpoints.

use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::error::{config_error, Error};

/// Service name used in the callback path and in log lines.
pub const SERVICE_NAME: &str = "cloudron";

const AUTHORIZE_PATH: &str = "/api/v1/oauth/dialog/authorize";
const TOKEN_PATH: &str = "/api/v1/oauth/token";
const PROFILE_PATH: &str = "/api/v1/profile";

/// OAuth client registration for a Cloudron instance.
///
/// Immutable for the lifetime of a login attempt and shared read-only between
/// concurrent attempts.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    client_id: String,
    client_secret: SecretString,
    api_origin: Url,
}

impl ProviderConfig {
    /// Create a provider configuration.
    ///
    /// Empty credentials or an origin that is not an absolute http(s) URL are
    /// reported as `ConfigurationMissing`.
    pub fn new(
        client_id: &str,
        client_secret: SecretString,
        api_origin: &str,
    ) -> Result<Self, Error> {
        if client_id.trim().is_empty() {
            return Err(config_error("OAuth client id is empty"));
        }
        if client_secret.expose_secret().trim().is_empty() {
            return Err(config_error("OAuth client secret is empty"));
        }

        let api_origin = Url::parse(api_origin.trim())
            .map_err(|e| config_error(&format!("Invalid API origin: {}", e)))?;
        if !matches!(api_origin.scheme(), "http" | "https") || api_origin.host().is_none() {
            return Err(config_error("API origin must be an http(s) URL"));
        }

        Ok(Self {
            client_id: client_id.trim().to_string(),
            client_secret,
            api_origin,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_secret(&self) -> &SecretString {
        &self.client_secret
    }

    pub fn api_origin(&self) -> &Url {
        &self.api_origin
    }

    /// Consent dialog the browser is sent to.
    pub fn authorize_endpoint(&self) -> String {
        self.endpoint(AUTHORIZE_PATH)
    }

    /// Server-to-server code exchange endpoint.
    pub fn token_endpoint(&self) -> String {
        self.endpoint(TOKEN_PATH)
    }

    /// Profile of the user owning an access token.
    pub fn profile_endpoint(&self) -> String {
        self.endpoint(PROFILE_PATH)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_origin.as_str().trim_end_matches('/'), path)
    }
}

/// Callback URL registered with the provider for a host rooted at `root_url`.
pub fn callback_url(root_url: &Url) -> String {
    format!(
        "{}/_oauth/{}/",
        root_url.as_str().trim_end_matches('/'),
        SERVICE_NAME
    )
}
