//! OAuth token types.

use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{config_error, token_exchange_error, Error, ExchangeErrorKind};

/// Token lifetime assumed for Cloudron access tokens, in milliseconds (about 7 days).
///
/// The token endpoint does not report an expiry, so `expires_at` is computed
/// locally from this value. It is not the provider's actual token lifetime.
pub const DEFAULT_TOKEN_TTL_MS: i64 = 6048 * 100000;

/// Tokens obtained from the authorization code exchange.
#[derive(Debug, Clone)]
pub struct TokenResponse {
    /// Access token for profile and API requests.
    pub access_token: SecretString,
    /// Refresh token, when the provider issues one.
    pub refresh_token: Option<SecretString>,
    /// Locally computed expiry.
    pub expires_at: DateTime<Utc>,
}

/// Accepts a token lifetime that is positive and keeps `now + ttl` representable.
pub fn check_token_ttl(ttl: Duration) -> Result<Duration, Error> {
    if ttl <= Duration::zero() {
        return Err(config_error("Token lifetime must be positive"));
    }

    Utc::now()
        .checked_add_signed(ttl)
        .map(|_| ttl)
        .ok_or_else(|| config_error("Token lifetime is out of range"))
}

/// JSON body returned by the token endpoint.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenPayload {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl TokenPayload {
    /// The provider's error field rendered as text, if present.
    pub fn error_message(&self) -> Option<String> {
        match &self.error {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(message)) => Some(message.clone()),
            Some(other) => Some(other.to_string()),
        }
    }

    /// Build a `TokenResponse` that expires `ttl` from now.
    pub fn into_tokens(self, ttl: Duration) -> Result<TokenResponse, Error> {
        let access_token = self
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                token_exchange_error(
                    ExchangeErrorKind::InvalidResponse,
                    "Token response has no access_token",
                )
            })?;
        let expires_at = Utc::now()
            .checked_add_signed(check_token_ttl(ttl)?)
            .ok_or_else(|| config_error("Token lifetime is out of range"))?;

        Ok(TokenResponse {
            access_token: SecretString::from(access_token),
            refresh_token: self
                .refresh_token
                .filter(|token| !token.is_empty())
                .map(SecretString::from),
            expires_at,
        })
    }
}
