//! Signed OAuth state parameter.
//!
//! The state carries the login style and the credential token through the
//! provider round trip. It is signed with HMAC-SHA256 keyed by the client
//! secret, so the callback side can recover and verify both without a
//! server-side session store.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{state_error, Error, ErrorKind, StateErrorKind};

type HmacSha256 = Hmac<Sha256>;

/// Bytes of entropy in a credential token.
pub const CREDENTIAL_TOKEN_BYTES: usize = 32;

/// How the browser reaches the consent dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoginStyle {
    Popup,
    Redirect,
}

impl LoginStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginStyle::Popup => "popup",
            LoginStyle::Redirect => "redirect",
        }
    }
}

impl std::str::FromStr for LoginStyle {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "popup" => Ok(LoginStyle::Popup),
            "redirect" => Ok(LoginStyle::Redirect),
            _ => Err(state_error(
                StateErrorKind::Malformed,
                &format!("Unknown login style: {}", value),
            )),
        }
    }
}

/// Values bound into the state parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateParam {
    pub login_style: LoginStyle,
    pub credential_token: String,
    /// Page to return to after a full-page redirect login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

/// Generate a cryptographically random credential token.
pub fn generate_credential_token() -> String {
    let random_bytes: [u8; CREDENTIAL_TOKEN_BYTES] = rand::thread_rng().gen();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Encodes and verifies state values for one provider registration.
#[derive(Clone)]
pub struct StateCodec {
    key: SecretString,
}

impl StateCodec {
    pub fn new(key: SecretString) -> Self {
        Self { key }
    }

    /// Encode a state as `base64url(json).base64url(hmac)`.
    pub fn encode(&self, param: &StateParam) -> Result<String, Error> {
        let json = serde_json::to_vec(param).map_err(|e| Error {
            source: Some(Box::new(e)),
            error_kind: ErrorKind::StateMismatch(StateErrorKind::Malformed),
            response: None,
        })?;
        let payload = URL_SAFE_NO_PAD.encode(json);
        let signature = URL_SAFE_NO_PAD.encode(self.mac(payload.as_bytes())?.finalize().into_bytes());

        Ok(format!("{}.{}", payload, signature))
    }

    /// Verify the signature of a returned state and recover its contents.
    pub fn decode(&self, state: &str) -> Result<StateParam, Error> {
        let (payload, signature) = state
            .split_once('.')
            .ok_or_else(|| state_error(StateErrorKind::Malformed, "State has no signature"))?;

        let signature = URL_SAFE_NO_PAD.decode(signature).map_err(|_| {
            state_error(StateErrorKind::Malformed, "State signature is not base64url")
        })?;

        // Constant-time comparison.
        self.mac(payload.as_bytes())?
            .verify_slice(&signature)
            .map_err(|_| {
                state_error(StateErrorKind::InvalidSignature, "State signature does not match")
            })?;

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| state_error(StateErrorKind::Malformed, "State payload is not base64url"))?;

        serde_json::from_slice(&json)
            .map_err(|_| state_error(StateErrorKind::Malformed, "State payload is not valid JSON"))
    }

    fn mac(&self, payload: &[u8]) -> Result<HmacSha256, Error> {
        let mut mac = HmacSha256::new_from_slice(self.key.expose_secret().as_bytes())
            .map_err(|_| state_error(StateErrorKind::Malformed, "Invalid HMAC key"))?;
        mac.update(payload);
        Ok(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn codec() -> StateCodec {
        StateCodec::new(SecretString::from("s1".to_string()))
    }

    fn param() -> StateParam {
        StateParam {
            login_style: LoginStyle::Popup,
            credential_token: generate_credential_token(),
            redirect_url: None,
        }
    }

    #[test]
    fn test_credential_token_length() {
        let token = generate_credential_token();
        // 32 bytes base64url encoded without padding
        assert_eq!(token.len(), 43);
        assert_eq!(URL_SAFE_NO_PAD.decode(&token).unwrap().len(), 32);
    }

    #[test]
    fn test_credential_tokens_are_unique() {
        let tokens: HashSet<String> = (0..10_000).map(|_| generate_credential_token()).collect();
        assert_eq!(tokens.len(), 10_000);
    }

    #[test]
    fn test_state_round_trip() {
        let codec = codec();
        let param = param();
        let state = codec.encode(&param).unwrap();

        assert_eq!(codec.decode(&state).unwrap(), param);
    }

    #[test]
    fn test_redirect_state_keeps_redirect_url() {
        let codec = codec();
        let param = StateParam {
            login_style: LoginStyle::Redirect,
            credential_token: generate_credential_token(),
            redirect_url: Some("http://localhost:3000/settings".to_string()),
        };
        let state = codec.encode(&param).unwrap();

        let decoded = codec.decode(&state).unwrap();
        assert_eq!(decoded.login_style, LoginStyle::Redirect);
        assert_eq!(decoded.redirect_url.as_deref(), Some("http://localhost:3000/settings"));
    }

    #[test]
    fn test_state_signed_with_other_key_is_rejected() {
        let state = StateCodec::new(SecretString::from("other".to_string()))
            .encode(&param())
            .unwrap();

        let err = codec().decode(&state).unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::StateMismatch(StateErrorKind::InvalidSignature)
        );
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let codec = codec();
        let state = codec.encode(&param()).unwrap();
        let (_, signature) = state.split_once('.').unwrap();
        let forged_payload = URL_SAFE_NO_PAD.encode(
            br#"{"loginStyle":"popup","credentialToken":"attacker"}"#,
        );

        let err = codec
            .decode(&format!("{}.{}", forged_payload, signature))
            .unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::StateMismatch(StateErrorKind::InvalidSignature)
        );
    }

    #[test]
    fn test_garbage_state_is_rejected() {
        let codec = codec();
        for state in ["", "abc", "abc.!!!", "."] {
            let err = codec.decode(state).unwrap_err();
            assert!(matches!(err.error_kind, ErrorKind::StateMismatch(_)));
        }
    }

    #[test]
    fn test_login_style_from_str() {
        assert_eq!("popup".parse::<LoginStyle>().unwrap(), LoginStyle::Popup);
        assert_eq!("REDIRECT".parse::<LoginStyle>().unwrap(), LoginStyle::Redirect);
        assert!("window".parse::<LoginStyle>().is_err());
    }
}
