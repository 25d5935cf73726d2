//! Pending credential handoff between the callback and the requesting context.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use hmac::digest::{Key, KeyInit};
use hmac::{Hmac, Mac};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::error::{credential_error, CredentialErrorKind, Error};
use crate::oauth::CompletedLogin;

type HmacSha256 = Hmac<Sha256>;

/// Handle given to the requesting context so it can claim a completed login.
#[derive(Debug, Clone)]
pub struct CredentialHandle {
    pub credential_token: String,
    pub credential_secret: SecretString,
}

struct PendingCredential {
    /// HMAC of the credential secret under the store key; the secret itself is not kept.
    secret_mac: Vec<u8>,
    login: CompletedLogin,
    expires_at: DateTime<Utc>,
}

/// Completed logins waiting to be claimed, keyed by credential token.
///
/// Each entry is consumed by its first successful `retrieve` and expires after
/// the configured TTL.
#[derive(Clone)]
pub struct PendingCredentials {
    entries: Arc<DashMap<String, PendingCredential>>,
    key: Arc<Key<HmacSha256>>,
    ttl: Duration,
}

impl PendingCredentials {
    /// Create a store with the default TTL of 60 seconds.
    pub fn new() -> Self {
        Self::with_ttl(Duration::seconds(60))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            key: Arc::new(Self::generate_key()),
            ttl,
        }
    }

    /// Park a completed login under its credential token.
    ///
    /// Returns the handle the requesting context needs to claim it.
    pub fn store(&self, login: CompletedLogin) -> CredentialHandle {
        let credential_token = login.credential_token.clone();
        let secret = SecretString::from(Self::generate_secret());
        let expires_at = Utc::now()
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.entries.insert(
            credential_token.clone(),
            PendingCredential {
                secret_mac: self.mac(secret.expose_secret()).finalize().into_bytes().to_vec(),
                login,
                expires_at,
            },
        );

        CredentialHandle {
            credential_token,
            credential_secret: secret,
        }
    }

    /// Claim a completed login.
    ///
    /// A wrong secret leaves the entry in place; a matching one removes it.
    /// Secrets are compared in constant time.
    pub fn retrieve(
        &self,
        credential_token: &str,
        credential_secret: &str,
    ) -> Result<CompletedLogin, Error> {
        let (_, pending) = self
            .entries
            .remove_if(credential_token, |_, pending| {
                self.mac(credential_secret)
                    .verify_slice(&pending.secret_mac)
                    .is_ok()
            })
            .ok_or_else(|| {
                credential_error(CredentialErrorKind::NotFound, "No pending credential for token")
            })?;

        if Utc::now() > pending.expires_at {
            return Err(credential_error(
                CredentialErrorKind::Expired,
                "Pending credential expired",
            ));
        }

        Ok(pending.login)
    }

    /// Drop expired entries. Call periodically.
    pub fn cleanup_expired(&self) {
        let now = Utc::now();
        self.entries.retain(|_, pending| pending.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn mac(&self, secret: &str) -> HmacSha256 {
        let mut mac = <HmacSha256 as KeyInit>::new(&self.key);
        mac.update(secret.as_bytes());
        mac
    }

    fn generate_key() -> Key<HmacSha256> {
        let mut key = Key::<HmacSha256>::default();
        rand::thread_rng().fill(key.as_mut_slice());
        key
    }

    fn generate_secret() -> String {
        let random_bytes: [u8; 32] = rand::thread_rng().gen();
        hex::encode(random_bytes)
    }
}

impl Default for PendingCredentials {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::oauth::{to_service_identity, AccountProfile, LoginStyle, TokenResponse};

    fn login(credential_token: &str) -> CompletedLogin {
        let profile: AccountProfile =
            serde_json::from_value(serde_json::json!({ "id": 7, "username": "bob" })).unwrap();
        let tokens = TokenResponse {
            access_token: SecretString::from("tok".to_string()),
            refresh_token: None,
            expires_at: Utc::now() + Duration::days(7),
        };
        CompletedLogin::new(
            credential_token.to_string(),
            LoginStyle::Popup,
            None,
            to_service_identity(tokens, &profile).unwrap(),
        )
    }

    #[test]
    fn test_store_and_retrieve() {
        let store = PendingCredentials::new();
        let handle = store.store(login("token-1"));

        assert_eq!(handle.credential_token, "token-1");
        assert_eq!(handle.credential_secret.expose_secret().len(), 64);

        let login = store
            .retrieve("token-1", handle.credential_secret.expose_secret())
            .unwrap();
        assert_eq!(login.service_data.id.to_string(), "7");
        assert!(store.is_empty());
    }

    #[test]
    fn test_retrieve_consumes_entry() {
        let store = PendingCredentials::new();
        let handle = store.store(login("token-1"));
        let secret = handle.credential_secret.expose_secret().clone();

        assert!(store.retrieve("token-1", &secret).is_ok());
        let err = store.retrieve("token-1", &secret).unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::Credential(CredentialErrorKind::NotFound));
    }

    #[test]
    fn test_wrong_secret_keeps_entry() {
        let store = PendingCredentials::new();
        let handle = store.store(login("token-1"));

        let err = store.retrieve("token-1", "wrong").unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::Credential(CredentialErrorKind::NotFound));
        assert_eq!(store.len(), 1);
        assert!(store
            .retrieve("token-1", handle.credential_secret.expose_secret())
            .is_ok());
    }

    #[test]
    fn test_secret_is_not_kept_in_plain_text() {
        let store = PendingCredentials::new();
        let handle = store.store(login("token-1"));
        let secret = handle.credential_secret.expose_secret();

        let entry = store.entries.get("token-1").unwrap();
        assert_eq!(entry.secret_mac.len(), 32);
        assert_ne!(entry.secret_mac, secret.as_bytes());
        assert_ne!(hex::encode(&entry.secret_mac), *secret);
    }

    #[test]
    fn test_secret_of_other_store_is_rejected() {
        let first = PendingCredentials::new();
        let second = PendingCredentials::new();
        let handle = first.store(login("token-1"));
        second.store(login("token-1"));

        let err = second
            .retrieve("token-1", handle.credential_secret.expose_secret())
            .unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::Credential(CredentialErrorKind::NotFound));
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let store = PendingCredentials::with_ttl(Duration::milliseconds(i64::MAX));
        let handle = store.store(login("token-1"));

        store.cleanup_expired();
        assert!(store
            .retrieve("token-1", handle.credential_secret.expose_secret())
            .is_ok());
    }

    #[test]
    fn test_expired_entry() {
        let store = PendingCredentials::with_ttl(Duration::seconds(-1));
        let handle = store.store(login("token-1"));

        let err = store
            .retrieve("token-1", handle.credential_secret.expose_secret())
            .unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::Credential(CredentialErrorKind::Expired));
    }

    #[test]
    fn test_cleanup_expired() {
        let store = PendingCredentials::with_ttl(Duration::seconds(-1));
        store.store(login("token-1"));
        store.store(login("token-2"));
        assert_eq!(store.len(), 2);

        store.cleanup_expired();
        assert!(store.is_empty());
    }
}
