//! Account profile normalization.
//!
//! The profile endpoint returns a superset of fields. Only `id`, `email`,
//! `alternateEmail`, `username` and `displayName` are copied into the identity
//! record handed to the host; everything else stays behind.

use std::fmt;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};

use super::token::TokenResponse;
use crate::error::{identity_error, Error};

/// Cloudron user id. Numeric and string ids are both accepted and written back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AccountId {
    Number(i64),
    Text(String),
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AccountId::Number(id) => write!(f, "{}", id),
            AccountId::Text(id) => write!(f, "{}", id),
        }
    }
}

/// Raw profile payload from `GET /api/v1/profile`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountProfile {
    #[serde(default)]
    pub id: Option<AccountId>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub alternate_email: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Untrusted fields that are never copied forward.
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

/// Identity and credential record stored by the host under the user's
/// `services.cloudron` entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceIdentity {
    #[serde(serialize_with = "expose_secret")]
    pub access_token: SecretString,
    #[serde(
        serialize_with = "expose_optional_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_token: Option<SecretString>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    pub id: AccountId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternate_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Initial profile the host creates for a new user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileProjection {
    pub name: Option<String>,
    pub username: Option<String>,
}

/// Merge tokens and whitelisted profile fields into a `ServiceIdentity`.
///
/// Fails with `InvalidIdentity` when the profile has no id; the host keys users
/// by it.
pub fn to_service_identity(
    tokens: TokenResponse,
    profile: &AccountProfile,
) -> Result<ServiceIdentity, Error> {
    let id = profile
        .id
        .clone()
        .ok_or_else(|| identity_error("Profile response has no id"))?;

    Ok(ServiceIdentity {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        expires_at: tokens.expires_at,
        id,
        email: profile.email.clone(),
        alternate_email: profile.alternate_email.clone(),
        username: profile.username.clone(),
        display_name: profile.display_name.clone(),
    })
}

impl ServiceIdentity {
    pub fn profile_projection(&self) -> ProfileProjection {
        ProfileProjection {
            name: self.display_name.clone(),
            username: self.username.clone(),
        }
    }
}

fn expose_secret<S: Serializer>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

fn expose_optional_secret<S: Serializer>(
    secret: &Option<SecretString>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(secret) => serializer.serialize_some(secret.expose_secret()),
        None => serializer.serialize_none(),
    }
}
