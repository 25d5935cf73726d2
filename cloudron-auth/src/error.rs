//! Error types for the `cloudron-auth` crate.
//!
//! A root `Error` struct holds an `ErrorKind` tree, the underlying cause and, for
//! failures that happened after the provider answered, the raw HTTP response so
//! the host can log or display it.

use std::error::Error as StdError;
use std::fmt;

/// Top-level error type for cloudron-auth.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
    /// Raw provider response, kept for diagnostics.
    pub response: Option<RawResponse>,
}

/// Status and body of a provider response that could not be used.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// Stages of a login attempt that can fail.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    /// No usable provider configuration was supplied. Not retryable.
    ConfigurationMissing,
    /// The returned state does not belong to this login attempt.
    StateMismatch(StateErrorKind),
    TokenExchangeFailed(ExchangeErrorKind),
    ProfileFetchFailed(ExchangeErrorKind),
    /// The provider profile has no `id` after whitelisting.
    InvalidIdentity,
    Credential(CredentialErrorKind),
    Http(HttpErrorKind),
}

/// Why a state value was rejected.
#[derive(Debug, PartialEq)]
pub enum StateErrorKind {
    Malformed,
    InvalidSignature,
    Mismatch,
}

/// Why a call to the provider failed.
#[derive(Debug, PartialEq)]
pub enum ExchangeErrorKind {
    Network,
    Timeout,
    Status(u16),
    /// The provider answered with an `error` field.
    Provider(String),
    InvalidResponse,
}

/// Errors from the pending credential handoff.
#[derive(Debug, PartialEq)]
pub enum CredentialErrorKind {
    NotFound,
    Expired,
}

/// Errors from building the HTTP client.
#[derive(Debug, PartialEq)]
pub enum HttpErrorKind {
    BuilderFailed,
}

impl Error {
    /// True for failures worth offering the user a fresh login attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.error_kind,
            ErrorKind::TokenExchangeFailed(ExchangeErrorKind::Network)
                | ErrorKind::TokenExchangeFailed(ExchangeErrorKind::Timeout)
                | ErrorKind::ProfileFetchFailed(ExchangeErrorKind::Network)
                | ErrorKind::ProfileFetchFailed(ExchangeErrorKind::Timeout)
        )
    }

    pub(crate) fn with_response(mut self, response: Option<RawResponse>) -> Self {
        self.response = response;
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::ConfigurationMissing => {
                write!(f, "Cloudron login is not configured")
            }
            ErrorKind::StateMismatch(kind) => write!(f, "OAuth state mismatch: {:?}", kind),
            ErrorKind::TokenExchangeFailed(kind) => write!(
                f,
                "Failed to complete OAuth handshake with Cloudron: {}",
                kind
            ),
            ErrorKind::ProfileFetchFailed(kind) => {
                write!(f, "Failed to fetch account data from Cloudron: {}", kind)
            }
            ErrorKind::InvalidIdentity => {
                write!(f, "Cloudron profile is missing the required id field")
            }
            ErrorKind::Credential(kind) => write!(f, "Credential error: {:?}", kind),
            ErrorKind::Http(kind) => write!(f, "HTTP error: {:?}", kind),
        }?;
        if let Some(source) = &self.source {
            write!(f, ". {}", source)?;
        }
        Ok(())
    }
}

impl fmt::Display for ExchangeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExchangeErrorKind::Network => write!(f, "network error"),
            ExchangeErrorKind::Timeout => write!(f, "request timed out"),
            ExchangeErrorKind::Status(status) => write!(f, "HTTP status {}", status),
            ExchangeErrorKind::Provider(error) => write!(f, "{}", error),
            ExchangeErrorKind::InvalidResponse => write!(f, "invalid response"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Http(HttpErrorKind::BuilderFailed),
            response: None,
        }
    }
}

/// Classifies a transport error from a provider call.
pub(crate) fn exchange_kind(err: &reqwest::Error) -> ExchangeErrorKind {
    if err.is_timeout() {
        ExchangeErrorKind::Timeout
    } else if err.is_decode() {
        ExchangeErrorKind::InvalidResponse
    } else {
        ExchangeErrorKind::Network
    }
}

/// Helper function to create configuration errors.
pub fn config_error(message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::ConfigurationMissing,
        response: None,
    }
}

/// Helper function to create state errors.
pub fn state_error(kind: StateErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::StateMismatch(kind),
        response: None,
    }
}

/// Helper function to create token exchange errors.
pub fn token_exchange_error(kind: ExchangeErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::TokenExchangeFailed(kind),
        response: None,
    }
}

/// Helper function to create profile fetch errors.
pub fn profile_fetch_error(kind: ExchangeErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::ProfileFetchFailed(kind),
        response: None,
    }
}

/// Helper function to create identity errors.
pub fn identity_error(message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::InvalidIdentity,
        response: None,
    }
}

/// Helper function to create credential errors.
pub fn credential_error(kind: CredentialErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Credential(kind),
        response: None,
    }
}
