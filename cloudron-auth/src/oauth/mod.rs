//! OAuth 2.0 authorization code login against a Cloudron instance.
//!
//! [`LoginInitiator`] starts an attempt and hands the consent URL to an external
//! [`Redirector`]; [`CallbackExchanger`] turns the provider callback into a
//! [`CompletedLogin`].

mod callback;
mod identity;
mod login;
mod state;
mod token;

pub use callback::{CallbackExchanger, CallbackQuery, CompletedLogin, HostOptions};
pub use identity::{
    to_service_identity, AccountId, AccountProfile, ProfileProjection, ServiceIdentity,
};
pub use login::{
    CompletionCallback, LoginInitiator, LoginLaunch, LoginOptions, LoginRequest, PopupOptions,
    Redirector, SCOPE,
};
pub use state::{generate_credential_token, LoginStyle, StateCodec, StateParam};
pub use token::{check_token_ttl, TokenResponse, DEFAULT_TOKEN_TTL_MS};
