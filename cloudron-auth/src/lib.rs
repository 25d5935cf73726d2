//! # cloudron-auth
//!
//! "Log in with Cloudron" for hosts that keep their own account store:
//! - Login initiation with a signed, self-verifying OAuth state
//! - Authorization code exchange and profile fetch
//! - Whitelist projection of the profile into a service identity
//! - Pending credential handoff back to the requesting context
//!
//! The host supplies the [`provider::ProviderConfig`], performs the browser
//! navigation through an [`oauth::Redirector`] and persists the resulting
//! identity itself.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cloudron_auth::{
//!     http::HttpClientBuilder,
//!     oauth::{CallbackExchanger, CallbackQuery},
//!     provider::ProviderConfig,
//! };
//!
//! let client = HttpClientBuilder::new().build()?;
//! let exchanger = CallbackExchanger::new(Some(config), client);
//! let login = exchanger.complete(&CallbackQuery { code, state }).await?;
//! ```

pub mod credentials;
pub mod error;
pub mod http;
pub mod oauth;
pub mod provider;

// Re-export commonly used types
pub use error::{Error, ErrorKind};
