//! Login initiation: credential token, signed state and authorization URL.

use std::sync::Arc;

use log::*;
use url::Url;

use super::state::{generate_credential_token, LoginStyle, StateCodec, StateParam};
use crate::credentials::CredentialHandle;
use crate::error::{config_error, Error};
use crate::provider::{callback_url, ProviderConfig, SERVICE_NAME};

/// Scope requested from Cloudron.
pub const SCOPE: &str = "profile";

/// Popup window size requested from the redirector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopupOptions {
    pub width: u32,
    pub height: u32,
}

impl Default for PopupOptions {
    fn default() -> Self {
        Self {
            width: 650,
            height: 600,
        }
    }
}

/// Per-attempt options supplied by the host.
#[derive(Debug, Clone, Default)]
pub struct LoginOptions {
    /// Overrides the configured login style.
    pub login_style: Option<LoginStyle>,
    /// Page to return to after a redirect-style login.
    pub redirect_url: Option<String>,
    pub popup_options: Option<PopupOptions>,
}

/// One login attempt. Consumed by the callback step.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub credential_token: String,
    pub state: String,
    pub redirect_uri: String,
    pub scope: String,
    pub login_style: LoginStyle,
}

impl LoginRequest {
    /// True when `state` is exactly the state issued for this attempt.
    pub fn matches_state(&self, state: &str) -> bool {
        self.state == state
    }
}

/// Everything the redirect mechanism needs to navigate the browser.
#[derive(Debug, Clone)]
pub struct LoginLaunch {
    pub login_service: &'static str,
    pub login_style: LoginStyle,
    pub login_url: String,
    pub credential_token: String,
    pub popup_options: PopupOptions,
}

/// Receives the outcome of a login attempt: a credential handle or a failure.
pub type CompletionCallback = Box<dyn FnOnce(Result<CredentialHandle, Error>) + Send>;

/// External mechanism that performs the browser navigation.
///
/// Implementations own popup sizing, focus and message passing back to the
/// opener. They call the completion callback once the host has a credential
/// handle for the attempt, or with an error if the attempt failed.
pub trait Redirector: Send + Sync {
    /// Whether full-page redirects are possible in this environment.
    fn supports_redirect(&self) -> bool {
        true
    }

    fn launch(&self, launch: LoginLaunch, on_complete: CompletionCallback);
}

/// Starts Cloudron logins.
pub struct LoginInitiator {
    config: Option<ProviderConfig>,
    redirect_uri: String,
    default_style: LoginStyle,
    redirector: Arc<dyn Redirector>,
}

impl LoginInitiator {
    /// Create an initiator for a host rooted at `root_url`.
    ///
    /// `config` is `None` when the host has no Cloudron registration; every
    /// `begin` then reports `ConfigurationMissing` through its callback.
    pub fn new(
        config: Option<ProviderConfig>,
        root_url: &Url,
        redirector: Arc<dyn Redirector>,
    ) -> Self {
        Self {
            config,
            redirect_uri: callback_url(root_url),
            default_style: LoginStyle::Popup,
            redirector,
        }
    }

    /// Set the login style used when the options do not choose one.
    pub fn with_default_style(mut self, style: LoginStyle) -> Self {
        self.default_style = style;
        self
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Start a login attempt with default options.
    pub fn begin_default(&self, on_complete: CompletionCallback) {
        self.begin(LoginOptions::default(), on_complete)
    }

    /// Start a login attempt.
    ///
    /// Failures before the hand-off are delivered to `on_complete`; this method
    /// never returns an error itself.
    pub fn begin(&self, options: LoginOptions, on_complete: CompletionCallback) {
        let popup_options = options.popup_options.unwrap_or_default();
        let request = match self.request(&options) {
            Ok(request) => request,
            Err(e) => {
                warn!("Unable to start {} login: {}", SERVICE_NAME, e);
                on_complete(Err(e));
                return;
            }
        };

        let login_url = match self.authorization_url(&request) {
            Ok(url) => url,
            Err(e) => {
                on_complete(Err(e));
                return;
            }
        };

        info!(
            "Launching {} login ({} style)",
            SERVICE_NAME,
            request.login_style.as_str()
        );

        self.redirector.launch(
            LoginLaunch {
                login_service: SERVICE_NAME,
                login_style: request.login_style,
                login_url,
                credential_token: request.credential_token,
                popup_options,
            },
            on_complete,
        );
    }

    /// Create a new `LoginRequest` with a fresh credential token and signed state.
    pub fn request(&self, options: &LoginOptions) -> Result<LoginRequest, Error> {
        let config = self.config()?;
        let login_style = self.login_style(options);
        let credential_token = generate_credential_token();

        let param = StateParam {
            login_style,
            credential_token: credential_token.clone(),
            redirect_url: match login_style {
                LoginStyle::Redirect => options.redirect_url.clone(),
                LoginStyle::Popup => None,
            },
        };
        let state = StateCodec::new(config.client_secret().clone()).encode(&param)?;

        Ok(LoginRequest {
            credential_token,
            state,
            redirect_uri: self.redirect_uri.clone(),
            scope: SCOPE.to_string(),
            login_style,
        })
    }

    /// Build the consent dialog URL for a request.
    pub fn authorization_url(&self, request: &LoginRequest) -> Result<String, Error> {
        let config = self.config()?;

        Ok(format!(
            "{}?\
            redirect_uri={}&\
            client_id={}&\
            scope={}&\
            response_type=code&\
            state={}",
            config.authorize_endpoint(),
            urlencoding::encode(&request.redirect_uri),
            urlencoding::encode(config.client_id()),
            urlencoding::encode(&request.scope),
            urlencoding::encode(&request.state)
        ))
    }

    /// Options win over the configured default; redirect falls back to popup
    /// when the environment cannot redirect.
    fn login_style(&self, options: &LoginOptions) -> LoginStyle {
        let style = options.login_style.unwrap_or(self.default_style);
        if style == LoginStyle::Redirect && !self.redirector.supports_redirect() {
            debug!("Redirect login not supported here, using popup");
            return LoginStyle::Popup;
        }
        style
    }

    fn config(&self) -> Result<&ProviderConfig, Error> {
        self.config
            .as_ref()
            .ok_or_else(|| config_error("No Cloudron provider configuration registered"))
    }
}
