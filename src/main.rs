use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use cloudron_auth::credentials::{CredentialHandle, PendingCredentials};
use cloudron_auth::http::HttpClientBuilder;
use cloudron_auth::oauth::{
    CallbackExchanger, CallbackQuery, CompletedLogin, CompletionCallback, LoginInitiator,
    LoginLaunch, LoginOptions, Redirector,
};
use cloudron_auth::provider::ProviderConfig;
use log::*;
use secrecy::{ExposeSecret, SecretString};
use service::{config::Config, logging::Logger};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use url::Url;

#[derive(Parser)]
#[command(name = "cloudron_login")]
#[command(about = "Log in to a Cloudron instance with OAuth 2.0")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a login attempt and print the consent dialog URL
    Authorize {
        /// Page to return to after a redirect-style login
        #[arg(long)]
        redirect_url: Option<String>,
    },
    /// Complete a login from the parameters Cloudron sent to the callback URL
    Callback {
        /// Authorization code
        #[arg(long)]
        code: String,

        /// State parameter, exactly as received
        #[arg(long)]
        state: String,
    },
    /// Run a whole login: print the consent URL, read back the callback URL the
    /// browser landed on, then claim the completed login
    Login {
        /// Page to return to after a redirect-style login
        #[arg(long)]
        redirect_url: Option<String>,
    },
}

fn print_launch(launch: &LoginLaunch) {
    println!("Open this URL to log in with {}:", launch.login_service);
    println!("{}", launch.login_url);
    println!("Credential token: {}", launch.credential_token);
    debug!(
        "Requested {} window {}x{}",
        launch.login_style.as_str(),
        launch.popup_options.width,
        launch.popup_options.height
    );
}

/// Prints the launch so the operator can open it in a browser. The completion
/// arrives through a later `callback` invocation.
struct TerminalRedirector;

impl Redirector for TerminalRedirector {
    fn launch(&self, launch: LoginLaunch, _on_complete: CompletionCallback) {
        print_launch(&launch);
    }
}

/// Holds the launch until the operator pastes the callback URL back in.
#[derive(Default)]
struct InteractiveRedirector {
    pending: Mutex<Option<(LoginLaunch, CompletionCallback)>>,
}

impl InteractiveRedirector {
    fn take(&self) -> Option<(LoginLaunch, CompletionCallback)> {
        self.pending.lock().ok()?.take()
    }
}

impl Redirector for InteractiveRedirector {
    fn launch(&self, launch: LoginLaunch, on_complete: CompletionCallback) {
        print_launch(&launch);
        if let Ok(mut pending) = self.pending.lock() {
            *pending = Some((launch, on_complete));
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = cli.config;

    Logger::init_logger(&config).context("Failed to initialize logger")?;
    info!("Starting cloudron_login in {} mode", config.runtime_env());

    let provider = provider_config(&config)?;

    match cli.command {
        Command::Authorize { redirect_url } => authorize(&config, provider, redirect_url),
        Command::Callback { code, state } => callback(&config, provider, code, state).await,
        Command::Login { redirect_url } => login(&config, provider, redirect_url).await,
    }
}

/// Registers the Cloudron provider only when client id, secret and origin are all set.
fn provider_config(config: &Config) -> Result<Option<ProviderConfig>> {
    if !config.has_oauth_credentials() {
        warn!("OAUTH_CLIENT_ID, OAUTH_CLIENT_SECRET or API_ORIGIN not set, Cloudron login is not configured");
        return Ok(None);
    }

    let (Some(client_id), Some(client_secret), Some(api_origin)) = (
        config.oauth_client_id(),
        config.oauth_client_secret(),
        config.api_origin(),
    ) else {
        return Ok(None);
    };

    let provider = ProviderConfig::new(&client_id, SecretString::from(client_secret), &api_origin)?;
    if config.is_production() && provider.api_origin().scheme() != "https" {
        warn!("API_ORIGIN {} is not served over https", provider.api_origin());
    }

    Ok(Some(provider))
}

fn initiator(
    config: &Config,
    provider: Option<ProviderConfig>,
    redirector: Arc<dyn Redirector>,
) -> Result<LoginInitiator> {
    let root_url = Url::parse(config.root_url()).context("ROOT_URL is not a valid URL")?;
    let initiator = LoginInitiator::new(provider, &root_url, redirector)
        .with_default_style(config.login_style);
    info!("Callback URL: {}", initiator.redirect_uri());

    Ok(initiator)
}

fn exchanger(config: &Config, provider: Option<ProviderConfig>) -> Result<CallbackExchanger> {
    let client = HttpClientBuilder::new()
        .with_timeout(Duration::from_secs(config.http_timeout_secs))
        .build()?;

    Ok(CallbackExchanger::new(provider, client)
        .with_token_ttl(chrono::Duration::milliseconds(config.token_ttl_ms))?)
}

fn print_handoff(login: &CompletedLogin) -> Result<()> {
    if let Some(redirect_url) = &login.redirect_url {
        info!("Login will return to {}", redirect_url);
    }
    println!("{}", serde_json::to_string_pretty(login)?);

    Ok(())
}

fn authorize(
    config: &Config,
    provider: Option<ProviderConfig>,
    redirect_url: Option<String>,
) -> Result<()> {
    let (tx, mut rx) = oneshot::channel::<Result<CredentialHandle, cloudron_auth::Error>>();
    initiator(config, provider, Arc::new(TerminalRedirector))?.begin(
        LoginOptions {
            redirect_url,
            ..Default::default()
        },
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );

    // Only a failure to start is reported synchronously.
    if let Ok(Err(e)) = rx.try_recv() {
        return Err(e.into());
    }

    Ok(())
}

async fn callback(
    config: &Config,
    provider: Option<ProviderConfig>,
    code: String,
    state: String,
) -> Result<()> {
    let login = exchanger(config, provider)?
        .complete(&CallbackQuery { code, state })
        .await?;

    print_handoff(&login)
}

async fn login(
    config: &Config,
    provider: Option<ProviderConfig>,
    redirect_url: Option<String>,
) -> Result<()> {
    let ttl = chrono::Duration::try_seconds(config.credential_ttl_secs)
        .context("CREDENTIAL_TTL_SECS is out of range")?;
    let pending = PendingCredentials::with_ttl(ttl);
    let exchanger = exchanger(config, provider.clone())?;

    let redirector = Arc::new(InteractiveRedirector::default());
    let (tx, rx) = oneshot::channel::<Result<CredentialHandle, cloudron_auth::Error>>();
    initiator(config, provider, redirector.clone())?.begin(
        LoginOptions {
            redirect_url,
            ..Default::default()
        },
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );

    // Backend side: finish the attempt and park the result for the requester.
    if let Some((launch, on_complete)) = redirector.take() {
        println!("Paste the URL the browser was sent back to:");
        let query = read_callback_query().await?;

        match exchanger.complete(&query).await {
            Ok(login) if login.credential_token == launch.credential_token => {
                pending.cleanup_expired();
                on_complete(Ok(pending.store(login)));
            }
            Ok(_) => on_complete(Err(cloudron_auth::error::state_error(
                cloudron_auth::error::StateErrorKind::Mismatch,
                "Callback belongs to another login attempt",
            ))),
            Err(e) => on_complete(Err(e)),
        }
    }

    // Requesting side: claim the credential with the handle.
    let handle = rx.await.map_err(|_| anyhow!("Login attempt was abandoned"))??;
    let login = pending.retrieve(
        &handle.credential_token,
        handle.credential_secret.expose_secret(),
    )?;

    print_handoff(&login)
}

/// Reads the callback URL from stdin.
async fn read_callback_query() -> Result<CallbackQuery> {
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read the callback URL")?;

    callback_query_from_url(&line)
}

/// Extracts `code` and `state` from the URL Cloudron redirected the browser to.
fn callback_query_from_url(callback_url: &str) -> Result<CallbackQuery> {
    let url = Url::parse(callback_url.trim()).context("Not a valid callback URL")?;
    let param = |name: &str| {
        url.query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
            .ok_or_else(|| anyhow!("Callback URL has no {} parameter", name))
    };

    Ok(CallbackQuery {
        code: param("code")?,
        state: param("state")?,
    })
}
