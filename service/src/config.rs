use clap::builder::TypedValueParser as _;
use clap::Args;
use cloudron_auth::oauth::{LoginStyle, DEFAULT_TOKEN_TTL_MS};
use log::LevelFilter;
use std::fmt;
use std::str::FromStr;

/// Default absolute URL of the host application.
pub const DEFAULT_ROOT_URL: &str = "http://localhost:3000/";

/// Largest pending credential lifetime, one year.
pub const MAX_CREDENTIAL_TTL_SECS: i64 = 365 * 24 * 60 * 60;

#[derive(Clone, Debug, PartialEq)]
pub enum RustEnv {
    Development,
    Production,
    Staging,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RustEnvParseError;

impl FromStr for RustEnv {
    type Err = RustEnvParseError;
    fn from_str(level: &str) -> Result<RustEnv, Self::Err> {
        match level.to_lowercase().as_str() {
            "development" => Ok(RustEnv::Development),
            "production" => Ok(RustEnv::Production),
            "staging" => Ok(RustEnv::Staging),
            _ => Err(RustEnvParseError),
        }
    }
}

impl fmt::Display for RustEnv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RustEnv::Development => write!(f, "development"),
            RustEnv::Production => write!(f, "production"),
            RustEnv::Staging => write!(f, "staging"),
        }
    }
}

/// Host settings. Every value can come from a flag, the environment or a `.env` file.
#[derive(Clone, Debug, Args)]
pub struct Config {
    /// OAuth client id registered with the Cloudron instance.
    #[arg(long, env = "OAUTH_CLIENT_ID")]
    oauth_client_id: Option<String>,

    /// OAuth client secret registered with the Cloudron instance.
    #[arg(long, env = "OAUTH_CLIENT_SECRET", hide_env_values = true)]
    oauth_client_secret: Option<String>,

    /// Origin of the Cloudron API (e.g. https://my.example.com).
    #[arg(long, env = "API_ORIGIN")]
    api_origin: Option<String>,

    /// Absolute root URL of the host application. The OAuth callback lives
    /// at `<root_url>/_oauth/cloudron/`.
    #[arg(long, env, default_value = DEFAULT_ROOT_URL)]
    root_url: String,

    /// Login style used when a login attempt does not choose one.
    #[arg(
        long,
        env,
        default_value = "popup",
        value_parser = clap::builder::PossibleValuesParser::new(["popup", "redirect"])
            .map(|s| s.parse::<LoginStyle>().unwrap()),
    )]
    pub login_style: LoginStyle,

    /// Timeout in seconds for each call to the Cloudron API
    #[arg(long, env, default_value_t = 30)]
    pub http_timeout_secs: u64,

    /// Lifetime in milliseconds assumed for issued access tokens. Cloudron does
    /// not report one.
    #[arg(
        long,
        env,
        default_value_t = DEFAULT_TOKEN_TTL_MS,
        value_parser = clap::value_parser!(i64).range(1..)
    )]
    pub token_ttl_ms: i64,

    /// Seconds a completed login waits to be claimed before it is discarded
    #[arg(
        long,
        env,
        default_value_t = 60,
        value_parser = clap::value_parser!(i64).range(1..=MAX_CREDENTIAL_TTL_SECS)
    )]
    pub credential_ttl_secs: i64,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap()),
        )]
    pub log_level_filter: LevelFilter,

    /// Set the Rust runtime environment to use.
    #[arg(
    short,
    long,
    env,
    default_value_t = RustEnv::Development,
    value_parser = clap::builder::PossibleValuesParser::new([
        "DEVELOPMENT", "PRODUCTION", "STAGING",
        "development", "production", "staging"
    ])
        .map(|s| s.parse::<RustEnv>().unwrap()),
    )]
    pub runtime_env: RustEnv,
}

impl Config {
    pub fn oauth_client_id(&self) -> Option<String> {
        self.oauth_client_id.clone()
    }

    pub fn oauth_client_secret(&self) -> Option<String> {
        self.oauth_client_secret.clone()
    }

    pub fn api_origin(&self) -> Option<String> {
        self.api_origin.clone()
    }

    /// True when client id, client secret and API origin are all set.
    pub fn has_oauth_credentials(&self) -> bool {
        [&self.oauth_client_id, &self.oauth_client_secret, &self.api_origin]
            .iter()
            .all(|value| value.as_deref().is_some_and(|v| !v.trim().is_empty()))
    }

    pub fn root_url(&self) -> &str {
        &self.root_url
    }

    pub fn runtime_env(&self) -> RustEnv {
        self.runtime_env.clone()
    }

    pub fn is_production(&self) -> bool {
        self.runtime_env() == RustEnv::Production
    }
}
