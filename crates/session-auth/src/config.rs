use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AuthError;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api/";

/// Persistence key for the refresh token.
pub const DEFAULT_REFRESH_TOKEN_KEY: &str = "refreshToken";

pub const DEFAULT_USER_AGENT: &str = concat!("squadrun-session/", env!("CARGO_PKG_VERSION"));

pub const LOGIN_PATH: &str = "auth/login/";
pub const REGISTER_PATH: &str = "auth/register/";
pub const TOKEN_REFRESH_PATH: &str = "auth/token/refresh/";
pub const ME_PATH: &str = "auth/me/";

/// What a renewal request does when another renewal is already running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContentionPolicy {
    /// Await the in-flight renewal and share its outcome.
    #[default]
    Join,
    /// Fail immediately with `RenewalError::InProgress`.
    Reject,
}

impl std::str::FromStr for ContentionPolicy {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "join" | "shared" => Ok(Self::Join),
            "reject" | "fail-fast" | "fail_fast" => Ok(Self::Reject),
            other => Err(AuthError::config(format!(
                "unknown renewal policy `{other}` (expected `join` or `reject`)"
            ))),
        }
    }
}

/// Proxy settings for the API client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Fall back to system/env proxy settings when `url` is unset.
    pub use_system_proxy: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            username: None,
            password: None,
            use_system_proxy: true,
        }
    }
}

/// Configuration for the session client.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// API root. Always ends with `/` so relative endpoint paths join beneath it.
    pub base_url: Url,

    /// Overall timeout for ordinary requests. Zero disables it.
    pub request_timeout: Duration,

    pub connect_timeout: Duration,

    /// Upper bound on the refresh exchange. `None` leaves it bounded by the
    /// transport only; expiry counts as a renewal failure.
    pub renewal_timeout: Option<Duration>,

    pub contention: ContentionPolicy,

    pub refresh_token_key: String,

    pub user_agent: String,

    pub proxy: ProxyConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_API_BASE_URL).expect("default API base URL is valid"),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            renewal_timeout: None,
            contention: ContentionPolicy::default(),
            refresh_token_key: DEFAULT_REFRESH_TOKEN_KEY.to_owned(),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl AuthConfig {
    /// Build a config for the given API root.
    pub fn new(base_url: &str) -> Result<Self, AuthError> {
        Self::default().with_base_url(base_url)
    }

    /// Load from the process environment (and a `.env` file if present).
    ///
    /// Recognized variables: `API_BASE_URL`, `SESSION_RENEWAL_TIMEOUT_SECS`,
    /// `SESSION_RENEWAL_POLICY`, `SESSION_REQUEST_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, AuthError> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Ok(base) = std::env::var("API_BASE_URL") {
            config = config.with_base_url(&base)?;
        }
        if let Some(secs) = env_secs("SESSION_RENEWAL_TIMEOUT_SECS")? {
            config.renewal_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = env_secs("SESSION_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Ok(policy) = std::env::var("SESSION_RENEWAL_POLICY") {
            config.contention = policy.parse()?;
        }

        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, AuthError> {
        self.base_url = normalize_base_url(base_url)?;
        Ok(self)
    }

    pub fn with_renewal_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.renewal_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_contention(mut self, policy: ContentionPolicy) -> Self {
        self.contention = policy;
        self
    }

    pub fn with_refresh_token_key(mut self, key: impl Into<String>) -> Self {
        self.refresh_token_key = key.into();
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = proxy;
        self
    }

    /// Resolve an endpoint path against the API root.
    ///
    /// Leading slashes are ignored, so `/auth/me/` and `auth/me/` are the same
    /// endpoint.
    pub fn endpoint(&self, path: &str) -> Result<Url, AuthError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|source| AuthError::InvalidUrl {
                input: path.to_owned(),
                source,
            })
    }
}

fn normalize_base_url(input: &str) -> Result<Url, AuthError> {
    let trimmed = input.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_owned()
    } else {
        format!("{trimmed}/")
    };

    let url = Url::parse(&with_slash).map_err(|source| AuthError::InvalidUrl {
        input: input.to_owned(),
        source,
    })?;

    if url.cannot_be_a_base() {
        return Err(AuthError::config(format!("`{input}` cannot be used as an API base")));
    }

    Ok(url)
}

fn env_secs(name: &str) -> Result<Option<u64>, AuthError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| AuthError::config(format!("{name}: {e}"))),
        Err(_) => Ok(None),
    }
}
