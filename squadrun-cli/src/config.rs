//! Persistent CLI configuration stored as TOML in the platform config dir.

use crate::error::{CliError, Result};
use serde::{Deserialize, Serialize};
use session_auth::{AuthConfig, ContentionPolicy, ProxyConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "squadrun";
const CONFIG_FILE: &str = "config.toml";
const SECRETS_FILE: &str = "secrets.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api_base_url: String,

    /// Seconds before a token renewal is abandoned. `0` disables the bound.
    pub renewal_timeout_secs: u64,

    /// `join` or `reject`
    pub renewal_policy: String,

    pub request_timeout_secs: u64,

    /// Where the refresh token is kept between runs.
    pub secrets_path: Option<PathBuf>,

    /// `[proxy]` table: `enabled`, `url`, `username`, `password`, `use_system_proxy`
    pub proxy: ProxyConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: session_auth::config::DEFAULT_API_BASE_URL.to_string(),
            renewal_timeout_secs: 30,
            renewal_policy: "join".to_string(),
            request_timeout_secs: 30,
            secrets_path: None,
            proxy: ProxyConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from `path`, or from the default location. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Write defaults to `path` (or the default location).
    pub fn reset(path: Option<&Path>) -> Result<()> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()
                .ok_or_else(|| CliError::config("no configuration directory on this platform"))?,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, Self::default().show()?)?;
        Ok(())
    }

    pub fn show(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    pub fn secrets_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.secrets_path {
            return Ok(path.clone());
        }
        dirs::data_dir()
            .map(|dir| dir.join(APP_DIR).join(SECRETS_FILE))
            .ok_or_else(|| CliError::config("no data directory on this platform; set `secrets_path`"))
    }

    /// Build the session client configuration, preferring `base_url_override`.
    pub fn auth_config(&self, base_url_override: Option<&str>) -> Result<AuthConfig> {
        let base = base_url_override.unwrap_or(&self.api_base_url);
        let policy: ContentionPolicy = self.renewal_policy.parse()?;

        Ok(AuthConfig::new(base)?
            .with_contention(policy)
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
            .with_renewal_timeout(
                (self.renewal_timeout_secs > 0)
                    .then(|| Duration::from_secs(self.renewal_timeout_secs)),
            )
            .with_proxy(self.proxy.clone()))
    }
}
