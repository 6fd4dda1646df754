//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Every field has a default, so running without a config file works against
//! a local backend with an in-memory session.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "marketplace.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Backend API settings
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_timeout")]
    pub refresh_timeout_secs: u64,
}

/// Session persistence settings
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Session file. Without it the session lives only as long as the process.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
            refresh_timeout_secs: default_timeout(),
        }
    }
}

fn default_base_url() -> String {
    market_auth::DEFAULT_BASE_URL.to_string()
}

fn default_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// A missing file is an error only when `required` is set (the path came
    /// from `--config` or `MARKETPLACE_CONFIG`); otherwise defaults apply.
    pub fn load(path: &Path, required: bool) -> common::Result<Self> {
        let mut config: Config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => Config::default(),
            Err(e) => return Err(e.into()),
        };

        if let Ok(url) = std::env::var("MARKETPLACE_API_URL") {
            if url.trim().is_empty() {
                return Err(common::Error::Config(
                    "MARKETPLACE_API_URL is set but empty".into(),
                ));
            }
            config.api.base_url = url;
        }
        if let Some(path) = config.session.path.take() {
            config.session.path = Some(expand_home(&path));
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            return Err(common::Error::InvalidField {
                field: "api.base_url",
                reason: format!("must start with http:// or https://, got: {}", self.api.base_url),
            });
        }

        if self.api.timeout_secs == 0 {
            return Err(common::Error::InvalidField {
                field: "api.timeout_secs",
                reason: "must be greater than 0".into(),
            });
        }

        if self.api.refresh_timeout_secs == 0 {
            return Err(common::Error::InvalidField {
                field: "api.refresh_timeout_secs",
                reason: "must be greater than 0".into(),
            });
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.api.refresh_timeout_secs)
    }

    /// Resolve config file path from CLI arg or MARKETPLACE_CONFIG env var.
    ///
    /// The flag says whether the path was given explicitly.
    pub fn resolve_path(cli_path: Option<&Path>) -> (PathBuf, bool) {
        if let Some(p) = cli_path {
            return (p.to_path_buf(), true);
        }
        if let Ok(p) = std::env::var("MARKETPLACE_CONFIG") {
            return (PathBuf::from(p), true);
        }
        (PathBuf::from(DEFAULT_CONFIG_FILE), false)
    }
}

/// Expand a leading `~/` using `HOME`.
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}
