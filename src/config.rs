//! Configuration for agencyhub, read from `.agencyhub/agencyhub.toml`.
//!
//! Layered: file → environment (`AGENCYHUB_PORT`, `AGENCYHUB_DB_PATH`,
//! `AGENCYHUB_LOG_JSON`) → CLI flags.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! db_path = ".agencyhub/agencyhub.db"
//! dev_mode = false
//!
//! [identity]
//! api_url = "https://api.identity.example"
//! secret_key_env = "IDENTITY_SECRET_KEY"
//! invitation_redirect_url = "http://localhost:3000/agency/sign-up"
//!
//! [logging]
//! filter = "info"
//! json = false
//! directory = ".agencyhub/logs"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory holding the config file and, by default, the database.
pub const HUB_DIR: &str = ".agencyhub";
pub const CONFIG_FILE: &str = "agencyhub.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Permissive CORS for local front-end development.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

fn default_db_path() -> PathBuf {
    PathBuf::from(HUB_DIR).join("agencyhub.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

/// External identity provider. Without `api_url` a local recording
/// provider is used and metadata/invitation calls only get logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySection {
    #[serde(default)]
    pub api_url: Option<String>,
    /// Name of the environment variable holding the provider secret key
    #[serde(default = "default_secret_key_env")]
    pub secret_key_env: String,
    #[serde(default = "default_redirect_url")]
    pub invitation_redirect_url: String,
}

fn default_secret_key_env() -> String {
    "IDENTITY_SECRET_KEY".to_string()
}

fn default_redirect_url() -> String {
    "http://localhost:3000/agency/sign-up".to_string()
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self {
            api_url: None,
            secret_key_env: default_secret_key_env(),
            invitation_redirect_url: default_redirect_url(),
        }
    }
}

impl IdentitySection {
    /// Read the secret key from the configured environment variable.
    pub fn secret_key(&self) -> Option<String> {
        std::env::var(&self.secret_key_env)
            .ok()
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
    /// When set, logs also go to a daily rolling file in this directory
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
            directory: None,
        }
    }
}

/// Root of `agencyhub.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HubToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub identity: IdentitySection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl HubToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse agencyhub.toml")
    }

    /// Load `agencyhub.toml` from `hub_dir`, or defaults when it doesn't exist.
    pub fn load_or_default(hub_dir: &Path) -> Result<Self> {
        let config_path = hub_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating the parent directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize agencyhub.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `AGENCYHUB_*` environment overrides on top of the file values.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(port) = std::env::var("AGENCYHUB_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid AGENCYHUB_PORT: {}", port))?;
        }
        if let Ok(path) = std::env::var("AGENCYHUB_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Ok(json) = std::env::var("AGENCYHUB_LOG_JSON") {
            self.logging.json = json != "false" && json != "0";
        }
        Ok(self)
    }

    /// Problems that would prevent the server from starting.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.server.port == 0 {
            problems.push("server.port must be non-zero".to_string());
        }
        if let Some(url) = &self.identity.api_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            problems.push(format!("identity.api_url must be an http(s) URL: {}", url));
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.filter).is_err() {
            problems.push(format!("logging.filter is not a valid filter: {}", self.logging.filter));
        }
        problems
    }
}

/// Resolve the config file path: explicit `--config` or the default location
/// under `project_dir`.
pub fn config_path(project_dir: &Path, explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(path) => path.to_path_buf(),
        None => project_dir.join(HUB_DIR).join(CONFIG_FILE),
    }
}

/// Load the effective configuration: file (if present) then environment.
pub fn load_effective(project_dir: &Path, explicit: Option<&Path>) -> Result<HubToml> {
    let path = config_path(project_dir, explicit);
    let file = if path.exists() {
        HubToml::load(&path)?
    } else if explicit.is_some() {
        anyhow::bail!("Config file not found: {}", path.display());
    } else {
        HubToml::default()
    };
    file.with_env_overrides()
}
