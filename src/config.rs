use std::{
    env, fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
};

use anyhow::{Context as _, bail};
use serde::Deserialize;
use std::str::FromStr;

use crate::scenario;

pub const PROJECT_CONFIG_FILENAME: &str = "mockreplay.toml";
const HOME_CONFIG_DIR: &str = ".mockreplay";
const HOME_CONFIG_FILENAME: &str = "config.toml";
const DEFAULT_STORAGE_PATH: &str = "mocks";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    pub logging: Option<LoggingConfig>,
    #[serde(skip)]
    source_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Listen address. Falls back to the port in `mockServer.config.json`, then 8080.
    pub listen: Option<SocketAddr>,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    /// Pins the served scenario for this process instead of reading `mockServer.config.json`.
    pub active_scenario: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            active_scenario: None,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct MatchingConfig {
    /// Header names dropped from every captured or incoming request/response header map.
    #[serde(default)]
    pub excluded_headers: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORAGE_PATH)
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

impl Config {
    /// Loads the explicit config, else the first of `./mockreplay.toml` and
    /// `$HOME/.mockreplay/config.toml`, else built-in defaults.
    pub fn load(explicit_path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit_path {
            return Self::from_path(path);
        }
        for candidate in discovery_candidates() {
            if candidate.is_file() {
                tracing::debug!(path = %candidate.display(), "discovered config file");
                return Self::from_path(&candidate);
            }
        }
        Ok(Self::default())
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        let mut config = Self::from_toml_str(&toml)
            .with_context(|| format!("load config {}", path.display()))?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn apply_active_scenario_override(&mut self, scenario: Option<&str>) -> anyhow::Result<()> {
        if let Some(scenario) = scenario {
            scenario::validate_scenario_name(scenario)
                .with_context(|| format!("invalid --scenario `{scenario}`"))?;
            self.storage.active_scenario = Some(scenario.to_owned());
        }
        Ok(())
    }

    pub fn listen_addr(&self, pointer_port: Option<u16>) -> SocketAddr {
        self.server.listen.unwrap_or_else(|| {
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                pointer_port.unwrap_or(DEFAULT_PORT),
            )
        })
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.server.max_body_bytes == 0 {
            bail!("`server.max_body_bytes` must be greater than zero");
        }
        if self.storage.path.as_os_str().is_empty() {
            bail!("`storage.path` cannot be empty");
        }
        if let Some(active_scenario) = self.storage.active_scenario.as_deref() {
            scenario::validate_scenario_name(active_scenario)
                .with_context(|| format!("invalid `storage.active_scenario` `{active_scenario}`"))?;
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }
}

fn discovery_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(PROJECT_CONFIG_FILENAME)];
    if let Some(home) = env::var_os("HOME").filter(|home| !home.is_empty()) {
        candidates.push(
            PathBuf::from(home)
                .join(HOME_CONFIG_DIR)
                .join(HOME_CONFIG_FILENAME),
        );
    }
    candidates
}
