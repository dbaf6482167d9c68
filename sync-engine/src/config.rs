use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::merge::TieBreakPolicy;
use crate::session::Environment;

pub const CONFIG_PATH_VAR: &str = "ALIAS_BRIDGE_CONFIG";

const APP_DIR: &str = "alias-bridge";

/// Daemon configuration. Every field has a default, so an absent or partial
/// file is fine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub environment: Environment,
    pub request_timeout_ms: u64,
    pub tie_break: TieBreakPolicy,
    pub paths: PathsConfig,
    pub remote: RemoteConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            request_timeout_ms: 10_000,
            tie_break: TieBreakPolicy::default(),
            paths: PathsConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_file: PathBuf,
    pub shell_file: PathBuf,
    pub client_id_file: PathBuf,
    pub credential_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home = home_dir();
        Self {
            data_file: home.join(".alias_bridge_data.json"),
            shell_file: home.join(".alias_bridge_aliases.sh"),
            client_id_file: home.join(".alias-bridge-client-id"),
            credential_file: app_config_dir().join("credentials.enc"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteBackend {
    #[default]
    Rest,
    /// In-process store; nothing leaves the machine.
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub backend: RemoteBackend,
    /// Overrides the URL held in the sealed credential.
    pub database_url: Option<String>,
}

impl SyncConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let mut config: SyncConfig =
            toml::from_str(contents).map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        config.paths.expand_home();
        Ok(config)
    }

    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(Error::Config(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        Self::from_toml_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Loads from [`config_path`], falling back to the defaults with a warning
    /// when the file cannot be used.
    pub fn load_or_default() -> Self {
        let path = config_path();
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("config load failed, using defaults: {e}");
                Self::default()
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }
}

impl PathsConfig {
    fn expand_home(&mut self) {
        for path in [
            &mut self.data_file,
            &mut self.shell_file,
            &mut self.client_id_file,
            &mut self.credential_file,
        ] {
            let expanded = path.strip_prefix("~").ok().map(|rest| home_dir().join(rest));
            if let Some(expanded) = expanded {
                *path = expanded;
            }
        }
    }
}

/// `$ALIAS_BRIDGE_CONFIG`, else `<config dir>/alias-bridge/config.toml`.
pub fn config_path() -> PathBuf {
    match std::env::var_os(CONFIG_PATH_VAR) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => app_config_dir().join("config.toml"),
    }
}

fn app_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| home_dir().join(".config"))
        .join(APP_DIR)
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}
