// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with system dataset manager configuration

use camino::{Utf8Path, Utf8PathBuf};
use dropshot::{ConfigLogging, ConfigLoggingLevel};
use serde::Deserialize;

/// Configuration for the system dataset manager
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Configuration for the manager's log
    #[serde(default = "default_log")]
    pub log: ConfigLogging,

    /// Where the system dataset and its helpers are mounted.
    #[serde(default)]
    pub paths: MountConfig,

    /// JSON file holding the persisted system dataset record.
    pub ledger: Utf8PathBuf,

    /// Directory for transient runtime flags shared with other services.
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: Utf8PathBuf,

    /// Name of the boot pool, used whenever no data pool hosts the dataset.
    #[serde(default = "default_boot_pool")]
    pub boot_pool: String,

    /// Whether this system is licensed as one half of a failover pair.
    #[serde(default)]
    pub failover_licensed: bool,

    /// Unit checked to decide whether a directory service is enabled.
    #[serde(default = "default_directory_service")]
    pub directory_service: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MountConfig {
    /// The stable path at which the system dataset is always mounted.
    pub system: Utf8PathBuf,
    /// Where the destination pool is staged while a migration copies data.
    pub scratch: Utf8PathBuf,
    /// The path bind-mounted onto the dataset's `cores` child.
    pub coredump: Utf8PathBuf,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            system: Utf8PathBuf::from("/var/db/system"),
            scratch: Utf8PathBuf::from("/tmp/system.new"),
            coredump: Utf8PathBuf::from("/var/lib/systemd/coredump"),
        }
    }
}

fn default_log() -> ConfigLogging {
    ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Info }
}

fn default_runtime_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("/run/sysdataset")
}

fn default_boot_pool() -> String {
    "boot-pool".to_string()
}

fn default_directory_service() -> String {
    "winbind".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

impl Config {
    pub fn from_file<P: AsRef<Utf8Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        Ok(config)
    }
}
