//! App configuration records
//!
//! The configuration record is owned by the host and keyed by app key. It holds
//! the chosen install location, an optional version and the tool-specific
//! option values collected from the installation page. Plugins read it through
//! the `AppContext`; only the host mutates and persists it.

use crate::errors::{ConfigError, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Where an app is installed
///
/// `Work` is backed by the persistent work volume so an installation survives
/// instance teardown; `Local` lives on instance-local storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallLocation {
    Work,
    Local,
}

impl InstallLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallLocation::Work => "work",
            InstallLocation::Local => "local",
        }
    }

    /// Install root for `key` under `home`
    ///
    /// `~/work/apps/<key>` for the work volume, `~/apps/<key>` otherwise.
    pub fn root(&self, home: &Path, key: &str) -> PathBuf {
        match self {
            InstallLocation::Work => home.join("work").join("apps").join(key),
            InstallLocation::Local => home.join("apps").join(key),
        }
    }

    /// Locations a page may offer, work volume first when allowed
    pub fn choices(allow_work: bool) -> Vec<InstallLocation> {
        if allow_work {
            vec![InstallLocation::Work, InstallLocation::Local]
        } else {
            vec![InstallLocation::Local]
        }
    }
}

impl fmt::Display for InstallLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstallLocation {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "work" => Ok(InstallLocation::Work),
            "local" => Ok(InstallLocation::Local),
            other => Err(ConfigError::InvalidChoice {
                input: "install_location".to_string(),
                value: other.to_string(),
                choices: vec!["work".to_string(), "local".to_string()],
            }),
        }
    }
}

/// Host-owned configuration record for one app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// App key this record belongs to
    pub key: String,
    pub install_location: InstallLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Tool-specific option values from the installation page, in page order
    #[serde(default)]
    pub options: IndexMap<String, String>,
    /// Set by the host when the plugin reports a completed installation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,
}

impl AppConfig {
    pub fn new(key: impl Into<String>, install_location: InstallLocation) -> Self {
        Self {
            key: key.into(),
            install_location,
            version: None,
            options: IndexMap::new(),
            installed_at: None,
        }
    }

    /// Absolute install root for this record
    pub fn install_root(&self, home: &Path) -> PathBuf {
        self.install_location.root(home, &self.key)
    }

    pub fn is_installed(&self) -> bool {
        self.installed_at.is_some()
    }

    /// Option value recorded at installation, if any
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            ConfigError::Parsing {
                message: e.to_string(),
            }
            .into()
        })
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| {
            ConfigError::Parsing {
                message: e.to_string(),
            }
            .into()
        })
    }
}
