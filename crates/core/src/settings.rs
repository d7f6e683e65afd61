//! Host settings
//!
//! Settings describe the workstation the apps are installed on: the home
//! directory holding both install roots, where the host keeps its state, the
//! conda installation used for environment activation, the readiness probe
//! bounds and the NFS shares offering asset bundles.
//!
//! Settings are read from TOML. Lookup order for the file is the explicit path,
//! then `APPHUB_CONFIG`, then `<config dir>/apphub.toml`; a missing default file
//! yields the built-in defaults. `APPHUB_HOME` and `APPHUB_STATE_DIR` override
//! the matching fields after loading.
//!
//! ```toml
//! home = "/root"
//!
//! [conda]
//! root = "/root/miniconda3"
//!
//! [readiness]
//! timeout_secs = 180
//!
//! [[assets.bundles]]
//! name = "sdxl"
//! label = "Stable Diffusion XL"
//! address = "10.0.0.12"
//! export = "/exports/models/sdxl"
//! ```

use crate::errors::{AssetError, ConfigError, Result};
use directories_next::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument};

/// Top-level host settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Home directory containing `work/apps/<key>` and `apps/<key>`
    pub home: PathBuf,
    /// Directory for config records, run records and transition locks
    pub state_dir: PathBuf,
    pub conda: CondaSettings,
    pub readiness: ReadinessSettings,
    pub assets: AssetSettings,
}

/// Conda installation used by `conda_activate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CondaSettings {
    /// Root prefix of the conda installation (the `base` environment)
    pub root: PathBuf,
}

/// Bounds for the post-launch port probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    /// Total time allowed for the service to open its port
    pub timeout_secs: u64,
    /// First delay between connection attempts
    pub poll_interval_ms: u64,
    /// Cap on the delay between connection attempts
    pub max_poll_interval_ms: u64,
    /// Address probed for readiness
    pub probe_host: String,
}

/// Shared asset volume configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetSettings {
    /// Directory under which each bundle gets its own mount point
    pub mount_root: PathBuf,
    /// Bundles offered on the start page
    pub bundles: Vec<AssetBundle>,
}

/// One NFS-exported, read-only asset bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBundle {
    /// Identifier used as the form value and mount directory name
    pub name: String,
    /// Human-readable label shown on the start page
    pub label: String,
    /// NFS server address
    pub address: String,
    /// Exported path on the server
    pub export: String,
    /// Mount options passed with `-o`
    #[serde(default = "default_nfs_options")]
    pub options: String,
}

fn default_nfs_options() -> String {
    "ro,nolock,vers=3,noresvport".to_string()
}

impl AssetBundle {
    /// `address:export` as passed to `mount`
    pub fn remote(&self) -> String {
        format!("{}:{}", self.address, self.export)
    }
}

impl Default for Settings {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/root"));
        Self {
            state_dir: home.join(".apphub"),
            home,
            conda: CondaSettings::default(),
            readiness: ReadinessSettings::default(),
            assets: AssetSettings::default(),
        }
    }
}

impl Default for CondaSettings {
    fn default() -> Self {
        let root = std::env::var_os("CONDA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/root/miniconda3"));
        Self { root }
    }
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            poll_interval_ms: 250,
            max_poll_interval_ms: 2_000,
            probe_host: "127.0.0.1".to_string(),
        }
    }
}

impl Default for AssetSettings {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/mnt/apphub/models"),
            bundles: vec![
                AssetBundle {
                    name: "sd15".to_string(),
                    label: "Stable Diffusion 1.5".to_string(),
                    address: "10.0.0.12".to_string(),
                    export: "/exports/models/sd15".to_string(),
                    options: default_nfs_options(),
                },
                AssetBundle {
                    name: "sdxl".to_string(),
                    label: "Stable Diffusion XL".to_string(),
                    address: "10.0.0.12".to_string(),
                    export: "/exports/models/sdxl".to_string(),
                    options: default_nfs_options(),
                },
            ],
        }
    }
}

impl ReadinessSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }
}

impl AssetSettings {
    /// Look up a bundle by name
    pub fn bundle(&self, name: &str) -> Result<&AssetBundle> {
        self.bundles
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| {
                AssetError::UnknownBundle {
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Local mount point for a bundle
    pub fn mount_point(&self, bundle: &AssetBundle) -> PathBuf {
        self.mount_root.join(&bundle.name)
    }
}

impl Settings {
    /// Load settings following the documented lookup order
    #[instrument]
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os("APPHUB_CONFIG").map(PathBuf::from);
        let mut settings = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound {
                        path: path.display().to_string(),
                    }
                    .into());
                }
                Self::from_file(&path)?
            }
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    debug!("No settings file found, using defaults");
                    Self::default()
                }
            },
        };
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let settings = Self::from_toml_str(&content)?;
        debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Parse settings from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            ConfigError::Parsing {
                message: e.to_string(),
            }
            .into()
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Some(home) = std::env::var_os("APPHUB_HOME") {
            self.home = PathBuf::from(home);
        }
        if let Some(state_dir) = std::env::var_os("APPHUB_STATE_DIR") {
            self.state_dir = PathBuf::from(state_dir);
        }
    }

    /// Reject settings the lifecycle cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.readiness.timeout_secs == 0 && self.readiness.poll_interval_ms == 0 {
            return Err(ConfigError::Validation {
                message: "readiness timeout and poll interval cannot both be zero".to_string(),
            }
            .into());
        }
        let mut seen = std::collections::HashSet::new();
        for bundle in &self.assets.bundles {
            if bundle.name == "bare" || bundle.name.is_empty() || bundle.name.contains('/') {
                return Err(ConfigError::Validation {
                    message: format!("invalid asset bundle name '{}'", bundle.name),
                }
                .into());
            }
            if !seen.insert(bundle.name.as_str()) {
                return Err(ConfigError::Validation {
                    message: format!("duplicate asset bundle '{}'", bundle.name),
                }
                .into());
            }
        }
        Ok(())
    }
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "apphub", "apphub").map(|dirs| dirs.config_dir().join("apphub.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.readiness.timeout(), Duration::from_secs(120));
        assert_eq!(settings.readiness.probe_host, "127.0.0.1");
        assert!(settings.assets.bundle("sdxl").is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let settings = Settings::from_toml_str(
            r#"
home = "/data/home"

[readiness]
timeout_secs = 5

[[assets.bundles]]
name = "flux"
label = "FLUX.1"
address = "192.168.1.2"
export = "/models/flux"
"#,
        )
        .unwrap();
        assert_eq!(settings.home, PathBuf::from("/data/home"));
        assert_eq!(settings.readiness.timeout_secs, 5);
        assert_eq!(settings.readiness.poll_interval_ms, 250);
        assert_eq!(settings.assets.bundles.len(), 1);
        let flux = settings.assets.bundle("flux").unwrap();
        assert_eq!(flux.remote(), "192.168.1.2:/models/flux");
        assert_eq!(flux.options, "ro,nolock,vers=3,noresvport");
        assert_eq!(
            settings.assets.mount_point(flux),
            PathBuf::from("/mnt/apphub/models/flux")
        );
    }

    #[test]
    fn test_parse_error() {
        let err = Settings::from_toml_str("home = [").unwrap_err();
        assert!(err.to_string().contains("Failed to parse configuration file"));
    }

    #[test]
    fn test_unknown_bundle() {
        let settings = Settings::default();
        let err = settings.assets.bundle("nope").unwrap_err();
        assert!(err.to_string().contains("Unknown asset bundle: nope"));
    }

    #[test]
    fn test_bare_bundle_name_rejected() {
        let mut settings = Settings::default();
        settings.assets.bundles[0].name = "bare".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_duplicate_bundle_rejected() {
        let mut settings = Settings::default();
        let dup = settings.assets.bundles[0].clone();
        settings.assets.bundles.push(dup);
        assert!(settings.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_explicit_missing_file() {
        let err = Settings::load(Some(Path::new("/nonexistent/apphub.toml"))).unwrap_err();
        assert!(err.to_string().contains("Configuration file not found"));
    }

    #[test]
    #[serial]
    fn test_load_applies_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apphub.toml");
        std::fs::write(&path, "home = \"/from/file\"\n").unwrap();

        std::env::set_var("APPHUB_HOME", "/from/env");
        std::env::set_var("APPHUB_STATE_DIR", dir.path().join("state"));
        let settings = Settings::load(Some(&path)).unwrap();
        std::env::remove_var("APPHUB_HOME");
        std::env::remove_var("APPHUB_STATE_DIR");

        assert_eq!(settings.home, PathBuf::from("/from/env"));
        assert_eq!(settings.state_dir, dir.path().join("state"));
    }
}
