//! Host-side persistence
//!
//! Everything the host remembers between invocations lives under the state
//! directory:
//!
//! ```text
//! <state_dir>/apps/<key>.json    configuration record
//! <state_dir>/run/<key>.json     run record of a started daemon
//! <state_dir>/locks/<key>.lock   transition lock, holds the owner's pid
//! ```
//!
//! Records are written atomically through a temp file and rename. A record
//! that cannot be parsed is reported and treated as missing.

use crate::config::AppConfig;
use crate::errors::{Result, StateError};
use crate::exec::DaemonHandle;
use crate::process;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

/// A daemon the host started and is responsible for stopping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub key: String,
    pub pid: u32,
    pub pgid: u32,
    pub port: u16,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(key: impl Into<String>, port: u16, handle: &DaemonHandle) -> Self {
        Self {
            key: key.into(),
            pid: handle.pid,
            pgid: handle.pgid,
            port,
            command: handle.command.clone(),
            log_file: handle.log_file.clone(),
            started_at: Utc::now(),
        }
    }

    pub fn is_alive(&self) -> bool {
        process::is_running(self.pid)
    }
}

fn persistence(e: anyhow::Error) -> crate::errors::AppHubError {
    StateError::Persistence {
        message: format!("{:#}", e),
    }
    .into()
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file: {}", path.display()))?;
    match serde_json::from_str::<T>(&content) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(
                "Failed to parse state file {}: {}. Treating as missing.",
                path.display(),
                e
            );
            Ok(None)
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(value)
        .with_context(|| format!("Failed to serialize state for {}", path.display()))?;

    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, &content)
        .with_context(|| format!("Failed to write temp state file: {}", temp_path.display()))?;
    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename temp state file {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;
    debug!("Wrote state file {}", path.display());
    Ok(())
}

fn remove_file(path: &Path) -> anyhow::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to remove state file: {}", path.display())),
    }
}

/// File-backed store for configuration and run records
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_path(&self, key: &str) -> PathBuf {
        self.dir.join("apps").join(format!("{}.json", key))
    }

    pub fn run_path(&self, key: &str) -> PathBuf {
        self.dir.join("run").join(format!("{}.json", key))
    }

    pub fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join("locks").join(format!("{}.lock", key))
    }

    #[instrument(skip(self))]
    pub fn load_config(&self, key: &str) -> Result<Option<AppConfig>> {
        read_json(&self.config_path(key)).map_err(persistence)
    }

    #[instrument(skip_all, fields(key = %config.key))]
    pub fn save_config(&self, config: &AppConfig) -> Result<()> {
        write_json(&self.config_path(&config.key), config).map_err(persistence)
    }

    pub fn remove_config(&self, key: &str) -> Result<bool> {
        remove_file(&self.config_path(key)).map_err(persistence)
    }

    #[instrument(skip(self))]
    pub fn load_run(&self, key: &str) -> Result<Option<RunRecord>> {
        read_json(&self.run_path(key)).map_err(persistence)
    }

    #[instrument(skip_all, fields(key = %record.key, pid = record.pid))]
    pub fn save_run(&self, record: &RunRecord) -> Result<()> {
        write_json(&self.run_path(&record.key), record).map_err(persistence)
    }

    pub fn remove_run(&self, key: &str) -> Result<bool> {
        remove_file(&self.run_path(key)).map_err(persistence)
    }

    /// Take the transition lock for `key`
    ///
    /// Fails with `StateError::Busy` while another live process holds it. A lock
    /// left behind by a dead process is replaced.
    #[instrument(skip(self))]
    pub fn lock(&self, key: &str) -> Result<TransitionLock> {
        let path = self.lock_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory: {}", parent.display()))
                .map_err(persistence)?;
        }

        for _ in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())
                        .with_context(|| format!("Failed to write lock file: {}", path.display()))
                        .map_err(persistence)?;
                    debug!("Acquired transition lock {}", path.display());
                    return Ok(TransitionLock { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let owner = std::fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match owner {
                        Some(pid) if process::is_running(pid) => {
                            return Err(StateError::Busy {
                                key: key.to_string(),
                                pid,
                            }
                            .into());
                        }
                        _ => {
                            warn!("Removing stale transition lock {}", path.display());
                            remove_file(&path).map_err(persistence)?;
                        }
                    }
                }
                Err(e) => {
                    return Err(persistence(anyhow::Error::new(e).context(format!(
                        "Failed to create lock file: {}",
                        path.display()
                    ))))
                }
            }
        }

        Err(StateError::Persistence {
            message: format!("could not acquire lock {}", path.display()),
        }
        .into())
    }

    /// Keys with a stored configuration record, sorted
    pub fn keys(&self) -> Result<Vec<String>> {
        let dir = self.dir.join("apps");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to list {}", dir.display()))
            .map_err(persistence)?;
        let mut keys: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Held for the duration of one lifecycle transition; released on drop
#[derive(Debug)]
pub struct TransitionLock {
    path: PathBuf,
}

impl TransitionLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TransitionLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstallLocation;
    use crate::errors::AppHubError;
    use tempfile::TempDir;

    #[test]
    fn test_config_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.load_config("comfyui").unwrap().is_none());

        let cfg = AppConfig::new("comfyui", InstallLocation::Local).with_option("python_env", "base");
        store.save_config(&cfg).unwrap();
        assert_eq!(store.load_config("comfyui").unwrap(), Some(cfg));
        assert!(!store.config_path("comfyui").with_extension("tmp").exists());
        assert_eq!(store.keys().unwrap(), vec!["comfyui".to_string()]);

        assert!(store.remove_config("comfyui").unwrap());
        assert!(!store.remove_config("comfyui").unwrap());
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn test_corrupted_record_treated_as_missing() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let path = store.run_path("comfyui");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();
        assert!(store.load_run("comfyui").unwrap().is_none());
    }

    #[test]
    fn test_run_record_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let handle = DaemonHandle {
            pid: 4242,
            pgid: 4242,
            command: "python main.py".to_string(),
            log_file: None,
        };
        let record = RunRecord::new("comfyui", 23810, &handle);
        store.save_run(&record).unwrap();
        assert_eq!(store.load_run("comfyui").unwrap(), Some(record));
        assert!(store.remove_run("comfyui").unwrap());
    }

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());

        let lock = store.lock("comfyui").unwrap();
        let err = store.lock("comfyui").unwrap_err();
        assert!(matches!(err, AppHubError::State(StateError::Busy { .. })));
        assert!(store.lock("other").is_ok());

        drop(lock);
        assert!(!store.lock_path("comfyui").exists());
        assert!(store.lock("comfyui").is_ok());
    }

    #[test]
    fn test_stale_lock_is_replaced() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let path = store.lock_path("comfyui");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, (4_194_304 + 17).to_string()).unwrap();

        let lock = store.lock("comfyui").unwrap();
        assert_eq!(
            std::fs::read_to_string(lock.path()).unwrap(),
            std::process::id().to_string()
        );
    }
}
