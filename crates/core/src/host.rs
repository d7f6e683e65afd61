//! Lifecycle host
//!
//! `AppHost` plays the platform side of the plugin contract: it owns the
//! configuration records, validates submitted forms against the app's pages,
//! serializes transitions per app with a lock file and refuses transitions
//! that do not apply to the app's current state.

use crate::app::{App, AppContext, HostNotifier};
use crate::config::{AppConfig, InstallLocation};
use crate::errors::{Result, StateError};
use crate::events::{EventSink, LifecycleEvent};
use crate::exec::{CommandRunner, ShellRunner};
use crate::page::Page;
use crate::registry::AppRegistry;
use crate::settings::Settings;
use crate::state::{RunRecord, StateStore};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Derived lifecycle state of one app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    /// No configuration record
    Uninstalled,
    /// A record exists but installation never completed
    Incomplete,
    /// Installed and not running
    Installed,
    /// Recorded daemon is alive
    Running,
    /// Recorded daemon is gone without having been stopped
    Stale,
}

impl AppState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppState::Uninstalled => "uninstalled",
            AppState::Incomplete => "incomplete",
            AppState::Installed => "installed",
            AppState::Running => "running",
            AppState::Stale => "stale",
        }
    }
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one app as reported by `status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppStatus {
    pub key: String,
    pub name: String,
    pub port: u16,
    pub state: AppState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_location: Option<InstallLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunRecord>,
}

/// `HostNotifier` backed by the state store
#[derive(Debug)]
struct StoreNotifier<'s> {
    store: &'s StateStore,
}

impl HostNotifier for StoreNotifier<'_> {
    fn app_installed(&self, config: &AppConfig) -> Result<()> {
        self.store.save_config(config)
    }

    fn app_started(&self, _config: &AppConfig, record: &RunRecord) -> Result<()> {
        self.store.save_run(record)
    }

    fn run_record(&self, key: &str) -> Result<Option<RunRecord>> {
        self.store.load_run(key)
    }

    fn app_stopped(&self, key: &str) -> Result<()> {
        self.store.remove_run(key).map(|_| ())
    }
}

fn emit(events: &mut dyn EventSink, event: LifecycleEvent) {
    if let Err(e) = events.emit(&event) {
        tracing::debug!("Failed to emit lifecycle event: {}", e);
    }
}

fn hook_begin(events: &mut dyn EventSink, app: &str, hook: &str) -> Instant {
    emit(
        events,
        LifecycleEvent::HookBegin {
            id: LifecycleEvent::next_id(),
            timestamp: LifecycleEvent::now(),
            app: app.to_string(),
            hook: hook.to_string(),
        },
    );
    Instant::now()
}

fn hook_end(events: &mut dyn EventSink, app: &str, hook: &str, started: Instant, success: bool) {
    emit(
        events,
        LifecycleEvent::HookEnd {
            id: LifecycleEvent::next_id(),
            timestamp: LifecycleEvent::now(),
            app: app.to_string(),
            hook: hook.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            success,
        },
    );
}

/// Remove what a failed install left behind so the next attempt starts clean
fn discard_partial_install(root: &std::path::Path) -> Result<()> {
    match std::fs::remove_dir_all(root) {
        Ok(()) => {
            info!("Removed partial install at {}", root.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Drives app lifecycles on this machine
pub struct AppHost {
    settings: Settings,
    registry: AppRegistry,
    store: StateStore,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for AppHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppHost")
            .field("settings", &self.settings)
            .field("registry", &self.registry)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl AppHost {
    /// Host running commands through the local shell
    pub fn new(settings: Settings, registry: AppRegistry) -> Self {
        Self::with_runner(settings, registry, Arc::new(ShellRunner::new()))
    }

    pub fn with_runner(
        settings: Settings,
        registry: AppRegistry,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let store = StateStore::new(settings.state_dir.clone());
        Self {
            settings,
            registry,
            store,
            runner,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &AppRegistry {
        &self.registry
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn app(&self, key: &str) -> Result<Arc<dyn App>> {
        self.registry.get(key)
    }

    /// Current state of `key`
    pub fn status(&self, key: &str) -> Result<AppStatus> {
        let app = self.app(key)?;
        let config = self.store.load_config(key)?;
        let run = self.store.load_run(key)?;
        let state = match (&config, &run) {
            (None, _) => AppState::Uninstalled,
            (Some(cfg), _) if !cfg.is_installed() => AppState::Incomplete,
            (Some(_), None) => AppState::Installed,
            (Some(_), Some(record)) if record.is_alive() => AppState::Running,
            (Some(_), Some(_)) => AppState::Stale,
        };
        Ok(AppStatus {
            key: key.to_string(),
            name: app.name().to_string(),
            port: app.port(),
            state,
            install_location: config.as_ref().map(|c| c.install_location),
            install_root: config.as_ref().map(|c| c.install_root(&self.settings.home)),
            installed_at: config.as_ref().and_then(|c| c.installed_at),
            run,
        })
    }

    /// Installation page for `key`
    pub fn installation_page(&self, key: &str) -> Result<Page> {
        let app = self.app(key)?;
        let config = self.store.load_config(key)?;
        Ok(app.render_installation_page(config.as_ref()))
    }

    /// Start page for `key`; the app must be installed
    pub fn start_page(&self, key: &str) -> Result<Page> {
        let app = self.app(key)?;
        let config = self.installed_config(key)?;
        Ok(app.render_start_page(&config, &self.settings))
    }

    fn installed_config(&self, key: &str) -> Result<AppConfig> {
        match self.store.load_config(key)? {
            Some(cfg) if cfg.is_installed() => Ok(cfg),
            _ => Err(StateError::NotInstalled {
                key: key.to_string(),
            }
            .into()),
        }
    }

    /// Install `key` from submitted installation-page values
    #[instrument(skip(self, submitted, events))]
    pub async fn install(
        &self,
        key: &str,
        submitted: &IndexMap<String, String>,
        events: &mut dyn EventSink,
    ) -> Result<AppConfig> {
        let app = self.app(key)?;
        let _lock = self.store.lock(key)?;

        let existing = self.store.load_config(key)?;
        if existing.as_ref().is_some_and(AppConfig::is_installed) {
            return Err(StateError::AlreadyInstalled {
                key: key.to_string(),
            }
            .into());
        }

        let page = app.render_installation_page(existing.as_ref());
        let form = page.collect(submitted)?;
        let mut config = AppConfig::new(key, form.install_location()?);
        if let Some(incomplete) = existing {
            discard_partial_install(&incomplete.install_root(&self.settings.home))?;
            config.version = incomplete.version;
        }
        self.store.save_config(&config)?;
        info!("Installing {} into {}", key, config.install_root(&self.settings.home).display());

        let started = hook_begin(events, key, "installation");
        let notifier = StoreNotifier { store: &self.store };
        let (result, installed, config) = {
            let mut ctx = AppContext::new(
                app.as_ref(),
                config,
                &self.settings,
                self.runner.as_ref(),
                &mut *events,
                &notifier,
            );
            let result = app.installation(&mut ctx, &form).await;
            let installed = ctx.was_installed();
            (result, installed, ctx.into_config())
        };
        let result = result.and_then(|()| {
            if installed {
                Ok(())
            } else {
                Err(StateError::InvalidTransition {
                    key: key.to_string(),
                    reason: "installation finished without reporting completion".to_string(),
                }
                .into())
            }
        });
        hook_end(events, key, "installation", started, result.is_ok());
        result.map(|()| config)
    }

    /// Start `key` from submitted start-page values
    #[instrument(skip(self, submitted, events))]
    pub async fn start(
        &self,
        key: &str,
        submitted: &IndexMap<String, String>,
        events: &mut dyn EventSink,
    ) -> Result<RunRecord> {
        let app = self.app(key)?;
        let _lock = self.store.lock(key)?;
        let config = self.installed_config(key)?;

        if let Some(record) = self.store.load_run(key)? {
            if record.is_alive() {
                return Err(StateError::AlreadyRunning {
                    key: key.to_string(),
                    pid: record.pid,
                }
                .into());
            }
            warn!("Discarding stale run record for {} (pid {})", key, record.pid);
            self.store.remove_run(key)?;
        }

        let page = app.render_start_page(&config, &self.settings);
        let form = page.collect(submitted)?;

        let started = hook_begin(events, key, "start");
        let notifier = StoreNotifier { store: &self.store };
        let (result, record) = {
            let mut ctx = AppContext::new(
                app.as_ref(),
                config,
                &self.settings,
                self.runner.as_ref(),
                &mut *events,
                &notifier,
            );
            let result = app.start(&mut ctx, &form).await;
            (result, ctx.started().cloned())
        };
        let result = result.and_then(|()| {
            record.ok_or_else(|| {
                StateError::InvalidTransition {
                    key: key.to_string(),
                    reason: "start finished without reporting a running service".to_string(),
                }
                .into()
            })
        });
        hook_end(events, key, "start", started, result.is_ok());
        result
    }

    /// Stop `key`; returns whether a daemon was running
    #[instrument(skip(self, events))]
    pub async fn stop(&self, key: &str, events: &mut dyn EventSink) -> Result<bool> {
        let app = self.app(key)?;
        let _lock = self.store.lock(key)?;
        let Some(config) = self.store.load_config(key)? else {
            return Ok(false);
        };

        let started = hook_begin(events, key, "close");
        let notifier = StoreNotifier { store: &self.store };
        let result = {
            let mut ctx = AppContext::new(
                app.as_ref(),
                config,
                &self.settings,
                self.runner.as_ref(),
                &mut *events,
                &notifier,
            );
            app.close(&mut ctx).await
        };
        hook_end(events, key, "close", started, result.is_ok());
        result
    }

    /// Stop `key`, delete its install root and forget it
    #[instrument(skip(self, events))]
    pub async fn uninstall(&self, key: &str, events: &mut dyn EventSink) -> Result<()> {
        let app = self.app(key)?;
        let _lock = self.store.lock(key)?;
        let Some(config) = self.store.load_config(key)? else {
            return Err(StateError::NotInstalled {
                key: key.to_string(),
            }
            .into());
        };

        let started = hook_begin(events, key, "uninstall");
        let notifier = StoreNotifier { store: &self.store };
        let result = {
            let mut ctx = AppContext::new(
                app.as_ref(),
                config,
                &self.settings,
                self.runner.as_ref(),
                &mut *events,
                &notifier,
            );
            app.uninstall(&mut ctx).await
        };
        let result = result.and_then(|()| {
            self.store.remove_run(key)?;
            self.store.remove_config(key)?;
            Ok(())
        });
        hook_end(events, key, "uninstall", started, result.is_ok());
        result
    }
}
