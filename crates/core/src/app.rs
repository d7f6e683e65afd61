//! App plugin contract
//!
//! An app is registered with the host under a unique key and driven through
//! its lifecycle:
//!
//! ```text
//! Uninstalled -> Installing -> Installed -> Starting -> Running
//!                                  ^                       |
//!                                  +------- close ---------+
//! Installed -> uninstall -> Uninstalled
//! ```
//!
//! The host renders the app's pages, validates submitted values against them,
//! and calls the matching hook with an [`AppContext`]. The context is the
//! app's only view of the host: the configuration record, the event sink, the
//! command runner and the `app_installed`/`app_started` callbacks.

use crate::assets::{self, LinkReport};
use crate::config::{AppConfig, InstallLocation};
use crate::errors::{Result, StateError};
use crate::events::{EventSink, LifecycleEvent};
use crate::exec::{CommandRunner, CommandSpec, DaemonHandle, ExecEnv};
use crate::page::{FormValues, Page};
use crate::process;
use crate::readiness::ReadinessProbe;
use crate::settings::Settings;
use crate::state::RunRecord;
use async_trait::async_trait;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Time a daemon group gets to exit after SIGTERM before SIGKILL
pub const STOP_GRACE: Duration = Duration::from_secs(10);

/// Receives lifecycle callbacks and owns run bookkeeping
///
/// The CLI host persists the configuration record and run record; tests use
/// in-memory implementations.
pub trait HostNotifier: Send + Sync {
    /// Installation finished; `config` carries `installed_at`
    fn app_installed(&self, config: &AppConfig) -> Result<()>;

    /// The service is up and accepting connections
    fn app_started(&self, config: &AppConfig, record: &RunRecord) -> Result<()>;

    /// The recorded daemon for `key`, if any
    fn run_record(&self, key: &str) -> Result<Option<RunRecord>>;

    /// The recorded daemon for `key` is gone
    fn app_stopped(&self, key: &str) -> Result<()>;
}

/// An installable, startable app
#[async_trait]
pub trait App: Send + Sync {
    /// Unique identifier, also the install directory name
    fn key(&self) -> &str;

    fn name(&self) -> &str;

    /// Port the service listens on
    fn port(&self) -> u16;

    /// Port reserved for the app's management endpoint
    fn op_port(&self) -> u16;

    /// Installation form
    ///
    /// Must contain the install-location chooser, an install button listing its
    /// inputs in order, and a log area. Has no side effects.
    fn render_installation_page(&self, cfg: Option<&AppConfig>) -> Page;

    /// Install the app from the submitted installation form
    ///
    /// Calls `ctx.app_installed()` once every step has succeeded; a failed step
    /// aborts the install without calling it.
    async fn installation(&self, ctx: &mut AppContext<'_>, form: &FormValues) -> Result<()>;

    /// Start form with runtime options, a start button and a log area
    fn render_start_page(&self, cfg: &AppConfig, settings: &Settings) -> Page;

    /// Launch the service and call `ctx.app_started()` once it is reachable
    async fn start(&self, ctx: &mut AppContext<'_>, form: &FormValues) -> Result<()>;

    /// Stop the recorded daemon group
    ///
    /// Returns whether anything was running. Closing a stopped app is a no-op.
    async fn close(&self, ctx: &mut AppContext<'_>) -> Result<bool> {
        ctx.stop_daemon().await
    }

    /// Close, then delete the install root
    async fn uninstall(&self, ctx: &mut AppContext<'_>) -> Result<()> {
        self.close(ctx).await?;
        ctx.remove_install_root()
    }
}

/// Host services available to a running hook
pub struct AppContext<'a> {
    key: String,
    port: u16,
    config: AppConfig,
    settings: &'a Settings,
    runner: &'a dyn CommandRunner,
    events: &'a mut dyn EventSink,
    notifier: &'a dyn HostNotifier,
    env: ExecEnv,
    installed: bool,
    started: Option<RunRecord>,
}

impl std::fmt::Debug for AppContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("key", &self.key)
            .field("config", &self.config)
            .field("env", &self.env)
            .finish_non_exhaustive()
    }
}

impl<'a> AppContext<'a> {
    pub fn new(
        app: &dyn App,
        config: AppConfig,
        settings: &'a Settings,
        runner: &'a dyn CommandRunner,
        events: &'a mut dyn EventSink,
        notifier: &'a dyn HostNotifier,
    ) -> Self {
        Self {
            key: app.key().to_string(),
            port: app.port(),
            config,
            settings,
            runner,
            events,
            notifier,
            env: ExecEnv::new(),
            installed: false,
            started: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn into_config(self) -> AppConfig {
        self.config
    }

    pub fn settings(&self) -> &Settings {
        self.settings
    }

    pub fn env(&self) -> &ExecEnv {
        &self.env
    }

    /// Install root of the current configuration record
    pub fn install_root(&self) -> PathBuf {
        self.config.install_root(&self.settings.home)
    }

    /// Record the chosen install location and create its root
    pub fn record_install_location(&mut self, location: InstallLocation) -> Result<PathBuf> {
        self.config.install_location = location;
        let root = self.install_root();
        std::fs::create_dir_all(&root)?;
        debug!("Install root {}", root.display());
        Ok(root)
    }

    /// Record a tool-specific option value in the configuration record
    pub fn record_option(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.config.options.insert(name.into(), value.into());
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.set(key, value);
    }

    pub fn emit(&mut self, event: LifecycleEvent) {
        if let Err(e) = self.events.emit(&event) {
            debug!("Failed to emit lifecycle event: {}", e);
        }
    }

    /// Message for the page log area
    pub fn log(&mut self, level: &str, text: impl Into<String>) {
        self.emit(LifecycleEvent::message(level, text));
    }

    /// Resolve a hook-supplied working directory
    ///
    /// Relative paths are taken from the install root; `None` is the root.
    pub fn resolve_workdir(&self, workdir: Option<&str>) -> PathBuf {
        let root = self.install_root();
        match workdir {
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => root.join(dir),
            None => root,
        }
    }

    /// Run a command to completion in the active environment
    pub async fn execute_command(&mut self, command: &str, workdir: Option<&str>) -> Result<()> {
        let spec = CommandSpec::new(command)
            .with_workdir(self.resolve_workdir(workdir))
            .with_env(self.env.clone());
        self.runner.run(&spec, &mut *self.events).await
    }

    /// Start a command detached; output goes to `<root>/logs/<key>.log`
    pub async fn spawn_daemon(&mut self, command: &str, workdir: Option<&str>) -> Result<DaemonHandle> {
        let log_file = self
            .install_root()
            .join("logs")
            .join(format!("{}.log", self.key));
        let spec = CommandSpec::new(command)
            .with_workdir(self.resolve_workdir(workdir))
            .with_env(self.env.clone())
            .with_log_file(log_file);
        self.runner.spawn_daemon(&spec, &mut *self.events).await
    }

    /// Prefix of a named conda environment
    ///
    /// `base` is the conda root, an absolute path is used as is, and any other
    /// name lives under `<root>/envs`.
    pub fn conda_prefix(&self, env_name: &str) -> PathBuf {
        let root = &self.settings.conda.root;
        if env_name == "base" {
            root.clone()
        } else if Path::new(env_name).is_absolute() {
            PathBuf::from(env_name)
        } else {
            root.join("envs").join(env_name)
        }
    }

    /// Activate a conda environment until the returned guard is dropped
    pub fn conda_activate(&mut self, env_name: &str) -> EnvGuard<'_, 'a> {
        let prefix = self.conda_prefix(env_name);
        let saved = self.env.clone();
        self.env.prepend_path(&prefix.join("bin"));
        self.env.set("CONDA_PREFIX", prefix.display().to_string());
        self.env.set("CONDA_DEFAULT_ENV", env_name);
        self.env.unset("VIRTUAL_ENV");
        self.env.unset("PYTHONHOME");
        debug!("Activated conda environment {}", prefix.display());
        EnvGuard { ctx: self, saved }
    }

    /// Mount a bundle and link it under `dest`; `bare` does nothing
    pub async fn attach_assets(&mut self, bundle: &str, dest: &Path) -> Result<Option<LinkReport>> {
        assets::attach_bundle(
            &self.settings.assets,
            bundle,
            dest,
            self.runner,
            &self.env,
            &mut *self.events,
        )
        .await
    }

    /// Wait for the app's port, stopping the daemon if it never opens
    pub async fn wait_until_ready(&mut self, handle: &DaemonHandle) -> Result<()> {
        let probe = ReadinessProbe::from_settings(&self.settings.readiness, self.port);
        let pid = handle.pid;
        match probe.wait(|| process::is_running(pid)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Service not ready: {}", e);
                self.log("error", format!("{}", e));
                if let Err(stop_err) = process::terminate_group(handle.pgid, STOP_GRACE).await {
                    warn!("Failed to stop daemon group {}: {}", handle.pgid, stop_err);
                }
                Err(e)
            }
        }
    }

    /// Report a completed installation to the host
    pub fn app_installed(&mut self) -> Result<()> {
        if self.installed {
            return Err(StateError::InvalidTransition {
                key: self.key.clone(),
                reason: "installation already reported".to_string(),
            }
            .into());
        }
        self.config.installed_at = Some(chrono::Utc::now());
        self.notifier.app_installed(&self.config)?;
        self.installed = true;
        info!("App {} installed", self.key);
        let event = LifecycleEvent::AppInstalled {
            id: LifecycleEvent::next_id(),
            timestamp: LifecycleEvent::now(),
            app: self.key.clone(),
        };
        self.emit(event);
        Ok(())
    }

    /// Report a running service to the host
    ///
    /// If the host cannot record the start the daemon group is stopped, so no
    /// service runs without a run record pointing at it.
    pub async fn app_started(&mut self, handle: &DaemonHandle) -> Result<()> {
        if self.started.is_some() {
            return Err(StateError::InvalidTransition {
                key: self.key.clone(),
                reason: "start already reported".to_string(),
            }
            .into());
        }
        let record = RunRecord::new(self.key.clone(), self.port, handle);
        if let Err(e) = self.notifier.app_started(&self.config, &record) {
            warn!("Could not record start of {}: {}", self.key, e);
            if let Err(stop_err) = process::terminate_group(handle.pgid, STOP_GRACE).await {
                warn!("Failed to stop daemon group {}: {}", handle.pgid, stop_err);
            }
            return Err(e);
        }
        info!("App {} started on port {}", self.key, self.port);
        let event = LifecycleEvent::AppStarted {
            id: LifecycleEvent::next_id(),
            timestamp: LifecycleEvent::now(),
            app: self.key.clone(),
            port: self.port,
            pid: handle.pid,
        };
        self.started = Some(record);
        self.emit(event);
        Ok(())
    }

    pub fn was_installed(&self) -> bool {
        self.installed
    }

    pub fn started(&self) -> Option<&RunRecord> {
        self.started.as_ref()
    }

    /// Terminate the recorded daemon group and forget it
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn stop_daemon(&mut self) -> Result<bool> {
        let was_running = match self.notifier.run_record(&self.key)? {
            Some(record) => {
                let was_running = process::terminate_group(record.pgid, STOP_GRACE).await?;
                self.notifier.app_stopped(&self.key)?;
                was_running
            }
            None => false,
        };
        let event = LifecycleEvent::AppStopped {
            id: LifecycleEvent::next_id(),
            timestamp: LifecycleEvent::now(),
            app: self.key.clone(),
            was_running,
        };
        self.emit(event);
        Ok(was_running)
    }

    /// Delete the whole install root
    pub fn remove_install_root(&mut self) -> Result<()> {
        let root = self.install_root();
        match std::fs::remove_dir_all(&root) {
            Ok(()) => info!("Removed {}", root.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} already absent", root.display())
            }
            Err(e) => return Err(e.into()),
        }
        let event = LifecycleEvent::AppUninstalled {
            id: LifecycleEvent::next_id(),
            timestamp: LifecycleEvent::now(),
            app: self.key.clone(),
        };
        self.emit(event);
        Ok(())
    }
}

/// Active environment; restores the previous one when dropped
pub struct EnvGuard<'g, 'a> {
    ctx: &'g mut AppContext<'a>,
    saved: ExecEnv,
}

impl<'a> Deref for EnvGuard<'_, 'a> {
    type Target = AppContext<'a>;

    fn deref(&self) -> &Self::Target {
        self.ctx
    }
}

impl<'a> DerefMut for EnvGuard<'_, 'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx
    }
}

impl Drop for EnvGuard<'_, '_> {
    fn drop(&mut self) {
        self.ctx.env = std::mem::take(&mut self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppHubError;
    use crate::events::MemorySink;
    use crate::exec::ShellRunner;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingNotifier {
        installed: Mutex<Vec<AppConfig>>,
        run: Mutex<Option<RunRecord>>,
    }

    impl HostNotifier for RecordingNotifier {
        fn app_installed(&self, config: &AppConfig) -> Result<()> {
            self.installed.lock().unwrap().push(config.clone());
            Ok(())
        }

        fn app_started(&self, _config: &AppConfig, record: &RunRecord) -> Result<()> {
            *self.run.lock().unwrap() = Some(record.clone());
            Ok(())
        }

        fn run_record(&self, _key: &str) -> Result<Option<RunRecord>> {
            Ok(self.run.lock().unwrap().clone())
        }

        fn app_stopped(&self, _key: &str) -> Result<()> {
            *self.run.lock().unwrap() = None;
            Ok(())
        }
    }

    struct UnwritableNotifier;

    impl HostNotifier for UnwritableNotifier {
        fn app_installed(&self, _config: &AppConfig) -> Result<()> {
            Ok(())
        }

        fn app_started(&self, _config: &AppConfig, _record: &RunRecord) -> Result<()> {
            Err(StateError::Persistence {
                message: "state directory is read-only".to_string(),
            }
            .into())
        }

        fn run_record(&self, _key: &str) -> Result<Option<RunRecord>> {
            Ok(None)
        }

        fn app_stopped(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    struct Dummy;

    #[async_trait]
    impl App for Dummy {
        fn key(&self) -> &str {
            "dummy"
        }
        fn name(&self) -> &str {
            "Dummy"
        }
        fn port(&self) -> u16 {
            1
        }
        fn op_port(&self) -> u16 {
            2
        }
        fn render_installation_page(&self, _cfg: Option<&AppConfig>) -> Page {
            let mut page = Page::new("Install Dummy");
            let location = page.install_location(false, None);
            page.installation_button(vec![location]);
            page.log();
            page
        }
        async fn installation(&self, ctx: &mut AppContext<'_>, form: &FormValues) -> Result<()> {
            ctx.record_install_location(form.install_location()?)?;
            ctx.app_installed()
        }
        fn render_start_page(&self, _cfg: &AppConfig, _settings: &Settings) -> Page {
            let mut page = Page::new("Start Dummy");
            page.start_button(Vec::new());
            page.log();
            page
        }
        async fn start(&self, _ctx: &mut AppContext<'_>, _form: &FormValues) -> Result<()> {
            Ok(())
        }
    }

    fn settings(home: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.home = home.to_path_buf();
        settings.state_dir = home.join(".apphub");
        settings.conda.root = PathBuf::from("/opt/conda");
        settings
    }

    #[tokio::test]
    async fn test_conda_guard_restores_environment() {
        let home = TempDir::new().unwrap();
        let settings = settings(home.path());
        let runner = ShellRunner::new();
        let mut sink = MemorySink::new();
        let notifier = RecordingNotifier::default();
        let cfg = AppConfig::new("dummy", InstallLocation::Local);
        let mut ctx = AppContext::new(&Dummy, cfg, &settings, &runner, &mut sink, &notifier);
        ctx.set_env("PIP_CACHE_DIR", "/tmp/pip");
        let before = ctx.env().clone();

        {
            let guard = ctx.conda_activate("base");
            assert_eq!(guard.env().get("CONDA_PREFIX").as_deref(), Some("/opt/conda"));
            assert!(guard
                .env()
                .get("PATH")
                .unwrap()
                .starts_with("/opt/conda/bin"));
            assert_eq!(guard.env().get("VIRTUAL_ENV"), None);
        }
        assert_eq!(ctx.env(), &before);
    }

    #[tokio::test]
    async fn test_conda_guard_restores_after_failed_command() {
        let home = TempDir::new().unwrap();
        let settings = settings(home.path());
        let runner = ShellRunner::new();
        let mut sink = MemorySink::new();
        let notifier = RecordingNotifier::default();
        let cfg = AppConfig::new("dummy", InstallLocation::Local);
        let mut ctx = AppContext::new(&Dummy, cfg, &settings, &runner, &mut sink, &notifier);
        ctx.record_install_location(InstallLocation::Local).unwrap();

        async fn failing(ctx: &mut AppContext<'_>) -> Result<()> {
            let mut env = ctx.conda_activate("tools");
            env.execute_command("exit 1", None).await?;
            Ok(())
        }
        assert!(failing(&mut ctx).await.is_err());
        assert!(ctx.env().overrides().next().is_none());
    }

    #[test]
    fn test_conda_prefix_resolution() {
        let home = TempDir::new().unwrap();
        let settings = settings(home.path());
        let runner = ShellRunner::new();
        let mut sink = MemorySink::new();
        let notifier = RecordingNotifier::default();
        let cfg = AppConfig::new("dummy", InstallLocation::Local);
        let ctx = AppContext::new(&Dummy, cfg, &settings, &runner, &mut sink, &notifier);

        assert_eq!(ctx.conda_prefix("base"), PathBuf::from("/opt/conda"));
        assert_eq!(ctx.conda_prefix("py310"), PathBuf::from("/opt/conda/envs/py310"));
        assert_eq!(ctx.conda_prefix("/data/env"), PathBuf::from("/data/env"));
    }

    #[tokio::test]
    async fn test_app_installed_reported_once() {
        let home = TempDir::new().unwrap();
        let settings = settings(home.path());
        let runner = ShellRunner::new();
        let mut sink = MemorySink::new();
        let notifier = RecordingNotifier::default();
        let cfg = AppConfig::new("dummy", InstallLocation::Local);
        let mut ctx = AppContext::new(&Dummy, cfg, &settings, &runner, &mut sink, &notifier);

        let page = Dummy.render_installation_page(None);
        let form = page.collect(&Default::default()).unwrap();
        Dummy.installation(&mut ctx, &form).await.unwrap();
        assert!(ctx.was_installed());
        assert!(ctx.app_installed().is_err());
        assert!(home.path().join("apps").join("dummy").is_dir());

        let installed = notifier.installed.lock().unwrap();
        assert_eq!(installed.len(), 1);
        assert!(installed[0].installed_at.is_some());
    }

    #[tokio::test]
    async fn test_close_without_start_is_noop() {
        let home = TempDir::new().unwrap();
        let settings = settings(home.path());
        let runner = ShellRunner::new();
        let mut sink = MemorySink::new();
        let notifier = RecordingNotifier::default();
        let cfg = AppConfig::new("dummy", InstallLocation::Local);
        let mut ctx = AppContext::new(&Dummy, cfg, &settings, &runner, &mut sink, &notifier);

        assert!(!Dummy.close(&mut ctx).await.unwrap());
        assert!(!Dummy.close(&mut ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_uninstall_removes_root() {
        let home = TempDir::new().unwrap();
        let settings = settings(home.path());
        let runner = ShellRunner::new();
        let mut sink = MemorySink::new();
        let notifier = RecordingNotifier::default();
        let cfg = AppConfig::new("dummy", InstallLocation::Work);
        let mut ctx = AppContext::new(&Dummy, cfg, &settings, &runner, &mut sink, &notifier);
        let root = ctx.record_install_location(InstallLocation::Work).unwrap();
        std::fs::write(root.join("file"), b"x").unwrap();

        Dummy.uninstall(&mut ctx).await.unwrap();
        assert!(!root.exists());
        assert!(home.path().join("work").join("apps").exists());
    }

    #[tokio::test]
    async fn test_unrecorded_start_stops_daemon() {
        let home = TempDir::new().unwrap();
        let settings = settings(home.path());
        let runner = ShellRunner::new();
        let mut sink = MemorySink::new();
        let notifier = UnwritableNotifier;
        let cfg = AppConfig::new("dummy", InstallLocation::Local);
        let mut ctx = AppContext::new(&Dummy, cfg, &settings, &runner, &mut sink, &notifier);
        ctx.record_install_location(InstallLocation::Local).unwrap();

        let handle = ctx.spawn_daemon("sleep 30", None).await.unwrap();
        assert!(process::is_running(handle.pid));

        let err = ctx.app_started(&handle).await.unwrap_err();
        assert!(matches!(err, AppHubError::State(StateError::Persistence { .. })));
        assert!(ctx.started().is_none());
        assert!(!process::is_running(handle.pid));
    }

    #[tokio::test]
    async fn test_relative_workdir_resolves_under_root() {
        let home = TempDir::new().unwrap();
        let settings = settings(home.path());
        let runner = ShellRunner::new();
        let mut sink = MemorySink::new();
        let notifier = RecordingNotifier::default();
        let cfg = AppConfig::new("dummy", InstallLocation::Local);
        let ctx = AppContext::new(&Dummy, cfg, &settings, &runner, &mut sink, &notifier);
        assert_eq!(
            ctx.resolve_workdir(Some("ComfyUI")),
            home.path().join("apps").join("dummy").join("ComfyUI")
        );
        assert_eq!(ctx.resolve_workdir(None), home.path().join("apps").join("dummy"));
    }
}
