//! Shell command execution
//!
//! Lifecycle hooks run shell command lines through a `CommandRunner`. A
//! foreground command is awaited to completion with its output streamed line
//! by line to the event sink; any non-zero exit aborts the caller's sequence.
//! A daemon command is started in its own process group with output sent to a
//! log file, and the caller gets its pid back without waiting.

use crate::errors::{CommandError, Result};
use crate::events::{EventSink, LifecycleEvent, Stream};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, instrument};

/// Environment overrides applied on top of the inherited process environment
///
/// `None` removes the variable for the child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecEnv {
    vars: IndexMap<String, Option<String>>,
}

impl ExecEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), Some(value.into()));
    }

    pub fn unset(&mut self, key: impl Into<String>) {
        self.vars.insert(key.into(), None);
    }

    /// Effective value: the override if present, else the inherited one
    pub fn get(&self, key: &str) -> Option<String> {
        match self.vars.get(key) {
            Some(value) => value.clone(),
            None => std::env::var(key).ok(),
        }
    }

    pub fn overrides(&self) -> impl Iterator<Item = (&String, &Option<String>)> {
        self.vars.iter()
    }

    /// Prepend a directory to `PATH`
    pub fn prepend_path(&mut self, dir: &Path) {
        let current = self.get("PATH").unwrap_or_default();
        let value = if current.is_empty() {
            dir.display().to_string()
        } else {
            format!("{}:{}", dir.display(), current)
        };
        self.set("PATH", value);
    }

    fn apply(&self, command: &mut Command) {
        for (key, value) in &self.vars {
            match value {
                Some(v) => {
                    command.env(key, v);
                }
                None => {
                    command.env_remove(key);
                }
            }
        }
    }
}

/// A shell command line with its execution parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    pub workdir: Option<PathBuf>,
    pub env: ExecEnv,
    /// Daemon output file; only used by `spawn_daemon`
    pub log_file: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            workdir: None,
            env: ExecEnv::new(),
            log_file: None,
        }
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: ExecEnv) -> Self {
        self.env = env;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(&self.command);
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }
        self.env.apply(&mut command);
        command
    }
}

/// A daemon started by `spawn_daemon`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonHandle {
    pub pid: u32,
    /// Process group id; equals `pid` because the daemon leads its own group
    pub pgid: u32,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Executes shell commands on behalf of lifecycle hooks
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion; non-zero exit is an error
    async fn run(&self, spec: &CommandSpec, events: &mut dyn EventSink) -> Result<()>;

    /// Start a command detached in its own process group
    async fn spawn_daemon(
        &self,
        spec: &CommandSpec,
        events: &mut dyn EventSink,
    ) -> Result<DaemonHandle>;
}

/// Runs commands with `sh -c` on the local host
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

fn emit(events: &mut dyn EventSink, event: LifecycleEvent) {
    if let Err(e) = events.emit(&event) {
        debug!("Failed to emit lifecycle event: {}", e);
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    #[instrument(skip(self, spec, events), fields(command = %spec.command))]
    async fn run(&self, spec: &CommandSpec, events: &mut dyn EventSink) -> Result<()> {
        emit(
            events,
            LifecycleEvent::CommandBegin {
                id: LifecycleEvent::next_id(),
                timestamp: LifecycleEvent::now(),
                command: spec.command.clone(),
                workdir: spec.workdir.as_ref().map(|d| d.display().to_string()),
                daemon: false,
            },
        );
        let start_time = Instant::now();

        let mut command = spec.to_command();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| CommandError::Spawn {
            command: spec.command.clone(),
            reason: e.to_string(),
        })?;

        let output_error = |reason: String| CommandError::Output {
            command: spec.command.clone(),
            reason,
        };
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| output_error("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| output_error("stderr not captured".to_string()))?;

        // Both pipes feed one channel so lines reach the sink in arrival order.
        let (tx, mut rx) = mpsc::unbounded_channel::<(Stream, String)>();
        let stdout_tx = tx.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stdout_tx.send((Stream::Stdout, line)).is_err() {
                    break;
                }
            }
        });
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send((Stream::Stderr, line)).is_err() {
                    break;
                }
            }
        });

        while let Some((stream, line)) = rx.recv().await {
            emit(
                events,
                LifecycleEvent::CommandOutput {
                    id: LifecycleEvent::next_id(),
                    timestamp: LifecycleEvent::now(),
                    stream,
                    line,
                },
            );
        }
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        let status = child
            .wait()
            .await
            .map_err(|e| output_error(e.to_string()))?;
        let duration = start_time.elapsed();
        let exit_code = status.code();

        emit(
            events,
            LifecycleEvent::CommandEnd {
                id: LifecycleEvent::next_id(),
                timestamp: LifecycleEvent::now(),
                command: spec.command.clone(),
                duration_ms: duration.as_millis() as u64,
                exit_code,
                success: status.success(),
            },
        );

        match exit_code {
            Some(0) => {
                debug!("Command completed in {:?}", duration);
                Ok(())
            }
            Some(code) => {
                error!("Command failed with exit code {}", code);
                Err(CommandError::Failed {
                    command: spec.command.clone(),
                    code,
                }
                .into())
            }
            None => Err(CommandError::Signaled {
                command: spec.command.clone(),
            }
            .into()),
        }
    }

    #[instrument(skip(self, spec, events), fields(command = %spec.command))]
    async fn spawn_daemon(
        &self,
        spec: &CommandSpec,
        events: &mut dyn EventSink,
    ) -> Result<DaemonHandle> {
        emit(
            events,
            LifecycleEvent::CommandBegin {
                id: LifecycleEvent::next_id(),
                timestamp: LifecycleEvent::now(),
                command: spec.command.clone(),
                workdir: spec.workdir.as_ref().map(|d| d.display().to_string()),
                daemon: true,
            },
        );

        let spawn_error = |reason: String| CommandError::Spawn {
            command: spec.command.clone(),
            reason,
        };

        let mut command = spec.to_command();
        command.stdin(Stdio::null());
        match &spec.log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| spawn_error(e.to_string()))?;
                }
                let log = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| spawn_error(e.to_string()))?;
                let log_err = log.try_clone().map_err(|e| spawn_error(e.to_string()))?;
                command.stdout(Stdio::from(log)).stderr(Stdio::from(log_err));
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        // Own process group so close() can signal the whole tree.
        command.process_group(0);
        command.kill_on_drop(false);

        let child = command.spawn().map_err(|e| spawn_error(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_error("process exited before reporting a pid".to_string()))?;
        // Dropping the handle detaches; the daemon outlives this call.
        drop(child);

        let handle = DaemonHandle {
            pid,
            pgid: pid,
            command: spec.command.clone(),
            log_file: spec.log_file.clone(),
        };
        emit(
            events,
            LifecycleEvent::DaemonSpawned {
                id: LifecycleEvent::next_id(),
                timestamp: LifecycleEvent::now(),
                command: spec.command.clone(),
                pid,
                log_file: spec.log_file.as_ref().map(|p| p.display().to_string()),
            },
        );
        debug!(pid, "Daemon spawned");
        Ok(handle)
    }
}

/// Recording runner for tests that must not touch the real system
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Record of one runner call
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MockCall {
        pub command: String,
        pub workdir: Option<PathBuf>,
        pub env: ExecEnv,
        pub daemon: bool,
    }

    /// Records foreground commands instead of running them
    ///
    /// A foreground command containing `fail_on` exits with code 1. Daemons
    /// are backed by a real `daemon_command` process in its own group so pid
    /// bookkeeping and termination behave as with `ShellRunner`.
    #[derive(Debug, Clone)]
    pub struct MockRunner {
        calls: Arc<Mutex<Vec<MockCall>>>,
        fail_on: Option<String>,
        daemon_command: String,
    }

    impl Default for MockRunner {
        fn default() -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                fail_on: None,
                daemon_command: "sleep 60".to_string(),
            }
        }
    }

    impl MockRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the first foreground command containing `pattern`
        pub fn failing_on(mut self, pattern: impl Into<String>) -> Self {
            self.fail_on = Some(pattern.into());
            self
        }

        /// Command actually started for daemons
        pub fn with_daemon_command(mut self, command: impl Into<String>) -> Self {
            self.daemon_command = command.into();
            self
        }

        pub fn calls(&self) -> Vec<MockCall> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        pub fn commands(&self) -> Vec<String> {
            self.calls().into_iter().map(|c| c.command).collect()
        }

        fn record(&self, spec: &CommandSpec, daemon: bool) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(MockCall {
                    command: spec.command.clone(),
                    workdir: spec.workdir.clone(),
                    env: spec.env.clone(),
                    daemon,
                });
            }
        }
    }

    #[async_trait]
    impl CommandRunner for MockRunner {
        async fn run(&self, spec: &CommandSpec, events: &mut dyn EventSink) -> Result<()> {
            self.record(spec, false);
            emit(
                events,
                LifecycleEvent::CommandBegin {
                    id: LifecycleEvent::next_id(),
                    timestamp: LifecycleEvent::now(),
                    command: spec.command.clone(),
                    workdir: spec.workdir.as_ref().map(|d| d.display().to_string()),
                    daemon: false,
                },
            );
            let failed = self
                .fail_on
                .as_ref()
                .is_some_and(|pattern| spec.command.contains(pattern.as_str()));
            let code = if failed { 1 } else { 0 };
            emit(
                events,
                LifecycleEvent::CommandEnd {
                    id: LifecycleEvent::next_id(),
                    timestamp: LifecycleEvent::now(),
                    command: spec.command.clone(),
                    duration_ms: 0,
                    exit_code: Some(code),
                    success: !failed,
                },
            );
            if failed {
                return Err(CommandError::Failed {
                    command: spec.command.clone(),
                    code,
                }
                .into());
            }
            Ok(())
        }

        async fn spawn_daemon(
            &self,
            spec: &CommandSpec,
            events: &mut dyn EventSink,
        ) -> Result<DaemonHandle> {
            self.record(spec, true);
            let backing = CommandSpec::new(self.daemon_command.clone());
            let handle = ShellRunner::new().spawn_daemon(&backing, events).await?;
            Ok(DaemonHandle {
                command: spec.command.clone(),
                log_file: spec.log_file.clone(),
                ..handle
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;

    #[tokio::test]
    async fn test_run_streams_output() {
        let runner = ShellRunner::new();
        let mut sink = MemorySink::new();
        let spec = CommandSpec::new("echo hello; echo oops 1>&2");
        runner.run(&spec, &mut sink).await.unwrap();

        let lines = sink.output_lines();
        assert!(lines.contains(&"hello".to_string()));
        assert!(lines.contains(&"oops".to_string()));
        assert_eq!(sink.commands(), vec!["echo hello; echo oops 1>&2"]);
    }

    #[tokio::test]
    async fn test_run_reports_exit_code() {
        let runner = ShellRunner::new();
        let mut sink = MemorySink::new();
        let err = runner
            .run(&CommandSpec::new("exit 3"), &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::errors::AppHubError::Command(CommandError::Failed { code: 3, .. })
        ));
        assert!(sink.events.iter().any(|e| matches!(
            e,
            LifecycleEvent::CommandEnd {
                success: false,
                exit_code: Some(3),
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_run_uses_workdir_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ShellRunner::new();
        let mut sink = MemorySink::new();
        let mut env = ExecEnv::new();
        env.set("APPHUB_TEST_VALUE", "42");
        let spec = CommandSpec::new("pwd; echo $APPHUB_TEST_VALUE")
            .with_workdir(dir.path())
            .with_env(env);
        runner.run(&spec, &mut sink).await.unwrap();

        let lines = sink.output_lines();
        let canonical = dir.path().canonicalize().unwrap();
        assert!(lines
            .iter()
            .any(|l| Path::new(l).canonicalize().ok() == Some(canonical.clone())));
        assert!(lines.contains(&"42".to_string()));
    }

    #[tokio::test]
    async fn test_unset_removes_variable() {
        let runner = ShellRunner::new();
        let mut sink = MemorySink::new();
        let mut env = ExecEnv::new();
        env.unset("HOME");
        let spec = CommandSpec::new("echo \"home=${HOME:-unset}\"").with_env(env);
        runner.run(&spec, &mut sink).await.unwrap();
        assert!(sink.output_lines().contains(&"home=unset".to_string()));
    }

    #[tokio::test]
    async fn test_missing_workdir_fails_to_spawn() {
        let runner = ShellRunner::new();
        let mut sink = MemorySink::new();
        let spec = CommandSpec::new("true").with_workdir("/nonexistent/apphub/dir");
        let err = runner.run(&spec, &mut sink).await.unwrap_err();
        assert!(matches!(
            err,
            crate::errors::AppHubError::Command(CommandError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn test_spawn_daemon_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs").join("daemon.log");
        let runner = ShellRunner::new();
        let mut sink = MemorySink::new();
        let spec = CommandSpec::new("echo started; sleep 30").with_log_file(&log);

        let started = Instant::now();
        let handle = runner.spawn_daemon(&spec, &mut sink).await.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(handle.pid, handle.pgid);
        assert!(log.exists());

        crate::process::terminate_group(handle.pgid, std::time::Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[test]
    fn test_prepend_path() {
        let mut env = ExecEnv::new();
        env.set("PATH", "/usr/bin");
        env.prepend_path(Path::new("/opt/conda/bin"));
        assert_eq!(env.get("PATH").unwrap(), "/opt/conda/bin:/usr/bin");
    }
}
