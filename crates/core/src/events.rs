//! Lifecycle event streaming
//!
//! Lifecycle hooks report what they do through an explicit `EventSink` instead
//! of a shared logger. Events are serialized as JSON lines with a `type` tag so
//! a host UI can subscribe to them (the "log area" of a page).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

/// Global event ID counter for deterministic ordering
static EVENT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Output stream a line was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Events emitted while a lifecycle hook runs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum LifecycleEvent {
    #[serde(rename = "hook.begin")]
    HookBegin {
        id: u64,
        timestamp: u64,
        app: String,
        hook: String,
    },
    #[serde(rename = "hook.end")]
    HookEnd {
        id: u64,
        timestamp: u64,
        app: String,
        hook: String,
        duration_ms: u64,
        success: bool,
    },
    #[serde(rename = "command.begin")]
    CommandBegin {
        id: u64,
        timestamp: u64,
        command: String,
        workdir: Option<String>,
        daemon: bool,
    },
    #[serde(rename = "command.output")]
    CommandOutput {
        id: u64,
        timestamp: u64,
        stream: Stream,
        line: String,
    },
    #[serde(rename = "command.end")]
    CommandEnd {
        id: u64,
        timestamp: u64,
        command: String,
        duration_ms: u64,
        exit_code: Option<i32>,
        success: bool,
    },
    #[serde(rename = "daemon.spawned")]
    DaemonSpawned {
        id: u64,
        timestamp: u64,
        command: String,
        pid: u32,
        log_file: Option<String>,
    },
    #[serde(rename = "assets.mounted")]
    AssetsMounted {
        id: u64,
        timestamp: u64,
        bundle: String,
        mount_point: String,
        already_mounted: bool,
    },
    #[serde(rename = "assets.linked")]
    AssetsLinked {
        id: u64,
        timestamp: u64,
        bundle: String,
        linked: usize,
        skipped: usize,
    },
    #[serde(rename = "app.installed")]
    AppInstalled {
        id: u64,
        timestamp: u64,
        app: String,
    },
    #[serde(rename = "app.started")]
    AppStarted {
        id: u64,
        timestamp: u64,
        app: String,
        port: u16,
        pid: u32,
    },
    #[serde(rename = "app.stopped")]
    AppStopped {
        id: u64,
        timestamp: u64,
        app: String,
        was_running: bool,
    },
    #[serde(rename = "app.uninstalled")]
    AppUninstalled {
        id: u64,
        timestamp: u64,
        app: String,
    },
    /// Free-form message for the page log area
    #[serde(rename = "message")]
    Message {
        id: u64,
        timestamp: u64,
        level: String,
        text: String,
    },
}

impl LifecycleEvent {
    pub fn next_id() -> u64 {
        EVENT_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
    }

    /// Milliseconds since the Unix epoch
    pub fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    pub fn message(level: &str, text: impl Into<String>) -> Self {
        LifecycleEvent::Message {
            id: Self::next_id(),
            timestamp: Self::now(),
            level: level.to_string(),
            text: text.into(),
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            LifecycleEvent::HookBegin { id, .. }
            | LifecycleEvent::HookEnd { id, .. }
            | LifecycleEvent::CommandBegin { id, .. }
            | LifecycleEvent::CommandOutput { id, .. }
            | LifecycleEvent::CommandEnd { id, .. }
            | LifecycleEvent::DaemonSpawned { id, .. }
            | LifecycleEvent::AssetsMounted { id, .. }
            | LifecycleEvent::AssetsLinked { id, .. }
            | LifecycleEvent::AppInstalled { id, .. }
            | LifecycleEvent::AppStarted { id, .. }
            | LifecycleEvent::AppStopped { id, .. }
            | LifecycleEvent::AppUninstalled { id, .. }
            | LifecycleEvent::Message { id, .. } => *id,
        }
    }

    /// One-line human-readable rendering for text log areas
    pub fn summary(&self) -> String {
        match self {
            LifecycleEvent::HookBegin { app, hook, .. } => format!("[{}] {} started", app, hook),
            LifecycleEvent::HookEnd {
                app,
                hook,
                duration_ms,
                success,
                ..
            } => format!(
                "[{}] {} {} in {}ms",
                app,
                hook,
                if *success { "finished" } else { "failed" },
                duration_ms
            ),
            LifecycleEvent::CommandBegin {
                command, workdir, ..
            } => match workdir {
                Some(dir) => format!("$ {}  (in {})", command, dir),
                None => format!("$ {}", command),
            },
            LifecycleEvent::CommandOutput { line, .. } => line.clone(),
            LifecycleEvent::CommandEnd {
                exit_code, success, ..
            } => match (success, exit_code) {
                (true, _) => "command succeeded".to_string(),
                (false, Some(code)) => format!("command failed with exit code {}", code),
                (false, None) => "command terminated by signal".to_string(),
            },
            LifecycleEvent::DaemonSpawned { pid, log_file, .. } => match log_file {
                Some(log) => format!("daemon started with pid {} (log: {})", pid, log),
                None => format!("daemon started with pid {}", pid),
            },
            LifecycleEvent::AssetsMounted {
                bundle,
                mount_point,
                already_mounted,
                ..
            } => {
                if *already_mounted {
                    format!("asset bundle {} already mounted at {}", bundle, mount_point)
                } else {
                    format!("mounted asset bundle {} at {}", bundle, mount_point)
                }
            }
            LifecycleEvent::AssetsLinked {
                bundle,
                linked,
                skipped,
                ..
            } => format!(
                "linked {} assets from {} ({} already present)",
                linked, bundle, skipped
            ),
            LifecycleEvent::AppInstalled { app, .. } => format!("{} installed", app),
            LifecycleEvent::AppStarted { app, port, .. } => {
                format!("{} is running on port {}", app, port)
            }
            LifecycleEvent::AppStopped {
                app, was_running, ..
            } => {
                if *was_running {
                    format!("{} stopped", app)
                } else {
                    format!("{} was not running", app)
                }
            }
            LifecycleEvent::AppUninstalled { app, .. } => format!("{} uninstalled", app),
            LifecycleEvent::Message { text, .. } => text.clone(),
        }
    }
}

/// Destination of the lifecycle event stream
pub trait EventSink: Send + Sync + std::fmt::Debug {
    fn emit(&mut self, event: &LifecycleEvent) -> Result<()>;
}

/// Forward events to `tracing`
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&mut self, event: &LifecycleEvent) -> Result<()> {
        match event {
            LifecycleEvent::Message { level, text, .. } if level == "warn" => {
                warn!(target: "apphub::events", "{}", text)
            }
            _ => info!(target: "apphub::events", event_id = event.id(), "{}", event.summary()),
        }
        Ok(())
    }
}

/// JSON lines written to stdout
#[derive(Debug, Default)]
pub struct StdoutSink;

impl EventSink for StdoutSink {
    fn emit(&mut self, event: &LifecycleEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", line)?;
        Ok(())
    }
}

/// Human-readable lines written to stdout
#[derive(Debug, Default)]
pub struct TextSink;

impl EventSink for TextSink {
    fn emit(&mut self, event: &LifecycleEvent) -> Result<()> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", event.summary())?;
        Ok(())
    }
}

/// JSON lines appended to a file
#[derive(Debug)]
pub struct JsonFileSink {
    writer: BufWriter<File>,
}

impl JsonFileSink {
    pub fn new(file_path: &Path) -> Result<Self> {
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl EventSink for JsonFileSink {
    fn emit(&mut self, event: &LifecycleEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Publish events on a channel a host task subscribes to
///
/// A dropped receiver is not an error; the hook keeps running.
#[derive(Debug)]
pub struct ChannelSink {
    sender: UnboundedSender<LifecycleEvent>,
}

impl ChannelSink {
    pub fn new(sender: UnboundedSender<LifecycleEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn emit(&mut self, event: &LifecycleEvent) -> Result<()> {
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

/// Keep events in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    pub events: Vec<LifecycleEvent>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands seen in `command.begin` events, in order
    pub fn commands(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match e {
                LifecycleEvent::CommandBegin { command, .. } => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    /// Output lines captured from foreground commands
    pub fn output_lines(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match e {
                LifecycleEvent::CommandOutput { line, .. } => Some(line.clone()),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&mut self, event: &LifecycleEvent) -> Result<()> {
        self.events.push(event.clone());
        Ok(())
    }
}

/// Fan events out to several sinks
#[derive(Debug, Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for MultiSink {
    /// Every sink sees the event; the first failure is returned afterwards
    fn emit(&mut self, event: &LifecycleEvent) -> Result<()> {
        let mut first_error = None;
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.emit(event) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
