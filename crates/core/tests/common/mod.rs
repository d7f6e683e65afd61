//! Shared test helpers for core integration tests.

#![allow(dead_code)]

use apphub_core::apps::Comfyui;
use apphub_core::events::{LifecycleEvent, MemorySink};
use apphub_core::exec::mock::MockRunner;
use apphub_core::host::AppHost;
use apphub_core::registry::AppRegistry;
use apphub_core::settings::{AssetBundle, Settings};
use apphub_core::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Isolated home, state directory and asset mount root
pub struct TestEnv {
    pub home: TempDir,
    pub state: TempDir,
    pub mounts: TempDir,
    pub settings: Settings,
}

impl TestEnv {
    pub fn new() -> Self {
        let home = TempDir::new().expect("home dir");
        let state = TempDir::new().expect("state dir");
        let mounts = TempDir::new().expect("mount root");

        let mut settings = Settings::default();
        settings.home = home.path().to_path_buf();
        settings.state_dir = state.path().to_path_buf();
        settings.conda.root = PathBuf::from("/opt/conda");
        settings.readiness.timeout_secs = 1;
        settings.readiness.poll_interval_ms = 20;
        settings.readiness.max_poll_interval_ms = 100;
        settings.assets.mount_root = mounts.path().to_path_buf();
        settings.assets.bundles = vec![AssetBundle {
            name: "sdxl".to_string(),
            label: "Stable Diffusion XL".to_string(),
            address: "10.0.0.12".to_string(),
            export: "/exports/models/sdxl".to_string(),
            options: "ro,nolock".to_string(),
        }];

        Self {
            home,
            state,
            mounts,
            settings,
        }
    }

    /// Host with ComfyUI registered on `port`
    pub fn host(&self, runner: &MockRunner, port: u16) -> AppHost {
        let mut registry = AppRegistry::new();
        registry
            .register(Arc::new(Comfyui::with_ports(port, port.wrapping_add(1))))
            .expect("register comfyui");
        AppHost::with_runner(self.settings.clone(), registry, Arc::new(runner.clone()))
    }

    /// Create `<mount_root>/<bundle>/<category>/<file>` for each entry
    pub fn populate_share(&self, bundle: &str, layout: &[(&str, &[&str])]) -> PathBuf {
        let share = self.mounts.path().join(bundle);
        for (category, files) in layout {
            let dir = share.join(category);
            std::fs::create_dir_all(&dir).expect("category dir");
            for file in *files {
                std::fs::write(dir.join(file), file.as_bytes()).expect("asset file");
            }
        }
        share
    }
}

/// Port nothing listens on
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr").port()
}

/// Listener standing in for a ready service
pub fn open_port() -> (std::net::TcpListener, u16) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    (listener, port)
}

pub fn values(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn installed_events(sink: &MemorySink) -> usize {
    sink.events
        .iter()
        .filter(|e| matches!(e, LifecycleEvent::AppInstalled { .. }))
        .count()
}

pub fn started_events(sink: &MemorySink) -> usize {
    sink.events
        .iter()
        .filter(|e| matches!(e, LifecycleEvent::AppStarted { .. }))
        .count()
}

/// Pids of daemons spawned during the recorded session
pub fn spawned_pids(sink: &MemorySink) -> Vec<u32> {
    sink.events
        .iter()
        .filter_map(|e| match e {
            LifecycleEvent::DaemonSpawned { pid, .. } => Some(*pid),
            _ => None,
        })
        .collect()
}

/// Every path below `dir`, depth first
pub fn walk(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            out.push(path.clone());
            let is_dir = std::fs::symlink_metadata(&path)
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if is_dir {
                out.extend(walk(&path));
            }
        }
    }
    out
}
