//! App registry
//!
//! Maps app keys to plugin instances. The host reads each app's identity once,
//! at registration, and looks plugins up by key afterwards.

use crate::app::App;
use crate::apps::comfyui::Comfyui;
use crate::errors::{AppHubError, ConfigError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Registry of available apps
#[derive(Default)]
pub struct AppRegistry {
    apps: BTreeMap<String, Arc<dyn App>>,
}

impl std::fmt::Debug for AppRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppRegistry")
            .field("keys", &self.apps.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AppRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in apps
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.apps.insert(
            Comfyui::KEY.to_string(),
            Arc::new(Comfyui::new()) as Arc<dyn App>,
        );
        info!(count = registry.apps.len(), "App registry initialized");
        registry
    }

    /// Register an app; keys and ports must be unique
    pub fn register(&mut self, app: Arc<dyn App>) -> Result<()> {
        let key = app.key().to_string();
        if key.is_empty() || key.contains('/') {
            return Err(ConfigError::Validation {
                message: format!("invalid app key '{}'", key),
            }
            .into());
        }
        if self.apps.contains_key(&key) {
            return Err(ConfigError::Validation {
                message: format!("app '{}' is already registered", key),
            }
            .into());
        }
        if let Some(other) = self
            .apps
            .values()
            .find(|other| other.port() == app.port() || other.op_port() == app.op_port())
        {
            return Err(ConfigError::Validation {
                message: format!("app '{}' reuses a port of app '{}'", key, other.key()),
            }
            .into());
        }
        debug!(key = %key, port = app.port(), "Registered app");
        self.apps.insert(key, app);
        Ok(())
    }

    /// Look up an app by key
    pub fn get(&self, key: &str) -> Result<Arc<dyn App>> {
        self.apps
            .get(key)
            .cloned()
            .ok_or_else(|| AppHubError::UnknownApp {
                key: key.to_string(),
            })
    }

    /// Registered apps, ordered by key
    pub fn list(&self) -> Vec<Arc<dyn App>> {
        self.apps.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}
