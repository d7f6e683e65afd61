//! Error types and handling
//!
//! The error taxonomy is structured with specific error enums for each domain
//! (configuration, command execution, startup, state, assets) that are then
//! wrapped in the main `AppHubError` enum for unified error handling.

use thiserror::Error;

/// Configuration-related errors (settings files, config records, form values)
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file parsing error
    #[error("Failed to parse configuration file: {message}")]
    Parsing { message: String },

    /// Configuration validation error
    #[error("Configuration validation error: {message}")]
    Validation { message: String },

    /// A form value did not match any of the choices offered by the control
    #[error("Invalid value '{value}' for '{input}'; expected one of: {}", choices.join(", "))]
    InvalidChoice {
        input: String,
        value: String,
        choices: Vec<String>,
    },

    /// A value required by the page was not supplied
    #[error("Missing value for input '{input}'")]
    MissingInput { input: String },

    /// A value was supplied for an input the page does not declare
    #[error("Unknown input '{input}'")]
    UnknownInput { input: String },

    /// Configuration file I/O error
    #[error("Failed to read configuration file")]
    Io(#[from] std::io::Error),

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: String },
}

/// Shell command execution errors
#[derive(Error, Debug)]
pub enum CommandError {
    /// The command could not be spawned at all
    #[error("Failed to spawn command '{command}': {reason}")]
    Spawn { command: String, reason: String },

    /// The command ran and exited with a non-zero status
    #[error("Command failed with exit code {code}: {command}")]
    Failed { command: String, code: i32 },

    /// The command was terminated by a signal
    #[error("Command terminated by signal: {command}")]
    Signaled { command: String },

    /// Reading the command output failed
    #[error("Failed to read output of '{command}': {reason}")]
    Output { command: String, reason: String },
}

/// Service startup errors
#[derive(Error, Debug)]
pub enum StartupError {
    /// The service did not open its port within the allotted interval
    #[error("Service did not open port {port} within {timeout_secs}s")]
    Timeout { port: u16, timeout_secs: u64 },

    /// The daemon process exited before becoming ready
    #[error("Service process exited before opening port {port}")]
    Exited { port: u16 },
}

/// Lifecycle state errors
#[derive(Error, Debug)]
pub enum StateError {
    /// The app is not installed
    #[error("App '{key}' is not installed")]
    NotInstalled { key: String },

    /// The app is already installed
    #[error("App '{key}' is already installed; uninstall it first")]
    AlreadyInstalled { key: String },

    /// The app is already running
    #[error("App '{key}' is already running (pid {pid})")]
    AlreadyRunning { key: String, pid: u32 },

    /// Another lifecycle transition holds the lock for this app
    #[error("Another operation is in progress for app '{key}' (pid {pid})")]
    Busy { key: String, pid: u32 },

    /// A lifecycle step was requested out of order
    #[error("Invalid transition for app '{key}': {reason}")]
    InvalidTransition { key: String, reason: String },

    /// State file could not be read or written
    #[error("State persistence error: {message}")]
    Persistence { message: String },
}

/// Shared asset mounting errors
#[derive(Error, Debug)]
pub enum AssetError {
    /// The requested bundle is not configured
    #[error("Unknown asset bundle: {name}")]
    UnknownBundle { name: String },

    /// The shared mount point does not exist after mounting
    #[error("Asset mount point not available: {path}")]
    MountMissing { path: String },

    /// Creating a link failed
    #[error("Failed to link {source_path} -> {target}: {reason}")]
    Link {
        source_path: String,
        target: String,
        reason: String,
    },

    /// Filesystem error while walking the share
    #[error("Asset filesystem error")]
    Io(#[from] std::io::Error),
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum AppHubError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Command execution errors
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// Startup errors
    #[error("Startup error: {0}")]
    Startup(#[from] StartupError),

    /// State errors
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Asset errors
    #[error("Asset error: {0}")]
    Asset(#[from] AssetError),

    /// No app is registered under the given key
    #[error("Unknown app: {key}")]
    UnknownApp { key: String },

    /// Filesystem errors outside a more specific domain
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results with AppHubError
pub type Result<T> = std::result::Result<T, AppHubError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::InvalidChoice {
            input: "extension_set".to_string(),
            value: "everything".to_string(),
            choices: vec!["none".to_string(), "manager".to_string()],
        };
        assert_eq!(
            format!("{}", error),
            "Invalid value 'everything' for 'extension_set'; expected one of: none, manager"
        );

        let error = ConfigError::MissingInput {
            input: "install_location".to_string(),
        };
        assert_eq!(
            format!("{}", error),
            "Missing value for input 'install_location'"
        );
    }

    #[test]
    fn test_command_error_display() {
        let error = CommandError::Failed {
            command: "pip install -r requirements.txt".to_string(),
            code: 1,
        };
        assert_eq!(
            format!("{}", error),
            "Command failed with exit code 1: pip install -r requirements.txt"
        );
    }

    #[test]
    fn test_startup_error_display() {
        let error = StartupError::Timeout {
            port: 23810,
            timeout_secs: 120,
        };
        assert_eq!(
            format!("{}", error),
            "Service did not open port 23810 within 120s"
        );
    }

    #[test]
    fn test_apphub_error_from_domain_errors() {
        let err: AppHubError = CommandError::Signaled {
            command: "sleep 1".to_string(),
        }
        .into();
        assert!(matches!(err, AppHubError::Command(_)));

        let err: AppHubError = StateError::NotInstalled {
            key: "comfyui".to_string(),
        }
        .into();
        assert!(matches!(err, AppHubError::State(_)));
        assert!(err.to_string().contains("not installed"));
    }

    #[test]
    fn test_error_source_chain() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err = AppHubError::Asset(AssetError::Io(io_error));
        assert!(err.source().is_some());
        if let Some(source) = err.source() {
            assert!(source.source().is_some());
        }
    }

    #[test]
    fn test_anyhow_conversion() {
        let err = AppHubError::Startup(StartupError::Exited { port: 1 });
        let anyhow_error = anyhow::Error::from(err);
        assert!(anyhow_error.to_string().contains("Startup error"));
    }
}
