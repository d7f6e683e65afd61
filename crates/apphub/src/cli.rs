use anyhow::Result;
use apphub_core::host::AppHost;
use apphub_core::logging::{LogFormat as CoreLogFormat, LogOptions};
use apphub_core::registry::AppRegistry;
use apphub_core::settings::Settings;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Log format options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log level options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    /// Error messages only
    Error,
    /// Warning and error messages
    Warn,
    /// Informational messages and above
    Info,
    /// Debug messages and above
    Debug,
    /// All messages including trace
    Trace,
}

/// Where lifecycle events of install/start/stop/uninstall go on stdout
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum EventsFormat {
    /// One human-readable line per event
    Text,
    /// One JSON object per line
    Json,
    /// Nothing on stdout
    None,
}

/// Which page to render
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum PageKind {
    Install,
    Start,
}

/// apphub subcommands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List registered apps and their state
    List {
        /// Output JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show an app's installation or start page
    Page {
        /// Page to render
        #[arg(value_enum)]
        kind: PageKind,
        /// App key
        key: String,
        /// Output the page description as JSON
        #[arg(long)]
        json: bool,
    },

    /// Install an app with values for its installation page
    Install {
        /// App key
        key: String,
        /// Page input value (format: NAME=VALUE, can be repeated)
        #[arg(long = "input", short = 'i', value_name = "NAME=VALUE")]
        inputs: Vec<String>,
    },

    /// Start an installed app with values for its start page
    Start {
        /// App key
        key: String,
        /// Page input value (format: NAME=VALUE, can be repeated)
        #[arg(long = "input", short = 'i', value_name = "NAME=VALUE")]
        inputs: Vec<String>,
    },

    /// Stop a running app (no-op when it is not running)
    Stop {
        /// App key
        key: String,
    },

    /// Stop an app and delete its installation
    Uninstall {
        /// App key
        key: String,
        /// Confirm deleting the install directory
        #[arg(long)]
        yes: bool,
    },

    /// Show an app's lifecycle state
    Status {
        /// App key
        key: String,
        /// Output JSON
        #[arg(long)]
        json: bool,
    },
}

/// Command-line host for apphub apps
#[derive(Debug, Parser)]
#[command(
    name = "apphub",
    version,
    about = "Install, start and stop workstation apps",
    long_about = "Install, start and stop workstation apps\n\nRenders each app's installation and start pages, collects their values from --input flags and drives the app lifecycle.",
    color = clap::ColorChoice::Auto
)]
pub struct Cli {
    /// Log format (text or json, defaults to text, can be set via APPHUB_LOG_FORMAT env var)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log level
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Settings file path (defaults to APPHUB_CONFIG or the user config directory)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Lifecycle event output on stdout
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub events: EventsFormat,

    /// Also append lifecycle events as JSON lines to this file
    #[arg(long, global = true, value_name = "PATH")]
    pub events_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Logging settings from the global flags
    pub fn log_options(&self) -> LogOptions {
        let format = self.log_format.as_ref().map(|f| match f {
            LogFormat::Text => CoreLogFormat::Text,
            LogFormat::Json => CoreLogFormat::Json,
        });
        let level = match self.log_level {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        LogOptions {
            format,
            level: level.to_string(),
        }
    }

    pub async fn dispatch(self) -> Result<()> {
        let log_options = self.log_options();
        apphub_core::logging::init(&log_options)?;
        tracing::debug!("CLI initialized with log level: {}", log_options.level);

        let Some(command) = self.command else {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            return Ok(());
        };

        let settings = Settings::load(self.config.as_deref())?;
        let host = AppHost::new(settings, AppRegistry::with_builtin());
        let sink_options = crate::commands::shared::SinkOptions {
            format: self.events,
            file: self.events_file,
        };

        match command {
            Commands::List { json } => crate::commands::list::execute_list(&host, json),
            Commands::Page { kind, key, json } => {
                crate::commands::page::execute_page(&host, kind, &key, json)
            }
            Commands::Install { key, inputs } => {
                crate::commands::lifecycle::execute_install(&host, &key, &inputs, &sink_options)
                    .await
            }
            Commands::Start { key, inputs } => {
                crate::commands::lifecycle::execute_start(&host, &key, &inputs, &sink_options)
                    .await
            }
            Commands::Stop { key } => {
                crate::commands::lifecycle::execute_stop(&host, &key, &sink_options).await
            }
            Commands::Uninstall { key, yes } => {
                crate::commands::lifecycle::execute_uninstall(&host, &key, yes, &sink_options)
                    .await
            }
            Commands::Status { key, json } => {
                crate::commands::status::execute_status(&host, &key, json)
            }
        }
    }
}
