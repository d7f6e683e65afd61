//! Logging setup
//!
//! `tracing` output always goes to stderr; stdout carries pages, status and the
//! lifecycle event stream. The CLI picks a format and a level. When set,
//! `APPHUB_LOG` (then `RUST_LOG`) replaces the level-derived filter, and
//! `APPHUB_LOG_FORMAT` supplies the format if the CLI did not.

use anyhow::Result;
use std::io;
use std::str::FromStr;
use std::sync::Once;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    /// `json` selects JSON lines; anything else is text
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(if s.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        })
    }
}

/// What the CLI asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// `None` defers to `APPHUB_LOG_FORMAT`, then text
    pub format: Option<LogFormat>,
    /// Level applied to the apphub crates (`error` .. `trace`)
    pub level: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            format: None,
            level: "info".to_string(),
        }
    }
}

/// Resolved filter directive
#[derive(Debug, Clone, PartialEq, Eq)]
struct FilterChoice {
    directive: String,
    /// Environment override that did not parse and was ignored
    rejected: Option<String>,
}

fn filter_choice(level: &str, apphub_log: Option<String>, rust_log: Option<String>) -> FilterChoice {
    let from_level = format!("apphub={level},apphub_core={level}");
    let env_override = apphub_log
        .filter(|s| !s.trim().is_empty())
        .or_else(|| rust_log.filter(|s| !s.trim().is_empty()));
    match env_override {
        Some(raw) if EnvFilter::try_new(&raw).is_ok() => FilterChoice {
            directive: raw,
            rejected: None,
        },
        Some(raw) => FilterChoice {
            directive: from_level,
            rejected: Some(raw),
        },
        None => FilterChoice {
            directive: from_level,
            rejected: None,
        },
    }
}

fn resolve_format(explicit: Option<LogFormat>, env_format: Option<&str>) -> LogFormat {
    explicit
        .or_else(|| env_format.and_then(|s| s.parse().ok()))
        .unwrap_or_default()
}

/// Span lifecycle events to print
///
/// `APPHUB_LOG_SPAN_EVENTS` takes `new`, `close`, `enter`, `exit`, `active` or
/// `full`, separated by `,` or `|`. Without it JSON logs record span open and
/// close, text logs none.
fn span_events(format: LogFormat, env_value: Option<&str>) -> FmtSpan {
    let Some(raw) = env_value else {
        return match format {
            LogFormat::Json => FmtSpan::NEW | FmtSpan::CLOSE,
            LogFormat::Text => FmtSpan::NONE,
        };
    };
    raw.split([',', '|'])
        .map(|token| match token.trim().to_ascii_lowercase().as_str() {
            "new" => FmtSpan::NEW,
            "close" => FmtSpan::CLOSE,
            "enter" => FmtSpan::ENTER,
            "exit" => FmtSpan::EXIT,
            "active" => FmtSpan::ACTIVE,
            "full" => FmtSpan::FULL,
            _ => FmtSpan::NONE,
        })
        .fold(FmtSpan::NONE, |acc, span| acc | span)
}

/// Install the global subscriber
///
/// Only the first call in a process has an effect; later calls, or a
/// subscriber installed elsewhere (tests), are not errors.
pub fn init(options: &LogOptions) -> Result<()> {
    INIT.call_once(|| {
        let choice = filter_choice(
            &options.level,
            std::env::var("APPHUB_LOG").ok(),
            std::env::var("RUST_LOG").ok(),
        );
        let format = resolve_format(
            options.format,
            std::env::var("APPHUB_LOG_FORMAT").ok().as_deref(),
        );
        let spans = span_events(format, std::env::var("APPHUB_LOG_SPAN_EVENTS").ok().as_deref());
        let filter = EnvFilter::try_new(&choice.directive).unwrap_or_else(|_| EnvFilter::new("info"));

        let (json, text) = match format {
            LogFormat::Json => (
                Some(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_events(spans)
                        .with_writer(io::stderr),
                ),
                None,
            ),
            LogFormat::Text => (
                None,
                Some(
                    fmt::layer()
                        .with_target(true)
                        .with_span_events(spans)
                        .with_writer(io::stderr),
                ),
            ),
        };

        if tracing_subscriber::registry()
            .with(filter)
            .with(json)
            .with(text)
            .try_init()
            .is_ok()
        {
            tracing::debug!("Logging initialized ({:?}, filter '{}')", format, choice.directive);
        }
        if let Some(rejected) = &choice.rejected {
            tracing::warn!(
                "Ignoring invalid log filter '{}', using '{}'",
                rejected,
                choice.directive
            );
        }
    });

    Ok(())
}

pub fn is_initialized() -> bool {
    INIT.is_completed()
}
