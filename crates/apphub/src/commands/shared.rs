//! Helpers shared by the lifecycle subcommands

use anyhow::Result;
use apphub_core::errors::ConfigError;
use apphub_core::events::{EventSink, JsonFileSink, MultiSink, StdoutSink, TextSink};
use apphub_core::IndexMap;
use std::path::PathBuf;

use crate::cli::EventsFormat;

/// Where lifecycle events should be written
#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub format: EventsFormat,
    pub file: Option<PathBuf>,
}

impl SinkOptions {
    /// Build the sink the lifecycle hooks report to
    pub fn build(&self) -> Result<MultiSink> {
        let mut sink = MultiSink::new();
        match self.format {
            EventsFormat::Text => sink.push(Box::new(TextSink)),
            EventsFormat::Json => sink.push(Box::new(StdoutSink)),
            EventsFormat::None => {}
        }
        if let Some(path) = &self.file {
            sink.push(Box::new(JsonFileSink::new(path)?) as Box<dyn EventSink>);
        }
        Ok(sink)
    }
}

/// Parse repeated `NAME=VALUE` flags into page input values
///
/// The value may contain `=` and may be empty. A repeated name keeps its last
/// value but its first position.
pub fn parse_inputs(raw: &[String]) -> Result<IndexMap<String, String>> {
    let mut values = IndexMap::new();
    for pair in raw {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next().unwrap_or_default().trim();
        let value = parts.next().ok_or_else(|| ConfigError::Validation {
            message: format!("Invalid input format: '{}'. Expected NAME=VALUE", pair),
        })?;
        if name.is_empty() {
            return Err(ConfigError::Validation {
                message: format!("Empty input name in: '{}'", pair),
            }
            .into());
        }
        values.insert(name.to_string(), value.to_string());
    }
    Ok(values)
}
