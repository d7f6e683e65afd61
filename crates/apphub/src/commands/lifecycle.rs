//! Lifecycle subcommands: install, start, stop and uninstall
//!
//! Each command builds the event sink selected by the global flags and hands
//! the transition to the host. Events go to stdout; logs go to stderr.

use anyhow::{bail, Result};
use apphub_core::host::AppHost;
use tracing::{info, instrument};

use super::shared::{parse_inputs, SinkOptions};

#[instrument(skip(host, inputs, sinks))]
pub async fn execute_install(
    host: &AppHost,
    key: &str,
    inputs: &[String],
    sinks: &SinkOptions,
) -> Result<()> {
    let values = parse_inputs(inputs)?;
    let mut events = sinks.build()?;
    host.install(key, &values, &mut events).await?;
    info!("Installed {}", key);
    Ok(())
}

#[instrument(skip(host, inputs, sinks))]
pub async fn execute_start(
    host: &AppHost,
    key: &str,
    inputs: &[String],
    sinks: &SinkOptions,
) -> Result<()> {
    let values = parse_inputs(inputs)?;
    let mut events = sinks.build()?;
    host.start(key, &values, &mut events).await?;
    info!("Started {}", key);
    Ok(())
}

#[instrument(skip(host, sinks))]
pub async fn execute_stop(host: &AppHost, key: &str, sinks: &SinkOptions) -> Result<()> {
    let mut events = sinks.build()?;
    let was_running = host.stop(key, &mut events).await?;
    info!("Stop {} (was running: {})", key, was_running);
    Ok(())
}

#[instrument(skip(host, sinks))]
pub async fn execute_uninstall(
    host: &AppHost,
    key: &str,
    yes: bool,
    sinks: &SinkOptions,
) -> Result<()> {
    if !yes {
        let root = host
            .status(key)?
            .install_root
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "its install directory".to_string());
        bail!(
            "Refusing to uninstall {} without --yes; this deletes {}",
            key,
            root
        );
    }
    let mut events = sinks.build()?;
    host.uninstall(key, &mut events).await?;
    info!("Uninstalled {}", key);
    Ok(())
}
