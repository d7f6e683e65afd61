//! `apphub list`

use anyhow::Result;
use apphub_core::host::{AppHost, AppStatus};
use tracing::{instrument, warn};

/// Print every registered app with its current state
#[instrument(skip(host))]
pub fn execute_list(host: &AppHost, json: bool) -> Result<()> {
    let statuses = host
        .registry()
        .list()
        .iter()
        .map(|app| host.status(app.key()))
        .collect::<apphub_core::errors::Result<Vec<AppStatus>>>()?;

    for key in host.store().keys()? {
        if host.registry().get(&key).is_err() {
            warn!("Configuration record for unregistered app '{}'", key);
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
    } else {
        print!("{}", crate::ui::status::render_table(&statuses));
    }
    Ok(())
}
