//! `apphub status`

use anyhow::Result;
use apphub_core::host::AppHost;
use tracing::instrument;

#[instrument(skip(host))]
pub fn execute_status(host: &AppHost, key: &str, json: bool) -> Result<()> {
    let status = host.status(key)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", crate::ui::status::render_detail(&status));
    }
    Ok(())
}
