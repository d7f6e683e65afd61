//! `apphub page`

use anyhow::Result;
use apphub_core::host::AppHost;
use tracing::instrument;

use crate::cli::PageKind;

/// Render an app's installation or start page
#[instrument(skip(host))]
pub fn execute_page(host: &AppHost, kind: PageKind, key: &str, json: bool) -> Result<()> {
    let page = match kind {
        PageKind::Install => host.installation_page(key)?,
        PageKind::Start => host.start_page(key)?,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&page)?);
    } else {
        print!("{}", crate::ui::page::render(&page, key));
    }
    Ok(())
}
