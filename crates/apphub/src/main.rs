use anyhow::Result;
use apphub_core::errors::AppHubError;
use clap::Parser;

mod cli;
mod commands;
mod ui;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let parsed = cli::Cli::parse();

    match parsed.dispatch().await {
        Ok(()) => Ok(()),
        Err(err) => {
            // Unknown app keys are usage errors
            if let Some(AppHubError::UnknownApp { .. }) = err.downcast_ref::<AppHubError>() {
                eprintln!("Error: {}", err);
                std::process::exit(2);
            }
            Err(err)
        }
    }
}
