//! Core library for apphub
//!
//! This crate contains the app plugin contract, page descriptions, command
//! execution, shared asset mounting, readiness probing, host-side state and
//! lifecycle enforcement, logging, error handling and the built-in apps.

pub mod app;
pub mod apps;
pub mod assets;
pub mod config;
pub mod errors;
pub mod events;
pub mod exec;
pub mod host;
pub mod logging;
pub mod page;
pub mod process;
pub mod readiness;
pub mod registry;
pub mod settings;
pub mod state;

// Re-export IndexMap for use by dependent crates (form values are ordered maps)
pub use indexmap::IndexMap;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
