//! Command implementations
//!
//! This module contains implementations for all CLI subcommands.

pub mod lifecycle;
pub mod list;
pub mod page;
pub mod shared;
pub mod status;
