//! Text rendering for pages and app status

pub mod page;
pub mod status;
