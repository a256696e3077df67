//! CLI command handling

pub mod handlers;
pub mod params;
pub mod response_handlers;
pub mod workflow_handlers;
