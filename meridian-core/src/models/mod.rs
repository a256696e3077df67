//! Data models for meridian

pub mod configuration;
pub mod event;
pub mod region;
pub mod workflow;

pub use configuration::*;
pub use event::*;
pub use region::*;
pub use workflow::*;
