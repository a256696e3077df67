//! Workflow orchestration module

pub mod actions;
pub mod engine;
pub mod handle;
pub mod handlers;
pub mod lifecycle;
pub mod orchestrator;
pub mod persistence;
pub mod validator;

pub use actions::*;
pub use engine::*;
pub use handle::*;
pub use handlers::*;
pub use lifecycle::*;
pub use orchestrator::*;
pub use persistence::*;
pub use validator::*;
