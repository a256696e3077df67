//! # Meridian Core Library
//!
//! Workflow orchestration for distributed threat response: a guarded state
//! machine, a dependency-aware step executor with compensation, event-driven
//! response patterns, eventually consistent replicated state with leases, and
//! multi-region health, placement and failover.

pub mod context;
pub mod distributed;
pub mod error;
pub mod models;
pub mod node;
pub mod region;
pub mod response;
pub mod server;
pub mod services;
pub mod state_machine;
pub mod workflow;

pub use context::RegionContext;
pub use error::{OrchestrationError, OrchestrationResult};
pub use node::RegionNode;
