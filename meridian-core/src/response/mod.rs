//! Event-driven threat response

pub mod engine;
pub mod pattern;

pub use engine::{ResponseOutcome, ResponseStats, ThreatResponseEngine};
pub use pattern::{FieldPredicate, PatternSet, PredicateOp, ThreatResponsePattern};
