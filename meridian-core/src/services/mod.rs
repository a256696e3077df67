//! Cross-cutting services

pub mod logging;
