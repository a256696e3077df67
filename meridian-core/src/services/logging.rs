//! Logging service

use crate::distributed::ConflictRecord;
use crate::models::{AuditEntry, LogLevel};

/// Initialize logging with the specified level
pub fn init_logging(level: LogLevel) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = match level {
        LogLevel::Error => "meridian_core=error,meridian=error",
        LogLevel::Warn => "meridian_core=warn,meridian=warn",
        LogLevel::Info => "meridian_core=info,meridian=info",
        LogLevel::Debug => "meridian_core=debug,meridian=debug",
        LogLevel::Trace => "meridian_core=trace,meridian=trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()?;

    Ok(())
}

/// Log an audit trail entry
pub fn log_audit_event(entry: &AuditEntry) {
    let workflow_id = entry
        .workflow_id
        .map(|id| id.to_string())
        .unwrap_or_default();
    tracing::info!(
        kind = ?entry.kind,
        workflow_id = %workflow_id,
        region = %entry.region,
        detail = %entry.detail,
        "Audit event"
    );
}

/// Log a resolved merge conflict (always at warn)
pub fn log_merge_conflict(record: &ConflictRecord) {
    tracing::warn!(
        key = %record.key,
        winner = %record.winner,
        loser = %record.loser,
        region = %record.resolved_by,
        "Concurrent write resolved"
    );
}

/// Log a system error
pub fn log_error(error: &str, context: Option<&str>) {
    tracing::error!(
        error = error,
        context = context.unwrap_or(""),
        "System error occurred"
    );
}
