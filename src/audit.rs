//! Audit trail for task starts.

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::tasks::model::{TaskId, TaskScope};

/// One audited action.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub requester: String,
    pub action: String,
    pub scope: TaskScope,
    pub options: Value,
    pub task_id: TaskId,
}

/// Receives audit entries. Called once per successful task start.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Writes audit entries as structured events on the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, entry: AuditEntry) {
        let options = entry.options.to_string();
        info!(
            target: "audit",
            requester = %entry.requester,
            action = %entry.action,
            scope = %entry.scope,
            task_id = %entry.task_id,
            options = %options,
            "Audit"
        );
    }
}
