//! Task data model — ids, kinds, scopes, statuses, and progress events.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::TaskError;

/// Opaque task identifier. Random v4 UUIDs, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| TaskError::InvalidId(s.to_string()))
    }
}

/// The fixed set of supported task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    Ingest,
    Verify,
    Recompute,
    BackupMysql,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::Ingest,
        TaskKind::Verify,
        TaskKind::Recompute,
        TaskKind::BackupMysql,
    ];

    /// Parse a wire name (`ingest`, `verify`, `recompute`, `backup-mysql`).
    pub fn parse(name: &str) -> Result<Self, TaskError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| TaskError::UnsupportedTask(name.to_string()))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Verify => "verify",
            Self::Recompute => "recompute",
            Self::BackupMysql => "backup-mysql",
        }
    }

    /// Upper-snake form used in environment variable names.
    pub fn env_suffix(&self) -> &'static str {
        match self {
            Self::Ingest => "INGEST",
            Self::Verify => "VERIFY",
            Self::Recompute => "RECOMPUTE",
            Self::BackupMysql => "BACKUP_MYSQL",
        }
    }

    /// Check the request body before a task record is created.
    pub fn validate_options(&self, options: &Value) -> Result<(), TaskError> {
        let invalid = |reason: &str| TaskError::InvalidOptions {
            task: self.as_str().to_string(),
            reason: reason.to_string(),
        };

        let map = options
            .as_object()
            .ok_or_else(|| invalid("options must be a JSON object"))?;

        if *self == Self::BackupMysql {
            match map.get("outputPath").and_then(Value::as_str) {
                Some(path) if !path.trim().is_empty() => {}
                _ => return Err(invalid("outputPath is required")),
            }
        }

        Ok(())
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which tenant a task belongs to. Global tasks are serialized as `null`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum TaskScope {
    Global,
    Guild(String),
}

impl TaskScope {
    /// Path segment that selects the global scope.
    pub const GLOBAL_SEGMENT: &'static str = "global";

    /// Normalize a request path segment into a scope.
    pub fn from_segment(segment: &str) -> Result<Self, TaskError> {
        let segment = segment.trim();
        if segment.is_empty() {
            return Err(TaskError::MissingScope);
        }
        if segment.eq_ignore_ascii_case(Self::GLOBAL_SEGMENT) {
            Ok(Self::Global)
        } else {
            Ok(Self::Guild(segment.to_string()))
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Self::Global)
    }
}

impl From<Option<String>> for TaskScope {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(guild) => Self::Guild(guild),
            None => Self::Global,
        }
    }
}

impl From<TaskScope> for Option<String> {
    fn from(value: TaskScope) -> Self {
        match value {
            TaskScope::Global => None,
            TaskScope::Guild(guild) => Some(guild),
        }
    }
}

impl fmt::Display for TaskScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str(Self::GLOBAL_SEGMENT),
            Self::Guild(guild) => f.write_str(guild),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        !self.is_terminal() && target.is_terminal()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Output stream an executor line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// How an execution concluded, as reported to finalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The executor reported an exit code.
    Exited(i32),
    /// The executor failed without a clean exit code.
    Failed(String),
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Exited(0) => TaskStatus::Completed,
            _ => TaskStatus::Failed,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<String> {
        match self {
            Self::Exited(0) => None,
            Self::Exited(code) => Some(format!("exited with code {code}")),
            Self::Failed(message) => Some(message.clone()),
        }
    }
}

/// Kind-specific event content. Serializes as `{"kind": ..., "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum EventData {
    Start {
        task_id: TaskId,
        name: TaskKind,
        scope: TaskScope,
        requested_by: String,
        started_at: DateTime<Utc>,
    },
    Log {
        stream: OutputStream,
        line: String,
    },
    Error {
        message: String,
    },
    End {
        status: TaskStatus,
        exit_code: Option<i32>,
    },
}

impl EventData {
    /// Event name used in stream frames.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Log { .. } => "log",
            Self::Error { .. } => "error",
            Self::End { .. } => "end",
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Self::End { .. })
    }
}

/// One unit of observable progress, ordered within its task by `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub data: EventData,
}

impl TaskEvent {
    pub fn kind(&self) -> &'static str {
        self.data.kind()
    }

    pub fn is_end(&self) -> bool {
        self.data.is_end()
    }

    /// The payload object alone, as written into `data:` lines.
    pub fn payload(&self) -> Value {
        match serde_json::to_value(&self.data) {
            Ok(Value::Object(mut map)) => map.remove("payload").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}

/// Mutable lifecycle state of one task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: TaskKind,
    pub scope: TaskScope,
    pub requested_by: String,
    pub options: Value,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        name: TaskKind,
        scope: TaskScope,
        options: Value,
        requested_by: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name,
            scope,
            requested_by: requested_by.into(),
            options,
            status: TaskStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            exit_code: None,
            error: None,
        }
    }

    /// Apply a terminal outcome. Returns `false` if the task was already
    /// terminal, in which case nothing changes.
    pub fn finish(&mut self, outcome: &TaskOutcome) -> bool {
        let target = outcome.status();
        if !self.status.can_transition_to(target) {
            return false;
        }
        self.status = target;
        self.exit_code = outcome.exit_code();
        self.error = outcome.error();
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn start_event(&self) -> EventData {
        EventData::Start {
            task_id: self.id,
            name: self.name,
            scope: self.scope.clone(),
            requested_by: self.requested_by.clone(),
            started_at: self.started_at,
        }
    }
}

/// Read-only view of a task returned by the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    #[serde(flatten)]
    pub record: TaskRecord,
    pub event_count: usize,
}
