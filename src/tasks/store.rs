//! Task record store: in-memory map from task id to task state.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::log::{EventLog, Subscription};
use super::model::{
    EventData, TaskEvent, TaskId, TaskKind, TaskOutcome, TaskRecord, TaskScope, TaskSnapshot,
    TaskStatus,
};
use crate::error::TaskError;

struct TaskState {
    record: TaskRecord,
    log: EventLog,
}

/// One task's record and event log, guarded together so a status change and
/// the events describing it are observed atomically.
pub struct TaskEntry {
    id: TaskId,
    state: Mutex<TaskState>,
}

impl TaskEntry {
    fn new(record: TaskRecord) -> Self {
        let mut log = EventLog::new();
        log.publish(record.start_event());
        Self {
            id: record.id,
            state: Mutex::new(TaskState { record, log }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn scope(&self) -> TaskScope {
        self.lock().record.scope.clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.lock().record.status
    }

    pub fn record(&self) -> TaskRecord {
        self.lock().record.clone()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.lock();
        TaskSnapshot {
            record: state.record.clone(),
            event_count: state.log.len(),
        }
    }

    /// Retained events in order.
    pub fn events(&self) -> Vec<TaskEvent> {
        self.lock().log.events().cloned().collect()
    }

    /// Replay snapshot plus live handle, taken under the same lock that
    /// `publish` holds, so nothing is duplicated or skipped between them.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (replay, live) = self.subscribe_from(0);
        Subscription::new(Arc::clone(self), replay, live)
    }

    pub(crate) fn subscribe_from(
        &self,
        from_seq: u64,
    ) -> (VecDeque<TaskEvent>, Option<broadcast::Receiver<TaskEvent>>) {
        self.lock().log.subscribe_from(from_seq)
    }

    /// Append a non-terminal event. Returns `None` if the task already ended.
    pub(crate) fn publish(&self, data: EventData) -> Option<TaskEvent> {
        self.lock().log.publish(data)
    }

    /// Move the task to its terminal status and publish `error` (if any) and
    /// `end`. Only the first call has any effect; returns the new status then.
    pub(crate) fn finalize(&self, outcome: &TaskOutcome) -> Option<TaskStatus> {
        let mut state = self.lock();
        if !state.record.finish(outcome) {
            return None;
        }

        let status = state.record.status;
        let exit_code = state.record.exit_code;
        if let Some(message) = state.record.error.clone() {
            state.log.publish(EventData::Error { message });
        }
        state.log.publish(EventData::End { status, exit_code });

        Some(status)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().log.receiver_count()
    }
}

/// In-memory task registry. Created once at startup and shared by handle.
pub struct TaskStore {
    tasks: RwLock<HashMap<TaskId, Arc<TaskEntry>>>,
}

impl TaskStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: RwLock::new(HashMap::new()),
        })
    }

    /// Allocate a fresh id and insert a `running` record whose log already
    /// holds the `start` event.
    pub fn create(
        &self,
        kind: TaskKind,
        scope: TaskScope,
        options: Value,
        requested_by: &str,
    ) -> Result<Arc<TaskEntry>, TaskError> {
        let record = TaskRecord::new(TaskId::new(), kind, scope, options, requested_by);
        let id = record.id;
        let entry = Arc::new(TaskEntry::new(record));

        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        match tasks.entry(id) {
            Entry::Occupied(_) => Err(TaskError::Duplicate(id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&entry));
                info!(task_id = %id, task = %kind, requested_by, "Task created");
                Ok(entry)
            }
        }
    }

    /// Look up a task. Unknown and reclaimed ids both yield `None`.
    pub fn get(&self, id: &TaskId) -> Option<Arc<TaskEntry>> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Remove a task unconditionally. Returns whether it was present.
    pub fn delete(&self, id: &TaskId) -> bool {
        let removed = self
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some();
        if removed {
            debug!(task_id = %id, "Task removed from store");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots of every task currently held.
    pub fn list(&self) -> Vec<TaskSnapshot> {
        let entries: Vec<Arc<TaskEntry>> = self
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        entries.iter().map(|entry| entry.snapshot()).collect()
    }
}
