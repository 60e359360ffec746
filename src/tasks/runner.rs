//! Task runner — starts executors and turns their output into task events.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use super::model::{EventData, TaskId, TaskKind, TaskOutcome, TaskScope, TaskStatus};
use super::reclaim::Reclaimer;
use super::store::{TaskEntry, TaskStore};
use crate::audit::{AuditEntry, AuditSink};
use crate::error::{ExecutorError, TaskError};
use crate::executor::{ExecutionContext, ExecutorOutput, ExecutorRegistry, OutputSink, TaskExecutor};

/// Creates tasks and drives each one's executor to a single terminal state.
pub struct TaskRunner {
    store: Arc<TaskStore>,
    executors: ExecutorRegistry,
    audit: Arc<dyn AuditSink>,
    reclaimer: Reclaimer,
}

impl TaskRunner {
    pub fn new(
        store: Arc<TaskStore>,
        executors: ExecutorRegistry,
        audit: Arc<dyn AuditSink>,
        reclaimer: Reclaimer,
    ) -> Self {
        Self {
            store,
            executors,
            audit,
            reclaimer,
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Start a task and return its id without waiting for it to finish.
    ///
    /// Request-time problems (unknown task name, bad options, no executor)
    /// are returned here before any record exists. Everything that goes
    /// wrong afterwards ends up in the task's own events.
    pub fn start(
        &self,
        task_name: &str,
        scope: TaskScope,
        options: Value,
        requested_by: &str,
    ) -> Result<TaskId, TaskError> {
        let kind = TaskKind::parse(task_name)?;
        kind.validate_options(&options)?;
        let executor = self
            .executors
            .get(kind)
            .ok_or_else(|| TaskError::NoExecutor(kind.to_string()))?;

        let entry = self
            .store
            .create(kind, scope.clone(), options.clone(), requested_by)?;
        let task_id = entry.id();

        self.audit.record(AuditEntry {
            requester: requested_by.to_string(),
            action: format!("task.start.{kind}"),
            scope: scope.clone(),
            options: options.clone(),
            task_id,
        });

        let ctx = ExecutionContext {
            task_id,
            kind,
            scope,
            options,
        };
        tokio::spawn(drive(entry, executor, ctx, self.reclaimer.clone()));

        Ok(task_id)
    }
}

/// Run one executor to completion. All mutations of this task happen on
/// this future, in the order the executor produced them.
async fn drive(
    entry: Arc<TaskEntry>,
    executor: Arc<dyn TaskExecutor>,
    ctx: ExecutionContext,
    reclaimer: Reclaimer,
) {
    let (sink, mut rx) = OutputSink::channel();
    let mut job = tokio::spawn(async move { executor.run(ctx, sink).await });

    let joined = loop {
        tokio::select! {
            biased;
            Some(output) = rx.recv() => apply(&entry, output, &reclaimer),
            joined = &mut job => {
                while let Ok(output) = rx.try_recv() {
                    apply(&entry, output, &reclaimer);
                }
                break joined;
            }
        }
    };

    finalize(&entry, &outcome_of_return(joined), &reclaimer);
}

fn apply(entry: &TaskEntry, output: ExecutorOutput, reclaimer: &Reclaimer) {
    match output {
        ExecutorOutput::Line { stream, line } => {
            if entry.publish(EventData::Log { stream, line }).is_none() {
                debug!(task_id = %entry.id(), "Dropping output after task end");
            }
        }
        ExecutorOutput::Exit(code) => finalize(entry, &TaskOutcome::Exited(code), reclaimer),
    }
}

/// Outcome implied by the executor returning. A no-op at finalize when it
/// already reported an exit code.
fn outcome_of_return(joined: Result<Result<(), ExecutorError>, JoinError>) -> TaskOutcome {
    let message = match joined {
        Ok(Ok(())) => "executor finished without an exit code".to_string(),
        Ok(Err(e)) => e.to_string(),
        Err(e) if e.is_panic() => "executor panicked".to_string(),
        Err(_) => "executor was aborted".to_string(),
    };
    TaskOutcome::Failed(message)
}

fn finalize(entry: &TaskEntry, outcome: &TaskOutcome, reclaimer: &Reclaimer) {
    let task_id = entry.id();
    match entry.finalize(outcome) {
        Some(TaskStatus::Completed) => {
            info!(task_id = %task_id, "Task completed");
            reclaimer.schedule(task_id);
        }
        Some(status) => {
            let error = outcome.error().unwrap_or_default();
            warn!(task_id = %task_id, status = %status, error = %error, "Task failed");
            reclaimer.schedule(task_id);
        }
        None => {
            debug!(task_id = %task_id, ?outcome, "Ignoring completion signal for finished task");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::tasks::log::Subscription;
    use crate::tasks::model::{OutputStream, TaskEvent};
    use crate::tasks::reclaim::DEFAULT_RECLAIM_GRACE;

    /// Replays a fixed script of outputs, then returns `result`.
    struct Scripted {
        outputs: Vec<ExecutorOutput>,
        result: Result<(), String>,
    }

    #[async_trait]
    impl TaskExecutor for Scripted {
        async fn run(&self, _ctx: ExecutionContext, output: OutputSink) -> Result<(), ExecutorError> {
            for out in &self.outputs {
                match out.clone() {
                    ExecutorOutput::Line { stream, line } => output.line(stream, line),
                    ExecutorOutput::Exit(code) => output.exit(code),
                }
                tokio::task::yield_now().await;
            }
            self.result.clone().map_err(ExecutorError::Failed)
        }
    }

    struct Panics;

    #[async_trait]
    impl TaskExecutor for Panics {
        async fn run(&self, _ctx: ExecutionContext, output: OutputSink) -> Result<(), ExecutorError> {
            output.stdout("about to fail");
            panic!("executor bug");
        }
    }

    #[derive(Default)]
    struct RecordingAudit {
        entries: Mutex<Vec<AuditEntry>>,
    }

    impl AuditSink for RecordingAudit {
        fn record(&self, entry: AuditEntry) {
            self.entries.lock().unwrap().push(entry);
        }
    }

    fn stdout(line: &str) -> ExecutorOutput {
        ExecutorOutput::Line {
            stream: OutputStream::Stdout,
            line: line.into(),
        }
    }

    fn runner_with(kind: TaskKind, executor: Arc<dyn TaskExecutor>) -> (TaskRunner, Arc<RecordingAudit>) {
        let store = TaskStore::new();
        let reclaimer = Reclaimer::spawn(&store, DEFAULT_RECLAIM_GRACE);
        let audit = Arc::new(RecordingAudit::default());
        let runner = TaskRunner::new(
            store,
            ExecutorRegistry::new().with(kind, executor),
            audit.clone(),
            reclaimer,
        );
        (runner, audit)
    }

    async fn drain(mut sub: Subscription) -> Vec<TaskEvent> {
        let mut events = Vec::new();
        while let Some(event) = sub.next().await {
            events.push(event);
        }
        events
    }

    async fn run_to_end(runner: &TaskRunner, id: TaskId) -> Vec<TaskEvent> {
        let entry = runner.store().get(&id).unwrap();
        tokio::time::timeout(Duration::from_secs(5), drain(entry.subscribe()))
            .await
            .expect("task did not finish")
    }

    #[tokio::test]
    async fn backup_completes_with_end_event() {
        let executor = Scripted {
            outputs: vec![stdout("dumping"), ExecutorOutput::Exit(0)],
            result: Ok(()),
        };
        let (runner, audit) = runner_with(TaskKind::BackupMysql, Arc::new(executor));

        let id = runner
            .start(
                "backup-mysql",
                TaskScope::Global,
                json!({"outputPath": "/x.sql.gz"}),
                "admin-1",
            )
            .unwrap();

        let entry = runner.store().get(&id).unwrap();
        assert_eq!(entry.events()[0].kind(), "start");

        let events = run_to_end(&runner, id).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["start", "log", "end"]);
        assert_eq!(
            serde_json::to_value(&events[2].data).unwrap(),
            json!({"kind": "end", "payload": {"status": "completed", "exitCode": 0}})
        );

        let record = entry.record();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.exit_code, Some(0));
        assert!(record.completed_at.is_some());

        let entries = audit.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].requester, "admin-1");
        assert_eq!(entries[0].task_id, id);
        assert_eq!(entries[0].action, "task.start.backup-mysql");
    }

    #[tokio::test]
    async fn rejects_unsupported_task_before_creating_record() {
        let executor = Scripted {
            outputs: vec![],
            result: Ok(()),
        };
        let (runner, audit) = runner_with(TaskKind::Ingest, Arc::new(executor));

        let err = runner
            .start("defragment", TaskScope::Global, json!({}), "admin-1")
            .unwrap_err();
        assert!(matches!(err, TaskError::UnsupportedTask(name) if name == "defragment"));
        assert!(runner.store().is_empty());
        assert!(audit.entries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_missing_executor_and_bad_options() {
        let executor = Scripted {
            outputs: vec![],
            result: Ok(()),
        };
        let (runner, _) = runner_with(TaskKind::Ingest, Arc::new(executor));

        assert!(matches!(
            runner.start("verify", TaskScope::Global, json!({}), "a"),
            Err(TaskError::NoExecutor(_))
        ));
        assert!(matches!(
            runner.start("ingest", TaskScope::Global, json!("x"), "a"),
            Err(TaskError::InvalidOptions { .. })
        ));
        assert!(runner.store().is_empty());
    }

    #[tokio::test]
    async fn non_zero_exit_fails_with_error_event() {
        let executor = Scripted {
            outputs: vec![
                ExecutorOutput::Line {
                    stream: OutputStream::Stderr,
                    line: "checksum mismatch".into(),
                },
                ExecutorOutput::Exit(2),
            ],
            result: Ok(()),
        };
        let (runner, _) = runner_with(TaskKind::Verify, Arc::new(executor));
        let id = runner
            .start("verify", TaskScope::Guild("g1".into()), json!({}), "mod-1")
            .unwrap();

        let events = run_to_end(&runner, id).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["start", "log", "error", "end"]);
        assert_eq!(events[1].payload()["stream"], "stderr");
        assert_eq!(events[2].payload()["message"], "exited with code 2");
        assert_eq!(events[3].payload(), json!({"status": "failed", "exitCode": 2}));

        let record = runner.store().get(&id).unwrap().record();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("exited with code 2"));
    }

    #[tokio::test]
    async fn executor_error_becomes_failed_state() {
        let executor = Scripted {
            outputs: vec![stdout("connecting")],
            result: Err("connection refused".into()),
        };
        let (runner, _) = runner_with(TaskKind::Ingest, Arc::new(executor));
        let id = runner
            .start("ingest", TaskScope::Global, json!({}), "admin-1")
            .unwrap();

        let events = run_to_end(&runner, id).await;
        let last = events.last().unwrap();
        assert_eq!(last.payload(), json!({"status": "failed", "exitCode": null}));
        assert_eq!(events[events.len() - 2].payload()["message"], "connection refused");

        let record = runner.store().get(&id).unwrap().record();
        assert_eq!(record.error.as_deref(), Some("connection refused"));
        assert_eq!(record.exit_code, None);
    }

    #[tokio::test]
    async fn exit_then_error_keeps_first_outcome() {
        let executor = Scripted {
            outputs: vec![ExecutorOutput::Exit(0), stdout("stray line")],
            result: Err("flaky double callback".into()),
        };
        let (runner, _) = runner_with(TaskKind::Recompute, Arc::new(executor));
        let id = runner
            .start("recompute", TaskScope::Global, json!({}), "admin-1")
            .unwrap();

        let events = run_to_end(&runner, id).await;
        // Let the driver observe the executor's return as well.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let entry = runner.store().get(&id).unwrap();
        let all = entry.events();
        assert_eq!(all.len(), events.len());
        assert_eq!(all.iter().filter(|e| e.is_end()).count(), 1);
        assert!(all.iter().all(|e| e.kind() != "error"));
        assert_eq!(entry.status(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn double_exit_publishes_single_end() {
        let executor = Scripted {
            outputs: vec![ExecutorOutput::Exit(1), ExecutorOutput::Exit(0)],
            result: Ok(()),
        };
        let (runner, _) = runner_with(TaskKind::Verify, Arc::new(executor));
        let id = runner
            .start("verify", TaskScope::Global, json!({}), "admin-1")
            .unwrap();

        let events = run_to_end(&runner, id).await;
        assert_eq!(events.iter().filter(|e| e.is_end()).count(), 1);
        assert_eq!(events.last().unwrap().payload()["exitCode"], 1);
    }

    #[tokio::test]
    async fn return_without_exit_code_fails() {
        let executor = Scripted {
            outputs: vec![stdout("done?")],
            result: Ok(()),
        };
        let (runner, _) = runner_with(TaskKind::Ingest, Arc::new(executor));
        let id = runner
            .start("ingest", TaskScope::Global, json!({}), "admin-1")
            .unwrap();

        run_to_end(&runner, id).await;
        let record = runner.store().get(&id).unwrap().record();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(
            record.error.as_deref(),
            Some("executor finished without an exit code")
        );
    }

    #[tokio::test]
    async fn panicking_executor_fails_task() {
        let (runner, _) = runner_with(TaskKind::Ingest, Arc::new(Panics));
        let id = runner
            .start("ingest", TaskScope::Global, json!({}), "admin-1")
            .unwrap();

        let events = run_to_end(&runner, id).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["start", "log", "error", "end"]);
        assert_eq!(events[2].payload()["message"], "executor panicked");
    }

    #[tokio::test]
    async fn ids_are_unique_across_starts() {
        let executor = Scripted {
            outputs: vec![ExecutorOutput::Exit(0)],
            result: Ok(()),
        };
        let (runner, _) = runner_with(TaskKind::Ingest, Arc::new(executor));
        let mut ids = std::collections::HashSet::new();
        for _ in 0..50 {
            ids.insert(
                runner
                    .start("ingest", TaskScope::Global, json!({}), "admin-1")
                    .unwrap(),
            );
        }
        assert_eq!(ids.len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_task_is_reclaimed_after_grace() {
        let executor = Scripted {
            outputs: vec![ExecutorOutput::Exit(0)],
            result: Ok(()),
        };
        let (runner, _) = runner_with(TaskKind::Ingest, Arc::new(executor));
        let id = runner
            .start("ingest", TaskScope::Global, json!({}), "admin-1")
            .unwrap();

        run_to_end(&runner, id).await;
        tokio::time::sleep(DEFAULT_RECLAIM_GRACE - Duration::from_secs(1)).await;
        assert!(runner.store().get(&id).is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(runner.store().get(&id).is_none());
    }
}
