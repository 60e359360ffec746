//! Executor contract: the opaque operations (ingest, verify, recompute,
//! backup) that a task wraps.
//!
//! An executor produces a finite, ordered stream of output lines through an
//! [`OutputSink`], reports an exit code, and then returns. Returning an error
//! means it failed before it could report a clean exit code.

pub mod command;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ExecutorError;
use crate::tasks::model::{OutputStream, TaskId, TaskKind, TaskScope};

pub use command::CommandExecutor;

/// One output signal from an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorOutput {
    Line { stream: OutputStream, line: String },
    Exit(i32),
}

/// Sending half of an executor's output channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct OutputSink {
    tx: mpsc::UnboundedSender<ExecutorOutput>,
}

impl OutputSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExecutorOutput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn line(&self, stream: OutputStream, line: impl Into<String>) {
        // The runner may have stopped listening after finalize
        let _ = self.tx.send(ExecutorOutput::Line {
            stream,
            line: line.into(),
        });
    }

    pub fn stdout(&self, line: impl Into<String>) {
        self.line(OutputStream::Stdout, line);
    }

    pub fn stderr(&self, line: impl Into<String>) {
        self.line(OutputStream::Stderr, line);
    }

    pub fn exit(&self, code: i32) {
        let _ = self.tx.send(ExecutorOutput::Exit(code));
    }
}

/// What the executor is asked to do.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub scope: TaskScope,
    pub options: Value,
}

/// An external task operation.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn run(&self, ctx: ExecutionContext, output: OutputSink) -> Result<(), ExecutorError>;
}

/// Resolves a task kind to its executor.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskKind, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: TaskKind, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(kind, executor);
    }

    pub fn with(mut self, kind: TaskKind, executor: Arc<dyn TaskExecutor>) -> Self {
        self.register(kind, executor);
        self
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(&kind).cloned()
    }

    /// Registered kinds, in a stable order.
    pub fn kinds(&self) -> Vec<TaskKind> {
        TaskKind::ALL
            .into_iter()
            .filter(|kind| self.executors.contains_key(kind))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.executors.len()
    }
}
