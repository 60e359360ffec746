//! Shell-command executor.
//!
//! Runs a configured command line and streams its stdout/stderr line by line
//! as they are produced. Task parameters are handed to the process through
//! environment variables:
//! - `TASK_ID`, `TASK_KIND`, `TASK_SCOPE`
//! - `TASK_OPTIONS` (the options object as JSON)

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::{ExecutionContext, OutputSink, TaskExecutor};
use crate::error::ExecutorError;
use crate::tasks::model::OutputStream;

/// Exit code reported when the process was terminated by a signal.
const SIGNALED_EXIT_CODE: i32 = -1;

/// Longer lines are split into chunks of this size.
const MAX_LINE_BYTES: usize = 16 * 1024;

/// Executes a shell command for a task.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: String,
    working_dir: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    fn build(&self, ctx: &ExecutionContext) -> Command {
        let mut command = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", &self.command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", &self.command]);
            c
        };

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        command
            .env("TASK_ID", ctx.task_id.to_string())
            .env("TASK_KIND", ctx.kind.as_str())
            .env("TASK_SCOPE", ctx.scope.to_string())
            .env("TASK_OPTIONS", ctx.options.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        command
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn run(&self, ctx: ExecutionContext, output: OutputSink) -> Result<(), ExecutorError> {
        let mut child = self
            .build(&ctx)
            .spawn()
            .map_err(|e| ExecutorError::SpawnFailed {
                command: self.command.clone(),
                reason: e.to_string(),
            })?;

        debug!(task_id = %ctx.task_id, command = %self.command, "Spawned task command");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (out, err) = tokio::join!(
            forward_lines(stdout, OutputStream::Stdout, &output),
            forward_lines(stderr, OutputStream::Stderr, &output),
        );

        let status = child.wait().await?;
        out?;
        err?;

        output.exit(status.code().unwrap_or(SIGNALED_EXIT_CODE));
        Ok(())
    }
}

async fn forward_lines<R>(
    reader: Option<R>,
    stream: OutputStream,
    output: &OutputSink,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(());
    };

    // Raw bytes, so output that is not UTF-8 still arrives (lossily)
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            return Ok(());
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        output.line(stream, String::from_utf8_lossy(&buf).into_owned());
    }
}
