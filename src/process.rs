//! Command execution helpers shared by `git.rs`, `workspace.rs`, and the
//! agent/judge adapters.
//!
//! Small `CommandExt`/`OutputExt` traits for checking exit codes and
//! treating a "killed by signal" status distinctly from a normal nonzero
//! exit, plus a timeout-racing helper for the agent invocation path,
//! where a run needs to be bounded by a wall-clock timeout and not just
//! by cancellation.

use std::process::{Output, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;

pub trait OutputExt {
    /// The exit code, erroring out if the process was killed by a signal
    /// rather than exiting normally.
    fn code_not_killed(&self) -> Result<i32>;
}

impl OutputExt for Output {
    fn code_not_killed(&self) -> Result<i32> {
        self.status
            .code()
            .ok_or_else(|| anyhow!("process was killed by a signal"))
    }
}

pub trait CommandExt {
    /// Run to completion, treating a nonzero exit as an error that carries
    /// stdout/stderr for diagnosis.
    fn execute(&mut self) -> impl std::future::Future<Output = Result<Output>> + Send;
}

impl CommandExt for Command {
    async fn execute(&mut self) -> Result<Output> {
        let output = self.output().await.context("spawning command")?;
        if !output.status.success() {
            return Err(anyhow!(
                "command failed ({:?}): stderr:\n{}\nstdout:\n{}",
                output.status,
                String::from_utf8_lossy(&output.stderr),
                String::from_utf8_lossy(&output.stdout)
            ));
        }
        Ok(output)
    }
}

/// Outcome of running a command with a bounded wall-clock timeout.
pub enum TimedOutput {
    Completed(Output),
    TimedOut,
}

/// Run `cmd` to completion or until `timeout_dur` elapses, whichever
/// comes first. On timeout, the process tree is killed (tokio's
/// `kill_on_drop` handles the direct child; callers needing process-group
/// semantics should set that up on `cmd` before calling this).
pub async fn execute_with_timeout(
    cmd: &mut Command,
    timeout_dur: Duration,
) -> Result<TimedOutput> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    let mut child = cmd.spawn().context("spawning command")?;
    match timeout(timeout_dur, child.wait_with_output()).await {
        Ok(result) => Ok(TimedOutput::Completed(result.context("waiting for command")?)),
        Err(_) => {
            // `wait_with_output` consumed `child`, so the timed-out branch
            // never gets a handle back to kill explicitly; `kill_on_drop`
            // above is what actually reaps it once this future is dropped.
            Ok(TimedOutput::TimedOut)
        }
    }
}

/// Write `input` to the child's stdin, then collect output, used by the
/// shell-based agent/judge adapters in `agent.rs`/`judge.rs` that feed a
/// prompt over stdin.
pub async fn execute_with_stdin(cmd: &mut Command, input: &[u8]) -> Result<Output> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().context("spawning command")?;
    {
        let mut stdin = child.stdin.take().context("no stdin handle")?;
        stdin.write_all(input).await.context("writing stdin")?;
    }
    let mut stdout = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        out.read_to_end(&mut stdout).await.ok();
    }
    let status = child.wait().await.context("waiting for command")?;
    Ok(Output {
        status,
        stdout,
        stderr: Vec::new(),
    })
}
