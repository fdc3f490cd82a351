//! Agent adapter interface (external collaborator) and its test/reference
//! implementations.
//!
//! Real per-vendor agent backends live outside this crate: this module
//! only defines the invoke-with-prompt-produce-artifacts contract and two
//! implementations that exercise it — a `ShellAgent` that shells out to an
//! arbitrary external CLI (a program/args split, same shape as any
//! subprocess-spawning command config), and a `MockAgent` used by the
//! engine's own test suite to simulate success, failure, timeout, and
//! rate-limit scenarios deterministically.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::model::TokenStats;
use crate::process::{execute_with_timeout, TimedOutput};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub exit_code: Option<i32>,
    pub token_stats: TokenStats,
    pub cost_usd: Option<f64>,
    pub started_at: String,
    pub ended_at: String,
    pub error: Option<String>,
}

pub enum AgentOutcome {
    Completed(AgentResult),
    TimedOut,
}

/// Inputs: model id, prompt file path, workspace path, output directory,
/// a merged config dictionary, and a timeout. Outputs are written to the
/// output directory (`stdout.log`, `stderr.log`, `output.txt`,
/// `command_log.json`, `result.json`); the return value additionally
/// carries the same information in-memory for the Run Executor to act on
/// without re-reading the files it just wrote.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    async fn run(
        &self,
        model: &str,
        prompt_path: &Path,
        workspace_path: &Path,
        output_dir: &Path,
        timeout: Duration,
    ) -> Result<AgentOutcome>;
}

/// Shells out to an arbitrary external agent CLI. The CLI is expected to
/// read the prompt file, operate on the workspace, and on success write
/// its final answer to stdout (captured as `output.txt`) along with a
/// `result.json` describing token usage if it produces one itself;
/// otherwise this adapter synthesizes a minimal `result.json` from the
/// observed exit code.
pub struct ShellAgent {
    pub program: PathBuf,
    pub args: Vec<String>,
}

#[async_trait]
impl AgentAdapter for ShellAgent {
    async fn run(
        &self,
        _model: &str,
        prompt_path: &Path,
        workspace_path: &Path,
        output_dir: &Path,
        timeout: Duration,
    ) -> Result<AgentOutcome> {
        std::fs::create_dir_all(output_dir).context("creating agent output dir")?;
        let started_at = now_rfc3339();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(prompt_path)
            .current_dir(workspace_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let outcome = execute_with_timeout(&mut cmd, timeout).await?;
        let ended_at = now_rfc3339();

        match outcome {
            TimedOutput::TimedOut => Ok(AgentOutcome::TimedOut),
            TimedOutput::Completed(output) => {
                std::fs::write(output_dir.join("stdout.log"), &output.stdout)?;
                std::fs::write(output_dir.join("stderr.log"), &output.stderr)?;
                std::fs::write(output_dir.join("output.txt"), &output.stdout)?;
                std::fs::write(output_dir.join("command_log.json"), "[]")?;

                let result = AgentResult {
                    exit_code: output.status.code(),
                    token_stats: TokenStats::default(),
                    cost_usd: None,
                    started_at,
                    ended_at,
                    error: if output.status.success() {
                        None
                    } else {
                        Some(String::from_utf8_lossy(&output.stderr).into_owned())
                    },
                };
                std::fs::write(
                    output_dir.join("result.json"),
                    serde_json::to_string_pretty(&result)?,
                )?;
                write_replay_script(output_dir, &self.program, &self.args, prompt_path)?;
                Ok(AgentOutcome::Completed(result))
            }
        }
    }
}

fn write_replay_script(
    output_dir: &Path,
    program: &Path,
    args: &[String],
    prompt_path: &Path,
) -> Result<()> {
    let mut script = format!("#!/usr/bin/env bash\nset -euo pipefail\n{:?}", program);
    for arg in args {
        script.push_str(&format!(" {:?}", arg));
    }
    script.push_str(&format!(" {:?}\n", prompt_path));
    std::fs::write(output_dir.join("replay.sh"), script).context("writing agent replay.sh")
}

/// Deterministic scripted behaviour for the engine's own test suite:
/// returns a queued outcome on each call, repeating the final entry once
/// the queue is exhausted.
pub enum ScriptedOutcome {
    Success { cost_usd: f64, token_stats: TokenStats },
    Failure(String),
    RateLimited { retry_after_secs: u64 },
    Timeout,
}

pub struct MockAgent {
    outcomes: Vec<ScriptedOutcome>,
    call_count: Arc<AtomicUsize>,
}

impl MockAgent {
    pub fn new(outcomes: Vec<ScriptedOutcome>) -> Self {
        Self {
            outcomes,
            call_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentAdapter for MockAgent {
    async fn run(
        &self,
        _model: &str,
        _prompt_path: &Path,
        _workspace_path: &Path,
        output_dir: &Path,
        _timeout: Duration,
    ) -> Result<AgentOutcome> {
        std::fs::create_dir_all(output_dir).context("creating agent output dir")?;
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .outcomes
            .get(idx)
            .or_else(|| self.outcomes.last())
            .expect("MockAgent configured with no outcomes");

        let started_at = now_rfc3339();
        let ended_at = now_rfc3339();

        match outcome {
            ScriptedOutcome::Timeout => Ok(AgentOutcome::TimedOut),
            ScriptedOutcome::RateLimited { retry_after_secs } => {
                let result = AgentResult {
                    exit_code: Some(1),
                    token_stats: TokenStats::default(),
                    cost_usd: None,
                    started_at,
                    ended_at,
                    error: Some(format!(
                        "429 Too Many Requests: retry_after={}",
                        retry_after_secs
                    )),
                };
                std::fs::write(
                    output_dir.join("result.json"),
                    serde_json::to_string_pretty(&result)?,
                )?;
                Ok(AgentOutcome::Completed(result))
            }
            ScriptedOutcome::Failure(message) => {
                let result = AgentResult {
                    exit_code: Some(1),
                    token_stats: TokenStats::default(),
                    cost_usd: None,
                    started_at,
                    ended_at,
                    error: Some(message.clone()),
                };
                std::fs::write(
                    output_dir.join("result.json"),
                    serde_json::to_string_pretty(&result)?,
                )?;
                Ok(AgentOutcome::Completed(result))
            }
            ScriptedOutcome::Success {
                cost_usd,
                token_stats,
            } => {
                std::fs::write(output_dir.join("output.txt"), "mock agent output")?;
                let result = AgentResult {
                    exit_code: Some(0),
                    token_stats: *token_stats,
                    cost_usd: Some(*cost_usd),
                    started_at,
                    ended_at,
                    error: None,
                };
                std::fs::write(
                    output_dir.join("result.json"),
                    serde_json::to_string_pretty(&result)?,
                )?;
                Ok(AgentOutcome::Completed(result))
            }
        }
    }
}

fn now_rfc3339() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", now.as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn mock_agent_cycles_through_scripted_outcomes() {
        let agent = MockAgent::new(vec![
            ScriptedOutcome::RateLimited { retry_after_secs: 2 },
            ScriptedOutcome::Success {
                cost_usd: 0.01,
                token_stats: TokenStats::default(),
            },
        ]);
        let dir = TempDir::new().unwrap();

        let first = agent
            .run("m", Path::new("p"), dir.path(), &dir.path().join("out1"), Duration::from_secs(1))
            .await
            .unwrap();
        match first {
            AgentOutcome::Completed(r) => assert!(r.error.is_some()),
            _ => panic!("expected completed rate-limit result"),
        }

        let second = agent
            .run("m", Path::new("p"), dir.path(), &dir.path().join("out2"), Duration::from_secs(1))
            .await
            .unwrap();
        match second {
            AgentOutcome::Completed(r) => assert_eq!(r.exit_code, Some(0)),
            _ => panic!("expected completed success result"),
        }
        assert_eq!(agent.calls(), 2);
    }

    #[tokio::test]
    async fn shell_agent_writes_expected_artifacts() {
        let dir = TempDir::new().unwrap();
        let prompt_path = dir.path().join("task_prompt.md");
        std::fs::write(&prompt_path, "do the thing").unwrap();
        let output_dir = dir.path().join("agent");

        let agent = ShellAgent {
            program: "echo".into(),
            args: vec!["hello".into()],
        };
        let outcome = agent
            .run("m", &prompt_path, dir.path(), &output_dir, Duration::from_secs(5))
            .await
            .unwrap();
        match outcome {
            AgentOutcome::Completed(result) => assert_eq!(result.exit_code, Some(0)),
            AgentOutcome::TimedOut => panic!("should not time out"),
        }
        assert!(output_dir.join("stdout.log").exists());
        assert!(output_dir.join("output.txt").exists());
        assert!(output_dir.join("result.json").exists());
        assert!(output_dir.join("replay.sh").exists());
    }
}
