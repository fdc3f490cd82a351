//! Run Executor (C4): drives one `(tier, subtest, run)` from scratch or
//! from partial progress to a finalized `RunResult`.
//!
//! The state machine (`PENDING → AGENT_RUNNING → AGENT_COMPLETE →
//! JUDGE_RUNNING → JUDGE_COMPLETE → FINALIZED`) is realized as a straight
//! sequence of `async fn` steps (spawn, await, map the result) rather
//! than an explicit `enum` + `match` loop — the intermediate states are
//! genuinely just checkpoints along one linear path, so a state enum
//! would add ceremony without adding clarity. Artifact-reuse inspection
//! is kept as free functions over filesystem state so they're testable
//! without spawning any process.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::agent::{AgentAdapter, AgentOutcome, AgentResult};
use crate::judge::{self, substitute_judge_prompt, JudgeClient, JudgeInputs};
use crate::model::{
    ConsensusJudgment, CriterionScore, ErrorDetail, ErrorTag, Grade, Judgment, RunArtifactPaths,
    RunNumber, RunResult, RunStatus, SubtestId, TierId, TokenStats,
};
use crate::ratelimit::{self, Decision, FailureClass, RetryPolicy};
use crate::report;

/// Everything a `RunExecutor` needs that does not change run-to-run within
/// one subtest: the composed task prompt, the paths to the uniform fixture
/// files, the shared workspace, and the external collaborators.
pub struct RunInputs<'a> {
    pub subtest_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub tier: TierId,
    pub subtest: SubtestId,
    pub run: RunNumber,
    pub composed_prompt: String,
    pub agent_model: String,
    pub agent: &'a dyn AgentAdapter,
    pub judges: &'a [(String, &'a dyn JudgeClient)],
    pub judge_prompt_template: &'a str,
    pub prompt_md: &'a Path,
    pub criteria_md: &'a Path,
    pub rubric_yaml: &'a Path,
    pub per_run_timeout: Duration,
    pub judge_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub pass_threshold: f64,
    pub disagreement_threshold: f64,
}

pub struct RunExecutor;

impl RunExecutor {
    /// Drive `inputs.run` to a finalized `RunResult`. `prior_status` is
    /// whatever the checkpoint currently records for this run (if
    /// anything); when it's a terminal status the run is skipped entirely
    /// without touching the filesystem any further than reading
    /// `run_result.json` back.
    pub async fn execute(
        inputs: RunInputs<'_>,
        prior_status: Option<RunStatus>,
    ) -> Result<RunResult> {
        let run_dir = inputs.subtest_dir.join(inputs.run.dir_name());
        let result_path = run_dir.join("run_result.json");

        if matches!(prior_status, Some(s) if s.is_terminal()) && result_path.is_file() {
            let content = fs::read_to_string(&result_path)
                .with_context(|| format!("reading {}", result_path.display()))?;
            debug!(
                "run {}/{}/{} already terminal, skipping",
                inputs.tier, inputs.subtest, inputs.run
            );
            return serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", result_path.display()));
        }

        // A run_result.json left over from a prior attempt that the
        // checkpoint no longer considers terminal (e.g. after a
        // `--from`-style replay reset) means this run number is being
        // reused; quarantine the old evidence before writing anything new.
        if result_path.is_file() {
            quarantine_run_dir(&run_dir)
                .with_context(|| format!("quarantining stale {}", run_dir.display()))?;
        }

        fs::create_dir_all(&run_dir)
            .with_context(|| format!("creating run dir {}", run_dir.display()))?;
        let task_prompt_path = run_dir.join("task_prompt.md");
        fs::write(&task_prompt_path, &inputs.composed_prompt)
            .context("writing task_prompt.md")?;

        let overall_start = Instant::now();
        let agent_dir = run_dir.join("agent");

        let (agent_result, agent_ran, agent_duration) =
            match reuse_or_run_agent(&inputs, &agent_dir, &task_prompt_path).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    let result = finalize_failure(
                        &inputs,
                        &run_dir,
                        &task_prompt_path,
                        err.tag,
                        err.message,
                        overall_start.elapsed(),
                    )?;
                    return Ok(result);
                }
            };

        let judge_dir = run_dir.join("judge");
        let judge_start = Instant::now();
        let (judgments, consensus, judge_error) = reuse_or_run_judges(
            &inputs,
            &judge_dir,
            agent_ran,
            &agent_dir.join("output.txt"),
        )
        .await?;
        let judge_duration = judge_start.elapsed();

        let total_duration = overall_start.elapsed();

        let (passed, grade, criteria_scores, error) = match (&consensus, &judge_error) {
            (Some(c), _) => (c.passed, Some(c.grade), c.criteria_scores.clone(), None),
            (None, Some(msg)) => (
                false,
                None,
                Default::default(),
                Some(ErrorDetail {
                    tag: ErrorTag::JudgeParseError,
                    message: msg.clone(),
                }),
            ),
            (None, None) => (
                false,
                None,
                Default::default(),
                Some(ErrorDetail {
                    tag: ErrorTag::JudgeParseError,
                    message: "all judges failed to produce a valid judgment".into(),
                }),
            ),
        };

        let cost_estimated = agent_result.cost_usd.is_none();
        let result = RunResult {
            tier: inputs.tier.clone(),
            subtest: inputs.subtest.clone(),
            run: inputs.run,
            agent_exit_code: agent_result.exit_code,
            token_stats: agent_result.token_stats,
            cost_usd: agent_result.cost_usd.unwrap_or(0.0),
            cost_estimated,
            agent_duration_secs: agent_duration.as_secs_f64(),
            judge_duration_secs: judge_duration.as_secs_f64(),
            total_duration_secs: total_duration.as_secs_f64(),
            judgments,
            consensus,
            passed,
            grade,
            criteria_scores,
            agent_ran,
            artifact_paths: artifact_paths(&run_dir, &task_prompt_path, &agent_dir, &judge_dir),
            error,
        };

        write_run_result(&result_path, &result)?;
        report::write_run_report(&run_dir, &result).context("writing run report")?;
        info!(
            "run {}/{}/{} finalized: passed={} score={:?}",
            inputs.tier,
            inputs.subtest,
            inputs.run,
            result.passed,
            result.consensus.as_ref().map(|c| c.score)
        );
        Ok(result)
    }
}

struct AgentFailure {
    tag: ErrorTag,
    message: String,
}

fn finalize_failure(
    inputs: &RunInputs<'_>,
    run_dir: &Path,
    task_prompt_path: &Path,
    tag: ErrorTag,
    message: String,
    elapsed: Duration,
) -> Result<RunResult> {
    let agent_dir = run_dir.join("agent");
    let judge_dir = run_dir.join("judge");
    let result = RunResult {
        tier: inputs.tier.clone(),
        subtest: inputs.subtest.clone(),
        run: inputs.run,
        agent_exit_code: None,
        token_stats: TokenStats::default(),
        cost_usd: 0.0,
        cost_estimated: true,
        agent_duration_secs: elapsed.as_secs_f64(),
        judge_duration_secs: 0.0,
        total_duration_secs: elapsed.as_secs_f64(),
        judgments: vec![],
        consensus: None,
        passed: false,
        grade: None,
        criteria_scores: Default::default(),
        agent_ran: true,
        artifact_paths: artifact_paths(run_dir, task_prompt_path, &agent_dir, &judge_dir),
        error: Some(ErrorDetail {
            tag,
            message,
        }),
    };
    let result_path = run_dir.join("run_result.json");
    write_run_result(&result_path, &result)?;
    report::write_run_report(run_dir, &result).context("writing run report")?;
    warn!(
        "run {}/{}/{} failed: {:?}",
        inputs.tier, inputs.subtest, inputs.run, result.error
    );
    Ok(result)
}

fn artifact_paths(
    run_dir: &Path,
    task_prompt: &Path,
    agent_dir: &Path,
    judge_dir: &Path,
) -> RunArtifactPaths {
    RunArtifactPaths {
        task_prompt: task_prompt.to_path_buf(),
        agent_dir: agent_dir.to_path_buf(),
        judge_dir: judge_dir.to_path_buf(),
        run_result: run_dir.join("run_result.json"),
        report_md: run_dir.join("report.md"),
        report_json: run_dir.join("report.json"),
    }
}

fn write_run_result(path: &Path, result: &RunResult) -> Result<()> {
    let content = serde_json::to_string_pretty(result).context("serializing run result")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &content).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))
}

/// Move an existing run directory's contents aside into
/// `run_NN/.failed/run_NN_failed_<k>/`, preserving evidence while freeing
/// the run number for a fresh attempt.
fn quarantine_run_dir(run_dir: &Path) -> Result<()> {
    if !run_dir.is_dir() {
        return Ok(());
    }
    let failed_dir = run_dir.join(".failed");
    fs::create_dir_all(&failed_dir).context("creating .failed dir")?;
    let mut k = 1usize;
    loop {
        let run_name = run_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("run")
            .to_string();
        let dest = failed_dir.join(format!("{}_failed_{}", run_name, k));
        if !dest.exists() {
            fs::create_dir_all(&dest).context("creating quarantine dest")?;
            for entry in fs::read_dir(run_dir).context("reading run dir to quarantine")? {
                let entry = entry?;
                let name = entry.file_name();
                if name == ".failed" {
                    continue;
                }
                fs::rename(entry.path(), dest.join(&name))
                    .with_context(|| format!("moving {:?} into quarantine", name))?;
            }
            return Ok(());
        }
        k += 1;
    }
}

/// Inspect `agent/result.json`: `Some(result)` if it parses and is usable
/// for reuse, `None` if absent or corrupt (in which case the agent must be
/// re-run).
fn inspect_agent_artifacts(agent_dir: &Path) -> Option<AgentResult> {
    let path = agent_dir.join("result.json");
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

async fn reuse_or_run_agent(
    inputs: &RunInputs<'_>,
    agent_dir: &Path,
    task_prompt_path: &Path,
) -> Result<(AgentResult, bool, Duration), AgentFailure> {
    if let Some(existing) = inspect_agent_artifacts(agent_dir) {
        if existing.exit_code == Some(0) && existing.error.is_none() {
            debug!("reusing existing agent result for this run");
            return Ok((existing, false, Duration::ZERO));
        }
    }

    let start = Instant::now();
    let mut attempt: u32 = 1;
    loop {
        let outcome = inputs
            .agent
            .run(
                &inputs.agent_model,
                task_prompt_path,
                &inputs.workspace_dir,
                agent_dir,
                inputs.per_run_timeout,
            )
            .await
            .map_err(|e| AgentFailure {
                tag: ErrorTag::InternalError,
                message: format!("{e:#}"),
            })?;

        match outcome {
            AgentOutcome::TimedOut => {
                let class = FailureClass::TransientNetwork;
                match inputs.retry_policy.decide(attempt, &class) {
                    Decision::RetryAfter(delay) if attempt <= inputs.retry_policy.max_retries => {
                        warn!("agent timed out (attempt {attempt}), retrying after {delay:?}");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    _ => {
                        return Err(AgentFailure {
                            tag: ErrorTag::AgentTimeout,
                            message: format!(
                                "agent invocation timed out after {}s",
                                inputs.per_run_timeout.as_secs()
                            ),
                        })
                    }
                }
            }
            AgentOutcome::Completed(result) => {
                if result.exit_code == Some(0) && result.error.is_none() {
                    return Ok((result, true, start.elapsed()));
                }
                let stderr_sample = agent_stderr_sample(agent_dir, &result);
                let class = ratelimit::classify(result.exit_code, &stderr_sample);
                match inputs.retry_policy.decide(attempt, &class) {
                    Decision::RetryAfter(delay) => {
                        debug!(
                            "agent attempt {attempt} failed ({class:?}), retrying after {delay:?}"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    Decision::FailNow => {
                        return Err(AgentFailure {
                            tag: tag_for_failure_class(&class),
                            message: stderr_sample,
                        })
                    }
                }
            }
        }
    }
}

fn agent_stderr_sample(agent_dir: &Path, result: &AgentResult) -> String {
    let mut sample = result.error.clone().unwrap_or_default();
    if let Ok(stderr) = fs::read_to_string(agent_dir.join("stderr.log")) {
        if !stderr.is_empty() {
            writeln!(sample, "\n{}", stderr).ok();
        }
    }
    sample
}

fn tag_for_failure_class(class: &FailureClass) -> ErrorTag {
    match class {
        FailureClass::RateLimited { .. } => ErrorTag::AgentRateLimited,
        FailureClass::TransientNetwork
        | FailureClass::Authentication
        | FailureClass::NotFound
        | FailureClass::Permanent => ErrorTag::AgentFailed,
    }
}

/// `Some(Vec<Judgment>)` if every configured judge has a valid
/// `judgment.json`, `None` otherwise (meaning judges must run fresh).
fn inspect_judge_artifacts(judge_dir: &Path, judge_count: usize) -> Option<Vec<Judgment>> {
    let mut judgments = Vec::with_capacity(judge_count);
    for idx in 1..=judge_count {
        let path = judge_dir
            .join(format!("judge_{:02}", idx))
            .join("judgment.json");
        let content = fs::read_to_string(path).ok()?;
        let judgment: Judgment = serde_json::from_str(&content).ok()?;
        judgments.push(judgment);
    }
    Some(judgments)
}

/// Judge re-run policy: judges are *always* re-run when the agent ran
/// this invocation, since any fresh agent output invalidates every prior
/// judgment; they are reused only when the agent did not run and every
/// judge's artifacts are individually valid.
async fn reuse_or_run_judges(
    inputs: &RunInputs<'_>,
    judge_dir: &Path,
    agent_ran: bool,
    agent_output_path: &Path,
) -> Result<(Vec<Option<Judgment>>, Option<ConsensusJudgment>, Option<String>)> {
    if !agent_ran {
        if let Some(judgments) = inspect_judge_artifacts(judge_dir, inputs.judges.len()) {
            debug!("reusing {} existing judgments", judgments.len());
            let wrapped: Vec<Option<Judgment>> = judgments.into_iter().map(Some).collect();
            let consensus = judge::compute_consensus(
                &wrapped,
                inputs.pass_threshold,
                inputs.disagreement_threshold,
            );
            return Ok((wrapped, consensus, None));
        }
    }

    let judge_inputs = JudgeInputs {
        prompt_md: inputs.prompt_md,
        criteria_md: inputs.criteria_md,
        rubric_yaml: inputs.rubric_yaml,
        agent_output_txt: agent_output_path,
        workspace: &inputs.workspace_dir,
    };
    let prompt = substitute_judge_prompt(inputs.judge_prompt_template, &judge_inputs);

    let mut judgments = Vec::with_capacity(inputs.judges.len());
    for (idx, (model, client)) in inputs.judges.iter().enumerate() {
        let n = idx + 1;
        let dir = judge_dir.join(format!("judge_{:02}", n));
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        fs::write(dir.join("prompt.md"), &prompt).context("writing judge prompt")?;
        write_judge_replay_script(&dir, model)?;

        let judgment = invoke_one_judge(*client, model, &prompt, &dir, inputs.judge_timeout).await;
        judgments.push(judgment);
    }

    let consensus = judge::compute_consensus(
        &judgments,
        inputs.pass_threshold,
        inputs.disagreement_threshold,
    );
    let judge_error = if consensus.is_none() {
        Some("all judges failed to produce a valid judgment".to_string())
    } else {
        None
    };
    Ok((judgments, consensus, judge_error))
}

async fn invoke_one_judge(
    client: &dyn JudgeClient,
    model: &str,
    prompt: &str,
    dir: &Path,
    timeout: Duration,
) -> Option<Judgment> {
    match client.judge(model, prompt, timeout).await {
        Ok(judgment) => {
            write_judgment(dir, &judgment);
            Some(judgment)
        }
        Err(crate::judge::JudgeError::Parse(_)) => {
            // Reprompt once before giving up on this judge.
            match client.judge(model, prompt, timeout).await {
                Ok(judgment) => {
                    write_judgment(dir, &judgment);
                    Some(judgment)
                }
                Err(e) => {
                    warn!("judge {model} failed on reprompt: {e}");
                    None
                }
            }
        }
        Err(e) => {
            warn!("judge {model} invocation failed: {e}");
            None
        }
    }
}

fn write_judgment(dir: &Path, judgment: &Judgment) {
    if let Ok(json) = serde_json::to_string_pretty(judgment) {
        let _ = fs::write(dir.join("response.txt"), &json);
        let _ = fs::write(dir.join("judgment.json"), &json);
    }
}

fn write_judge_replay_script(dir: &Path, model: &str) -> Result<()> {
    let mut script = String::new();
    writeln!(script, "#!/usr/bin/env bash").ok();
    writeln!(script, "set -euo pipefail").ok();
    writeln!(script, "# replay judge invocation for model {:?}", model).ok();
    writeln!(script, "cat {:?}", dir.join("prompt.md")).ok();
    fs::write(dir.join("replay.sh"), script).context("writing judge replay.sh")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgent;
    use crate::agent::ScriptedOutcome;
    use crate::judge::JudgeError;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct FixedJudge {
        judgment: Judgment,
    }

    #[async_trait]
    impl JudgeClient for FixedJudge {
        async fn judge(
            &self,
            _model: &str,
            _prompt: &str,
            _timeout: Duration,
        ) -> Result<Judgment, JudgeError> {
            Ok(self.judgment.clone())
        }
    }

    fn passing_judgment(score: f64) -> Judgment {
        Judgment {
            score,
            passed: score >= 0.6,
            grade: Grade::A,
            reasoning: "looks good".into(),
            criteria_scores: Default::default(),
        }
    }

    #[tokio::test]
    async fn fresh_run_passes_and_writes_all_artifacts() {
        let dir = TempDir::new().unwrap();
        let subtest_dir = dir.path().join("T0").join("00-empty");
        let workspace_dir = subtest_dir.join("workspace");
        fs::create_dir_all(&workspace_dir).unwrap();

        let agent = MockAgent::new(vec![ScriptedOutcome::Success {
            cost_usd: 0.02,
            token_stats: TokenStats {
                input: 10,
                output: 20,
                cache_read: 0,
                cache_creation: 0,
            },
        }]);
        let judge = FixedJudge {
            judgment: passing_judgment(0.9),
        };
        let judges: Vec<(String, &dyn JudgeClient)> = vec![("mock".into(), &judge)];
        let prompt_md = dir.path().join("prompt.md");
        let criteria_md = dir.path().join("criteria.md");
        let rubric_yaml = dir.path().join("rubric.yaml");
        fs::write(&prompt_md, "p").unwrap();
        fs::write(&criteria_md, "c").unwrap();
        fs::write(&rubric_yaml, "r: {}").unwrap();

        let inputs = RunInputs {
            subtest_dir: subtest_dir.clone(),
            workspace_dir,
            tier: TierId("T0".into()),
            subtest: SubtestId("00-empty".into()),
            run: RunNumber(1),
            composed_prompt: "do it".into(),
            agent_model: "mock".into(),
            agent: &agent,
            judges: &judges,
            judge_prompt_template: "{{prompt_md}}",
            prompt_md: &prompt_md,
            criteria_md: &criteria_md,
            rubric_yaml: &rubric_yaml,
            per_run_timeout: Duration::from_secs(5),
            judge_timeout: Duration::from_secs(5),
            retry_policy: RetryPolicy::default(),
            pass_threshold: 0.6,
            disagreement_threshold: 0.3,
        };

        let result = RunExecutor::execute(inputs, None).await.unwrap();
        assert!(result.passed);
        assert!(result.agent_ran);
        assert_eq!(result.token_stats.input, 10);
        assert!(subtest_dir.join("run_01").join("run_result.json").is_file());
        assert!(subtest_dir.join("run_01").join("report.json").is_file());
        assert!(subtest_dir.join("run_01").join("report.md").is_file());
        assert!(subtest_dir
            .join("run_01")
            .join("judge")
            .join("judge_01")
            .join("judgment.json")
            .is_file());
    }

    #[tokio::test]
    async fn terminal_prior_status_skips_execution_entirely() {
        let dir = TempDir::new().unwrap();
        let subtest_dir = dir.path().join("T0").join("00-empty");
        let run_dir = subtest_dir.join("run_01");
        fs::create_dir_all(&run_dir).unwrap();
        let prior = sample_result();
        fs::write(
            run_dir.join("run_result.json"),
            serde_json::to_string(&prior).unwrap(),
        )
        .unwrap();

        let agent = MockAgent::new(vec![ScriptedOutcome::Failure("should not run".into())]);
        let judge = FixedJudge {
            judgment: passing_judgment(0.9),
        };
        let judges: Vec<(String, &dyn JudgeClient)> = vec![("mock".into(), &judge)];
        let prompt_md = dir.path().join("prompt.md");
        fs::write(&prompt_md, "p").unwrap();

        let inputs = RunInputs {
            subtest_dir: subtest_dir.clone(),
            workspace_dir: subtest_dir.join("workspace"),
            tier: TierId("T0".into()),
            subtest: SubtestId("00-empty".into()),
            run: RunNumber(1),
            composed_prompt: "do it".into(),
            agent_model: "mock".into(),
            agent: &agent,
            judges: &judges,
            judge_prompt_template: "{{prompt_md}}",
            prompt_md: &prompt_md,
            criteria_md: &prompt_md,
            rubric_yaml: &prompt_md,
            per_run_timeout: Duration::from_secs(5),
            judge_timeout: Duration::from_secs(5),
            retry_policy: RetryPolicy::default(),
            pass_threshold: 0.6,
            disagreement_threshold: 0.3,
        };

        RunExecutor::execute(inputs, Some(RunStatus::Passed))
            .await
            .unwrap();
        assert_eq!(agent.calls(), 0, "agent must not be invoked for a terminal run");
    }

    #[tokio::test]
    async fn agent_rerun_invalidates_cached_judgments() {
        let dir = TempDir::new().unwrap();
        let subtest_dir = dir.path().join("T0").join("00-empty");
        let workspace_dir = subtest_dir.join("workspace");
        fs::create_dir_all(&workspace_dir).unwrap();

        let agent = MockAgent::new(vec![ScriptedOutcome::Success {
            cost_usd: 0.0,
            token_stats: TokenStats::default(),
        }]);
        let judge = FixedJudge {
            judgment: passing_judgment(0.9),
        };
        let judges: Vec<(String, &dyn JudgeClient)> = vec![("mock".into(), &judge)];
        let prompt_md = dir.path().join("prompt.md");
        fs::write(&prompt_md, "p").unwrap();

        let make_inputs = || RunInputs {
            subtest_dir: subtest_dir.clone(),
            workspace_dir: workspace_dir.clone(),
            tier: TierId("T0".into()),
            subtest: SubtestId("00-empty".into()),
            run: RunNumber(1),
            composed_prompt: "do it".into(),
            agent_model: "mock".into(),
            agent: &agent,
            judges: &judges,
            judge_prompt_template: "{{prompt_md}}",
            prompt_md: &prompt_md,
            criteria_md: &prompt_md,
            rubric_yaml: &prompt_md,
            per_run_timeout: Duration::from_secs(5),
            judge_timeout: Duration::from_secs(5),
            retry_policy: RetryPolicy::default(),
            pass_threshold: 0.6,
            disagreement_threshold: 0.3,
        };

        RunExecutor::execute(make_inputs(), None).await.unwrap();
        assert_eq!(agent.calls(), 1);

        // Delete the finalized run_result.json but keep agent/result.json,
        // simulating a kill after agent completion but before judging.
        let run_dir = subtest_dir.join("run_01");
        fs::remove_file(run_dir.join("run_result.json")).unwrap();
        RunExecutor::execute(make_inputs(), None).await.unwrap();
        assert_eq!(agent.calls(), 1, "agent output should be reused");

        // Now delete agent/result.json entirely: agent must re-run, and
        // judges must never be reused across a fresh agent invocation.
        fs::remove_file(run_dir.join("run_result.json")).ok();
        fs::remove_file(run_dir.join("agent").join("result.json")).unwrap();
        RunExecutor::execute(make_inputs(), None).await.unwrap();
        assert_eq!(agent.calls(), 2, "agent should re-run when result.json is gone");
    }

    fn sample_result() -> RunResult {
        RunResult {
            tier: TierId("T0".into()),
            subtest: SubtestId("00-empty".into()),
            run: RunNumber(1),
            agent_exit_code: Some(0),
            token_stats: Default::default(),
            cost_usd: 0.0,
            cost_estimated: true,
            agent_duration_secs: 1.0,
            judge_duration_secs: 1.0,
            total_duration_secs: 2.0,
            judgments: vec![],
            consensus: None,
            passed: true,
            grade: None,
            criteria_scores: Default::default(),
            agent_ran: true,
            artifact_paths: RunArtifactPaths {
                task_prompt: "task_prompt.md".into(),
                agent_dir: "agent".into(),
                judge_dir: "judge".into(),
                run_result: "run_result.json".into(),
                report_md: "report.md".into(),
                report_json: "report.json".into(),
            },
            error: None,
        }
    }
}
