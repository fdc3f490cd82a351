//! Subtest Orchestrator (C7): executes all configured runs of one subtest
//! under a bounded worker pool, aggregates into a `SubtestResult`.
//!
//! The runs of one subtest are a *fixed* list (`1..=N`), so a
//! `tokio::sync::Semaphore` plus `futures::future::join_all` over
//! in-place futures is enough to bound concurrency — no `tokio::spawn`
//! is needed since every run borrows from this call's own stack rather
//! than owning `'static` data. Workspace creation is still
//! single-writer: the first run that needs it creates the worktree, the
//! rest await the same `tokio::sync::OnceCell`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use tokio::sync::{OnceCell, Semaphore};

use crate::agent::AgentAdapter;
use crate::git::Repo;
use crate::judge::JudgeClient;
use crate::model::{RunNumber, RunStatus, SubtestId, SubtestResult, TierId, TokenStats};
use crate::ratelimit::RetryPolicy;
use crate::resolver::{Resolver, SubtestConfig};
use crate::run_executor::{RunExecutor, RunInputs};
use crate::workspace::{SubtestWorkspace, WorkspaceManager};

/// Inputs shared by every run of one subtest, grouped into one struct so a
/// single value can be threaded through `run_subtest` instead of a dozen
/// loose parameters.
pub struct SubtestRunConfig {
    pub tier: TierId,
    pub subtest: SubtestConfig,
    pub runs_per_subtest: u32,
    pub parallelism_cap: usize,
    pub agent_model: String,
    pub judge_models: Vec<String>,
    pub per_run_timeout: Duration,
    pub judge_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub pass_threshold: f64,
    pub disagreement_threshold: f64,
    pub source_commit: String,
}

/// A single place a run can ask "what should I write into the prompt, who
/// do I hand it to, and what's my checkpoint status" without the
/// orchestrator needing to know about checkpoint internals. The checkpoint
/// lookup/write-back is routed through closures so the orchestrator has no
/// compile-time dependency on any particular checkpoint storage strategy,
/// keeping the invariant that only one logical writer ever
/// touches the checkpoint (see `experiment.rs`, which supplies a
/// mutex-guarded handle here).
pub struct CheckpointPort<'a> {
    pub run_status: Box<dyn Fn(&TierId, &SubtestId, RunNumber) -> Option<RunStatus> + Send + Sync + 'a>,
    pub mark_run: Box<dyn Fn(&TierId, &SubtestId, RunNumber, RunStatus) -> Result<()> + Send + Sync + 'a>,
}

pub struct SubtestOrchestrator<'a> {
    pub results_root: PathBuf,
    pub fixture_dir: PathBuf,
    pub workspace_manager: &'a WorkspaceManager,
    pub resolver: &'a Resolver,
    pub agent: &'a (dyn AgentAdapter + Sync),
    pub judges: &'a [(String, Box<dyn JudgeClient>)],
    pub judge_prompt_template: &'a str,
    pub prompt_md: PathBuf,
    pub criteria_md: PathBuf,
    pub rubric_yaml: PathBuf,
}

impl<'a> SubtestOrchestrator<'a> {
    /// Run every configured run of `config.subtest`, up to
    /// `config.parallelism_cap` concurrently, and aggregate the results.
    /// Run numbers are assigned in order, but completion is not ordered;
    /// aggregation always sorts by run number first so the computed
    /// median is reproducible regardless of scheduling.
    pub async fn run_subtest(
        &self,
        base_repo: &Repo,
        config: SubtestRunConfig,
        checkpoint: &CheckpointPort<'_>,
    ) -> Result<SubtestResult> {
        let tier_dir = self.results_root.join(&config.tier.0);
        let subtest_dir = tier_dir.join(&config.subtest.id.0);
        std::fs::create_dir_all(&subtest_dir)
            .with_context(|| format!("creating subtest dir {}", subtest_dir.display()))?;

        let task_prompt = std::fs::read_to_string(&self.prompt_md).context("reading prompt.md")?;
        let composed_prompt = self.resolver.compose_prompt(&config.subtest, &task_prompt);

        let workspace_cell: OnceCell<SubtestWorkspace> = OnceCell::new();
        let semaphore = Semaphore::new(config.parallelism_cap.max(1));
        // Referenced (not owned) by every per-run future below, so each
        // `async move` block only copies the reference, never the
        // underlying `Semaphore`/`OnceCell`.
        let semaphore = &semaphore;
        let workspace_cell = &workspace_cell;

        // Every pending run is driven as its own future, all polled
        // concurrently by `join_all` within this single task (no
        // `tokio::spawn`, since these futures borrow `self` and `base_repo`
        // rather than owning `'static` data). Concurrency is bounded by the
        // semaphore permit each future acquires before doing any real work;
        // the workspace is created at most once via the shared `OnceCell`,
        // whichever future gets there first.
        let mut pending: Vec<RunNumber> = Vec::new();
        let mut run_futures = Vec::new();
        for n in 1..=config.runs_per_subtest {
            let run = RunNumber(n);
            let prior_status = (checkpoint.run_status)(&config.tier, &config.subtest.id, run);
            if matches!(prior_status, Some(s) if s.is_terminal()) {
                // Already terminal: nothing external needs to be touched
                // (resume safety). Reloaded from disk below for aggregation
                // instead.
                continue;
            }

            let tier = config.tier.clone();
            let subtest_id = config.subtest.id.clone();
            let composed_prompt = composed_prompt.clone();
            let agent_model = config.agent_model.clone();
            let commit = config.source_commit.clone();
            let subtest_dir = subtest_dir.clone();
            let per_run_timeout = config.per_run_timeout;
            let judge_timeout = config.judge_timeout;
            let retry_policy = config.retry_policy;
            let pass_threshold = config.pass_threshold;
            let disagreement_threshold = config.disagreement_threshold;

            pending.push(run);
            run_futures.push(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");

                let workspace = workspace_cell
                    .get_or_try_init(|| {
                        self.workspace_manager
                            .create_worktree(base_repo, &subtest_dir, &tier, &subtest_id, &commit)
                    })
                    .await
                    .context("creating subtest workspace")?;

                let judges_refs: Vec<(String, &dyn JudgeClient)> = self
                    .judges
                    .iter()
                    .map(|(m, c)| (m.clone(), c.as_ref()))
                    .collect();

                let inputs = RunInputs {
                    subtest_dir: subtest_dir.clone(),
                    workspace_dir: workspace.path().to_path_buf(),
                    tier: tier.clone(),
                    subtest: subtest_id.clone(),
                    run,
                    composed_prompt,
                    agent_model,
                    agent: self.agent,
                    judges: &judges_refs,
                    judge_prompt_template: self.judge_prompt_template,
                    prompt_md: &self.prompt_md,
                    criteria_md: &self.criteria_md,
                    rubric_yaml: &self.rubric_yaml,
                    per_run_timeout,
                    judge_timeout,
                    retry_policy,
                    pass_threshold,
                    disagreement_threshold,
                };
                RunExecutor::execute(inputs, prior_status).await
            });
        }

        let results = futures::future::join_all(run_futures).await;

        let mut runs = Vec::new();
        for (run, result) in pending.into_iter().zip(results) {
            let result: crate::model::RunResult =
                result.with_context(|| format!("executing run {}", run))?;
            let status = if result.passed {
                RunStatus::Passed
            } else {
                RunStatus::Failed
            };
            (checkpoint.mark_run)(&config.tier, &config.subtest.id, run, status)?;
            runs.push(result);
        }

        // Reload any runs that were already terminal (skipped above) from
        // disk so aggregation covers every configured run, not just the
        // ones executed this invocation.
        for n in 1..=config.runs_per_subtest {
            let run = RunNumber(n);
            if runs.iter().any(|r| r.run == run) {
                continue;
            }
            let result_path = subtest_dir.join(run.dir_name()).join("run_result.json");
            if let Ok(content) = std::fs::read_to_string(&result_path) {
                if let Ok(result) = serde_json::from_str(&content) {
                    runs.push(result);
                }
            }
        }
        runs.sort_by_key(|r| r.run);

        info!(
            "subtest {}/{} finished: {}/{} passed",
            config.tier,
            config.subtest.id,
            runs.iter().filter(|r| r.passed).count(),
            runs.len()
        );

        Ok(aggregate_subtest(config.subtest.id, runs, &subtest_dir))
    }
}

/// Aggregate a (run-number-sorted) list of `RunResult`s into one
/// `SubtestResult`. A free function so it's independently testable against
/// literal `RunResult` fixtures without any orchestration machinery.
pub fn aggregate_subtest(
    subtest: SubtestId,
    mut runs: Vec<crate::model::RunResult>,
    subtest_dir: &std::path::Path,
) -> SubtestResult {
    runs.sort_by_key(|r| r.run);
    let n = runs.len().max(1) as f64;
    let scores: Vec<f64> = runs
        .iter()
        .map(|r| r.consensus.as_ref().map(|c| c.score).unwrap_or(0.0))
        .collect();
    let median_score = crate::model::median(&scores);
    let pass_rate = runs.iter().filter(|r| r.passed).count() as f64 / n;
    let token_stats = runs
        .iter()
        .fold(TokenStats::default(), |acc, r| acc + r.token_stats);
    let cost_usd = runs.iter().map(|r| r.cost_usd).sum();
    let total_duration_secs = runs.iter().map(|r| r.total_duration_secs).sum();

    SubtestResult {
        subtest,
        runs,
        median_score,
        pass_rate,
        token_stats,
        cost_usd,
        total_duration_secs,
        report_path: subtest_dir.join("report.json"),
    }
}
