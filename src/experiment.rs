//! Experiment Runner (C8): the top-level state machine that iterates
//! tiers in declared order, drives each to completion via the Subtest
//! Orchestrator, selects a best subtest per tier, and finalizes.
//!
//! This is the one module allowed to mutate the checkpoint on disk;
//! every other component reaches the checkpoint only through the
//! `CheckpointPort` closures built here. Tier iteration is kept serial:
//! this keeps reporting deterministic and bounds the number of
//! concurrent agents sharing one rate-limit budget (see DESIGN.md).

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::agent::AgentAdapter;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::{self, FixtureFiles};
use crate::judge::{self, JudgeClient};
use crate::lockfile::FileLock;
use crate::model::{
    ExperimentConfig, ExperimentState, RunNumber, RunStatus, SubtestId, TierId, TierResult,
    TierState,
};
use crate::orchestrator::{CheckpointPort, SubtestOrchestrator, SubtestRunConfig};
use crate::ratelimit::RetryPolicy;
use crate::report;
use crate::resolver::Resolver;
use crate::workspace::WorkspaceManager;

/// Which on-disk stage to reset to pending before continuing, for the
/// `run --from STATE` replay control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayFrom {
    ReplayGenerated,
    JudgePipelineRun,
    RunFinalized,
}

pub struct ExperimentRunner<'a> {
    pub experiment_root: PathBuf,
    pub fixture_dir: PathBuf,
    pub config: ExperimentConfig,
    pub resolver: Resolver,
    pub workspace_manager: WorkspaceManager,
    pub agent: &'a (dyn AgentAdapter + Sync),
    pub judges: Vec<(String, Box<dyn JudgeClient>)>,
    pub cancellation: CancellationToken,
    /// If set, subtest discovery stops after this many subtests per tier
    /// (`--max-subtests`).
    pub max_subtests: Option<usize>,
    /// `--filter-tier`: restrict tier iteration to tiers whose id matches
    /// exactly, without touching `self.config.tiers` (so a filtered run's
    /// checkpoint and report still reflect the tier list the experiment
    /// was declared with).
    pub filter_tier: Option<TierId>,
    /// `--filter-status`: narrows a `--from` replay so only runs currently
    /// at this exact status are reset to pending, instead of every run at
    /// or past the replay stage.
    pub filter_status: Option<RunStatus>,
}

impl<'a> ExperimentRunner<'a> {
    /// Run the experiment to completion (or to the first unrecoverable
    /// setup error). Returns the final `ExperimentState`; a `FAILED` tier
    /// never causes this to return `Err` — only a setup-level error that
    /// prevents the engine from making progress at all does.
    pub async fn run(&mut self, fresh: bool, from: Option<ReplayFrom>) -> Result<ExperimentState> {
        std::fs::create_dir_all(&self.experiment_root)
            .with_context(|| format!("creating experiment root {}", self.experiment_root.display()))?;

        let lock_path = self.experiment_root.join(".experiment.lock");
        let _lock = FileLock::try_acquire(&lock_path)
            .context("acquiring experiment lock")?
            .ok_or_else(|| crate::error::EngineError::ExperimentLockHeld {
                path: self.experiment_root.display().to_string(),
            })?;

        if fresh {
            self.quarantine_existing_tree()?;
        }

        let checkpoint_path = self.experiment_root.join("checkpoint.json");
        let mut store = match CheckpointStore::load(&checkpoint_path)? {
            Some(mut checkpoint) => {
                if let Some(stage) = from {
                    reset_for_replay(&mut checkpoint, stage, self.filter_status);
                }
                CheckpointStore::from_existing(checkpoint_path, checkpoint)
            }
            None => {
                let checkpoint = Checkpoint::new(
                    experiment_id(&self.experiment_root),
                    config::config_hash(&self.config)?,
                    now_rfc3339(),
                );
                CheckpointStore::open_or_create(checkpoint_path, checkpoint)?
            }
        };
        store.get_mut().experiment_state = ExperimentState::Running;
        store.save().context("saving checkpoint after marking experiment running")?;

        let fixture = config::load_fixture_files(&self.fixture_dir)?;
        config::persist_experiment_root_files(&self.experiment_root, &self.config, &fixture)?;
        let judge_prompt_template = config::load_judge_prompt_template(&self.experiment_root)?;

        let prompt_md = self.experiment_root.join("prompt.md");
        let criteria_md = self.experiment_root.join("criteria.md");
        let rubric_yaml = self.experiment_root.join("rubric.yaml");

        let base_repo = self
            .workspace_manager
            .ensure_base(&self.config.source_repo_url, &self.config.source_commit)
            .await
            .context("ensuring base repository")?;

        // `CheckpointPort`'s closures are `Fn`, not `FnMut`, because the
        // orchestrator fans several of them out across concurrently-polled
        // run futures, even though there's still only one logical writer.
        // `parking_lot::Mutex` gives every closure shared, `Send + Sync`
        // access while the single-writer invariant holds because no lock
        // guard is ever held across an `.await` point.
        let store = Mutex::new(store);

        let orchestrator = SubtestOrchestrator {
            results_root: self.experiment_root.clone(),
            fixture_dir: self.fixture_dir.clone(),
            workspace_manager: &self.workspace_manager,
            resolver: &self.resolver,
            agent: self.agent,
            judges: &self.judges,
            judge_prompt_template: &judge_prompt_template,
            prompt_md: prompt_md.clone(),
            criteria_md: criteria_md.clone(),
            rubric_yaml: rubric_yaml.clone(),
        };

        let mut tier_results = Vec::new();

        for tier_id in self.config.tiers.clone() {
            if self.cancellation.is_cancelled() {
                warn!("cancellation requested, stopping before tier {}", tier_id);
                break;
            }
            if let Some(filter) = &self.filter_tier {
                if &tier_id != filter {
                    continue;
                }
            }

            info!("starting tier {}", tier_id);
            store.lock().mark_tier(tier_id.clone(), TierState::Running)?;

            let mut subtests = self.resolver.list_subtests(&tier_id)?;
            if let Some(max) = self.max_subtests {
                subtests.truncate(max);
            }

            let tier_dir = self.experiment_root.join(&tier_id.0);
            std::fs::create_dir_all(&tier_dir)
                .with_context(|| format!("creating tier dir {}", tier_dir.display()))?;

            let mut subtest_results = BTreeMap::new();
            let mut any_setup_failure = false;

            for subtest in subtests {
                if self.cancellation.is_cancelled() {
                    warn!("cancellation requested, stopping before subtest {}", subtest.id);
                    break;
                }

                let subtest_id = subtest.id.clone();
                let run_config = SubtestRunConfig {
                    tier: tier_id.clone(),
                    subtest,
                    runs_per_subtest: self.config.runs_per_subtest,
                    parallelism_cap: self.config.parallelism_cap,
                    agent_model: self.config.agent_model.clone(),
                    judge_models: self.config.judge_models.clone(),
                    per_run_timeout: Duration::from_secs(self.config.per_run_timeout_secs),
                    judge_timeout: Duration::from_secs(self.config.per_run_timeout_secs),
                    retry_policy: RetryPolicy {
                        max_retries: self.config.max_retries,
                        ..RetryPolicy::default()
                    },
                    pass_threshold: self.config.pass_threshold,
                    disagreement_threshold: self.config.disagreement_threshold,
                    source_commit: self.config.source_commit.clone(),
                };

                let checkpoint = CheckpointPort {
                    run_status: Box::new(|tier: &TierId, subtest: &SubtestId, run: RunNumber| {
                        store.lock().get().run_status(tier, subtest, run)
                    }),
                    mark_run: Box::new(
                        |tier: &TierId, subtest: &SubtestId, run: RunNumber, status: RunStatus| {
                            store
                                .lock()
                                .mark_run(tier.clone(), subtest.clone(), run, status)
                        },
                    ),
                };

                match orchestrator
                    .run_subtest(&base_repo, run_config, &checkpoint)
                    .await
                {
                    Ok(result) => {
                        report::write_subtest_report(
                            &tier_dir.join(&subtest_id.0),
                            &result,
                        )?;
                        subtest_results.insert(subtest_id, result);
                    }
                    Err(err) => {
                        warn!("subtest {}/{} setup failed: {err:#}", tier_id, subtest_id);
                        any_setup_failure = true;
                    }
                }
            }

            let candidates: Vec<(SubtestId, f64, u64)> = subtest_results
                .iter()
                .map(|(id, r)| (id.clone(), r.median_score, r.token_stats.total()))
                .collect();
            let best_subtest = judge::select_best_subtest(&candidates, self.config.tie_break_threshold)
                .cloned();
            store
                .lock()
                .set_best_subtest(tier_id.clone(), best_subtest.clone())?;

            let tier_result = TierResult {
                tier: tier_id.clone(),
                subtests: subtest_results,
                best_subtest,
                report_path: tier_dir.join("report.json"),
            };
            report::write_tier_report(&tier_dir, &tier_result)?;

            let zero_passed_runs = tier_result
                .subtests
                .values()
                .all(|s| s.runs.iter().all(|r| !r.passed));
            let tier_state = if any_setup_failure || (!tier_result.subtests.is_empty() && zero_passed_runs) {
                TierState::Failed
            } else {
                TierState::Complete
            };
            store.lock().mark_tier(tier_id.clone(), tier_state)?;
            info!("tier {} finished: {:?}", tier_id, tier_state);

            tier_results.push(tier_result);
        }

        {
            let store_ref = store.lock();
            report::write_experiment_report(
                &self.experiment_root,
                &store_ref.get().experiment_id,
                &tier_results,
                &store_ref.get().tier_states,
            )?;
        }

        let final_state = if self.cancellation.is_cancelled() {
            ExperimentState::Running
        } else {
            ExperimentState::Complete
        };
        store.lock().mark_experiment(final_state)?;
        Ok(final_state)
    }

    /// `--fresh`: move the existing experiment tree aside (preserving it,
    /// per the "investigate before deleting" posture) and start over with
    /// no checkpoint.
    fn quarantine_existing_tree(&self) -> Result<()> {
        let checkpoint_path = self.experiment_root.join("checkpoint.json");
        if !checkpoint_path.exists() {
            return Ok(());
        }
        let quarantine_dir = self
            .experiment_root
            .parent()
            .unwrap_or(&self.experiment_root)
            .join(format!(
                "{}.stale-{}",
                self.experiment_root
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("experiment"),
                now_rfc3339()
            ));
        std::fs::rename(&self.experiment_root, &quarantine_dir)
            .context("quarantining existing experiment tree for --fresh")?;
        std::fs::create_dir_all(&self.experiment_root).context("recreating experiment root")?;
        Ok(())
    }
}

/// Reset the checkpoint's `completed_runs` entries whose stage is at or
/// past `stage`, so the next invocation replays from there. A replay
/// request only ever rewinds progress, never advances it. When
/// `filter_status` is set, only runs currently at that exact status are
/// reset, narrowing a replay to (for example) only the runs that are
/// stuck `JUDGE_COMPLETE` rather than every run past that stage.
fn reset_for_replay(checkpoint: &mut Checkpoint, stage: ReplayFrom, filter_status: Option<RunStatus>) {
    for subtests in checkpoint.completed_runs.values_mut() {
        for runs in subtests.values_mut() {
            runs.retain(|_, status| {
                let matches_filter = match filter_status {
                    Some(f) => *status == f,
                    None => true,
                };
                !(should_reset(*status, stage) && matches_filter)
            });
        }
    }
}

fn should_reset(status: RunStatus, stage: ReplayFrom) -> bool {
    match stage {
        ReplayFrom::ReplayGenerated => true,
        ReplayFrom::JudgePipelineRun => {
            matches!(status, RunStatus::AgentComplete | RunStatus::JudgeComplete)
        }
        ReplayFrom::RunFinalized => matches!(status, RunStatus::JudgeComplete),
    }
}

fn experiment_id(experiment_root: &Path) -> String {
    experiment_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("experiment")
        .to_string()
}

fn now_rfc3339() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", now.as_secs())
}
