//! CLI entry point. `do_main` does all the real work and returns a
//! `Result`; `main` translates that into a `std::process::ExitCode`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use log::error;
use tokio_util::sync::CancellationToken;

use scylla_engine::agent::{AgentAdapter, MockAgent, ScriptedOutcome, ShellAgent};
use scylla_engine::checkpoint::CheckpointStore;
use scylla_engine::config::{self, ConfigOverrides};
use scylla_engine::error::EngineError;
use scylla_engine::experiment::{ExperimentRunner, ReplayFrom};
use scylla_engine::judge::{JudgeClient, MockJudge, ScriptedJudgment, ShellJudge};
use scylla_engine::model::{ExperimentConfig, Grade, Judgment, RunStatus, TierId, TokenStats};
use scylla_engine::resolver::Resolver;
use scylla_engine::workspace::WorkspaceManager;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Increase log verbosity (debug).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Decrease log verbosity (warn only).
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run (or resume) an experiment against a fixture directory.
    Run(RunArgs),
    /// Rebuild `checkpoint.json`'s `completed_runs` by rescanning
    /// `run_result.json` files, leaving everything else untouched.
    Repair {
        /// Path to the checkpoint file to repair.
        checkpoint_path: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Fixture directory: prompt.md, criteria.md, rubric.yaml, and the
    /// per-tier/subtest tree.
    #[arg(long)]
    config: PathBuf,

    /// Directory the experiment's checkpoint/reports/worktrees live under.
    /// Defaults to the platform's per-user data directory for
    /// `scylla-engine` when omitted.
    #[arg(long)]
    results_root: Option<PathBuf>,

    /// Git URL of the repository under evaluation.
    #[arg(long)]
    source_repo_url: String,

    /// Commit (or ref) of the source repository to check out per worktree.
    #[arg(long)]
    source_commit: String,

    /// Restrict to these tiers (defaults to every tier discovered in the
    /// fixture directory).
    #[arg(long = "tiers", num_args = 0..)]
    tiers: Vec<String>,

    /// Runs per subtest.
    #[arg(long = "runs")]
    runs: Option<u32>,

    /// Max concurrent runs per subtest.
    #[arg(long = "parallel")]
    parallel: Option<usize>,

    /// Agent model id.
    #[arg(long = "model")]
    model: Option<String>,

    /// Primary judge model id.
    #[arg(long = "judge-model")]
    judge_model: Option<String>,

    /// Additional judge model ids, each judging independently (consensus
    /// is computed across all configured judges).
    #[arg(long = "add-judge")]
    add_judge: Vec<String>,

    /// Per-run agent/judge timeout in seconds.
    #[arg(long = "timeout")]
    timeout: Option<u64>,

    /// Cap the number of subtests discovered per tier.
    #[arg(long = "max-subtests")]
    max_subtests: Option<usize>,

    /// Maximum pairwise absolute judge-score difference above which a
    /// run's consensus is flagged `high_disagreement`.
    #[arg(long = "disagreement-threshold")]
    disagreement_threshold: Option<f64>,

    /// Discard the existing checkpoint and quarantine the prior
    /// experiment tree before starting over.
    #[arg(long)]
    fresh: bool,

    /// Replay from a given stage, rewinding any run past it back to
    /// pending before continuing.
    #[arg(long = "from", value_enum)]
    from: Option<FromStage>,

    /// Restrict tier iteration to a single tier.
    #[arg(long = "filter-tier")]
    filter_tier: Option<String>,

    /// Combined with `--from`, only rewind runs currently at this status.
    #[arg(long = "filter-status", value_enum)]
    filter_status: Option<FilterStatus>,

    /// Use the `mock` agent/judge adapters instead of shelling out
    /// (primarily useful for dry runs and the engine's own fixtures).
    #[arg(long)]
    mock: bool,

    /// Program to invoke for the agent adapter when not using `--mock`.
    #[arg(long = "agent-program")]
    agent_program: Option<PathBuf>,

    /// Program to invoke for judge adapters when not using `--mock`.
    #[arg(long = "judge-program")]
    judge_program: Option<PathBuf>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum FromStage {
    ReplayGenerated,
    JudgePipelineRun,
    RunFinalized,
}

impl From<FromStage> for ReplayFrom {
    fn from(stage: FromStage) -> Self {
        match stage {
            FromStage::ReplayGenerated => ReplayFrom::ReplayGenerated,
            FromStage::JudgePipelineRun => ReplayFrom::JudgePipelineRun,
            FromStage::RunFinalized => ReplayFrom::RunFinalized,
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum FilterStatus {
    Passed,
    Failed,
    AgentComplete,
    JudgeComplete,
}

impl From<FilterStatus> for RunStatus {
    fn from(status: FilterStatus) -> Self {
        match status {
            FilterStatus::Passed => RunStatus::Passed,
            FilterStatus::Failed => RunStatus::Failed,
            FilterStatus::AgentComplete => RunStatus::AgentComplete,
            FilterStatus::JudgeComplete => RunStatus::JudgeComplete,
        }
    }
}

async fn do_main(cli: Cli) -> Result<(), EngineError> {
    match cli.command {
        Command::Run(args) => run_command(args).await,
        Command::Repair { checkpoint_path } => repair_command(&checkpoint_path),
    }
}

async fn run_command(args: RunArgs) -> Result<(), EngineError> {
    let results_root = args.results_root.clone().unwrap_or_else(default_results_root);
    let resolver = Resolver::new(args.config.clone());

    let tiers: Vec<TierId> = if args.tiers.is_empty() {
        resolver
            .discover_tiers()
            .map_err(EngineError::Other)?
    } else {
        args.tiers.into_iter().map(TierId).collect()
    };

    let base_config = ExperimentConfig {
        source_repo_url: args.source_repo_url,
        source_commit: args.source_commit,
        tiers,
        subtests: None,
        runs_per_subtest: 3,
        agent_model: args.model.clone().unwrap_or_else(|| "default".to_string()),
        judge_models: {
            let mut models = args.judge_model.clone().into_iter().collect::<Vec<_>>();
            if models.is_empty() {
                models.push("default".to_string());
            }
            models.extend(args.add_judge.clone());
            models
        },
        per_run_timeout_secs: args.timeout.unwrap_or(600),
        parallelism_cap: args.parallel.unwrap_or(1),
        results_root: results_root.clone(),
        tie_break_threshold: 0.05,
        pass_threshold: 0.60,
        disagreement_threshold: 0.3,
        max_retries: 3,
    };

    let overrides = ConfigOverrides {
        tiers: None,
        runs: args.runs,
        parallel: args.parallel,
        model: args.model,
        judge_models: None,
        timeout_secs: args.timeout,
        max_subtests: args.max_subtests,
        disagreement_threshold: args.disagreement_threshold,
    };
    let config = config::apply_overrides(base_config, &overrides);
    config.validate().map_err(EngineError::Other)?;

    let experiment_root = results_root.join("experiment");
    let workspace_manager = WorkspaceManager::new(results_root);

    let agent: Box<dyn AgentAdapter + Sync> = if args.mock {
        Box::new(MockAgent::new(vec![ScriptedOutcome::Success {
            cost_usd: 0.0,
            token_stats: TokenStats::default(),
        }]))
    } else {
        let program = args
            .agent_program
            .ok_or_else(|| EngineError::Other(anyhow::anyhow!("--agent-program is required unless --mock is set")))?;
        Box::new(ShellAgent { program, args: Vec::new() })
    };

    let mut judges: Vec<(String, Box<dyn JudgeClient>)> = Vec::new();
    for model in &config.judge_models {
        let client: Box<dyn JudgeClient> = if args.mock {
            Box::new(MockJudge::new(vec![ScriptedJudgment::Judgment(Judgment {
                score: 1.0,
                passed: true,
                grade: Grade::S,
                reasoning: "mock".into(),
                criteria_scores: Default::default(),
            })]))
        } else {
            let program = args.judge_program.clone().ok_or_else(|| {
                EngineError::Other(anyhow::anyhow!("--judge-program is required unless --mock is set"))
            })?;
            Box::new(ShellJudge { program, args: Vec::new() })
        };
        judges.push((model.clone(), client));
    }

    let cancellation = CancellationToken::new();
    {
        let cancellation = cancellation.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancellation.cancel();
            }
        });
    }

    let mut runner = ExperimentRunner {
        experiment_root,
        fixture_dir: args.config,
        config,
        resolver,
        workspace_manager,
        agent: agent.as_ref(),
        judges,
        cancellation: cancellation.clone(),
        max_subtests: args.max_subtests,
        filter_tier: args.filter_tier.map(TierId),
        filter_status: args.filter_status.map(RunStatus::from),
    };

    let state = runner
        .run(args.fresh, args.from.map(ReplayFrom::from))
        .await
        .map_err(|e| e.downcast::<EngineError>().unwrap_or_else(EngineError::Other))?;

    if cancellation.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    log::info!("experiment finished: {state:?}");
    Ok(())
}

/// Per-user data directory for `scylla-engine`, used when `--results-root`
/// is omitted. Falls back to `./scylla-results` if the platform has no
/// resolvable home directory (e.g. a stripped-down container).
fn default_results_root() -> PathBuf {
    directories::ProjectDirs::from("", "", "scylla-engine")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("scylla-results"))
}

fn repair_command(checkpoint_path: &std::path::Path) -> Result<(), EngineError> {
    let experiment_root = checkpoint_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    let checkpoint = CheckpointStore::load(checkpoint_path)
        .map_err(EngineError::Other)?
        .ok_or_else(|| EngineError::CorruptCheckpoint {
            path: checkpoint_path.display().to_string(),
            source: anyhow::anyhow!("no checkpoint found at this path"),
        })?;

    let mut store = CheckpointStore::from_existing(checkpoint_path.to_path_buf(), checkpoint);
    store
        .repair(&experiment_root)
        .map_err(EngineError::Other)?;
    log::info!("repaired checkpoint at {}", checkpoint_path.display());
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        log::LevelFilter::Debug
    } else if cli.quiet {
        log::LevelFilter::Warn
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start async runtime: {e}");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(do_main(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(e.exit_code())
        }
    }
}
