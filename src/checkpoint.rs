//! Checkpoint Store (C1): the durable, resume-safe record of experiment
//! progress.
//!
//! Writes are atomic (temp file + fsync + rename). Only the experiment
//! runner's single writer thread is expected to call the mutators; this
//! module doesn't enforce that with a lock of its own (the experiment
//! lockfile in `lockfile.rs` is what prevents two runner processes
//! writing at once).

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::{RunNumber, RunStatus, SubtestId, TierId, TierState};

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub experiment_id: String,
    pub config_hash: String,
    pub started_at: String,
    pub last_updated: String,
    pub experiment_state: crate::model::ExperimentState,
    pub tier_states: BTreeMap<TierId, TierState>,
    #[allow(clippy::type_complexity)]
    pub completed_runs: BTreeMap<TierId, BTreeMap<SubtestId, BTreeMap<RunNumber, RunStatus>>>,
    pub best_subtest_per_tier: BTreeMap<TierId, Option<SubtestId>>,

    /// Unknown fields read from disk are preserved and ignored by engine
    /// logic, but round-tripped on save so forward-compatible readers
    /// don't silently lose data written by a newer version of the engine.
    #[serde(flatten)]
    pub unknown_fields: serde_json::Map<String, serde_json::Value>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Checkpoint {
    pub fn new(experiment_id: String, config_hash: String, now: String) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            experiment_id,
            config_hash,
            started_at: now.clone(),
            last_updated: now,
            experiment_state: crate::model::ExperimentState::Pending,
            tier_states: BTreeMap::new(),
            completed_runs: BTreeMap::new(),
            best_subtest_per_tier: BTreeMap::new(),
            unknown_fields: serde_json::Map::new(),
        }
    }

    pub fn run_status(
        &self,
        tier: &TierId,
        subtest: &SubtestId,
        run: RunNumber,
    ) -> Option<RunStatus> {
        self.completed_runs
            .get(tier)?
            .get(subtest)?
            .get(&run)
            .copied()
    }

    /// A tier is complete iff every subtest/run pair configured for it has
    /// reached a terminal status. Callers pass in the full set of
    /// configured (subtest, run) pairs since the checkpoint alone can't
    /// know what *should* exist.
    pub fn tier_is_complete(&self, tier: &TierId, configured: &[(SubtestId, RunNumber)]) -> bool {
        configured.iter().all(|(subtest, run)| {
            self.run_status(tier, subtest, *run)
                .map(|s| s.is_terminal())
                .unwrap_or(false)
        })
    }
}

/// Owns the on-disk checkpoint path and the in-memory copy, and is the
/// sole writer in a correctly-operating experiment run.
pub struct CheckpointStore {
    path: PathBuf,
    checkpoint: Checkpoint,
}

impl CheckpointStore {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn get_mut(&mut self) -> &mut Checkpoint {
        &mut self.checkpoint
    }

    /// Load an existing checkpoint, wrapping it in a store. Returns
    /// `Ok(None)` if the file is missing.
    pub fn load(path: &Path) -> Result<Option<Checkpoint>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading checkpoint {}", path.display()))?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)
            .with_context(|| format!("checkpoint at {} is corrupt", path.display()))?;
        Ok(Some(checkpoint))
    }

    pub fn open_or_create(path: PathBuf, checkpoint: Checkpoint) -> Result<Self> {
        let mut store = Self {
            path,
            checkpoint,
        };
        store.save()?;
        Ok(store)
    }

    pub fn from_existing(path: PathBuf, checkpoint: Checkpoint) -> Self {
        Self { path, checkpoint }
    }

    /// Atomic write: serialize, write to a temp file in the same
    /// directory, fsync, then rename over the target. Fails only on disk
    /// error, per the contract.
    pub fn save(&mut self) -> Result<()> {
        self.checkpoint.last_updated = now_rfc3339();
        let content = serde_json::to_string_pretty(&self.checkpoint)
            .context("serializing checkpoint")?;
        let dir = self
            .path
            .parent()
            .context("checkpoint path has no parent directory")?;
        fs::create_dir_all(dir).context("creating checkpoint directory")?;
        let tmp_path = dir.join(format!(
            ".{}.tmp",
            self.path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("checkpoint.json")
        ));
        {
            let mut tmp_file =
                fs::File::create(&tmp_path).context("creating temp checkpoint file")?;
            tmp_file
                .write_all(content.as_bytes())
                .context("writing temp checkpoint file")?;
            tmp_file.sync_all().context("fsyncing temp checkpoint file")?;
        }
        fs::rename(&tmp_path, &self.path).context("renaming checkpoint into place")?;
        Ok(())
    }

    pub fn mark_run(
        &mut self,
        tier: TierId,
        subtest: SubtestId,
        run: RunNumber,
        status: RunStatus,
    ) -> Result<()> {
        self.checkpoint
            .completed_runs
            .entry(tier)
            .or_default()
            .entry(subtest)
            .or_default()
            .insert(run, status);
        self.save()
    }

    pub fn mark_tier(&mut self, tier: TierId, state: TierState) -> Result<()> {
        self.checkpoint.tier_states.insert(tier, state);
        self.save()
    }

    pub fn mark_experiment(&mut self, state: crate::model::ExperimentState) -> Result<()> {
        self.checkpoint.experiment_state = state;
        self.save()
    }

    pub fn set_best_subtest(&mut self, tier: TierId, subtest: Option<SubtestId>) -> Result<()> {
        self.checkpoint.best_subtest_per_tier.insert(tier, subtest);
        self.save()
    }

    /// Rebuild `completed_runs` by scanning `run_result.json` files under
    /// `experiment_root`, leaving everything else untouched. Idempotent:
    /// running it twice in a row produces the same checkpoint.
    pub fn repair(&mut self, experiment_root: &Path) -> Result<()> {
        let mut rebuilt: BTreeMap<TierId, BTreeMap<SubtestId, BTreeMap<RunNumber, RunStatus>>> =
            BTreeMap::new();
        if experiment_root.is_dir() {
            for tier_entry in fs::read_dir(experiment_root)
                .with_context(|| format!("reading {}", experiment_root.display()))?
            {
                let tier_entry = tier_entry?;
                if !tier_entry.file_type()?.is_dir() {
                    continue;
                }
                let tier_name = tier_entry.file_name().to_string_lossy().into_owned();
                if tier_name == "repos" {
                    continue;
                }
                let tier_id = TierId(tier_name);
                for subtest_entry in fs::read_dir(tier_entry.path())? {
                    let subtest_entry = subtest_entry?;
                    if !subtest_entry.file_type()?.is_dir() {
                        continue;
                    }
                    let subtest_name = subtest_entry.file_name().to_string_lossy().into_owned();
                    if !starts_with_two_digits(&subtest_name) {
                        continue;
                    }
                    let subtest_id = SubtestId(subtest_name);
                    for run_entry in fs::read_dir(subtest_entry.path())? {
                        let run_entry = run_entry?;
                        if !run_entry.file_type()?.is_dir() {
                            continue;
                        }
                        let run_dir_name = run_entry.file_name().to_string_lossy().into_owned();
                        let Some(run_number) = parse_run_dir_name(&run_dir_name) else {
                            continue;
                        };
                        let result_path = run_entry.path().join("run_result.json");
                        if !result_path.is_file() {
                            continue;
                        }
                        let content = fs::read_to_string(&result_path)
                            .with_context(|| format!("reading {}", result_path.display()))?;
                        let result: crate::model::RunResult = serde_json::from_str(&content)
                            .with_context(|| {
                                format!("parsing run result {}", result_path.display())
                            })?;
                        let status = if result.passed {
                            RunStatus::Passed
                        } else {
                            RunStatus::Failed
                        };
                        rebuilt
                            .entry(tier_id.clone())
                            .or_default()
                            .entry(subtest_id.clone())
                            .or_default()
                            .insert(run_number, status);
                    }
                }
            }
        }
        self.checkpoint.completed_runs = rebuilt;
        self.save()
    }
}

fn starts_with_two_digits(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_digit())
        && matches!(chars.next(), Some(c) if c.is_ascii_digit())
}

fn parse_run_dir_name(s: &str) -> Option<RunNumber> {
    let n = s.strip_prefix("run_")?;
    n.parse::<u32>().ok().map(RunNumber)
}

/// RFC 3339 timestamp. The engine never needs sub-second precision for
/// checkpoint bookkeeping, just a monotonically-plausible, human-readable
/// value.
fn now_rfc3339() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", now.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExperimentState;
    use tempfile::TempDir;

    fn fresh_checkpoint() -> Checkpoint {
        Checkpoint::new("exp-1".into(), "hash-1".into(), "0".into())
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        let mut store = CheckpointStore::open_or_create(path.clone(), fresh_checkpoint()).unwrap();
        store
            .mark_run(
                TierId("T0".into()),
                SubtestId("00-empty".into()),
                RunNumber(1),
                RunStatus::Passed,
            )
            .unwrap();

        let loaded = CheckpointStore::load(&path).unwrap().unwrap();
        assert_eq!(
            loaded.run_status(&TierId("T0".into()), &SubtestId("00-empty".into()), RunNumber(1)),
            Some(RunStatus::Passed)
        );
    }

    #[test]
    fn save_load_save_is_a_fixed_point() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        let mut store = CheckpointStore::open_or_create(path.clone(), fresh_checkpoint()).unwrap();
        store.mark_experiment(ExperimentState::Running).unwrap();

        let loaded = CheckpointStore::load(&path).unwrap().unwrap();
        let mut store2 = CheckpointStore::from_existing(path.clone(), loaded);
        store2.save().unwrap();

        let loaded2 = CheckpointStore::load(&path).unwrap().unwrap();
        assert_eq!(loaded2.experiment_state, ExperimentState::Running);
        assert_eq!(loaded2.completed_runs, store2.get().completed_runs);
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        assert!(CheckpointStore::load(&path).unwrap().is_none());
    }

    #[test]
    fn load_corrupt_file_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        fs::write(&path, "not json at all {").unwrap();
        assert!(CheckpointStore::load(&path).is_err());
    }

    #[test]
    fn repair_on_consistent_checkpoint_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("exp");
        let run_dir = root.join("T0").join("00-empty").join("run_01");
        fs::create_dir_all(&run_dir).unwrap();
        let result = sample_run_result();
        fs::write(
            run_dir.join("run_result.json"),
            serde_json::to_string(&result).unwrap(),
        )
        .unwrap();

        let path = root.join("checkpoint.json");
        let mut store = CheckpointStore::open_or_create(path.clone(), fresh_checkpoint()).unwrap();
        store.repair(&root).unwrap();
        let first = store.get().completed_runs.clone();

        store.repair(&root).unwrap();
        let second = store.get().completed_runs.clone();
        assert_eq!(first, second);
        assert_eq!(
            second
                .get(&TierId("T0".into()))
                .unwrap()
                .get(&SubtestId("00-empty".into()))
                .unwrap()
                .get(&RunNumber(1)),
            Some(&RunStatus::Passed)
        );
    }

    fn sample_run_result() -> crate::model::RunResult {
        crate::model::RunResult {
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
            artifact_paths: crate::model::RunArtifactPaths {
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
