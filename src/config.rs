//! Fixture and experiment configuration loading.
//!
//! `ExperimentConfig` (model.rs) is persisted verbatim as `experiment.json`
//! via `serde_json`. The fixture directory's own files (`prompt.md`,
//! `criteria.md`, `rubric.yaml`) are read as plain text / `serde_yaml`,
//! via the same `Context`-wrapped `fs::read_to_string` pattern used for
//! every other on-disk load in this crate.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::ExperimentConfig;

/// The three uniform-across-all-runs fixture files that live at the top
/// of a fixture directory, alongside the per-tier/subtest tree.
pub struct FixtureFiles {
    pub prompt_md: String,
    pub criteria_md: String,
    pub rubric_yaml: String,
}

pub fn load_fixture_files(fixture_dir: &Path) -> Result<FixtureFiles> {
    Ok(FixtureFiles {
        prompt_md: read_required(fixture_dir, "prompt.md")?,
        criteria_md: read_required(fixture_dir, "criteria.md")?,
        rubric_yaml: read_required(fixture_dir, "rubric.yaml")?,
    })
}

fn read_required(fixture_dir: &Path, name: &str) -> Result<String> {
    let path = fixture_dir.join(name);
    fs::read_to_string(&path).with_context(|| format!("reading fixture file {}", path.display()))
}

/// The judge system prompt template, written once at experiment root as
/// `judge_prompt.md`. A reasonable default is shipped so experiments can
/// start without an operator hand-authoring one; an experiment root that
/// already has one keeps it untouched across re-invocations (§4.8 step 2:
/// "persist ... if not present").
pub const DEFAULT_JUDGE_PROMPT_TEMPLATE: &str = "\
You are grading a coding agent's attempt at the task described below.

Task prompt: {{prompt_md}}
Grading criteria: {{criteria_md}}
Rubric: {{rubric_yaml}}
Agent's final output: {{agent_output_txt}}
Resulting workspace: {{workspace}}

Read the files above and respond with a single JSON object of the form:
{\"score\": <0..1>, \"passed\": <bool>, \"grade\": \"S|A|B|C|D|F\", \
\"reasoning\": \"...\", \"criteria_scores\": {\"<criterion>\": {\"score\": <0..1>, \"explanation\": \"...\"}}}
";

/// Ensure `experiment.json`, `prompt.md`, `criteria.md`, `rubric.yaml`, and
/// `judge_prompt.md` exist at `experiment_root`, persisting the given
/// config/fixture contents the first time and leaving them untouched on
/// subsequent invocations (re-entry must not silently change an
/// in-flight experiment's inputs).
pub fn persist_experiment_root_files(
    experiment_root: &Path,
    config: &ExperimentConfig,
    fixture: &FixtureFiles,
) -> Result<()> {
    fs::create_dir_all(experiment_root)
        .with_context(|| format!("creating experiment root {}", experiment_root.display()))?;

    write_if_absent(
        &experiment_root.join("experiment.json"),
        &serde_json::to_string_pretty(config)?,
    )?;
    write_if_absent(&experiment_root.join("prompt.md"), &fixture.prompt_md)?;
    write_if_absent(&experiment_root.join("criteria.md"), &fixture.criteria_md)?;
    write_if_absent(&experiment_root.join("rubric.yaml"), &fixture.rubric_yaml)?;
    write_if_absent(
        &experiment_root.join("judge_prompt.md"),
        DEFAULT_JUDGE_PROMPT_TEMPLATE,
    )?;
    Ok(())
}

fn write_if_absent(path: &Path, content: &str) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    fs::write(path, content).with_context(|| format!("writing {}", path.display()))
}

pub fn load_experiment_config(experiment_root: &Path) -> Result<ExperimentConfig> {
    let path = experiment_root.join("experiment.json");
    let content =
        fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

pub fn load_judge_prompt_template(experiment_root: &Path) -> Result<String> {
    let path = experiment_root.join("judge_prompt.md");
    fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
}

/// A stable hash of the config's content, used as `Checkpoint::config_hash`
/// so a resumed experiment can be sanity-checked against configuration
/// drift: `ExperimentConfig` is meant to be immutable after a run starts,
/// and this hash is the cheap way to notice a caller violated that.
pub fn config_hash(config: &ExperimentConfig) -> Result<String> {
    use sha2::{Digest, Sha256};
    let canonical = serde_json::to_vec(config).context("serializing config for hashing")?;
    let digest = Sha256::digest(&canonical);
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Deserializes the overrides a CLI invocation may layer onto a fixture's
/// defaults; kept distinct from `ExperimentConfig` itself so `main.rs` can
/// build one value from scattered `clap` fields without contaminating the
/// persisted, immutable config type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverrides {
    pub tiers: Option<Vec<String>>,
    pub runs: Option<u32>,
    pub parallel: Option<usize>,
    pub model: Option<String>,
    pub judge_models: Option<Vec<String>>,
    pub timeout_secs: Option<u64>,
    pub max_subtests: Option<usize>,
    pub disagreement_threshold: Option<f64>,
}

/// Layer CLI-supplied overrides onto a base config, each field winning
/// only when present. `max_subtests` isn't part of `ExperimentConfig`
/// (it's a discovery-time cap the runner applies itself, not a persisted
/// experiment input), so it's returned separately.
pub fn apply_overrides(mut base: ExperimentConfig, overrides: &ConfigOverrides) -> ExperimentConfig {
    if let Some(tiers) = &overrides.tiers {
        base.tiers = tiers
            .iter()
            .cloned()
            .map(crate::model::TierId)
            .collect();
    }
    if let Some(runs) = overrides.runs {
        base.runs_per_subtest = runs;
    }
    if let Some(parallel) = overrides.parallel {
        base.parallelism_cap = parallel;
    }
    if let Some(model) = &overrides.model {
        base.agent_model = model.clone();
    }
    if let Some(judge_models) = &overrides.judge_models {
        base.judge_models = judge_models.clone();
    }
    if let Some(timeout_secs) = overrides.timeout_secs {
        base.per_run_timeout_secs = timeout_secs;
    }
    if let Some(disagreement_threshold) = overrides.disagreement_threshold {
        base.disagreement_threshold = disagreement_threshold;
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TierId;
    use tempfile::TempDir;

    fn sample_config(results_root: PathBuf) -> ExperimentConfig {
        ExperimentConfig {
            source_repo_url: "https://example.com/repo.git".into(),
            source_commit: "deadbeef".into(),
            tiers: vec![TierId("T0".into())],
            subtests: None,
            runs_per_subtest: 2,
            agent_model: "mock".into(),
            judge_models: vec!["mock".into()],
            per_run_timeout_secs: 60,
            parallelism_cap: 2,
            results_root,
            tie_break_threshold: 0.05,
            pass_threshold: 0.60,
            disagreement_threshold: 0.3,
            max_retries: 3,
        }
    }

    #[test]
    fn persist_is_idempotent_and_leaves_existing_files_untouched() {
        let dir = TempDir::new().unwrap();
        let config = sample_config(dir.path().to_path_buf());
        let fixture = FixtureFiles {
            prompt_md: "do the task".into(),
            criteria_md: "criteria".into(),
            rubric_yaml: "rubric: {}".into(),
        };
        persist_experiment_root_files(dir.path(), &config, &fixture).unwrap();
        fs::write(dir.path().join("prompt.md"), "mutated by hand").unwrap();
        persist_experiment_root_files(dir.path(), &config, &fixture).unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("prompt.md")).unwrap(),
            "mutated by hand"
        );
        assert!(dir.path().join("judge_prompt.md").exists());
    }

    #[test]
    fn config_hash_is_deterministic() {
        let config = sample_config(PathBuf::from("/tmp/results"));
        assert_eq!(config_hash(&config).unwrap(), config_hash(&config).unwrap());
    }

    #[test]
    fn load_experiment_config_round_trips() {
        let dir = TempDir::new().unwrap();
        let config = sample_config(dir.path().to_path_buf());
        let fixture = FixtureFiles {
            prompt_md: "p".into(),
            criteria_md: "c".into(),
            rubric_yaml: "r: {}".into(),
        };
        persist_experiment_root_files(dir.path(), &config, &fixture).unwrap();
        let loaded = load_experiment_config(dir.path()).unwrap();
        assert_eq!(loaded.source_commit, config.source_commit);
    }

    #[test]
    fn apply_overrides_only_touches_present_fields() {
        let base = sample_config(PathBuf::from("/tmp/results"));
        let overrides = ConfigOverrides {
            runs: Some(5),
            ..Default::default()
        };
        let merged = apply_overrides(base.clone(), &overrides);
        assert_eq!(merged.runs_per_subtest, 5);
        assert_eq!(merged.agent_model, base.agent_model);
        assert_eq!(merged.tiers, base.tiers);
    }

    #[test]
    fn apply_overrides_replaces_tiers_and_judge_models() {
        let base = sample_config(PathBuf::from("/tmp/results"));
        let overrides = ConfigOverrides {
            tiers: Some(vec!["T1".into(), "T2".into()]),
            judge_models: Some(vec!["judge-a".into(), "judge-b".into()]),
            ..Default::default()
        };
        let merged = apply_overrides(base, &overrides);
        assert_eq!(merged.tiers, vec![TierId("T1".into()), TierId("T2".into())]);
        assert_eq!(merged.judge_models, vec!["judge-a", "judge-b"]);
    }
}
