//! Hierarchical Reporter (C9): JSON + Markdown reports at run, subtest,
//! tier, and experiment levels.
//!
//! Every non-leaf report is written in memory, fully, before it touches
//! disk — the atomic-rename pattern from `checkpoint.rs` is reused here so
//! a crash mid-aggregation can never leave a partially-written report
//! behind. JSON is produced by `serde_json::to_string_pretty` over
//! `#[derive(Serialize)]` structs, which is deterministic given a
//! deterministic serializer, so regenerating all reports from the same
//! `RunResult` files is idempotent and byte-identical.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::model::{RunResult, SubtestResult, TierResult, TokenStats};

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("tmp")
    ));
    fs::write(&tmp, content).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value).context("serializing report")?;
    write_atomic(path, &content)
}

/// One run's report: `report.json` (the `RunResult` verbatim) and
/// `report.md` (a short human summary, no children to link since a run is
/// a leaf of the report hierarchy).
pub fn write_run_report(run_dir: &Path, result: &RunResult) -> Result<()> {
    write_json(&run_dir.join("report.json"), result)?;

    let mut md = String::new();
    writeln!(md, "# Run {} / {} / {}", result.tier, result.subtest, result.run).ok();
    writeln!(md).ok();
    writeln!(md, "- **passed**: {}", result.passed).ok();
    if let Some(grade) = result.grade {
        writeln!(md, "- **grade**: {:?}", grade).ok();
    }
    if let Some(consensus) = &result.consensus {
        writeln!(md, "- **score**: {:.3}", consensus.score).ok();
        if consensus.high_disagreement {
            writeln!(md, "- **high disagreement among judges**").ok();
        }
    }
    writeln!(
        md,
        "- **tokens**: input={} output={} cache_read={} cache_creation={}",
        result.token_stats.input,
        result.token_stats.output,
        result.token_stats.cache_read,
        result.token_stats.cache_creation
    )
    .ok();
    writeln!(
        md,
        "- **cost**: ${:.4}{}",
        result.cost_usd,
        if result.cost_estimated { " (estimated)" } else { "" }
    )
    .ok();
    writeln!(md, "- **agent ran this invocation**: {}", result.agent_ran).ok();
    if let Some(error) = &result.error {
        writeln!(md, "- **error**: `{:?}`: {}", error.tag, error.message).ok();
    }
    writeln!(md).ok();
    writeln!(md, "[task prompt](task_prompt.md) · [agent artifacts](agent/) · [judge artifacts](judge/)").ok();

    write_atomic(&run_dir.join("report.md"), &md)
}

/// A subtest's report: the aggregated `SubtestResult` plus a relative link
/// to every run report, and the best (highest-scoring, passed) run
/// emphasized in the Markdown table in bold/italic rather than a
/// duplicated "Best" column.
pub fn write_subtest_report(subtest_dir: &Path, result: &SubtestResult) -> Result<()> {
    write_json(&subtest_dir.join("report.json"), result)?;

    let best_run = result
        .runs
        .iter()
        .filter(|r| r.passed)
        .max_by(|a, b| {
            let sa = a.consensus.as_ref().map(|c| c.score).unwrap_or(0.0);
            let sb = b.consensus.as_ref().map(|c| c.score).unwrap_or(0.0);
            sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|r| r.run);

    let mut md = String::new();
    writeln!(md, "# Subtest {}", result.subtest).ok();
    writeln!(md).ok();
    writeln!(md, "- **median score**: {:.3}", result.median_score).ok();
    writeln!(md, "- **pass rate**: {:.0}%", result.pass_rate * 100.0).ok();
    writeln!(md, "- **total cost**: ${:.4}", result.cost_usd).ok();
    writeln!(md, "- **total duration**: {:.1}s", result.total_duration_secs).ok();
    writeln!(md).ok();
    writeln!(md, "| Run | Passed | Score | Grade | Cost |").ok();
    writeln!(md, "|---|---|---|---|---|").ok();
    for run in &result.runs {
        let score = run.consensus.as_ref().map(|c| c.score).unwrap_or(0.0);
        let grade = run
            .grade
            .map(|g| format!("{:?}", g))
            .unwrap_or_else(|| "-".to_string());
        let is_best = Some(run.run) == best_run;
        let (open, close) = if is_best { ("**", "**") } else { ("", "") };
        writeln!(
            md,
            "| [{open}{}{close}]({}/report.md) | {} | {open}{:.3}{close} | {} | ${:.4} |",
            run.run,
            run.run.dir_name(),
            run.passed,
            score,
            grade,
            run.cost_usd
        )
        .ok();
    }

    write_atomic(&subtest_dir.join("report.md"), &md)
}

/// A tier's report: the map of `SubtestResult`s plus a pointer to the best
/// subtest (by median score, §4.5's tie-break rule) and a relative link
/// to every subtest report.
pub fn write_tier_report(tier_dir: &Path, result: &TierResult) -> Result<()> {
    write_json(&tier_dir.join("report.json"), result)?;
    write_json(
        &tier_dir.join("best_subtest.json"),
        &BestSubtest {
            best_subtest: result.best_subtest.clone(),
        },
    )?;

    let mut md = String::new();
    writeln!(md, "# Tier {}", result.tier).ok();
    writeln!(md).ok();
    writeln!(md, "| Subtest | Median score | Pass rate | Tokens | Cost |").ok();
    writeln!(md, "|---|---|---|---|---|").ok();
    for (id, subtest) in &result.subtests {
        let is_best = Some(id) == result.best_subtest.as_ref();
        let (open, close) = if is_best { ("**", "**") } else { ("", "") };
        writeln!(
            md,
            "| [{open}{}{close}]({}/report.md) | {open}{:.3}{close} | {:.0}% | {} | ${:.4} |",
            id,
            id,
            subtest.median_score,
            subtest.pass_rate * 100.0,
            subtest.token_stats.total(),
            subtest.cost_usd
        )
        .ok();
    }
    if result.subtests.is_empty() {
        writeln!(md, "_no subtests configured for this tier_").ok();
    }

    write_atomic(&tier_dir.join("report.md"), &md)
}

#[derive(Serialize)]
struct BestSubtest {
    best_subtest: Option<crate::model::SubtestId>,
}

/// The top-level experiment report: an aggregate over every tier's
/// aggregate, plus a relative link to every tier report, plus a callout
/// for any tier that finished `FAILED` (partial-failure semantics are
/// surfaced here, since `experiment_state = COMPLETE` alone tells an
/// operator nothing about which tiers actually succeeded).
pub fn write_experiment_report(
    experiment_root: &Path,
    experiment_id: &str,
    tier_results: &[TierResult],
    tier_states: &std::collections::BTreeMap<crate::model::TierId, crate::model::TierState>,
) -> Result<()> {
    let report = ExperimentReport {
        experiment_id: experiment_id.to_string(),
        tiers: tier_results
            .iter()
            .map(|t| t.tier.clone())
            .collect(),
        token_stats: tier_results
            .iter()
            .flat_map(|t| t.subtests.values())
            .fold(TokenStats::default(), |acc, s| acc + s.token_stats),
        cost_usd: tier_results
            .iter()
            .flat_map(|t| t.subtests.values())
            .map(|s| s.cost_usd)
            .sum(),
    };
    write_json(&experiment_root.join("report.json"), &report)?;

    let mut md = String::new();
    writeln!(md, "# Experiment {}", experiment_id).ok();
    writeln!(md).ok();
    writeln!(md, "| Tier | State | Best subtest | Median score | Pass rate |").ok();
    writeln!(md, "|---|---|---|---|---|").ok();
    for tier in tier_results {
        let state = tier_states
            .get(&tier.tier)
            .map(|s| format!("{:?}", s))
            .unwrap_or_else(|| "?".to_string());
        let best = tier
            .best_subtest
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        let best_result = tier.best_subtest.as_ref().and_then(|id| tier.subtests.get(id));
        let median = best_result.map(|s| format!("{:.3}", s.median_score)).unwrap_or_else(|| "-".into());
        let pass_rate = best_result
            .map(|s| format!("{:.0}%", s.pass_rate * 100.0))
            .unwrap_or_else(|| "-".into());
        writeln!(
            md,
            "| [{}]({}/report.md) | {} | {} | {} | {} |",
            tier.tier, tier.tier, state, best, median, pass_rate
        )
        .ok();
    }
    writeln!(md).ok();
    writeln!(md, "Total cost: ${:.4}", report.cost_usd).ok();

    write_atomic(&experiment_root.join("report.md"), &md)
}

#[derive(Serialize)]
struct ExperimentReport {
    experiment_id: String,
    tiers: Vec<crate::model::TierId>,
    token_stats: TokenStats,
    cost_usd: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ConsensusJudgment, Grade, RunArtifactPaths, RunNumber, SubtestId, TierId, TierState,
    };
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn sample_run(n: u32, passed: bool, score: f64) -> RunResult {
        RunResult {
            tier: TierId("T0".into()),
            subtest: SubtestId("00-empty".into()),
            run: RunNumber(n),
            agent_exit_code: Some(0),
            token_stats: Default::default(),
            cost_usd: 0.01,
            cost_estimated: false,
            agent_duration_secs: 1.0,
            judge_duration_secs: 1.0,
            total_duration_secs: 2.0,
            judgments: vec![],
            consensus: Some(ConsensusJudgment {
                score,
                passed,
                grade: Grade::B,
                criteria_scores: Default::default(),
                high_disagreement: false,
                valid_judge_count: 1,
                total_judge_count: 1,
            }),
            passed,
            grade: Some(Grade::B),
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

    #[test]
    fn run_report_links_resolve() {
        let dir = TempDir::new().unwrap();
        let run_dir = dir.path().join("run_01");
        fs::create_dir_all(&run_dir).unwrap();
        let result = sample_run(1, true, 0.9);
        write_run_report(&run_dir, &result).unwrap();
        assert!(run_dir.join("report.json").is_file());
        assert!(run_dir.join("report.md").is_file());
    }

    #[test]
    fn subtest_report_bolds_best_run() {
        let dir = TempDir::new().unwrap();
        let subtest_dir = dir.path().join("00-empty");
        fs::create_dir_all(&subtest_dir).unwrap();
        let runs = vec![sample_run(1, true, 0.7), sample_run(2, true, 0.9)];
        let result = crate::orchestrator::aggregate_subtest(
            SubtestId("00-empty".into()),
            runs,
            &subtest_dir,
        );
        write_subtest_report(&subtest_dir, &result).unwrap();
        let md = fs::read_to_string(subtest_dir.join("report.md")).unwrap();
        assert!(md.contains("**2**"), "best run should be bolded: {md}");
    }

    #[test]
    fn experiment_report_idempotent_byte_identical() {
        let dir = TempDir::new().unwrap();
        let tier_dir = dir.path().join("T0");
        fs::create_dir_all(&tier_dir).unwrap();

        let mut subtests = BTreeMap::new();
        let runs = vec![sample_run(1, true, 0.9)];
        let subtest_result = crate::orchestrator::aggregate_subtest(
            SubtestId("00-empty".into()),
            runs,
            &tier_dir.join("00-empty"),
        );
        subtests.insert(SubtestId("00-empty".into()), subtest_result);
        let tier_result = TierResult {
            tier: TierId("T0".into()),
            subtests,
            best_subtest: Some(SubtestId("00-empty".into())),
            report_path: tier_dir.join("report.json"),
        };

        let mut tier_states = BTreeMap::new();
        tier_states.insert(TierId("T0".into()), TierState::Complete);

        write_experiment_report(dir.path(), "exp-1", &[tier_result.clone()], &tier_states).unwrap();
        let first = fs::read_to_string(dir.path().join("report.json")).unwrap();

        write_experiment_report(dir.path(), "exp-1", &[tier_result], &tier_states).unwrap();
        let second = fs::read_to_string(dir.path().join("report.json")).unwrap();

        assert_eq!(first, second);
    }
}
