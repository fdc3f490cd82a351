//! Judge Pipeline (C5): the judge client interface (external collaborator)
//! plus the consensus/disagreement logic that is squarely part of the
//! engine.
//!
//! Paths, not inlined content, are passed to judges — this module never
//! reads `output.txt` itself, it only forwards the path. Fan-out and the
//! reprompt-once-on-parse-failure policy live in `run_executor.rs`
//! (`reuse_or_run_judges`/`invoke_one_judge`), since each judge also needs
//! its own artifact directory written alongside the invocation; a single
//! judge failing there never cancels the others, so consensus can proceed
//! with fewer valid judges.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::model::{median, ConsensusJudgment, CriterionScore, Grade, Judgment};
use crate::process::execute_with_stdin;

/// Error returned by a judge client invocation. Parse failures are
/// distinguished from transport/availability failures because they are
/// handled differently (reprompt-once, then drop the judge from
/// consensus).
#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("judge response could not be parsed: {0}")]
    Parse(String),
    #[error("judge invocation failed: {0}")]
    Invocation(#[from] anyhow::Error),
}

/// Function takes a model id + composed prompt + timeout, returns a JSON
/// object conforming to the judgment schema.
#[async_trait]
pub trait JudgeClient: Send + Sync {
    async fn judge(
        &self,
        model: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<Judgment, JudgeError>;
}

/// Paths forwarded to every judge invocation, substituted into the
/// judge system prompt template written once at the experiment root.
pub struct JudgeInputs<'a> {
    pub prompt_md: &'a Path,
    pub criteria_md: &'a Path,
    pub rubric_yaml: &'a Path,
    pub agent_output_txt: &'a Path,
    pub workspace: &'a Path,
}

pub fn substitute_judge_prompt(template: &str, inputs: &JudgeInputs<'_>) -> String {
    template
        .replace("{{prompt_md}}", &inputs.prompt_md.to_string_lossy())
        .replace("{{criteria_md}}", &inputs.criteria_md.to_string_lossy())
        .replace("{{rubric_yaml}}", &inputs.rubric_yaml.to_string_lossy())
        .replace(
            "{{agent_output_txt}}",
            &inputs.agent_output_txt.to_string_lossy(),
        )
        .replace("{{workspace}}", &inputs.workspace.to_string_lossy())
}

/// Consensus rule: score = median of valid judge scores; `passed` = the
/// majority vote over valid judges, ties resolving to `passed=true` iff
/// the median is at least `pass_threshold`; per-criterion aggregation is
/// an element-wise median. Returns `None` only when there are zero valid
/// judges (all parsed or all failed).
pub fn compute_consensus(
    judgments: &[Option<Judgment>],
    pass_threshold: f64,
    disagreement_threshold: f64,
) -> Option<ConsensusJudgment> {
    let valid: Vec<&Judgment> = judgments.iter().filter_map(|j| j.as_ref()).collect();
    if valid.is_empty() {
        return None;
    }

    let scores: Vec<f64> = valid.iter().map(|j| j.score).collect();
    let score = median(&scores);

    let pass_votes = valid.iter().filter(|j| j.passed).count();
    let fail_votes = valid.len() - pass_votes;
    let passed = match pass_votes.cmp(&fail_votes) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => score >= pass_threshold,
    };

    let grade = grade_for_score(score);

    let mut criteria_names: Vec<&String> = valid
        .iter()
        .flat_map(|j| j.criteria_scores.keys())
        .unique()
        .collect();
    criteria_names.sort();
    let mut criteria_scores = BTreeMap::new();
    for name in criteria_names {
        let values: Vec<f64> = valid
            .iter()
            .filter_map(|j| j.criteria_scores.get(name).map(|c| c.score))
            .collect();
        let explanations: Vec<&str> = valid
            .iter()
            .filter_map(|j| j.criteria_scores.get(name).map(|c| c.explanation.as_str()))
            .collect();
        criteria_scores.insert(
            name.clone(),
            CriterionScore {
                score: median(&values),
                explanation: explanations.first().unwrap_or(&"").to_string(),
            },
        );
    }

    let max_pairwise_diff = scores
        .iter()
        .enumerate()
        .flat_map(|(i, a)| scores[i + 1..].iter().map(move |b| (a - b).abs()))
        .fold(0.0_f64, f64::max);

    Some(ConsensusJudgment {
        score,
        passed,
        grade,
        criteria_scores,
        high_disagreement: max_pairwise_diff > disagreement_threshold,
        valid_judge_count: valid.len(),
        total_judge_count: judgments.len(),
    })
}

fn grade_for_score(score: f64) -> Grade {
    if score >= 0.95 {
        Grade::S
    } else if score >= 0.85 {
        Grade::A
    } else if score >= 0.70 {
        Grade::B
    } else if score >= 0.55 {
        Grade::C
    } else if score >= 0.40 {
        Grade::D
    } else {
        Grade::F
    }
}

/// Given a tier's subtest results and token totals, select the best
/// subtest: compare median scores, and within `tie_threshold` prefer the
/// subtest with lower total tokens; an exact token tie breaks to the
/// lexicographically smaller subtest id. No additional model invocation
/// is needed.
pub fn select_best_subtest<'a>(
    candidates: &'a [(crate::model::SubtestId, f64, u64)],
    tie_threshold: f64,
) -> Option<&'a crate::model::SubtestId> {
    let best_score = candidates
        .iter()
        .map(|(_, score, _)| *score)
        .fold(f64::NEG_INFINITY, f64::max);
    if !best_score.is_finite() {
        return None;
    }

    // Every candidate within tie_threshold of the best score is "tied";
    // among those, lower total tokens wins, and an exact token tie breaks
    // to the lexicographically smaller subtest id.
    candidates
        .iter()
        .filter(|(_, score, _)| (best_score - score).abs() <= tie_threshold)
        .min_by(|(id_a, _, tokens_a), (id_b, _, tokens_b)| {
            tokens_a.cmp(tokens_b).then_with(|| id_a.cmp(id_b))
        })
        .map(|(id, _, _)| id)
}

/// Shells out to an arbitrary external judge CLI, feeding it the composed
/// prompt over stdin (a program/args split, the same shape
/// `agent::ShellAgent` uses) and expecting a JSON object on stdout
/// conforming to `Judgment`'s shape.
pub struct ShellJudge {
    pub program: PathBuf,
    pub args: Vec<String>,
}

#[async_trait]
impl JudgeClient for ShellJudge {
    async fn judge(
        &self,
        model: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<Judgment, JudgeError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg("--model").arg(model);

        let output = tokio::time::timeout(timeout, execute_with_stdin(&mut cmd, prompt.as_bytes()))
            .await
            .map_err(|_| JudgeError::Invocation(anyhow::anyhow!("judge invocation timed out")))?
            .map_err(JudgeError::Invocation)?;

        if !output.status.success() {
            return Err(JudgeError::Invocation(anyhow::anyhow!(
                "judge exited with {:?}: {}",
                output.status,
                String::from_utf8_lossy(&output.stdout)
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| JudgeError::Parse(format!("{e}: {}", String::from_utf8_lossy(&output.stdout))))
    }
}

/// Deterministic scripted behaviour for the engine's own test suite,
/// mirroring `agent::MockAgent`: returns a queued outcome on each call,
/// repeating the final entry once the queue is exhausted.
pub enum ScriptedJudgment {
    Judgment(Judgment),
    ParseFailure,
    InvocationFailure(String),
}

pub struct MockJudge {
    outcomes: Vec<ScriptedJudgment>,
    call_count: Arc<AtomicUsize>,
}

impl MockJudge {
    pub fn new(outcomes: Vec<ScriptedJudgment>) -> Self {
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
impl JudgeClient for MockJudge {
    async fn judge(
        &self,
        _model: &str,
        _prompt: &str,
        _timeout: Duration,
    ) -> Result<Judgment, JudgeError> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        match self
            .outcomes
            .get(idx)
            .or_else(|| self.outcomes.last())
            .expect("MockJudge configured with no outcomes")
        {
            ScriptedJudgment::Judgment(j) => Ok(j.clone()),
            ScriptedJudgment::ParseFailure => Err(JudgeError::Parse("mock parse failure".into())),
            ScriptedJudgment::InvocationFailure(msg) => {
                Err(JudgeError::Invocation(anyhow::anyhow!(msg.clone())))
            }
        }
    }
}
