//! Shared data model: identifiers, configuration, results, and the
//! `TokenStats` additive monoid.
//!
//! This module has no behaviour of its own beyond small helpers; it exists
//! so that every other module can agree on one vocabulary for the entities
//! described by the experiment's data model.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Short symbolic tier token, e.g. `T0`. Used verbatim as a directory name,
/// so it must not contain path separators.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierId(pub String);

impl fmt::Display for TierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Two-digit-prefixed subtest id, e.g. `00-empty`. Sortable lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubtestId(pub String);

impl fmt::Display for SubtestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 1-based run number. `Display` zero-pads to two digits for path
/// construction (`run_01`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunNumber(pub u32);

impl fmt::Display for RunNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

impl RunNumber {
    pub fn dir_name(&self) -> String {
        format!("run_{:02}", self.0)
    }
}

/// First 64 bits of SHA-256 of the canonical source repository URL,
/// hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoKey(pub String);

impl RepoKey {
    pub fn from_url(url: &str) -> Self {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(url.as_bytes());
        let mut hex = String::with_capacity(16);
        for byte in &digest[..8] {
            hex.push_str(&format!("{:02x}", byte));
        }
        Self(hex)
    }
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `"{TierId}_{SubtestId}"`, unique across the experiment. Used as a git
/// worktree branch name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchName(pub String);

impl BranchName {
    pub fn new(tier: &TierId, subtest: &SubtestId) -> Self {
        Self(format!("{}_{}", tier.0, subtest.0))
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable-after-start experiment configuration. Persisted verbatim into
/// the experiment root as `experiment.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub source_repo_url: String,
    pub source_commit: String,
    pub tiers: Vec<TierId>,
    /// `None` means "all subtests discovered for each tier".
    pub subtests: Option<Vec<SubtestId>>,
    pub runs_per_subtest: u32,
    pub agent_model: String,
    pub judge_models: Vec<String>,
    pub per_run_timeout_secs: u64,
    pub parallelism_cap: usize,
    pub results_root: PathBuf,
    #[serde(default = "default_tie_break_threshold")]
    pub tie_break_threshold: f64,
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f64,
    /// Maximum pairwise absolute judge-score difference above which a
    /// run's consensus is flagged `high_disagreement` (not a failure).
    #[serde(default = "default_disagreement_threshold")]
    pub disagreement_threshold: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_tie_break_threshold() -> f64 {
    0.05
}

fn default_pass_threshold() -> f64 {
    0.60
}

fn default_disagreement_threshold() -> f64 {
    0.3
}

fn default_max_retries() -> u32 {
    3
}

impl ExperimentConfig {
    /// `runs_per_subtest` must be >= 1 and `judge_models` must be non-empty;
    /// both are invariants of the data model, not merely CLI validation.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.runs_per_subtest < 1 {
            anyhow::bail!("runs_per_subtest must be >= 1");
        }
        if self.judge_models.is_empty() {
            anyhow::bail!("at least one judge model is required");
        }
        if self.tiers.is_empty() {
            anyhow::bail!("at least one tier is required");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExperimentState {
    Pending,
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TierState {
    Pending,
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Passed,
    Failed,
    AgentComplete,
    JudgeComplete,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Passed | RunStatus::Failed)
    }
}

/// Additive monoid: element-wise `+` with a zero element. Used to aggregate
/// agent token usage across runs/subtests/tiers/the experiment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenStats {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_creation: u64,
}

impl Add for TokenStats {
    type Output = TokenStats;
    fn add(self, rhs: TokenStats) -> TokenStats {
        TokenStats {
            input: self.input + rhs.input,
            output: self.output + rhs.output,
            cache_read: self.cache_read + rhs.cache_read,
            cache_creation: self.cache_creation + rhs.cache_creation,
        }
    }
}

impl AddAssign for TokenStats {
    fn add_assign(&mut self, rhs: TokenStats) {
        *self = *self + rhs;
    }
}

impl TokenStats {
    pub fn total(&self) -> u64 {
        self.input + self.output + self.cache_read + self.cache_creation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Grade {
    S,
    A,
    B,
    C,
    D,
    F,
}

/// Error taxonomy tag attached to a finalized run when it did not pass
/// cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorTag {
    AgentFailed,
    AgentTimeout,
    AgentRateLimited,
    JudgeFailed,
    JudgeParseError,
    WorkspaceSetupFailed,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionScore {
    pub score: f64,
    pub explanation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Judgment {
    pub score: f64,
    pub passed: bool,
    pub grade: Grade,
    pub reasoning: String,
    pub criteria_scores: BTreeMap<String, CriterionScore>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusJudgment {
    pub score: f64,
    pub passed: bool,
    pub grade: Grade,
    pub criteria_scores: BTreeMap<String, CriterionScore>,
    pub high_disagreement: bool,
    pub valid_judge_count: usize,
    pub total_judge_count: usize,
}

/// Finalized per-run record. Never mutated after being written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub tier: TierId,
    pub subtest: SubtestId,
    pub run: RunNumber,
    pub agent_exit_code: Option<i32>,
    pub token_stats: TokenStats,
    pub cost_usd: f64,
    pub cost_estimated: bool,
    pub agent_duration_secs: f64,
    pub judge_duration_secs: f64,
    pub total_duration_secs: f64,
    pub judgments: Vec<Option<Judgment>>,
    pub consensus: Option<ConsensusJudgment>,
    pub passed: bool,
    pub grade: Option<Grade>,
    pub criteria_scores: BTreeMap<String, CriterionScore>,
    pub agent_ran: bool,
    pub artifact_paths: RunArtifactPaths,
    pub error: Option<ErrorDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub tag: ErrorTag,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunArtifactPaths {
    pub task_prompt: PathBuf,
    pub agent_dir: PathBuf,
    pub judge_dir: PathBuf,
    pub run_result: PathBuf,
    pub report_md: PathBuf,
    pub report_json: PathBuf,
}

/// N runs of one subtest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtestResult {
    pub subtest: SubtestId,
    pub runs: Vec<RunResult>,
    pub median_score: f64,
    pub pass_rate: f64,
    pub token_stats: TokenStats,
    pub cost_usd: f64,
    pub total_duration_secs: f64,
    pub report_path: PathBuf,
}

/// K subtests of one tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierResult {
    pub tier: TierId,
    pub subtests: BTreeMap<SubtestId, SubtestResult>,
    pub best_subtest: Option<SubtestId>,
    pub report_path: PathBuf,
}

/// Standard median: mean of the two middle values when the count is even.
/// Returns 0.0 for an empty slice (callers only invoke this on non-empty
/// sets of scores in practice, but the degenerate case must not panic).
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("NaN score"));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_stats_monoid_laws() {
        let zero = TokenStats::default();
        let a = TokenStats {
            input: 1,
            output: 2,
            cache_read: 3,
            cache_creation: 4,
        };
        let b = TokenStats {
            input: 5,
            output: 6,
            cache_read: 7,
            cache_creation: 8,
        };
        // identity
        assert_eq!(a + zero, a);
        assert_eq!(zero + a, a);
        // commutative
        assert_eq!(a + b, b + a);
        // associative
        let c = TokenStats {
            input: 9,
            output: 10,
            cache_read: 11,
            cache_creation: 12,
        };
        assert_eq!((a + b) + c, a + (b + c));
    }

    #[test]
    fn median_odd_and_even() {
        assert_eq!(median(&[0.5]), 0.5);
        assert_eq!(median(&[0.2, 0.8]), 0.5);
        assert_eq!(median(&[0.1, 0.5, 0.9]), 0.5);
        assert_eq!(median(&[0.1, 0.3, 0.7, 0.9]), 0.5);
    }

    #[test]
    fn median_empty_is_zero() {
        assert_eq!(median(&[]), 0.0);
    }

    #[test]
    fn branch_name_format() {
        let b = BranchName::new(&TierId("T0".into()), &SubtestId("00-empty".into()));
        assert_eq!(b.0, "T0_00-empty");
    }

    #[test]
    fn run_number_dir_name_zero_pads() {
        assert_eq!(RunNumber(1).dir_name(), "run_01");
        assert_eq!(RunNumber(12).dir_name(), "run_12");
    }

    #[test]
    fn repo_key_is_deterministic_and_16_hex_chars() {
        let a = RepoKey::from_url("https://example.com/repo.git");
        let b = RepoKey::from_url("https://example.com/repo.git");
        assert_eq!(a, b);
        assert_eq!(a.0.len(), 16);
    }
}
