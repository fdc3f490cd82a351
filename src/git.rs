//! Low-level git plumbing shared by the Workspace Manager.
//!
//! Shells out to the `git` CLI rather than a library binding: checkouts
//! need to be cancellable mid-command, and the CLI is git's only properly
//! supported "API". This module only deals with plumbing commands
//! (`clone`, `fetch`, `cat-file`, `worktree add/remove`, `rev-parse`,
//! `checkout`); the policy of *which* worktree to create where, and the
//! shared-base-repo lock dance, live in `workspace.rs`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use log::debug;
use tokio::process::Command;

use crate::process::{CommandExt, OutputExt};

/// A bare or working git repository, addressed by the path passed to
/// `git -C`.
#[derive(Debug, Clone)]
pub struct Repo {
    path: PathBuf,
}

impl Repo {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn git(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.path);
        cmd
    }

    /// Full (non-shallow) clone of `url` into `dest`, which must not yet
    /// exist. A shallow base cannot reliably serve arbitrary commits
    /// across experiments, so the one-time full-clone cost is amortized
    /// over every subsequent run (see the Workspace Manager's rationale).
    pub async fn clone_from(url: &str, dest: &Path) -> Result<Self> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating parent dir for clone at {}", dest.display()))?;
        }
        debug!("cloning {} into {}", url, dest.display());
        let mut cmd = Command::new("git");
        cmd.arg("clone").arg(url).arg(dest);
        cmd.execute()
            .await
            .with_context(|| format!("git clone {} into {}", url, dest.display()))?;
        Ok(Self::at(dest.to_path_buf()))
    }

    /// True if `commit` is present in the object store.
    pub async fn has_commit(&self, commit: &str) -> Result<bool> {
        let mut cmd = self.git();
        cmd.args(["cat-file", "-t", commit])
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let status = cmd.status().await.context("running git cat-file")?;
        Ok(status.success())
    }

    /// `git fetch origin <commit>`, used when the base repo's clone
    /// predates a commit we now need to test.
    pub async fn fetch(&self, commit: &str) -> Result<()> {
        let mut cmd = self.git();
        cmd.args(["fetch", "origin", commit]);
        cmd.execute()
            .await
            .with_context(|| format!("git fetch origin {}", commit))?;
        Ok(())
    }

    /// Add a worktree at `worktree_path` on a new branch `branch`. Fails
    /// with an actionable error identifying the conflicting branch when
    /// `branch` already exists (possibly as another worktree), as the
    /// Workspace Manager's contract requires.
    pub async fn add_worktree(&self, worktree_path: &Path, branch: &str) -> Result<()> {
        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("creating parent dir for worktree {}", worktree_path.display())
            })?;
        }
        let mut cmd = self.git();
        cmd.args(["worktree", "add", "-b", branch])
            .arg(worktree_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let output = cmd.output().await.context("spawning git worktree add")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("already exists") {
                return Err(anyhow!(
                    "branch {branch:?} already exists: another worktree is using it \
                     (git says: {})",
                    stderr.trim()
                ));
            }
            return Err(anyhow!(
                "git worktree add failed for branch {branch:?}: {}",
                stderr.trim()
            ));
        }
        Ok(())
    }

    pub async fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        let mut cmd = self.git();
        cmd.args(["worktree", "remove", "--force"]).arg(worktree_path);
        cmd.execute()
            .await
            .with_context(|| format!("git worktree remove {}", worktree_path.display()))?;
        Ok(())
    }

    /// Checkout `commit` inside this repo/worktree. Callers must never
    /// invoke this on the shared base repo itself — only on a worktree.
    pub async fn checkout(&self, commit: &str) -> Result<()> {
        let mut cmd = self.git();
        cmd.args(["checkout", "--force", commit]);
        cmd.execute()
            .await
            .with_context(|| format!("git checkout {}", commit))?;
        Ok(())
    }

    pub async fn rev_parse(&self, rev: &str) -> Result<String> {
        let mut cmd = self.git();
        cmd.args(["rev-parse", rev]);
        let output = cmd.execute().await.context("git rev-parse")?;
        let _ = output.code_not_killed()?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    #[cfg(test)]
    pub async fn init(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let mut cmd = Command::new("git");
        cmd.arg("init").current_dir(path);
        cmd.execute().await.context("git init")?;
        Ok(Self::at(path.to_path_buf()))
    }

    #[cfg(test)]
    pub async fn commit_empty(&self, message: &str) -> Result<String> {
        let mut cmd = self.git();
        cmd.args(["commit", "--allow-empty", "-m", message]);
        cmd.execute().await.context("git commit")?;
        self.rev_parse("HEAD").await
    }
}
