//! Workspace Manager (C2): a shared base-repo cache plus per-subtest
//! worktrees.
//!
//! Each subtest gets a *persistent*, named-branch worktree shared by all
//! runs of that subtest, rather than one created and torn down per run —
//! it needs to survive across runs and be inspectable afterward. The
//! at-most-one-clone-per-repo guarantee is provided by
//! `lockfile::FileLock`, the same primitive used for the experiment-root
//! lock.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;

use crate::git::Repo;
use crate::lockfile::FileLock;
use crate::model::{BranchName, RepoKey, SubtestId, TierId};

/// Owns the `<results_root>/repos/` directory: the shared base-repo
/// caches, one per `RepoKey`.
pub struct WorkspaceManager {
    results_root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(results_root: PathBuf) -> Self {
        Self { results_root }
    }

    fn repos_dir(&self) -> PathBuf {
        self.results_root.join("repos")
    }

    fn base_repo_dir(&self, key: &RepoKey) -> PathBuf {
        self.repos_dir().join(&key.0)
    }

    fn lock_path(&self, key: &RepoKey) -> PathBuf {
        self.repos_dir().join(format!(".{}.lock", key.0))
    }

    /// Ensure the shared base repository for `url` exists locally and has
    /// `commit` available. At-most-one clone per repo key is guaranteed by
    /// holding an exclusive file lock for the entire "check, maybe clone,
    /// maybe fetch" sequence — the lock scope deliberately covers the
    /// fetch-if-missing-commit step too, so two experiments racing to test
    /// different commits of the same repo can't corrupt each other's
    /// fetch.
    pub async fn ensure_base(&self, url: &str, commit: &str) -> Result<Repo> {
        let key = RepoKey::from_url(url);
        std::fs::create_dir_all(self.repos_dir()).context("creating repos dir")?;
        let lock_path = self.lock_path(&key);
        let _lock = FileLock::acquire_blocking(&lock_path)
            .with_context(|| format!("locking base repo {}", key))?;

        let base_dir = self.base_repo_dir(&key);
        let repo = if base_dir.join(".git").exists() {
            debug!("base repo {} already cloned at {}", key, base_dir.display());
            Repo::at(base_dir)
        } else {
            Repo::clone_from(url, &base_dir)
                .await
                .with_context(|| format!("cloning base repo for {}", url))?
        };

        if !repo.has_commit(commit).await? {
            repo.fetch(commit)
                .await
                .with_context(|| format!("fetching {} into base repo for {}", commit, url))?;
        }

        Ok(repo)
    }

    /// Create (or reuse, if it already exists) the shared subtest
    /// workspace worktree at `subtest_dir/workspace`, on branch
    /// `{tier_id}_{subtest_id}`, checked out to `commit`.
    ///
    /// On any error, the caller is responsible for removing the partial
    /// directory before retrying, since the orchestrator may want to
    /// quarantine evidence rather than blindly delete it.
    pub async fn create_worktree(
        &self,
        base_repo: &Repo,
        subtest_dir: &Path,
        tier_id: &TierId,
        subtest_id: &SubtestId,
        commit: &str,
    ) -> Result<SubtestWorkspace> {
        let branch = BranchName::new(tier_id, subtest_id);
        let workspace_path = subtest_dir.join("workspace");

        base_repo
            .add_worktree(&workspace_path, &branch.0)
            .await
            .with_context(|| format!("creating worktree for {}", branch))?;

        let worktree = Repo::at(workspace_path.clone());
        worktree
            .checkout(commit)
            .await
            .with_context(|| format!("checking out {} in worktree for {}", commit, branch))?;

        write_replay_script(subtest_dir, base_repo.path(), &workspace_path, &branch.0, commit)?;

        Ok(SubtestWorkspace {
            repo: worktree,
            branch,
        })
    }
}

/// A persistent, named-branch worktree shared by all runs of one subtest.
pub struct SubtestWorkspace {
    repo: Repo,
    branch: BranchName,
}

impl SubtestWorkspace {
    pub fn path(&self) -> &Path {
        self.repo.path()
    }

    pub fn branch(&self) -> &BranchName {
        &self.branch
    }

    pub fn repo(&self) -> &Repo {
        &self.repo
    }
}

/// A human-readable shell script, `worktree_create.sh`, capturing the
/// exact commands used to set up a subtest's workspace — so an operator
/// can reproduce the setup by hand without reading this crate's source.
fn write_replay_script(
    subtest_dir: &Path,
    base_repo_path: &Path,
    workspace_path: &Path,
    branch: &str,
    commit: &str,
) -> Result<()> {
    let mut script = String::new();
    writeln!(script, "#!/usr/bin/env bash").ok();
    writeln!(script, "set -euo pipefail").ok();
    writeln!(
        script,
        "git -C {:?} worktree add -b {:?} {:?}",
        base_repo_path, branch, workspace_path
    )
    .ok();
    writeln!(script, "git -C {:?} checkout --force {:?}", workspace_path, commit).ok();
    std::fs::write(subtest_dir.join("worktree_create.sh"), script)
        .context("writing worktree_create.sh")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn make_origin() -> (TempDir, String, String) {
        let dir = TempDir::new().unwrap();
        let repo = crate::git::Repo::init(dir.path()).await.unwrap();
        let hash = repo.commit_empty("first").await.unwrap();
        (dir, dir.path().to_str().unwrap().to_string(), hash)
    }

    #[tokio::test]
    async fn ensure_base_clones_once_then_reuses() {
        let (_origin_dir, url, commit) = make_origin().await;
        let results_root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(results_root.path().to_path_buf());

        let repo1 = manager.ensure_base(&url, &commit).await.unwrap();
        let mtime1 = std::fs::metadata(repo1.path().join(".git")).unwrap().modified().unwrap();
        let repo2 = manager.ensure_base(&url, &commit).await.unwrap();
        let mtime2 = std::fs::metadata(repo2.path().join(".git")).unwrap().modified().unwrap();

        assert_eq!(repo1.path(), repo2.path());
        assert_eq!(mtime1, mtime2, "second call should not re-clone");
    }

    #[tokio::test]
    async fn create_worktree_checks_out_commit_and_writes_replay_script() {
        let (_origin_dir, url, commit) = make_origin().await;
        let results_root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(results_root.path().to_path_buf());
        let base = manager.ensure_base(&url, &commit).await.unwrap();

        let subtest_dir = results_root.path().join("T0").join("00-empty");
        std::fs::create_dir_all(&subtest_dir).unwrap();

        let tier = TierId("T0".into());
        let subtest = SubtestId("00-empty".into());
        let workspace = manager
            .create_worktree(&base, &subtest_dir, &tier, &subtest, &commit)
            .await
            .unwrap();

        assert_eq!(workspace.branch().0, "T0_00-empty");
        assert!(subtest_dir.join("worktree_create.sh").exists());
        assert_eq!(workspace.repo().rev_parse("HEAD").await.unwrap(), commit);
    }

    #[tokio::test]
    async fn create_worktree_conflicting_branch_is_actionable() {
        let (_origin_dir, url, commit) = make_origin().await;
        let results_root = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(results_root.path().to_path_buf());
        let base = manager.ensure_base(&url, &commit).await.unwrap();

        let tier = TierId("T0".into());
        let subtest = SubtestId("00-empty".into());

        let subtest_dir = results_root.path().join("T0").join("00-empty");
        std::fs::create_dir_all(&subtest_dir).unwrap();
        manager
            .create_worktree(&base, &subtest_dir, &tier, &subtest, &commit)
            .await
            .unwrap();

        let subtest_dir2 = results_root.path().join("T0").join("00-empty-2");
        std::fs::create_dir_all(&subtest_dir2).unwrap();
        let err = manager
            .create_worktree(&base, &subtest_dir2, &tier, &subtest, &commit)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("T0_00-empty"));
    }
}
