//! End-to-end tests that drive the compiled `scylla-engine` binary
//! exactly as an operator would from a shell: a real local git repo as
//! the source under evaluation, a real fixture directory on disk, and
//! `--mock` so no external agent/judge CLI needs to be installed.

use std::fs;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use tempfile::TempDir;
use test_bin::get_test_bin;
use tokio::process::Command;

async fn git(dir: &std::path::Path, args: &[&str]) -> Result<()> {
    let status = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .with_context(|| format!("spawning git {args:?}"))?;
    if !status.success() {
        anyhow::bail!("git {args:?} failed: {status:?}");
    }
    Ok(())
}

/// A bare-bones source repo with a single empty commit, returned as
/// (the TempDir that must outlive the test, its URL, its HEAD commit).
async fn make_source_repo() -> Result<(TempDir, String, String)> {
    let dir = TempDir::new()?;
    git(dir.path(), &["init"]).await?;
    git(dir.path(), &["config", "user.email", "test@example.com"]).await?;
    git(dir.path(), &["config", "user.name", "test"]).await?;
    git(dir.path(), &["commit", "--allow-empty", "-m", "initial"]).await?;

    let output = Command::new("git")
        .arg("-C")
        .arg(dir.path())
        .args(["rev-parse", "HEAD"])
        .stderr(Stdio::null())
        .output()
        .await?;
    let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let url = dir.path().to_string_lossy().into_owned();
    Ok((dir, url, commit))
}

/// A minimal one-tier, one-subtest fixture directory.
fn write_fixture(fixture_dir: &std::path::Path) {
    fs::create_dir_all(fixture_dir).unwrap();
    fs::write(fixture_dir.join("prompt.md"), "Do the task.").unwrap();
    fs::write(fixture_dir.join("criteria.md"), "Be correct.").unwrap();
    fs::write(fixture_dir.join("rubric.yaml"), "rubric: {}").unwrap();
    fs::create_dir_all(fixture_dir.join("T0").join("00-smoke")).unwrap();
}

fn run_args(
    fixture_dir: &std::path::Path,
    results_root: &std::path::Path,
    source_repo_url: &str,
    source_commit: &str,
    extra: &[&str],
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "--config".into(),
        fixture_dir.to_string_lossy().into_owned(),
        "--results-root".into(),
        results_root.to_string_lossy().into_owned(),
        "--source-repo-url".into(),
        source_repo_url.into(),
        "--source-commit".into(),
        source_commit.into(),
        "--runs".into(),
        "1".into(),
        "--mock".into(),
    ];
    args.extend(extra.iter().map(|s| s.to_string()));
    args
}

#[tokio::test]
async fn fresh_run_completes_and_writes_reports() {
    let (_source_dir, url, commit) = make_source_repo().await.unwrap();
    let workdir = TempDir::new().unwrap();
    let fixture_dir = workdir.path().join("fixture");
    write_fixture(&fixture_dir);
    let results_root = workdir.path().join("results");

    let output = get_test_bin("scylla-engine")
        .args(run_args(&fixture_dir, &results_root, &url, &commit, &[]))
        .output()
        .expect("spawning scylla-engine");

    assert!(
        output.status.success(),
        "run failed: stdout={} stderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    let experiment_root = results_root.join("experiment");
    assert!(experiment_root.join("checkpoint.json").is_file());
    assert!(experiment_root.join("report.json").is_file());
    assert!(experiment_root.join("report.md").is_file());
    assert!(experiment_root.join("T0").join("report.json").is_file());
    assert!(experiment_root
        .join("T0")
        .join("00-smoke")
        .join("report.json")
        .is_file());

    let checkpoint: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(experiment_root.join("checkpoint.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(checkpoint["experiment_state"], "Complete");
    assert_eq!(checkpoint["tier_states"]["T0"], "Complete");
}

#[tokio::test]
async fn resume_is_idempotent_and_skips_completed_runs() {
    let (_source_dir, url, commit) = make_source_repo().await.unwrap();
    let workdir = TempDir::new().unwrap();
    let fixture_dir = workdir.path().join("fixture");
    write_fixture(&fixture_dir);
    let results_root = workdir.path().join("results");

    let first = get_test_bin("scylla-engine")
        .args(run_args(&fixture_dir, &results_root, &url, &commit, &[]))
        .output()
        .unwrap();
    assert!(first.status.success());

    let experiment_root = results_root.join("experiment");
    let run_result_path = experiment_root
        .join("T0")
        .join("00-smoke")
        .join("run_01")
        .join("run_result.json");
    assert!(run_result_path.is_file());
    let first_mtime = fs::metadata(&run_result_path).unwrap().modified().unwrap();

    // Re-invoking without --fresh must resume from the checkpoint rather
    // than re-run anything that already reached a terminal state.
    let second = get_test_bin("scylla-engine")
        .args(run_args(&fixture_dir, &results_root, &url, &commit, &[]))
        .output()
        .unwrap();
    assert!(
        second.status.success(),
        "resume failed: stderr={}",
        String::from_utf8_lossy(&second.stderr)
    );

    let second_mtime = fs::metadata(&run_result_path).unwrap().modified().unwrap();
    assert_eq!(
        first_mtime, second_mtime,
        "resume must not re-execute an already-passed run"
    );
}

#[tokio::test]
async fn fresh_flag_quarantines_prior_experiment_tree() {
    let (_source_dir, url, commit) = make_source_repo().await.unwrap();
    let workdir = TempDir::new().unwrap();
    let fixture_dir = workdir.path().join("fixture");
    write_fixture(&fixture_dir);
    let results_root = workdir.path().join("results");

    let first = get_test_bin("scylla-engine")
        .args(run_args(&fixture_dir, &results_root, &url, &commit, &[]))
        .output()
        .unwrap();
    assert!(first.status.success());

    let second = get_test_bin("scylla-engine")
        .args(run_args(
            &fixture_dir,
            &results_root,
            &url,
            &commit,
            &["--fresh"],
        ))
        .output()
        .unwrap();
    assert!(
        second.status.success(),
        "fresh re-run failed: stderr={}",
        String::from_utf8_lossy(&second.stderr)
    );

    let stale_dirs: Vec<PathBuf> = fs::read_dir(&results_root)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.contains(".stale-"))
                .unwrap_or(false)
        })
        .collect();
    assert_eq!(stale_dirs.len(), 1, "expected exactly one quarantined tree");

    let experiment_root = results_root.join("experiment");
    assert!(experiment_root.join("checkpoint.json").is_file());
}

#[tokio::test]
async fn second_concurrent_run_is_rejected_with_lock_conflict_exit_code() {
    let (_source_dir, url, commit) = make_source_repo().await.unwrap();
    let workdir = TempDir::new().unwrap();
    let fixture_dir = workdir.path().join("fixture");
    write_fixture(&fixture_dir);
    let results_root = workdir.path().join("results");
    let experiment_root = results_root.join("experiment");
    fs::create_dir_all(&experiment_root).unwrap();

    // Hold the experiment lock ourselves, standing in for a concurrently
    // running instance of the engine over the same results root.
    let lock_path = experiment_root.join(".experiment.lock");
    let held_lock_file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .unwrap();
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;
    flock(held_lock_file.as_raw_fd(), FlockArg::LockExclusiveNonblock).unwrap();

    let output = get_test_bin("scylla-engine")
        .args(run_args(&fixture_dir, &results_root, &url, &commit, &[]))
        .output()
        .unwrap();

    assert_eq!(
        output.status.code(),
        Some(3),
        "lock conflict must exit with code 3; stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );

    drop(held_lock_file);
}
