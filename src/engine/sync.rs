//! Source synchronization.
//!
//! Brings a workspace to the remote branch tip: fresh clone when the
//! directory is empty, fetch + hard reset when a checkout already exists
//! (local drift is discarded: builds run from the pushed state, never from
//! residual edits). The caller must hold the workspace lease for the whole
//! call. Git's own output is captured into the transcript that ends up in
//! the build log.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::errors::BuildFailure;

use super::exec::CommandRunner;
use super::models::CommandSpec;

/// Outcome of a successful synchronization.
#[derive(Debug)]
pub struct SyncReport {
    /// Resolved commit id of the checked-out tip, 40-hex.
    pub commit: String,
    /// Captured git output, ready to append to the build log.
    pub transcript: String,
}

#[derive(Clone)]
pub struct Synchronizer {
    runner: CommandRunner,
    timeout: Duration,
}

impl Synchronizer {
    pub fn new(runner: CommandRunner, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Synchronize `workspace` to the tip of `branch` at `url` and resolve
    /// the resulting commit. Every git failure (unreachable remote, missing
    /// branch, corrupted local state) becomes `BuildFailure::Sync` carrying
    /// the transcript so far.
    pub async fn sync(
        &self,
        workspace: &Path,
        url: &str,
        branch: &str,
    ) -> Result<SyncReport, BuildFailure> {
        let mut transcript = String::new();

        if workspace.join(".git").exists() {
            transcript.push_str(&format!("Fetching {} ({})\n", url, branch));
            self.git(&["fetch", "--all", "--prune"], workspace, &mut transcript)
                .await?;
            let target = format!("origin/{}", branch);
            self.git(&["reset", "--hard", &target], workspace, &mut transcript)
                .await?;
        } else {
            transcript.push_str(&format!("Cloning {} ({})\n", url, branch));
            self.git(&["clone", "--branch", branch, url, "."], workspace, &mut transcript)
                .await?;
        }

        let commit = resolve_head(workspace).map_err(|e| BuildFailure::Sync {
            message: format!("{:#}", e),
            output: transcript.clone(),
        })?;
        transcript.push_str(&format!("Checked out {}\n", commit));

        Ok(SyncReport { commit, transcript })
    }

    async fn git(
        &self,
        args: &[&str],
        workspace: &Path,
        transcript: &mut String,
    ) -> Result<(), BuildFailure> {
        let spec = CommandSpec::new("git", args);
        match self.runner.run(&spec, workspace, self.timeout).await {
            Ok(out) => {
                transcript.push_str(&out.output);
                Ok(())
            }
            Err(failure) => {
                transcript.push_str(failure.output());
                Err(BuildFailure::Sync {
                    message: failure.to_string(),
                    output: std::mem::take(transcript),
                })
            }
        }
    }
}

/// Resolve the commit the workspace HEAD points at.
fn resolve_head(workspace: &Path) -> Result<String> {
    let repo = git2::Repository::open(workspace).context("Failed to open repository")?;
    let head = repo.head().context("Failed to read HEAD")?;
    let commit = head
        .peel_to_commit()
        .context("HEAD does not point at a commit")?;
    Ok(commit.id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_OUTPUT_CAP_BYTES;
    use std::process::Command as StdCommand;

    fn git_in(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git")
            .args([
                "-c",
                "user.email=ci@test",
                "-c",
                "user.name=ci",
                "-c",
                "commit.gpgsign=false",
            ])
            .args(args)
            .current_dir(dir)
            .status()
            .expect("failed to run git");
        assert!(status.success(), "git {:?} failed", args);
    }

    /// Create an origin repo with one commit; returns its branch name
    /// (init defaults differ across git versions).
    fn make_origin(dir: &Path) -> String {
        git_in(dir, &["init"]);
        std::fs::write(dir.join("README.md"), "# fixture\n").unwrap();
        git_in(dir, &["add", "."]);
        git_in(dir, &["commit", "-m", "initial"]);
        let out = StdCommand::new("git")
            .args(["rev-parse", "--abbrev-ref", "HEAD"])
            .current_dir(dir)
            .output()
            .unwrap();
        String::from_utf8(out.stdout).unwrap().trim().to_string()
    }

    fn synchronizer() -> Synchronizer {
        Synchronizer::new(
            CommandRunner::new(DEFAULT_OUTPUT_CAP_BYTES),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn fresh_workspace_is_cloned() {
        let origin = tempfile::tempdir().unwrap();
        let branch = make_origin(origin.path());
        let workspace = tempfile::tempdir().unwrap();

        let report = synchronizer()
            .sync(workspace.path(), origin.path().to_str().unwrap(), &branch)
            .await
            .unwrap();

        assert_eq!(report.commit.len(), 40);
        assert!(report.commit.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(report.transcript.contains("Cloning"));
        assert!(workspace.path().join("README.md").exists());
    }

    #[tokio::test]
    async fn existing_workspace_is_fetched_and_reset() {
        let origin = tempfile::tempdir().unwrap();
        let branch = make_origin(origin.path());
        let workspace = tempfile::tempdir().unwrap();
        let sync = synchronizer();
        let url = origin.path().to_str().unwrap().to_string();

        let first = sync.sync(workspace.path(), &url, &branch).await.unwrap();

        // Push a new commit upstream and drift the local tree.
        std::fs::write(origin.path().join("new-file"), "v2\n").unwrap();
        git_in(origin.path(), &["add", "."]);
        git_in(origin.path(), &["commit", "-m", "second"]);
        std::fs::write(workspace.path().join("README.md"), "local drift\n").unwrap();

        let second = sync.sync(workspace.path(), &url, &branch).await.unwrap();

        assert_ne!(first.commit, second.commit);
        assert!(second.transcript.contains("Fetching"));
        assert!(workspace.path().join("new-file").exists());
        let readme = std::fs::read_to_string(workspace.path().join("README.md")).unwrap();
        assert_eq!(readme, "# fixture\n", "local drift must be discarded");
    }

    #[tokio::test]
    async fn unreachable_remote_is_a_sync_failure() {
        let workspace = tempfile::tempdir().unwrap();
        let err = synchronizer()
            .sync(workspace.path(), "/nonexistent/origin.git", "main")
            .await
            .unwrap_err();
        match err {
            BuildFailure::Sync { output, .. } => assert!(!output.is_empty()),
            other => panic!("Expected Sync failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_branch_is_a_sync_failure() {
        let origin = tempfile::tempdir().unwrap();
        make_origin(origin.path());
        let workspace = tempfile::tempdir().unwrap();

        let err = synchronizer()
            .sync(
                workspace.path(),
                origin.path().to_str().unwrap(),
                "no-such-branch",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BuildFailure::Sync { .. }));
    }
}
