//! Git source provider
//!
//! Keeps a bare mirror of the repository in the cache directory and serves
//! branch heads and tree archives from it with the `git` CLI. The mirror is
//! refreshed before every branch lookup and whenever an archive is requested
//! for a commit it does not hold yet.

use async_trait::async_trait;
use conduit_core::PipelineError;
use conduit_core::source::SourceProvider;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct GitSourceProvider {
    url: String,
    mirror: PathBuf,
    // Serializes clone/update so concurrent lookups don't race on the mirror
    refresh: Mutex<()>,
}

impl GitSourceProvider {
    pub fn new(url: impl Into<String>, cache_dir: &Path) -> Self {
        Self {
            url: url.into(),
            mirror: cache_dir.join("mirror.git"),
            refresh: Mutex::new(()),
        }
    }

    async fn refresh_mirror(&self) -> Result<(), PipelineError> {
        let _guard = self.refresh.lock().await;

        if self.mirror.join("HEAD").is_file() {
            debug!("Updating mirror {}", self.mirror.display());
            self.git(&["remote", "update", "--prune"]).await?;
            return Ok(());
        }

        if let Some(parent) = self.mirror.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PipelineError::SourceFetch(format!(
                    "failed to create source cache {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        info!("Cloning {} into {}", self.url, self.mirror.display());
        let output = Command::new("git")
            .arg("clone")
            .arg("--mirror")
            .arg("--quiet")
            .arg("--")
            .arg(&self.url)
            .arg(&self.mirror)
            .output()
            .await
            .map_err(|e| PipelineError::SourceFetch(format!("failed to execute git: {}", e)))?;
        check_status("clone", &output)?;
        Ok(())
    }

    /// Whether the mirror already holds `commit`
    async fn has_commit(&self, commit: &str) -> bool {
        let object = format!("{}^{{commit}}", commit);
        self.git(&["rev-parse", "--verify", "--quiet", &object])
            .await
            .is_ok()
    }

    /// Runs git against the mirror and returns stdout
    async fn git(&self, args: &[&str]) -> Result<Vec<u8>, PipelineError> {
        let output = Command::new("git")
            .arg("--git-dir")
            .arg(&self.mirror)
            .args(args)
            .output()
            .await
            .map_err(|e| PipelineError::SourceFetch(format!("failed to execute git: {}", e)))?;
        check_status(args.first().copied().unwrap_or("git"), &output)?;
        Ok(output.stdout)
    }
}

#[async_trait]
impl SourceProvider for GitSourceProvider {
    async fn branch_head(&self, branch: &str) -> Result<String, PipelineError> {
        if branch.is_empty() || branch.starts_with('-') || branch.contains("..") {
            return Err(PipelineError::SourceFetch(format!(
                "invalid branch name '{}'",
                branch
            )));
        }

        self.refresh_mirror().await?;

        let reference = format!("refs/heads/{}^{{commit}}", branch);
        let stdout = self
            .git(&["rev-parse", "--verify", "--quiet", &reference])
            .await
            .map_err(|_| PipelineError::SourceFetch(format!("branch '{}' not found", branch)))?;

        let commit = String::from_utf8_lossy(&stdout).trim().to_string();
        debug!("Branch {} is at {}", branch, commit);
        Ok(commit)
    }

    async fn fetch_archive(&self, commit: &str) -> Result<Vec<u8>, PipelineError> {
        let is_hex = !commit.is_empty() && commit.chars().all(|c| c.is_ascii_hexdigit());
        if !is_hex {
            return Err(PipelineError::SourceFetch(format!(
                "invalid commit id '{}'",
                commit
            )));
        }

        if !self.mirror.join("HEAD").is_file() || !self.has_commit(commit).await {
            self.refresh_mirror().await?;
        }

        self.git(&["archive", "--format=tar", commit]).await
    }
}

fn check_status(what: &str, output: &std::process::Output) -> Result<(), PipelineError> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(PipelineError::SourceFetch(format!(
        "git {} failed (exit code {}): {}",
        what,
        output.status.code().unwrap_or(-1),
        stderr.trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn git_available() -> bool {
        StdCommand::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.name=Conduit", "-c", "user.email=ci@example.com"])
            .args(args)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {:?} failed", args);
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Creates a repository with one commit on `main`
    fn upstream() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init", "--quiet", "--initial-branch=main"]);
        std::fs::write(dir.path().join("buildspec.yml"), "version: 0.2\n").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "--quiet", "-m", "initial"]);
        dir
    }

    #[tokio::test]
    async fn test_head_and_archive() {
        if !git_available() {
            return;
        }
        let upstream = upstream();
        let cache = tempfile::tempdir().unwrap();
        let provider =
            GitSourceProvider::new(upstream.path().to_string_lossy().to_string(), cache.path());

        let expected = git(upstream.path(), &["rev-parse", "HEAD"]);
        let head = provider.branch_head("main").await.unwrap();
        assert_eq!(head, expected);

        let archive = provider.fetch_archive(&head).await.unwrap();
        let names = conduit_runner::bundle::list(&archive).unwrap();
        assert_eq!(names, vec!["buildspec.yml"]);
    }

    #[tokio::test]
    async fn test_mirror_follows_new_commits() {
        if !git_available() {
            return;
        }
        let upstream = upstream();
        let cache = tempfile::tempdir().unwrap();
        let provider =
            GitSourceProvider::new(upstream.path().to_string_lossy().to_string(), cache.path());

        let first = provider.branch_head("main").await.unwrap();

        std::fs::write(upstream.path().join("README.md"), "change").unwrap();
        git(upstream.path(), &["add", "."]);
        git(upstream.path(), &["commit", "--quiet", "-m", "second"]);

        let second = provider.branch_head("main").await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_archive_of_commit_pushed_after_mirror() {
        if !git_available() {
            return;
        }
        let upstream = upstream();
        let cache = tempfile::tempdir().unwrap();
        let provider =
            GitSourceProvider::new(upstream.path().to_string_lossy().to_string(), cache.path());

        provider.branch_head("main").await.unwrap();

        std::fs::write(upstream.path().join("README.md"), "change").unwrap();
        git(upstream.path(), &["add", "."]);
        git(upstream.path(), &["commit", "--quiet", "-m", "second"]);
        let pushed = git(upstream.path(), &["rev-parse", "HEAD"]);

        // Webhook events name the commit directly, without a branch lookup
        let archive = provider.fetch_archive(&pushed).await.unwrap();
        let mut names = conduit_runner::bundle::list(&archive).unwrap();
        names.sort();
        assert_eq!(names, vec!["README.md", "buildspec.yml"]);
    }

    #[tokio::test]
    async fn test_archive_of_unknown_commit() {
        if !git_available() {
            return;
        }
        let upstream = upstream();
        let cache = tempfile::tempdir().unwrap();
        let provider =
            GitSourceProvider::new(upstream.path().to_string_lossy().to_string(), cache.path());

        provider.branch_head("main").await.unwrap();
        assert!(matches!(
            provider
                .fetch_archive("0123456789abcdef0123456789abcdef01234567")
                .await,
            Err(PipelineError::SourceFetch(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_branch() {
        if !git_available() {
            return;
        }
        let upstream = upstream();
        let cache = tempfile::tempdir().unwrap();
        let provider =
            GitSourceProvider::new(upstream.path().to_string_lossy().to_string(), cache.path());

        assert!(matches!(
            provider.branch_head("release").await,
            Err(PipelineError::SourceFetch(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_option_like_input() {
        let cache = tempfile::tempdir().unwrap();
        let provider = GitSourceProvider::new("/nonexistent", cache.path());

        assert!(provider.branch_head("--upload-pack=x").await.is_err());
        assert!(provider.fetch_archive("--output=/tmp/x").await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_repository() {
        if !git_available() {
            return;
        }
        let cache = tempfile::tempdir().unwrap();
        let provider = GitSourceProvider::new("/nonexistent/conduit/repo.git", cache.path());
        assert!(matches!(
            provider.branch_head("main").await,
            Err(PipelineError::SourceFetch(_))
        ));
    }
}
