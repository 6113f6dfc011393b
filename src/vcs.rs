//! Version-control capability.
//!
//! The engine consumes only path strings and branch names; the capability
//! owns authentication and remote communication. The shipped adapter
//! shells out to `git`, which keeps credential handling in the operator's
//! existing setup.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::errors::ConductorError;

#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn create_branch(&self, repo: &Path, branch: &str) -> Result<()>;
    async fn checkout(&self, repo: &Path, branch: &str) -> Result<()>;
    async fn commit_all(&self, repo: &Path, message: &str) -> Result<()>;
    async fn push(&self, repo: &Path, branch: &str) -> Result<()>;
    async fn diff_against(&self, repo: &Path, base: &str) -> Result<String>;
    async fn list_remote_branches(&self, repo: &Path) -> Result<Vec<String>>;
    async fn reset_to(&self, repo: &Path, commit: &str) -> Result<()>;
}

/// `git` subprocess adapter.
pub struct GitCli {
    /// Root under which repository paths are resolved.
    pub workspace_root: PathBuf,
}

impl GitCli {
    pub fn new(workspace_root: &Path) -> Self {
        Self {
            workspace_root: workspace_root.to_path_buf(),
        }
    }

    async fn git(&self, repo: &Path, args: &[&str]) -> Result<String> {
        let dir = if repo.is_absolute() {
            repo.to_path_buf()
        } else {
            self.workspace_root.join(repo)
        };
        let output = Command::new("git")
            .args(args)
            .current_dir(&dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConductorError::Git(format!(
                "git {} failed in {}: {}",
                args.join(" "),
                dir.display(),
                stderr.trim()
            ))
            .into());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn create_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        self.git(repo, &["checkout", "-b", branch]).await.map(|_| ())
    }

    async fn checkout(&self, repo: &Path, branch: &str) -> Result<()> {
        self.git(repo, &["checkout", branch]).await.map(|_| ())
    }

    async fn commit_all(&self, repo: &Path, message: &str) -> Result<()> {
        self.git(repo, &["add", "-A"]).await?;
        self.git(repo, &["commit", "-m", message, "--allow-empty"])
            .await
            .map(|_| ())
    }

    async fn push(&self, repo: &Path, branch: &str) -> Result<()> {
        self.git(repo, &["push", "-u", "origin", branch])
            .await
            .map(|_| ())
    }

    async fn diff_against(&self, repo: &Path, base: &str) -> Result<String> {
        self.git(repo, &["diff", &format!("{base}...HEAD")]).await
    }

    async fn list_remote_branches(&self, repo: &Path) -> Result<Vec<String>> {
        let output = self
            .git(repo, &["branch", "-r", "--format=%(refname:short)"])
            .await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn reset_to(&self, repo: &Path, commit: &str) -> Result<()> {
        self.git(repo, &["reset", "--hard", commit]).await.map(|_| ())
    }
}
