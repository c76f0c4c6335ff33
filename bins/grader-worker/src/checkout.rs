// Source checkout - materialises one repository commit in a private directory
// that disappears when the checkout is dropped.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("git {step} failed for {repo}: {message}")]
    Git {
        repo: String,
        step: &'static str,
        message: String,
    },

    #[error("checkout io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A checked-out source tree; the directory is removed on drop
#[derive(Debug)]
pub struct SourceTree {
    path: PathBuf,
    _dir: Option<TempDir>,
}

impl SourceTree {
    pub fn temporary(dir: TempDir) -> Self {
        Self {
            path: dir.path().to_path_buf(),
            _dir: Some(dir),
        }
    }

    /// A tree the caller owns; nothing is deleted on drop
    pub fn borrowed(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _dir: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, repo: &str, commit_sha: &str) -> Result<SourceTree, CheckoutError>;
}

/// Clones over HTTPS with the repository-host token
pub struct GitCheckout {
    host: String,
    token: Option<String>,
    workspace_dir: PathBuf,
}

impl GitCheckout {
    pub fn new(host: impl Into<String>, token: Option<String>, workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            token,
            workspace_dir: workspace_dir.into(),
        }
    }

    fn clone_url(&self, repo: &str) -> String {
        match &self.token {
            Some(token) => format!("https://x-access-token:{}@{}/{}.git", token, self.host, repo),
            None => format!("https://{}/{}.git", self.host, repo),
        }
    }

    /// Git output can echo the remote URL; never let the token reach a record
    fn redact(&self, text: &str) -> String {
        match &self.token {
            Some(token) if !token.is_empty() => text.replace(token.as_str(), "***"),
            _ => text.to_string(),
        }
    }

    async fn git(&self, repo: &str, step: &'static str, cwd: &Path, args: &[&str]) -> Result<(), CheckoutError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(CheckoutError::Git {
                repo: repo.to_string(),
                step,
                message: self.redact(String::from_utf8_lossy(&output.stderr).trim()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SourceFetcher for GitCheckout {
    #[tracing::instrument(skip(self))]
    async fn fetch(&self, repo: &str, commit_sha: &str) -> Result<SourceTree, CheckoutError> {
        tokio::fs::create_dir_all(&self.workspace_dir).await?;
        let name = repo.rsplit('/').next().unwrap_or(repo);
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", name))
            .tempdir_in(&self.workspace_dir)?;

        let url = self.clone_url(repo);
        let target = dir.path().to_string_lossy().to_string();
        self.git(repo, "clone", &self.workspace_dir, &["clone", "--quiet", &url, &target])
            .await?;
        self.git(repo, "checkout", dir.path(), &["checkout", "--quiet", "--detach", commit_sha])
            .await?;

        info!(repo = %repo, commit = %commit_sha, path = %dir.path().display(), "Source checked out");
        Ok(SourceTree::temporary(dir))
    }
}

/// Serves the same local directory for every request
pub struct LocalSource {
    path: PathBuf,
}

impl LocalSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SourceFetcher for LocalSource {
    async fn fetch(&self, _repo: &str, _commit_sha: &str) -> Result<SourceTree, CheckoutError> {
        if !self.path.is_dir() {
            return Err(CheckoutError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("source directory {} does not exist", self.path.display()),
            )));
        }
        Ok(SourceTree::borrowed(self.path.clone()))
    }
}
