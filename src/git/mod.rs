//! Git Workspace (§4.1 C1).
//!
//! Branch operations scoped to a single site checkout. Every operation
//! shells out to the system `git` binary through an async process runner
//! with an explicit timeout, following the same subprocess idiom the
//! container runtimes and `engine::preview` use for cloning — no libgit2
//! binding, no in-process repository handle.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Subprocess budget for any single git invocation (§5).
const GIT_TIMEOUT: Duration = Duration::from_secs(60);

const MAIN_BRANCH: &str = "main";

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("git {op} failed: {stderr}")]
    CommandFailed { op: String, stderr: String },
    #[error("git {op} timed out after {secs}s")]
    Timeout { op: String, secs: u64 },
    #[error("io error running git {op}: {source}")]
    Io {
        op: String,
        #[source]
        source: std::io::Error,
    },
}

impl RepoError {
    fn io(op: &str, source: std::io::Error) -> Self {
        RepoError::Io { op: op.to_string(), source }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RepoStatus {
    pub is_repo: bool,
    pub current_branch: String,
    pub dirty: bool,
    pub untracked: Vec<String>,
    pub modified: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CommitEntry {
    pub hash: String,
    pub author: String,
    pub message: String,
    pub timestamp: String,
}

/// Branch operations on a site's working-copy checkout. Stateless: every
/// call takes the site path explicitly rather than holding one open.
#[derive(Debug, Clone, Default)]
pub struct GitWorkspace;

impl GitWorkspace {
    pub fn new() -> Self {
        Self
    }

    /// Initialize a repository at `path` if one doesn't already exist, write
    /// a default ignore list, and produce an initial commit. Idempotent.
    pub async fn initialize(&self, path: &Path) -> Result<(), RepoError> {
        if path.join(".git").is_dir() {
            return Ok(());
        }

        self.run(path, &["init", "-b", MAIN_BRANCH]).await?;
        self.run(path, &["config", "user.email", "deploy@localhost"]).await?;
        self.run(path, &["config", "user.name", "deploy"]).await?;

        let ignore_path = path.join(".gitignore");
        if !ignore_path.exists() {
            let default_ignore = "node_modules/\ndist/\nbuild/\n.env\n.DS_Store\n*.log\n";
            tokio::fs::write(&ignore_path, default_ignore)
                .await
                .map_err(|e| RepoError::io("write .gitignore", e))?;
        }

        self.run(path, &["add", "-A"]).await?;
        // An initial commit on an empty tree is legitimate; ignore "nothing
        // to commit" so initialize stays idempotent on re-entry.
        let _ = self.run(path, &["commit", "-m", "Initial commit", "--allow-empty"]).await;

        Ok(())
    }

    /// Check out main, create `"<base>-<unix_ms>"`, and check it out.
    pub async fn create_edit_branch(&self, path: &Path, base: &str) -> Result<String, RepoError> {
        self.checkout(path, MAIN_BRANCH).await?;

        let status = self.status(path).await?;
        if status.dirty {
            return Err(RepoError::CommandFailed {
                op: "checkout main".to_string(),
                stderr: "main has uncommitted changes".to_string(),
            });
        }

        let branch = format!("{}-{}", base, unix_millis());
        self.run(path, &["checkout", "-b", &branch]).await?;
        Ok(branch)
    }

    pub async fn status(&self, path: &Path) -> Result<RepoStatus, RepoError> {
        if !path.join(".git").is_dir() {
            return Ok(RepoStatus {
                is_repo: false,
                current_branch: String::new(),
                dirty: false,
                untracked: vec![],
                modified: vec![],
            });
        }

        let branch_out = self.run(path, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let current_branch = branch_out.trim().to_string();

        let porcelain = self.run(path, &["status", "--porcelain"]).await?;
        let mut untracked = Vec::new();
        let mut modified = Vec::new();
        for line in porcelain.lines() {
            if line.len() < 3 {
                continue;
            }
            let (code, file) = line.split_at(2);
            let file = file.trim().to_string();
            if code.starts_with("??") {
                untracked.push(file);
            } else {
                modified.push(file);
            }
        }

        Ok(RepoStatus {
            is_repo: true,
            current_branch,
            dirty: !untracked.is_empty() || !modified.is_empty(),
            untracked,
            modified,
        })
    }

    /// Stage all changes and commit. Returns "" when the working tree was
    /// clean (L2 idempotence). Auto-generates a message from status when
    /// `message` is `None`.
    pub async fn commit(
        &self,
        path: &Path,
        message: Option<&str>,
        author: Option<&str>,
    ) -> Result<String, RepoError> {
        let status = self.status(path).await?;
        if !status.dirty {
            return Ok(String::new());
        }

        self.run(path, &["add", "-A"]).await?;

        let generated;
        let msg = match message {
            Some(m) if !m.is_empty() => m,
            _ => {
                let mut files = status.untracked.clone();
                files.extend(status.modified.clone());
                generated = if files.len() <= 3 {
                    format!("Update {}", files.join(", "))
                } else {
                    format!("Update {} files", files.len())
                };
                &generated
            }
        };

        let mut args = vec!["commit".to_string(), "-m".to_string(), msg.to_string()];
        if let Some(author) = author {
            args.push(format!("--author={} <{}@localhost>", author, author));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(path, &arg_refs).await?;

        let hash = self.run(path, &["rev-parse", "HEAD"]).await?;
        Ok(hash.trim().to_string())
    }

    pub async fn checkout(&self, path: &Path, branch: &str) -> Result<(), RepoError> {
        self.run(path, &["checkout", branch]).await?;
        Ok(())
    }

    pub async fn delete_branch(&self, path: &Path, branch: &str, force: bool) -> Result<(), RepoError> {
        let flag = if force { "-D" } else { "-d" };
        self.run(path, &["branch", flag, branch]).await?;
        Ok(())
    }

    pub async fn list_branches(&self, path: &Path) -> Result<Vec<String>, RepoError> {
        let out = self
            .run(path, &["for-each-ref", "--format=%(refname:short)", "refs/heads/"])
            .await?;
        Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    pub async fn history(&self, path: &Path, limit: usize) -> Result<Vec<CommitEntry>, RepoError> {
        let limit_arg = format!("-{}", limit.max(1));
        let out = self
            .run(path, &["log", &limit_arg, "--format=%H%x1f%an%x1f%s%x1f%cI"])
            .await
            .unwrap_or_default();

        let mut entries = Vec::new();
        for line in out.lines() {
            let parts: Vec<&str> = line.split('\u{1f}').collect();
            if parts.len() == 4 {
                entries.push(CommitEntry {
                    hash: parts[0].to_string(),
                    author: parts[1].to_string(),
                    message: parts[2].to_string(),
                    timestamp: parts[3].to_string(),
                });
            }
        }
        Ok(entries)
    }

    /// Checkout main, merge `branch` with a merge commit (non-fast-forward
    /// tolerant), and delete the branch on success.
    pub async fn merge_to_main(&self, path: &Path, branch: &str) -> Result<String, RepoError> {
        self.checkout(path, MAIN_BRANCH).await?;

        if let Err(e) = self
            .run(path, &["merge", "--no-ff", "-m", &format!("Merge {}", branch), branch])
            .await
        {
            // Leave the conflicted state for the operator to inspect; abort
            // so the checkout isn't left half-merged for the next caller.
            let _ = self.run(path, &["merge", "--abort"]).await;
            return Err(e);
        }

        let hash = self.run(path, &["rev-parse", "HEAD"]).await?;

        if let Err(e) = self.delete_branch(path, branch, false).await {
            warn!(branch = %branch, error = %e, "merged branch left undeleted");
        }

        Ok(hash.trim().to_string())
    }

    async fn run(&self, path: &Path, args: &[&str]) -> Result<String, RepoError> {
        let op = args.join(" ");
        debug!(dir = %path.display(), cmd = %op, "git");

        let fut = Command::new("git")
            .arg("-C")
            .arg(path)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = match timeout(GIT_TIMEOUT, fut).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(RepoError::io(&op, e)),
            Err(_) => {
                return Err(RepoError::Timeout {
                    op,
                    secs: GIT_TIMEOUT.as_secs(),
                })
            }
        };

        if !output.status.success() {
            return Err(RepoError::CommandFailed {
                op,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn unix_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Resolve a site-scoped path from a user-supplied relative path, rejecting
/// traversal outside the site root (B3).
pub fn resolve_scoped_path(site_root: &Path, relative: &str) -> Result<PathBuf, RepoError> {
    if relative.contains("..") || relative.starts_with('/') || relative.contains('\0') {
        return Err(RepoError::CommandFailed {
            op: "resolve path".to_string(),
            stderr: format!("rejected unsafe path: {}", relative),
        });
    }
    Ok(site_root.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("index.html"), "<h1>hi</h1>")
            .await
            .unwrap();
        GitWorkspace::new().initialize(dir.path()).await.unwrap();
        dir
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let dir = init_repo().await;
        let ws = GitWorkspace::new();
        ws.initialize(dir.path()).await.unwrap();
        let status = ws.status(dir.path()).await.unwrap();
        assert!(status.is_repo);
        assert_eq!(status.current_branch, "main");
    }

    #[tokio::test]
    async fn create_edit_branch_returns_timestamped_name() {
        let dir = init_repo().await;
        let ws = GitWorkspace::new();
        let branch = ws.create_edit_branch(dir.path(), "edit").await.unwrap();
        assert!(branch.starts_with("edit-"));
        let status = ws.status(dir.path()).await.unwrap();
        assert_eq!(status.current_branch, branch);
    }

    #[tokio::test]
    async fn commit_with_no_changes_returns_empty_hash() {
        let dir = init_repo().await;
        let ws = GitWorkspace::new();
        let hash = ws.commit(dir.path(), None, None).await.unwrap();
        assert_eq!(hash, "");
    }

    #[tokio::test]
    async fn commit_generates_message_from_changed_files() {
        let dir = init_repo().await;
        let ws = GitWorkspace::new();
        tokio::fs::write(dir.path().join("about.html"), "about")
            .await
            .unwrap();
        let hash = ws.commit(dir.path(), None, None).await.unwrap();
        assert!(!hash.is_empty());
    }

    #[tokio::test]
    async fn merge_to_main_round_trip() {
        let dir = init_repo().await;
        let ws = GitWorkspace::new();
        let branch = ws.create_edit_branch(dir.path(), "edit").await.unwrap();
        tokio::fs::write(dir.path().join("new.html"), "new")
            .await
            .unwrap();
        ws.commit(dir.path(), Some("add page"), None).await.unwrap();
        let merged = ws.merge_to_main(dir.path(), &branch).await.unwrap();
        assert!(!merged.is_empty());

        let branches = ws.list_branches(dir.path()).await.unwrap();
        assert!(!branches.contains(&branch));
    }

    #[test]
    fn resolve_scoped_path_rejects_traversal() {
        let root = Path::new("/sites/blog");
        assert!(resolve_scoped_path(root, "../../etc/passwd").is_err());
        assert!(resolve_scoped_path(root, "/etc/passwd").is_err());
        assert!(resolve_scoped_path(root, "index.html").is_ok());
    }
}
