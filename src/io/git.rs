//! C2: a narrow wrapper over the `git` binary.
//!
//! Stateless except for the repository root; holds no in-process lock, since
//! each Lane Executor operates on its own worktree (§4.2).

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Error taxonomy surfaced by the Git Service (§4.2, §7).
#[derive(Debug, Error)]
pub enum GitError {
    #[error("worktree already exists at {0}")]
    WorktreeExists(PathBuf),
    #[error("branch '{0}' is checked out elsewhere")]
    BranchConflict(String),
    #[error("push rejected (non-fast-forward): {0}")]
    PushRejected(String),
    #[error("push authentication failed: {0}")]
    PushAuth(String),
    #[error("push failed (network): {0}")]
    PushNet(String),
    #[error("git {args}: {stderr}")]
    Command { args: String, stderr: String },
    #[error("spawn git {args}: {source}")]
    Spawn {
        args: String,
        #[source]
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, GitError>;

/// Result of a merge attempt (§4.2 `safeMerge`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub success: bool,
    pub conflict: bool,
    pub conflicting_files: Vec<String>,
}

/// Options for `safeMerge`.
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub no_ff: bool,
    pub message: Option<String>,
    pub abort_on_conflict: bool,
}

/// A worktree entry as reported by `git worktree list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self { workdir: workdir.into() }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Create a worktree checked out onto a new branch from `base`.
    #[instrument(skip_all, fields(branch, path = %path.display()))]
    pub fn create_worktree(&self, base: &str, branch: &str, path: &Path) -> Result<()> {
        if path.exists() {
            return Err(GitError::WorktreeExists(path.to_path_buf()));
        }
        if self.branch_checked_out_elsewhere(branch)? {
            return Err(GitError::BranchConflict(branch.to_string()));
        }
        debug!(branch, path = %path.display(), "creating worktree");
        self.run_checked(&[
            "worktree",
            "add",
            "-b",
            branch,
            &path.to_string_lossy(),
            base,
        ])?;
        Ok(())
    }

    /// Re-attach a worktree to a branch that already exists (resume after the
    /// worktree directory was removed or orphaned). Unlike [`create_worktree`]
    /// this does not create `branch` — it must already point at the commit the
    /// lane left off at.
    #[instrument(skip_all, fields(branch, path = %path.display()))]
    pub fn attach_worktree(&self, branch: &str, path: &Path) -> Result<()> {
        if path.exists() {
            return Err(GitError::WorktreeExists(path.to_path_buf()));
        }
        if self.branch_checked_out_elsewhere(branch)? {
            return Err(GitError::BranchConflict(branch.to_string()));
        }
        debug!(branch, path = %path.display(), "re-attaching worktree");
        self.run_checked(&["worktree", "add", &path.to_string_lossy(), branch])?;
        Ok(())
    }

    /// Remove a worktree. Tolerates the directory having been deleted out of band.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn remove_worktree(&self, path: &Path, force: bool) -> Result<()> {
        if !path.exists() {
            debug!(path = %path.display(), "worktree already gone");
            let _ = self.run(&["worktree", "prune"]);
            return Ok(());
        }
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        let path_str = path.to_string_lossy().to_string();
        args.push(&path_str);
        self.run_checked(&args)?;
        Ok(())
    }

    /// Delete a branch. Non-fatal if the ref does not exist.
    #[instrument(skip_all, fields(branch))]
    pub fn delete_branch(&self, branch: &str, remote: bool, force: bool) -> Result<()> {
        if remote {
            let flag = if force { "--force" } else { "" };
            let mut args = vec!["push", "origin", "--delete", branch];
            if !flag.is_empty() {
                args.insert(1, flag);
            }
            if let Err(err) = self.run_checked(&args) {
                warn!(branch, err = %err, "remote branch deletion failed (non-fatal)");
            }
            return Ok(());
        }
        let flag = if force { "-D" } else { "-d" };
        let output = self.run(&["branch", flag, branch]).map_err(spawn_err("branch -d"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not found") {
                debug!(branch, "branch already absent");
                return Ok(());
            }
            return Err(GitError::Command {
                args: format!("branch {flag} {branch}"),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Push a branch, optionally setting upstream.
    #[instrument(skip_all, fields(branch))]
    pub fn push(&self, branch: &str, set_upstream: bool) -> Result<()> {
        let mut args = vec!["push"];
        if set_upstream {
            args.extend(["-u", "origin", branch]);
        } else {
            args.extend(["origin", branch]);
        }
        let output = self.run(&args).map_err(spawn_err("push"))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if stderr.contains("non-fast-forward") || stderr.contains("fetch first") {
            return Err(GitError::PushRejected(stderr));
        }
        if stderr.contains("Authentication") || stderr.contains("permission denied") {
            return Err(GitError::PushAuth(stderr));
        }
        Err(GitError::PushNet(stderr))
    }

    /// Merge `ref` into the current branch with conflict detection.
    #[instrument(skip_all, fields(r#ref = r#ref))]
    pub fn safe_merge(&self, r#ref: &str, opts: &MergeOptions) -> Result<MergeOutcome> {
        let mut args = vec!["merge"];
        if opts.no_ff {
            args.push("--no-ff");
        }
        if let Some(msg) = &opts.message {
            args.push("-m");
            args.push(msg);
        }
        args.push(r#ref);
        let output = self.run(&args).map_err(spawn_err("merge"))?;
        if output.status.success() {
            return Ok(MergeOutcome {
                success: true,
                conflict: false,
                conflicting_files: Vec::new(),
            });
        }

        let conflicting_files = self.conflicting_files()?;
        if opts.abort_on_conflict {
            let _ = self.run(&["merge", "--abort"]);
        }
        Ok(MergeOutcome {
            success: false,
            conflict: !conflicting_files.is_empty(),
            conflicting_files,
        })
    }

    fn conflicting_files(&self) -> Result<Vec<String>> {
        let output = self
            .run(&["diff", "--name-only", "--diff-filter=U"])
            .map_err(spawn_err("diff --diff-filter=U"))?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }

    pub fn has_uncommitted_changes(&self) -> Result<bool> {
        let output = self.run(&["status", "--porcelain"]).map_err(spawn_err("status"))?;
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// List registered worktrees (porcelain format).
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeEntry>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        let mut entries = Vec::new();
        let mut current_path: Option<PathBuf> = None;
        let mut current_branch: Option<String> = None;
        for line in out.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                if let Some(path) = current_path.take() {
                    entries.push(WorktreeEntry {
                        path,
                        branch: current_branch.take(),
                    });
                }
                current_path = Some(PathBuf::from(path));
            } else if let Some(branch) = line.strip_prefix("branch ") {
                current_branch = Some(branch.trim_start_matches("refs/heads/").to_string());
            }
        }
        if let Some(path) = current_path {
            entries.push(WorktreeEntry {
                path,
                branch: current_branch,
            });
        }
        Ok(entries)
    }

    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"]).map_err(spawn_err("diff --cached"))?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            return Ok(false);
        }
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .map_err(spawn_err("show-ref"))?
            .status;
        Ok(status.success())
    }

    fn branch_checked_out_elsewhere(&self, branch: &str) -> Result<bool> {
        Ok(self
            .list_worktrees()?
            .iter()
            .any(|entry| entry.branch.as_deref() == Some(branch)))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args).map_err(spawn_err(&args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitError::Command {
                args: args.join(" "),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> std::result::Result<Output, std::io::Error> {
        Command::new("git").args(args).current_dir(&self.workdir).output()
    }
}

fn spawn_err(args: &str) -> impl FnOnce(std::io::Error) -> GitError + '_ {
    move |source| GitError::Spawn {
        args: args.to_string(),
        source,
    }
}
