//! Git worktree controller for write-capable child sessions.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;

use crate::error::OrchardError;
use crate::subprocess::{RunOutput, Tool};

const GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Merges touch the parent repository's index; one at a time per process.
static MERGE_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub bare: bool,
    pub detached: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorktreeDiff {
    pub branch: String,
    pub commits: Vec<String>,
    pub files: Vec<String>,
    pub patch: String,
}

/// Branch name used for a child's worktree.
pub fn branch_name(parent: u64, child_index: u32) -> String {
    format!("orchard/s{parent}-c{child_index}")
}

fn git(repo: &Path) -> Tool {
    Tool::new("git").current_dir(repo).timeout(GIT_TIMEOUT)
}

fn git_ok(repo: &Path, args: &[&str]) -> anyhow::Result<RunOutput> {
    git(repo).args(args).run_ok()
}

/// Top of the main checkout that owns `cwd`, even when `cwd` is inside a
/// linked worktree.
pub fn repo_root(cwd: &Path) -> anyhow::Result<PathBuf> {
    let out = git_ok(cwd, &["rev-parse", "--path-format=absolute", "--git-common-dir"])
        .with_context(|| format!("{} is not inside a git repository", cwd.display()))?;
    let common = PathBuf::from(out.stdout.trim());
    if common.file_name().is_some_and(|n| n == ".git") {
        if let Some(parent) = common.parent() {
            return Ok(parent.to_path_buf());
        }
    }
    // Bare repository: the common dir is the repository itself.
    Ok(common)
}

pub fn current_branch(repo: &Path) -> anyhow::Result<String> {
    let out = git_ok(repo, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    Ok(out.stdout.trim().to_string())
}

fn branch_exists(repo: &Path, branch: &str) -> bool {
    git(repo)
        .args(&["rev-parse", "--verify", "--quiet"])
        .arg(format!("refs/heads/{branch}"))
        .run()
        .is_ok_and(|o| o.success())
}

/// Create a worktree at `path` on a new branch forked from `base`.
pub fn create(repo: &Path, path: &Path, branch: &str, base: &str) -> anyhow::Result<()> {
    if path.exists() {
        return Err(OrchardError::WorktreeBusy(format!("{} already exists", path.display())).into());
    }
    if branch_exists(repo, branch) {
        return Err(OrchardError::WorktreeBusy(format!("branch {branch} already exists")).into());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let path_str = path.to_string_lossy();
    git_ok(repo, &["worktree", "add", "-b", branch, &path_str, base])
        .with_context(|| format!("creating worktree {}", path.display()))?;
    tracing::info!(path = %path.display(), branch, base, "worktree created");
    Ok(())
}

pub fn list(repo: &Path) -> anyhow::Result<Vec<WorktreeInfo>> {
    let out = git_ok(repo, &["worktree", "list", "--porcelain"])?;
    Ok(parse_porcelain(&out.stdout))
}

fn parse_porcelain(text: &str) -> Vec<WorktreeInfo> {
    let mut result = Vec::new();
    let mut current: Option<WorktreeInfo> = None;
    for line in text.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            result.extend(current.take());
            current = Some(WorktreeInfo {
                path: PathBuf::from(path),
                head: None,
                branch: None,
                bare: false,
                detached: false,
            });
            continue;
        }
        let Some(wt) = current.as_mut() else { continue };
        if let Some(head) = line.strip_prefix("HEAD ") {
            wt.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            wt.branch = Some(branch.strip_prefix("refs/heads/").unwrap_or(branch).to_string());
        } else if line == "bare" {
            wt.bare = true;
        } else if line == "detached" {
            wt.detached = true;
        }
    }
    result.extend(current);
    result
}

/// Remove a worktree and, if given, its branch. Missing pieces are not errors.
pub fn remove(repo: &Path, path: &Path, branch: Option<&str>) -> anyhow::Result<()> {
    if path.exists() {
        let path_str = path.to_string_lossy();
        if let Err(e) = git_ok(repo, &["worktree", "remove", "--force", &path_str]) {
            tracing::warn!(path = %path.display(), error = %e, "git worktree remove failed, deleting directory");
            std::fs::remove_dir_all(path)
                .with_context(|| format!("removing {}", path.display()))?;
        }
    }
    // Forget administrative entries for directories that are gone.
    let _ = git(repo).args(&["worktree", "prune"]).run();
    if let Some(branch) = branch {
        if branch_exists(repo, branch) {
            git_ok(repo, &["branch", "-D", branch])
                .with_context(|| format!("deleting branch {branch}"))?;
        }
    }
    tracing::info!(path = %path.display(), "worktree removed");
    Ok(())
}

/// Merge `branch` into the repository's current branch. Squash merges stage
/// the combined change and commit it with `message`; otherwise a no-ff
/// merge commit is created. On failure the merge is aborted and the
/// repository is left as it was.
pub fn merge(repo: &Path, branch: &str, squash: bool, message: &str) -> anyhow::Result<String> {
    let _guard = MERGE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

    if !branch_exists(repo, branch) {
        return Err(OrchardError::NotFound {
            what: "branch",
            id: branch.to_string(),
        }
        .into());
    }

    let result = if squash {
        git_ok(repo, &["merge", "--squash", branch]).and_then(|_| {
            let staged = git(repo).args(&["diff", "--cached", "--quiet"]).run()?;
            if staged.success() {
                // Nothing to commit: the branch carried no changes.
                return Ok(());
            }
            git_ok(repo, &["commit", "-m", message]).map(|_| ())
        })
    } else {
        git_ok(repo, &["merge", "--no-ff", "-m", message, branch]).map(|_| ())
    };

    if let Err(e) = result {
        let abort = if squash { ["reset", "--merge"] } else { ["merge", "--abort"] };
        let _ = git(repo).args(&abort).run();
        return Err(e.context(format!("merging {branch}")));
    }

    let head = git_ok(repo, &["rev-parse", "HEAD"])?;
    let head = head.stdout.trim().to_string();
    tracing::info!(branch, squash, head = %head, "branch merged");
    Ok(head)
}

/// Commits and changes on `branch` since it forked from the current branch.
pub fn diff(repo: &Path, branch: &str) -> anyhow::Result<WorktreeDiff> {
    let range = format!("HEAD..{branch}");
    let merge_base = format!("HEAD...{branch}");
    let log = git_ok(repo, &["log", "--oneline", &range])?;
    let names = git_ok(repo, &["diff", "--name-only", &merge_base])?;
    let patch = git_ok(repo, &["diff", &merge_base])?;
    Ok(WorktreeDiff {
        branch: branch.to_string(),
        commits: log.stdout.lines().map(str::to_string).collect(),
        files: names
            .stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        patch: patch.stdout,
    })
}

/// True when the worktree has uncommitted changes.
pub fn is_dirty(path: &Path) -> anyhow::Result<bool> {
    let out = git_ok(path, &["status", "--porcelain"])?;
    Ok(!out.stdout.trim().is_empty())
}

/// Stage and commit everything in a worktree. Returns false when clean.
pub fn commit_all(path: &Path, message: &str) -> anyhow::Result<bool> {
    if !is_dirty(path)? {
        return Ok(false);
    }
    git_ok(path, &["add", "-A"])?;
    git_ok(path, &["commit", "-m", message])?;
    Ok(true)
}
