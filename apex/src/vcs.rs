//! Thin wrapper over the VCS and PR CLIs: default-branch discovery, merging
//! a task branch, and polling a PR's merge state. Every operation shells out
//! rather than linking a VCS library, matching how the worktree provider
//! talks to git.

use std::path::Path;

use serde::Deserialize;
use tokio::process::Command;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("git command failed: {0}")]
    GitFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub success: bool,
    pub changed_files: Vec<String>,
    pub error: Option<String>,
    pub conflicted: bool,
}

async fn branch_exists(repo_root: &Path, branch: &str) -> Result<bool, VcsError> {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", branch])
        .current_dir(repo_root)
        .output()
        .await?;
    Ok(output.status.success())
}

/// `main`, else `master`, else a freshly created `main` at `HEAD`.
pub async fn default_branch(repo_root: &Path) -> Result<String, VcsError> {
    for candidate in ["main", "master"] {
        if branch_exists(repo_root, candidate).await? {
            return Ok(candidate.to_string());
        }
    }
    let output = Command::new("git")
        .args(["checkout", "-b", "main"])
        .current_dir(repo_root)
        .output()
        .await?;
    if !output.status.success() {
        return Err(VcsError::GitFailed(String::from_utf8_lossy(&output.stderr).to_string()));
    }
    Ok("main".to_string())
}

pub async fn current_branch(repo_root: &Path) -> Result<String, VcsError> {
    let output = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(repo_root)
        .output()
        .await?;
    if !output.status.success() {
        return Err(VcsError::GitFailed(String::from_utf8_lossy(&output.stderr).to_string()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Merge `branch` onto the default branch. On conflict, aborts the merge and
/// reports `conflicted: true` rather than leaving the tree in a half-merged
/// state.
pub async fn merge_branch(repo_root: &Path, branch: &str, squash: bool) -> Result<MergeOutcome, VcsError> {
    let default = default_branch(repo_root).await?;

    let checkout = Command::new("git")
        .args(["checkout", &default])
        .current_dir(repo_root)
        .output()
        .await?;
    if !checkout.status.success() {
        return Ok(MergeOutcome {
            success: false,
            error: Some(String::from_utf8_lossy(&checkout.stderr).to_string()),
            ..Default::default()
        });
    }

    let mut args = vec!["merge"];
    if squash {
        args.push("--squash");
    }
    args.push(branch);
    let merge = Command::new("git").args(&args).current_dir(repo_root).output().await?;

    if !merge.status.success() {
        warn!(branch, "merge conflict detected, aborting");
        let _ = Command::new("git").args(["merge", "--abort"]).current_dir(repo_root).output().await;
        return Ok(MergeOutcome {
            success: false,
            error: Some("merge conflicts".to_string()),
            conflicted: true,
            ..Default::default()
        });
    }

    if squash {
        let _ = Command::new("git")
            .args(["commit", "-m", &format!("Merge {branch} (squash)"), "--allow-empty"])
            .current_dir(repo_root)
            .output()
            .await;
    }

    let diff = Command::new("git")
        .args(["diff", "--name-only", &format!("{default}@{{1}}"), &default])
        .current_dir(repo_root)
        .output()
        .await?;
    let changed_files = String::from_utf8_lossy(&diff.stdout)
        .lines()
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    Ok(MergeOutcome {
        success: true,
        changed_files,
        error: None,
        conflicted: false,
    })
}

#[derive(Debug, Deserialize)]
struct PrView {
    state: String,
}

/// Pull the trailing numeric path segment off a PR URL
/// (`https://github.com/org/repo/pull/456` -> `456`).
pub fn parse_pr_number(pr_url: &str) -> Option<u64> {
    pr_url.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

/// Query the PR CLI for a task's pull request state. Degrades to `false` on
/// any failure -- missing CLI, unparsable URL, auth error, not-found -- each
/// logged at `warn` rather than propagated, per the persistent-external-error
/// handling this check is specified to follow.
pub async fn check_pr_merged(repo_root: &Path, pr_url: Option<&str>) -> bool {
    let Some(pr_url) = pr_url else {
        warn!("check_pr_merged: task has no PR url");
        return false;
    };
    let Some(number) = parse_pr_number(pr_url) else {
        warn!(pr_url, "check_pr_merged: could not parse PR number");
        return false;
    };

    let output = match Command::new("gh")
        .args(["pr", "view", &number.to_string(), "--json", "state"])
        .current_dir(repo_root)
        .output()
        .await
    {
        Ok(o) => o,
        Err(e) => {
            warn!(error = %e, "check_pr_merged: PR CLI unavailable");
            return false;
        }
    };

    if !output.status.success() {
        warn!(pr_url, "check_pr_merged: gh pr view failed");
        return false;
    }

    match serde_json::from_slice::<PrView>(&output.stdout) {
        Ok(view) => view.state == "MERGED",
        Err(e) => {
            warn!(error = %e, "check_pr_merged: unparsable gh pr view output");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pr_number_extracts_trailing_segment() {
        assert_eq!(parse_pr_number("https://github.com/org/repo/pull/456"), Some(456));
        assert_eq!(parse_pr_number("https://github.com/org/repo/pull/456/"), Some(456));
        assert_eq!(parse_pr_number("not-a-url"), None);
    }
}
