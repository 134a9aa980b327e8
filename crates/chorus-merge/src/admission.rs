use crate::queue::{MergeQueue, MergeRequest, MAX_PRIORITY};
use chorus_core::ChorusError;
use chorus_git::Repo;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Priority given to operator branches when none is supplied.
pub const DEFAULT_MERGE_PRIORITY: u8 = 2;

/// Why a branch was not admitted to the merge queue.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// The branch does not resolve to a commit.
    #[error("branch not found: {0}")]
    BranchNotFound(String),

    /// The branch has nothing to merge.
    #[error("no commits ahead of {target}: {branch}")]
    NoCommitsAhead {
        /// Branch that was offered.
        branch: String,
        /// Integration branch it was compared against.
        target: String,
    },

    /// The branch is queued already.
    #[error("branch already in queue: {0}")]
    AlreadyQueued(String),

    /// Priority outside 0-4.
    #[error("invalid priority {0}: expected 0-4")]
    InvalidPriority(u8),

    /// Git itself failed while validating.
    #[error(transparent)]
    Internal(#[from] ChorusError),
}

/// A branch accepted into the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    /// Derived task id, `user-<branch>`.
    pub task_id: String,
    /// The admitted branch.
    pub branch: String,
    /// 1-based position: queue length after insertion.
    pub position: usize,
    /// Commits on the branch not yet on the target.
    pub commits_ahead: u32,
    /// 0 (highest) to 4.
    pub priority: u8,
}

/// Task id used for an operator-submitted branch.
pub fn user_task_id(branch: &str) -> String {
    format!("user-{}", branch.replace('/', "-"))
}

/// Validate `branch` and enqueue it.
///
/// Checks, in order: priority range, branch exists, not already queued, at
/// least one commit ahead of `target`.
pub async fn admit(
    repo: &Repo,
    queue: &mut MergeQueue,
    target: &str,
    branch: &str,
    priority: Option<u8>,
) -> Result<Admission, AdmissionError> {
    let priority = priority.unwrap_or(DEFAULT_MERGE_PRIORITY);
    if priority > MAX_PRIORITY {
        return Err(AdmissionError::InvalidPriority(priority));
    }
    if repo.rev_parse(branch).await?.is_none() {
        return Err(AdmissionError::BranchNotFound(branch.to_string()));
    }
    if queue.contains_branch(branch) {
        return Err(AdmissionError::AlreadyQueued(branch.to_string()));
    }
    let commits_ahead = repo.commits_ahead(target, branch).await?;
    if commits_ahead == 0 {
        return Err(AdmissionError::NoCommitsAhead {
            branch: branch.to_string(),
            target: target.to_string(),
        });
    }

    let task_id = user_task_id(branch);
    let position = queue.enqueue(MergeRequest {
        task_id: task_id.clone(),
        branch: branch.to_string(),
        worktree: None,
        priority,
        dependencies: Vec::new(),
    })?;
    info!(branch = %branch, task_id = %task_id, position, commits_ahead, "Branch admitted to merge queue");

    Ok(Admission {
        task_id,
        branch: branch.to_string(),
        position,
        commits_ahead,
        priority,
    })
}
