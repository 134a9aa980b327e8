use chorus_checkpoint::{CheckpointType, Checkpointer};
use chorus_core::{ChorusError, ChorusResult};
use chorus_git::Repo;
use chorus_tasks::{TaskStatus, TaskStore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

/// How much work a rollback undoes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackLevel {
    /// The last iterations of one agent, inside its worktree.
    Iteration,
    /// Every commit of one task on the integration branch.
    Task,
    /// A task and everything that depends on it.
    TaskChain,
    /// Back to the autopilot start checkpoint.
    Session,
}

impl fmt::Display for RollbackLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackLevel::Iteration => write!(f, "iteration"),
            RollbackLevel::Task => write!(f, "task"),
            RollbackLevel::TaskChain => write!(f, "task_chain"),
            RollbackLevel::Session => write!(f, "session"),
        }
    }
}

impl std::str::FromStr for RollbackLevel {
    type Err = ChorusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "iteration" => Ok(RollbackLevel::Iteration),
            "task" => Ok(RollbackLevel::Task),
            "task_chain" | "task-chain" | "chain" => Ok(RollbackLevel::TaskChain),
            "session" => Ok(RollbackLevel::Session),
            other => Err(ChorusError::Config(format!("unknown rollback level: {other}"))),
        }
    }
}

/// What a rollback did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Granularity that was undone.
    pub level: RollbackLevel,
    /// Task id, agent id or checkpoint tag the rollback aimed at.
    pub target: String,
    /// Tasks put back to `todo`, in the order they were handled.
    pub affected_tasks: Vec<String>,
    /// Commits reverted or reset.
    pub reverted_commits: usize,
}

/// Undoes agent work at the granularity of a [`RollbackLevel`].
///
/// Task rollbacks revert commits tagged `[<task-id>]` on the main checkout
/// instead of rewriting history, so work merged after the task survives.
pub struct Rollback {
    repo: Repo,
}

impl Rollback {
    /// Roll back commits in `repo`.
    pub fn new(repo: Repo) -> Self {
        Self { repo }
    }

    /// Soft-reset an agent worktree to the commit an iteration started from.
    /// The undone changes stay staged for the next iteration.
    pub async fn iteration(
        &self,
        agent_id: &str,
        worktree: &Path,
        start_commit: &str,
    ) -> ChorusResult<RollbackReport> {
        self.repo.reset_soft(worktree, start_commit).await?;
        info!(agent_id = %agent_id, commit = %start_commit, "Iteration rolled back");
        Ok(RollbackReport {
            level: RollbackLevel::Iteration,
            target: agent_id.to_string(),
            affected_tasks: Vec::new(),
            reverted_commits: 0,
        })
    }

    /// Revert one task's commits and put it back to `todo`.
    pub async fn task(&self, tasks: &mut TaskStore, task_id: &str) -> ChorusResult<RollbackReport> {
        require(tasks, task_id)?;
        let ids = vec![task_id.to_string()];
        self.revert_tasks(tasks, RollbackLevel::Task, task_id, ids)
            .await
    }

    /// Revert a task and its transitive dependents, leaves first.
    pub async fn task_chain(
        &self,
        tasks: &mut TaskStore,
        task_id: &str,
    ) -> ChorusResult<RollbackReport> {
        require(tasks, task_id)?;
        let ids = tasks.dependents_transitive(task_id);
        self.revert_tasks(tasks, RollbackLevel::TaskChain, task_id, ids)
            .await
    }

    /// Restore the latest autopilot start checkpoint and reopen every task
    /// whose commits were dropped.
    pub async fn session(
        &self,
        checkpointer: &mut Checkpointer,
        tasks: &mut TaskStore,
    ) -> ChorusResult<RollbackReport> {
        let tag = checkpointer
            .latest(Some(CheckpointType::AutopilotStart))
            .map(|c| c.id.clone())
            .ok_or_else(|| {
                ChorusError::Orchestrator("no autopilot start checkpoint to roll back to".into())
            })?;
        let affected = checkpointer.restore(&tag).await?;

        let mut reset = Vec::new();
        for id in &affected {
            if tasks.get(id).is_none() {
                warn!(task_id = %id, "Commit references unknown task");
                continue;
            }
            reset_task(tasks, id)?;
            reset.push(id.clone());
        }
        info!(checkpoint = %tag, affected = reset.len(), "Session rolled back");
        Ok(RollbackReport {
            level: RollbackLevel::Session,
            target: tag,
            affected_tasks: reset,
            reverted_commits: 0,
        })
    }

    async fn revert_tasks(
        &self,
        tasks: &mut TaskStore,
        level: RollbackLevel,
        target: &str,
        ids: Vec<String>,
    ) -> ChorusResult<RollbackReport> {
        let root = self.repo.root().to_path_buf();
        let mut reverted = 0;
        for id in &ids {
            let shas = self
                .repo
                .commits_matching(&root, &format!("[{id}]"))
                .await?;
            for sha in shas {
                if let Err(e) = self.repo.revert_no_commit(&root, &sha).await {
                    warn!(task_id = %id, sha = %sha, error = %e, "Revert failed, aborting rollback");
                    let _ = self.repo.run(&["revert", "--abort"]).await;
                    return Err(e);
                }
                reverted += 1;
            }
        }

        if reverted > 0 {
            // No brackets: the revert commit must not count as work of the task.
            let message = format!("Revert {} ({level} rollback)", ids.join(", "));
            self.repo
                .run_checked(&root, &["commit", "-m", &message])
                .await?;
        }

        for id in &ids {
            reset_task(tasks, id)?;
        }
        info!(target = %target, level = %level, reverted, tasks = ids.len(), "Tasks rolled back");
        Ok(RollbackReport {
            level,
            target: target.to_string(),
            affected_tasks: ids,
            reverted_commits: reverted,
        })
    }
}

fn require(tasks: &TaskStore, task_id: &str) -> ChorusResult<()> {
    if tasks.get(task_id).is_none() {
        return Err(ChorusError::TaskNotFound(task_id.to_string()));
    }
    Ok(())
}

/// Put a task back to `todo` from whatever state it reached.
fn reset_task(tasks: &mut TaskStore, id: &str) -> ChorusResult<()> {
    let status = tasks
        .get(id)
        .map(|t| t.status)
        .ok_or_else(|| ChorusError::TaskNotFound(id.to_string()))?;
    match status {
        TaskStatus::Done | TaskStatus::Failed => {
            tasks.reopen(id)?;
        }
        TaskStatus::Doing => {
            tasks.release(id)?;
        }
        TaskStatus::Todo => {}
    }
    Ok(())
}
