use chorus_core::ChorusResult;
use chorus_git::Repo;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Scratchpad written into each new worktree when no template is configured.
pub const DEFAULT_SCRATCHPAD: &str = "# Scratchpad for {task_id}\n\n\
## Plan\n\n\
## Notes\n\n\
## Blockers\n";

/// Creates and tears down per-agent git worktrees.
pub struct WorktreeManager {
    repo: Repo,
    base_branch: String,
    template_path: Option<PathBuf>,
}

impl WorktreeManager {
    /// Worktrees branch from `base_branch`.
    pub fn new(repo: Repo, base_branch: impl Into<String>) -> Self {
        Self {
            repo,
            base_branch: base_branch.into(),
            template_path: None,
        }
    }

    /// Use the scratchpad template at `path` when it exists.
    pub fn with_template(mut self, path: impl Into<PathBuf>) -> Self {
        self.template_path = Some(path.into());
        self
    }

    /// Make sure a worktree for `branch` exists at `path`.
    ///
    /// An existing directory is reused as is. Otherwise the branch is created
    /// from the base branch, or checked out if it already exists.
    pub async fn ensure(&self, task_id: &str, path: &Path, branch: &str) -> ChorusResult<()> {
        let full = self.absolute(path);
        if tokio::fs::try_exists(full.join(".git")).await.unwrap_or(false) {
            info!(task_id = %task_id, path = %full.display(), "Reusing worktree");
            return Ok(());
        }
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if self.repo.rev_parse(branch).await?.is_some() {
            self.repo.worktree_add_existing(&full, branch).await?;
        } else {
            self.repo
                .worktree_add(&full, branch, &self.base_branch)
                .await?;
        }
        info!(task_id = %task_id, branch = %branch, path = %full.display(), "Worktree created");

        self.write_scratchpad(task_id, &full).await
    }

    async fn write_scratchpad(&self, task_id: &str, worktree: &Path) -> ChorusResult<()> {
        let template = match &self.template_path {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(text) => text,
                Err(_) => DEFAULT_SCRATCHPAD.to_string(),
            },
            None => DEFAULT_SCRATCHPAD.to_string(),
        };
        let dir = worktree.join(".agent");
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("scratchpad.md"), template.replace("{task_id}", task_id)).await?;
        Ok(())
    }

    /// Stash uncommitted changes in the worktree. Returns whether anything was stashed.
    pub async fn stash(&self, path: &Path) -> ChorusResult<bool> {
        let full = self.absolute(path);
        if !tokio::fs::try_exists(&full).await.unwrap_or(false) {
            return Ok(false);
        }
        self.repo.stash(&full).await
    }

    /// Remove the worktree, keeping the branch.
    pub async fn remove(&self, path: &Path) -> ChorusResult<()> {
        let full = self.absolute(path);
        if let Err(e) = self.repo.worktree_remove(&full).await {
            warn!(path = %full.display(), error = %e, "Worktree removal failed");
            return Err(e);
        }
        Ok(())
    }

    /// `path` resolved against the repository root.
    pub fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.repo.root().join(path)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chorus_git::{GitOutput, MockGitRunner};
    use std::sync::Arc;

    fn manager(root: &Path, runner: Arc<MockGitRunner>) -> WorktreeManager {
        WorktreeManager::new(Repo::new(runner, root), "main")
    }

    #[tokio::test]
    async fn test_new_branch_from_base() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockGitRunner::new(|call| {
            if call.starts_with(&["rev-parse"]) {
                GitOutput::failure(128, "unknown revision")
            } else {
                GitOutput::ok("")
            }
        }));
        let wt = manager(tmp.path(), runner.clone());
        wt.ensure("ch-1", Path::new(".worktrees/agent-ch-1"), "agent/ch-1")
            .await
            .unwrap();

        assert!(runner.ran("worktree add"));
        assert!(runner.ran("-b agent/ch-1 main"));
        let pad = std::fs::read_to_string(
            tmp.path().join(".worktrees/agent-ch-1/.agent/scratchpad.md"),
        )
        .unwrap();
        assert!(pad.contains("Scratchpad for ch-1"));
    }

    #[tokio::test]
    async fn test_existing_branch_and_template() {
        let tmp = tempfile::tempdir().unwrap();
        let template = tmp.path().join("scratchpad.md");
        std::fs::write(&template, "Working on {task_id}\n").unwrap();
        let runner = Arc::new(MockGitRunner::new(|call| {
            if call.starts_with(&["rev-parse"]) {
                GitOutput::ok("abc123\n")
            } else {
                GitOutput::ok("")
            }
        }));
        let wt = manager(tmp.path(), runner.clone()).with_template(&template);
        wt.ensure("ch-2", Path::new(".worktrees/agent-ch-2"), "agent/ch-2")
            .await
            .unwrap();

        assert!(!runner.ran("-b agent/ch-2"));
        assert!(runner.ran("worktree add"));
        let pad = std::fs::read_to_string(
            tmp.path().join(".worktrees/agent-ch-2/.agent/scratchpad.md"),
        )
        .unwrap();
        assert_eq!(pad, "Working on ch-2\n");
    }

    #[tokio::test]
    async fn test_existing_worktree_reused() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join(".worktrees/agent-ch-3")).unwrap();
        std::fs::write(tmp.path().join(".worktrees/agent-ch-3/.git"), "gitdir: x").unwrap();
        let runner = Arc::new(MockGitRunner::ok());
        let wt = manager(tmp.path(), runner.clone());
        wt.ensure("ch-3", Path::new(".worktrees/agent-ch-3"), "agent/ch-3")
            .await
            .unwrap();
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stash_missing_worktree_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockGitRunner::ok());
        let wt = manager(tmp.path(), runner.clone());
        assert!(!wt.stash(Path::new(".worktrees/gone")).await.unwrap());
        assert!(runner.calls().is_empty());
    }
}
