use chorus_core::ChorusResult;
use chorus_git::Repo;
use std::path::Path;
use tracing::{info, warn};

/// Result of one rebase attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebaseResult {
    /// The branch now sits on top of the target.
    pub success: bool,
    /// The rebase stopped on conflicts and was aborted.
    pub had_conflicts: bool,
    /// Raw git error for failures other than conflicts.
    pub error: Option<String>,
}

impl RebaseResult {
    fn ok() -> Self {
        Self {
            success: true,
            had_conflicts: false,
            error: None,
        }
    }
}

/// Rebases a branch checkout onto the merge target.
///
/// Conflicts are detected from git's rebase state directories rather than the
/// exit code, and only a rebase this type started is ever aborted.
#[derive(Clone)]
pub struct RebaseRetry {
    repo: Repo,
}

impl RebaseRetry {
    /// Create a rebaser over `repo`.
    pub fn new(repo: Repo) -> Self {
        Self { repo }
    }

    /// `git rebase <onto>` in `cwd`.
    pub async fn rebase(&self, cwd: &Path, onto: &str) -> ChorusResult<RebaseResult> {
        let out = self.repo.rebase(cwd, onto).await?;
        if out.success() {
            info!(cwd = %cwd.display(), onto = %onto, "Rebase succeeded");
            return Ok(RebaseResult::ok());
        }

        if self.repo.rebase_in_progress(cwd).await? {
            let abort = self.repo.abort_rebase(cwd).await?;
            if !abort.success() {
                warn!(cwd = %cwd.display(), error = %abort.message(), "git rebase --abort failed");
            }
            info!(cwd = %cwd.display(), onto = %onto, "Rebase hit conflicts, aborted");
            return Ok(RebaseResult {
                success: false,
                had_conflicts: true,
                error: None,
            });
        }

        warn!(cwd = %cwd.display(), onto = %onto, error = %out.message(), "Rebase failed");
        Ok(RebaseResult {
            success: false,
            had_conflicts: false,
            error: Some(out.message().to_string()),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chorus_git::{GitOutput, MockGitRunner};
    use std::sync::Arc;

    fn rebaser(git: MockGitRunner) -> (RebaseRetry, Arc<MockGitRunner>) {
        let git = Arc::new(git);
        (RebaseRetry::new(Repo::new(git.clone(), "/repo")), git)
    }

    #[tokio::test]
    async fn test_clean_rebase() {
        let (rebaser, git) = rebaser(MockGitRunner::ok());
        let result = rebaser.rebase(Path::new("/wt"), "main").await.unwrap();
        assert!(result.success);
        assert_eq!(git.commands(), vec!["rebase main"]);
    }

    #[tokio::test]
    async fn test_conflict_aborts() {
        let (rebaser, git) = rebaser(MockGitRunner::new(|call| {
            if call.starts_with(&["rebase", "main"]) {
                GitOutput::failure(1, "CONFLICT (content): Merge conflict in src/lib.rs")
            } else {
                GitOutput::ok("")
            }
        }));
        git.set_rebase_in_progress(true);
        let result = rebaser.rebase(Path::new("/wt"), "main").await.unwrap();
        assert!(!result.success);
        assert!(result.had_conflicts);
        assert!(git.ran("rebase --abort"));
    }

    #[tokio::test]
    async fn test_other_error_does_not_abort() {
        let (rebaser, git) = rebaser(MockGitRunner::new(|_| {
            GitOutput::failure(128, "fatal: invalid upstream 'main'")
        }));
        let result = rebaser.rebase(Path::new("/wt"), "main").await.unwrap();
        assert!(!result.had_conflicts);
        assert_eq!(result.error.as_deref(), Some("fatal: invalid upstream 'main'"));
        assert!(!git.ran("--abort"));
    }
}
