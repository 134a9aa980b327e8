use crate::rebase::{RebaseResult, RebaseRetry};
use chorus_core::ChorusResult;
use chorus_git::Repo;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Outcome of one force-push check for a queue item.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ForcePushCheck {
    /// The remote target was rewritten since the last fetch.
    pub detected: bool,
    /// Recovery budget for this task is spent; autopilot should stop.
    pub needs_pause: bool,
    /// Recoveries performed for this task so far.
    pub recovery_count: u32,
    /// Result of the recovery rebase, when one ran.
    pub rebase: Option<RebaseResult>,
}

/// Detects upstream force-pushes to the merge target and rebases onto the
/// rewritten history, a bounded number of times per task.
pub struct ForcePushRecovery {
    repo: Repo,
    rebaser: RebaseRetry,
    remote: String,
    target: String,
    max_recoveries: u32,
    counts: HashMap<String, u32>,
}

impl ForcePushRecovery {
    /// Watch `<remote>/<target>`; pause after `max_recoveries` per task.
    pub fn new(repo: Repo, remote: &str, target: &str, max_recoveries: u32) -> Self {
        Self {
            rebaser: RebaseRetry::new(repo.clone()),
            repo,
            remote: remote.to_string(),
            target: target.to_string(),
            max_recoveries,
            counts: HashMap::new(),
        }
    }

    fn tracking_ref(&self) -> String {
        format!("refs/remotes/{}/{}", self.remote, self.target)
    }

    /// Fetch the target and report whether its history was rewritten.
    ///
    /// A fetch failure (no remote, offline) counts as "not detected".
    pub async fn detect(&self) -> ChorusResult<bool> {
        let tracking = self.tracking_ref();
        let before = self.repo.rev_parse(&tracking).await?;
        if let Err(e) = self.repo.fetch(&self.remote, &self.target).await {
            debug!(remote = %self.remote, error = %e, "Fetch failed, skipping force-push check");
            return Ok(false);
        }
        let after = self.repo.rev_parse(&tracking).await?;

        let (Some(before), Some(after)) = (before, after) else {
            return Ok(false);
        };
        if before == after {
            return Ok(false);
        }
        match self.repo.is_ancestor(&before, &after).await {
            Ok(fast_forward) => Ok(!fast_forward),
            Err(e) => {
                warn!(error = %e, "Could not compare remote history");
                Ok(false)
            }
        }
    }

    /// Rebase the task's checkout onto the rewritten target.
    ///
    /// Once `max_recoveries` have been spent on a task, no further rebase runs
    /// and `needs_pause` is set.
    pub async fn recover(&mut self, task_id: &str, cwd: &Path) -> ChorusResult<ForcePushCheck> {
        let count = self.recovery_count(task_id);
        if count >= self.max_recoveries {
            warn!(task_id = %task_id, recoveries = count, "Force-push recovery budget exhausted");
            return Ok(ForcePushCheck {
                detected: true,
                needs_pause: true,
                recovery_count: count,
                rebase: None,
            });
        }

        if let Err(e) = self.repo.fetch(&self.remote, &self.target).await {
            warn!(remote = %self.remote, error = %e, "Re-fetch before recovery failed");
        }
        let onto = format!("{}/{}", self.remote, self.target);
        let rebase = self.rebaser.rebase(cwd, &onto).await?;

        let count = count + 1;
        self.counts.insert(task_id.to_string(), count);
        info!(task_id = %task_id, recoveries = count, success = rebase.success, "Recovered from force-push");
        Ok(ForcePushCheck {
            detected: true,
            needs_pause: false,
            recovery_count: count,
            rebase: Some(rebase),
        })
    }

    /// [`detect`](Self::detect), then [`recover`](Self::recover) if needed.
    pub async fn check(&mut self, task_id: &str, cwd: &Path) -> ChorusResult<ForcePushCheck> {
        if !self.detect().await? {
            return Ok(ForcePushCheck {
                recovery_count: self.recovery_count(task_id),
                ..ForcePushCheck::default()
            });
        }
        info!(task_id = %task_id, target = %self.target, "Upstream force-push detected");
        self.recover(task_id, cwd).await
    }

    /// Recoveries performed for `task_id`.
    pub fn recovery_count(&self, task_id: &str) -> u32 {
        self.counts.get(task_id).copied().unwrap_or(0)
    }

    /// Forget the counter for a task that has left the queue.
    pub fn reset(&mut self, task_id: &str) {
        self.counts.remove(task_id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chorus_git::{GitOutput, MockGitRunner};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Every fetch rewrites `origin/main` to a sha unrelated to the previous one.
    fn force_pushing_git() -> MockGitRunner {
        let fetches = AtomicU32::new(0);
        MockGitRunner::new(move |call| {
            if call.starts_with(&["fetch"]) {
                fetches.fetch_add(1, Ordering::SeqCst);
                GitOutput::ok("")
            } else if call.starts_with(&["rev-parse"]) {
                GitOutput::ok(format!("sha{}\n", fetches.load(Ordering::SeqCst)))
            } else if call.starts_with(&["merge-base", "--is-ancestor"]) {
                GitOutput::failure(1, "")
            } else {
                GitOutput::ok("")
            }
        })
    }

    fn recovery(git: MockGitRunner) -> (ForcePushRecovery, Arc<MockGitRunner>) {
        let git = Arc::new(git);
        let repo = Repo::new(git.clone(), "/repo");
        (ForcePushRecovery::new(repo, "origin", "main", 2), git)
    }

    #[tokio::test]
    async fn test_third_force_push_needs_pause() {
        let (mut fp, git) = recovery(force_pushing_git());
        let wt = Path::new("/wt");

        let first = fp.check("ch-1", wt).await.unwrap();
        assert!(first.detected);
        assert!(!first.needs_pause);
        assert_eq!(first.recovery_count, 1);

        let second = fp.check("ch-1", wt).await.unwrap();
        assert!(!second.needs_pause);
        assert_eq!(second.recovery_count, 2);

        let third = fp.check("ch-1", wt).await.unwrap();
        assert!(third.detected);
        assert!(third.needs_pause);
        assert!(third.rebase.is_none());

        assert_eq!(
            git.commands().iter().filter(|c| *c == "rebase origin/main").count(),
            2
        );
        // Counters are per task.
        assert!(!fp.check("ch-2", wt).await.unwrap().needs_pause);
    }

    #[tokio::test]
    async fn test_fast_forward_is_not_force_push() {
        let (fp, _) = recovery(MockGitRunner::new({
            let fetched = AtomicU32::new(0);
            move |call| {
                if call.starts_with(&["fetch"]) {
                    fetched.store(1, Ordering::SeqCst);
                    GitOutput::ok("")
                } else if call.starts_with(&["rev-parse"]) {
                    GitOutput::ok(format!("sha{}\n", fetched.load(Ordering::SeqCst)))
                } else {
                    GitOutput::ok("")
                }
            }
        }));
        assert!(!fp.detect().await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_failure_is_not_detected() {
        let (fp, _) = recovery(MockGitRunner::new(|call| {
            if call.starts_with(&["fetch"]) {
                GitOutput::failure(128, "fatal: 'origin' does not appear to be a git repository")
            } else {
                GitOutput::ok("abc\n")
            }
        }));
        assert!(!fp.detect().await.unwrap());
    }

    #[tokio::test]
    async fn test_unchanged_ref() {
        let (fp, _) = recovery(MockGitRunner::new(|_| GitOutput::ok("same\n")));
        assert!(!fp.detect().await.unwrap());
    }
}
