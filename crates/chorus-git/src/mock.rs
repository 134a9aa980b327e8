use crate::runner::{GitOutput, GitRunner};
use async_trait::async_trait;
use chorus_core::ChorusResult;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// One recorded invocation of [`MockGitRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCall {
    /// Working directory the command ran in.
    pub cwd: PathBuf,
    /// Arguments after `git`.
    pub args: Vec<String>,
}

impl GitCall {
    /// Arguments joined with spaces, e.g. `"rebase main"`.
    pub fn command(&self) -> String {
        self.args.join(" ")
    }

    /// Whether the arguments start with `prefix`.
    pub fn starts_with(&self, prefix: &[&str]) -> bool {
        self.args.len() >= prefix.len() && self.args.iter().zip(prefix).all(|(a, p)| a == p)
    }
}

type Handler = Box<dyn Fn(&GitCall) -> GitOutput + Send + Sync>;

/// A [`GitRunner`] whose responses come from a closure. Every call is recorded.
pub struct MockGitRunner {
    handler: Handler,
    calls: Mutex<Vec<GitCall>>,
    rebase_in_progress: AtomicBool,
}

impl MockGitRunner {
    /// Create a runner that answers every call with `handler`.
    pub fn new(handler: impl Fn(&GitCall) -> GitOutput + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            rebase_in_progress: AtomicBool::new(false),
        }
    }

    /// A runner where every command succeeds with empty output.
    pub fn ok() -> Self {
        Self::new(|_| GitOutput::ok(""))
    }

    /// Make [`GitRunner::rebase_in_progress`] report `value`.
    pub fn set_rebase_in_progress(&self, value: bool) {
        self.rebase_in_progress.store(value, Ordering::SeqCst);
    }

    /// Snapshot of every call so far.
    pub fn calls(&self) -> Vec<GitCall> {
        self.calls.lock().clone()
    }

    /// Every call rendered with [`GitCall::command`].
    pub fn commands(&self) -> Vec<String> {
        self.calls().iter().map(GitCall::command).collect()
    }

    /// Whether any recorded command contains `needle`.
    pub fn ran(&self, needle: &str) -> bool {
        self.commands().iter().any(|c| c.contains(needle))
    }
}

#[async_trait]
impl GitRunner for MockGitRunner {
    async fn run(&self, cwd: &Path, args: &[&str]) -> ChorusResult<GitOutput> {
        let call = GitCall {
            cwd: cwd.to_path_buf(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
        };
        let out = (self.handler)(&call);
        self.calls.lock().push(call);
        Ok(out)
    }

    async fn rebase_in_progress(&self, _cwd: &Path) -> ChorusResult<bool> {
        Ok(self.rebase_in_progress.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_calls() {
        let git = MockGitRunner::new(|call| {
            if call.starts_with(&["rev-parse"]) {
                GitOutput::ok("abc123\n")
            } else {
                GitOutput::failure(1, "nope")
            }
        });
        let out = git
            .run(Path::new("/repo"), &["rev-parse", "HEAD"])
            .await
            .unwrap();
        assert_eq!(out.trimmed(), "abc123");
        let out = git.run(Path::new("/repo"), &["merge", "x"]).await.unwrap();
        assert!(!out.success());
        assert_eq!(git.commands(), vec!["rev-parse HEAD", "merge x"]);
        assert!(git.ran("merge"));
    }
}
