use crate::classifier::ConflictInfo;
use async_trait::async_trait;
use chorus_core::{ChorusError, ChorusResult, SignalParser, SignalType};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// A conflict handed to a resolver agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveRequest {
    /// Task the branch belongs to.
    pub task_id: String,
    /// Worktree where the conflicted merge is in progress.
    pub worktree: PathBuf,
    /// Conflicting files.
    pub files: Vec<String>,
    /// Branch being merged into.
    pub target_branch: String,
}

/// What the resolver reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Conflicts are resolved and staged.
    Resolved,
    /// The resolver wants a human.
    NeedsHuman(Option<String>),
    /// The resolver crashed, timed out or emitted no verdict.
    Failed(String),
}

/// Resolves complex conflicts inside a worktree.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    /// Attempt to resolve the conflicts described by `request`.
    async fn resolve(&self, request: &ResolveRequest) -> ChorusResult<ResolveOutcome>;
}

/// Supplies line-range and semantic-conflict information for classification.
///
/// Without one, every non-allow-listed file classifies as `MEDIUM`.
#[async_trait]
pub trait ConflictInspector: Send + Sync {
    /// Describe the conflicts in `files`, as seen from `cwd`.
    async fn inspect(&self, cwd: &Path, files: &[String]) -> ChorusResult<Vec<ConflictInfo>>;
}

/// Runs an external command (argv) in the worktree and reads its verdict
/// from `<chorus>RESOLVED</chorus>` / `<chorus>NEEDS_HUMAN</chorus>` on stdout.
///
/// The conflicted files are passed in `CHORUS_CONFLICT_FILES`, newline separated.
pub struct CommandResolver {
    argv: Vec<String>,
    timeout: Duration,
    parser: SignalParser,
}

impl CommandResolver {
    /// Create a resolver running `argv` with the given timeout.
    pub fn new(argv: Vec<String>, timeout: Duration) -> ChorusResult<Self> {
        if argv.is_empty() {
            return Err(ChorusError::Config(
                "resolver_command must not be empty".to_string(),
            ));
        }
        Ok(Self {
            argv,
            timeout,
            parser: SignalParser::new(),
        })
    }
}

#[async_trait]
impl ConflictResolver for CommandResolver {
    async fn resolve(&self, request: &ResolveRequest) -> ChorusResult<ResolveOutcome> {
        info!(
            task_id = %request.task_id,
            files = request.files.len(),
            "Running conflict resolver"
        );
        let result = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(&self.argv[0])
                .args(&self.argv[1..])
                .current_dir(&request.worktree)
                .env("CHORUS_TASK_ID", &request.task_id)
                .env("CHORUS_TARGET_BRANCH", &request.target_branch)
                .env("CHORUS_CONFLICT_FILES", request.files.join("\n"))
                .kill_on_drop(true)
                .output(),
        )
        .await;

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Ok(ResolveOutcome::Failed(format!(
                    "failed to start resolver: {e}"
                )))
            }
            Err(_) => {
                warn!(task_id = %request.task_id, "Conflict resolver timed out");
                return Ok(ResolveOutcome::Failed(format!(
                    "resolver timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        for signal in self.parser.parse_all(&stdout) {
            match signal.kind {
                SignalType::Resolved => return Ok(ResolveOutcome::Resolved),
                SignalType::NeedsHuman => return Ok(ResolveOutcome::NeedsHuman(signal.payload)),
                _ => {}
            }
        }
        Ok(ResolveOutcome::Failed(format!(
            "resolver exited with {} without a verdict",
            output.status
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request(dir: &Path) -> ResolveRequest {
        ResolveRequest {
            task_id: "ch-1".into(),
            worktree: dir.to_path_buf(),
            files: vec!["a.rs".into(), "b.rs".into()],
            target_branch: "main".into(),
        }
    }

    fn sh(script: &str) -> CommandResolver {
        CommandResolver::new(
            vec!["sh".into(), "-c".into(), script.into()],
            Duration::from_secs(10),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandResolver::new(vec![], Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_resolved_signal() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = sh("echo working; echo '<chorus>RESOLVED</chorus>'");
        let outcome = resolver.resolve(&request(dir.path())).await.unwrap();
        assert_eq!(outcome, ResolveOutcome::Resolved);
    }

    #[tokio::test]
    async fn test_needs_human_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = sh("echo '<chorus>NEEDS_HUMAN:schema mismatch</chorus>'");
        let outcome = resolver.resolve(&request(dir.path())).await.unwrap();
        assert_eq!(
            outcome,
            ResolveOutcome::NeedsHuman(Some("schema mismatch".into()))
        );
    }

    #[tokio::test]
    async fn test_env_carries_files() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = sh(
            "test \"$CHORUS_CONFLICT_FILES\" = \"$(printf 'a.rs\\nb.rs')\" && echo '<chorus>RESOLVED</chorus>'",
        );
        let outcome = resolver.resolve(&request(dir.path())).await.unwrap();
        assert_eq!(outcome, ResolveOutcome::Resolved);
    }

    #[tokio::test]
    async fn test_no_verdict_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = sh("exit 3").resolve(&request(dir.path())).await.unwrap();
        assert!(matches!(outcome, ResolveOutcome::Failed(_)));
    }
}
