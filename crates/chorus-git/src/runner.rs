use async_trait::async_trait;
use chorus_core::{ChorusError, ChorusResult};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Captured result of one git invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GitOutput {
    /// Process exit code (`-1` when killed by a signal).
    pub code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl GitOutput {
    /// A successful invocation with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed invocation with the given exit code and stderr.
    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether git exited with status 0.
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// stdout with surrounding whitespace removed.
    pub fn trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// stderr if present, else stdout. Used in error messages.
    pub fn message(&self) -> &str {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim()
        } else {
            err
        }
    }
}

/// Executes git commands. The only way Chorus touches a repository.
#[async_trait]
pub trait GitRunner: Send + Sync {
    /// Run `git <args>` in `cwd` and capture its output.
    ///
    /// A non-zero exit status is *not* an error here; it comes back in
    /// [`GitOutput::code`]. `Err` means git could not be run at all.
    async fn run(&self, cwd: &Path, args: &[&str]) -> ChorusResult<GitOutput>;

    /// Whether a rebase is stopped mid-way in `cwd`.
    ///
    /// Detected from the rebase state directories rather than from the exit
    /// code of `git rebase`, which is non-zero for unrelated failures too.
    async fn rebase_in_progress(&self, cwd: &Path) -> ChorusResult<bool> {
        for marker in ["rebase-merge", "rebase-apply"] {
            let out = self.run(cwd, &["rev-parse", "--git-path", marker]).await?;
            if !out.success() {
                continue;
            }
            let path = cwd.join(out.trimmed());
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Runs the system `git` binary as a tokio subprocess.
#[derive(Debug, Clone)]
pub struct CliGitRunner {
    timeout: Duration,
}

impl CliGitRunner {
    /// Create a runner with the default 120s per-command timeout.
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(120),
        }
    }

    /// Override the per-command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for CliGitRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GitRunner for CliGitRunner {
    async fn run(&self, cwd: &Path, args: &[&str]) -> ChorusResult<GitOutput> {
        debug!(cwd = %cwd.display(), args = ?args, "git");

        let result = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new("git")
                .args(args)
                .current_dir(cwd)
                .env("GIT_TERMINAL_PROMPT", "0")
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => Ok(GitOutput {
                code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(e)) => Err(ChorusError::Git(format!("failed to run git: {e}"))),
            Err(_) => {
                warn!(args = ?args, timeout = ?self.timeout, "git command timed out");
                Err(ChorusError::Git(format!(
                    "git {} timed out after {:?}",
                    args.join(" "),
                    self.timeout
                )))
            }
        }
    }
}
