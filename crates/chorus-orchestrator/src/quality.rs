use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Output kept per command in a report.
const MAX_OUTPUT_LEN: usize = 4000;

/// Exit code reported for a command that hit its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Result of one quality command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Shell command as configured.
    pub command: String,
    /// Exit status; 124 on timeout.
    pub exit_code: i32,
    /// Combined stdout and stderr, truncated.
    pub output: String,
    /// Wall-clock time.
    pub duration_ms: u64,
}

impl CheckResult {
    /// Whether the command exited 0.
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Outcome of a quality gate run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityReport {
    /// One result per command that ran.
    pub results: Vec<CheckResult>,
    /// Every command passed.
    pub all_passed: bool,
}

impl QualityReport {
    /// The command that stopped the gate, if any.
    pub fn first_failure(&self) -> Option<&CheckResult> {
        self.results.iter().find(|r| !r.passed())
    }

    /// Feedback for the agent's next iteration.
    pub fn feedback(&self) -> Option<String> {
        self.first_failure().map(|failed| {
            format!(
                "Quality check `{}` failed with exit code {}:\n{}",
                failed.command, failed.exit_code, failed.output
            )
        })
    }
}

/// Runs the configured quality commands in an agent's worktree.
///
/// Commands run one after another through `sh -c` and the gate stops at the
/// first failure. No commands means the gate passes.
#[derive(Debug, Clone)]
pub struct QualityGate {
    commands: Vec<String>,
    timeout: Duration,
}

impl QualityGate {
    /// Each command gets `timeout` before it is killed.
    pub fn new(commands: Vec<String>, timeout: Duration) -> Self {
        Self { commands, timeout }
    }

    /// Whether no commands are configured.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Run the commands in `cwd`.
    pub async fn run(&self, cwd: &Path) -> QualityReport {
        let mut results = Vec::with_capacity(self.commands.len());
        for command in &self.commands {
            let result = self.run_one(cwd, command).await;
            let passed = result.passed();
            results.push(result);
            if !passed {
                break;
            }
        }
        let all_passed = results.iter().all(CheckResult::passed);
        info!(cwd = %cwd.display(), checks = results.len(), all_passed, "Quality gate finished");
        QualityReport {
            results,
            all_passed,
        }
    }

    async fn run_one(&self, cwd: &Path, command: &str) -> CheckResult {
        debug!(command = %command, cwd = %cwd.display(), "Running quality command");
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(cwd)
                .kill_on_drop(true)
                .output(),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (exit_code, output) = match result {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.is_empty() {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&stderr);
                }
                (output.status.code().unwrap_or(-1), text)
            }
            Ok(Err(e)) => (-1, format!("failed to run command: {e}")),
            Err(_) => (
                TIMEOUT_EXIT_CODE,
                format!("timed out after {}s", self.timeout.as_secs()),
            ),
        };
        if exit_code != 0 {
            warn!(command = %command, exit_code, "Quality command failed");
        }

        CheckResult {
            command: command.to_string(),
            exit_code,
            output: truncate_output(&output, MAX_OUTPUT_LEN),
            duration_ms,
        }
    }
}

fn truncate_output(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated, {} total bytes]", &s[..end], s.len())
}
