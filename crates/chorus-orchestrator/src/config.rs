use chorus_core::{ChorusError, ChorusResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Controller settings, the `[orchestrator]` table of `chorus.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Agents allowed to run at once.
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
    /// Iterations an agent gets before its task is failed.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Branch agent worktrees are created from.
    #[serde(default = "default_integration_branch")]
    pub integration_branch: String,
    /// Directory for agent worktrees, relative to the repository root.
    #[serde(default = "default_worktree_dir")]
    pub worktree_dir: String,
    /// Prefix of task ids, e.g. `ch` for `ch-12`.
    #[serde(default = "default_task_prefix")]
    pub task_prefix: String,
    /// Agent program and arguments. The prompt is appended as the last argument.
    #[serde(default = "default_agent_command")]
    pub agent_command: Vec<String>,
    /// Shell commands that must all pass before an agent's work is accepted.
    #[serde(default)]
    pub quality_commands: Vec<String>,
    /// Seconds before a single quality command is killed.
    #[serde(default = "default_quality_timeout_secs")]
    pub quality_timeout_secs: u64,
    /// Autopilot tick interval in milliseconds.
    #[serde(default = "default_autopilot_tick_ms")]
    pub autopilot_tick_ms: u64,
}

fn default_max_agents() -> usize {
    3
}

fn default_max_iterations() -> u32 {
    10
}

fn default_integration_branch() -> String {
    "main".to_string()
}

fn default_worktree_dir() -> String {
    ".worktrees".to_string()
}

fn default_task_prefix() -> String {
    "ch".to_string()
}

fn default_agent_command() -> Vec<String> {
    vec!["claude".to_string(), "-p".to_string()]
}

fn default_quality_timeout_secs() -> u64 {
    300
}

fn default_autopilot_tick_ms() -> u64 {
    1000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_agents: default_max_agents(),
            max_iterations: default_max_iterations(),
            integration_branch: default_integration_branch(),
            worktree_dir: default_worktree_dir(),
            task_prefix: default_task_prefix(),
            agent_command: default_agent_command(),
            quality_commands: Vec::new(),
            quality_timeout_secs: default_quality_timeout_secs(),
            autopilot_tick_ms: default_autopilot_tick_ms(),
        }
    }
}

impl OrchestratorConfig {
    /// Reject settings the controller cannot run with.
    pub fn validate(&self) -> ChorusResult<()> {
        if self.max_agents == 0 {
            return Err(ChorusError::Config("max_agents must be at least 1".into()));
        }
        if self.max_iterations == 0 {
            return Err(ChorusError::Config("max_iterations must be at least 1".into()));
        }
        if self.agent_command.is_empty() {
            return Err(ChorusError::Config("agent_command must not be empty".into()));
        }
        if self.task_prefix.is_empty() {
            return Err(ChorusError::Config("task_prefix must not be empty".into()));
        }
        if self.autopilot_tick_ms == 0 {
            return Err(ChorusError::Config("autopilot_tick_ms must be positive".into()));
        }
        Ok(())
    }

    /// Autopilot tick interval.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.autopilot_tick_ms)
    }

    /// Per-command quality timeout.
    pub fn quality_timeout(&self) -> Duration {
        Duration::from_secs(self.quality_timeout_secs)
    }
}
