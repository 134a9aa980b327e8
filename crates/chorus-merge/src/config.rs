use serde::{Deserialize, Serialize};

/// Merge pipeline settings, the `[merge]` table of `chorus.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Branch that queued work is merged into.
    #[serde(default = "default_target_branch")]
    pub target_branch: String,
    /// Remote watched for upstream force-pushes.
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Failed attempts before an item is escalated to a human.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Force-push recoveries per task before autopilot is paused.
    #[serde(default = "default_max_force_push_recoveries")]
    pub max_force_push_recoveries: u32,
    /// Command (argv) that resolves complex conflicts inside a worktree.
    #[serde(default)]
    pub resolver_command: Option<Vec<String>>,
    /// Seconds before the resolver command is killed.
    #[serde(default = "default_resolver_timeout_secs")]
    pub resolver_timeout_secs: u64,
}

fn default_target_branch() -> String {
    "main".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_force_push_recoveries() -> u32 {
    2
}

fn default_resolver_timeout_secs() -> u64 {
    600
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            target_branch: default_target_branch(),
            remote: default_remote(),
            max_retries: default_max_retries(),
            max_force_push_recoveries: default_max_force_push_recoveries(),
            resolver_command: None,
            resolver_timeout_secs: default_resolver_timeout_secs(),
        }
    }
}
