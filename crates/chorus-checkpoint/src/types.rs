use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Why a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    /// Before autopilot starts self-assigning tasks.
    AutopilotStart,
    /// Before a queued branch is merged.
    PreMerge,
    /// On the periodic timer.
    Periodic,
    /// Requested by the operator.
    Manual,
}

impl std::fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointType::AutopilotStart => write!(f, "autopilot_start"),
            CheckpointType::PreMerge => write!(f, "pre_merge"),
            CheckpointType::Periodic => write!(f, "periodic"),
            CheckpointType::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for CheckpointType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "autopilot_start" => Ok(Self::AutopilotStart),
            "pre_merge" => Ok(Self::PreMerge),
            "periodic" => Ok(Self::Periodic),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown checkpoint type '{other}'")),
        }
    }
}

/// A restorable point, mirrored 1:1 by a git tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint id; identical to the tag name.
    pub id: String,
    /// Git tag name.
    pub tag: String,
    /// When the tag was created.
    pub timestamp: DateTime<Utc>,
    /// Why the checkpoint was taken.
    #[serde(rename = "type")]
    pub kind: CheckpointType,
    /// Task being merged, for pre-merge checkpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// When checkpoints are taken and how many are retained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Master switch.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Checkpoint when autopilot starts.
    #[serde(default = "default_true")]
    pub before_autopilot: bool,
    /// Checkpoint before each merge.
    #[serde(default = "default_true")]
    pub before_merge: bool,
    /// Minutes between periodic checkpoints, 0 disables them.
    #[serde(default = "default_periodic")]
    pub periodic: u64,
    /// Number of checkpoints kept by pruning.
    #[serde(default = "default_keep")]
    pub keep: usize,
}

fn default_true() -> bool {
    true
}

fn default_periodic() -> u64 {
    5
}

fn default_keep() -> usize {
    10
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            before_autopilot: true,
            before_merge: true,
            periodic: default_periodic(),
            keep: default_keep(),
        }
    }
}

impl CheckpointConfig {
    /// Interval for periodic checkpoints, `None` when disabled.
    pub fn periodic_interval(&self) -> Option<Duration> {
        (self.enabled && self.periodic > 0).then(|| Duration::from_secs(self.periodic * 60))
    }
}
