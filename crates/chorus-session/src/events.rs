use crate::snapshot::{AgentStatus, Mode};
use chorus_merge::MergeItem;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// A domain event recorded in the event log.
///
/// Events carry every value the snapshot needs, so folding the same sequence
/// always produces the same state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        session_id: Uuid,
        mode: Mode,
        started_at: DateTime<Utc>,
    },
    /// Adds the elapsed wall time of a finished run to the total.
    SessionEnded { runtime_secs: u64 },
    ModeChanged { mode: Mode },
    Paused,
    Resumed,
    AgentSpawned {
        agent_id: String,
        task_id: String,
        worktree: PathBuf,
        branch: String,
        pid: Option<u32>,
    },
    AgentStatusChanged {
        agent_id: String,
        status: AgentStatus,
    },
    IterationStarted { agent_id: String, iteration: u32 },
    AgentProgress { agent_id: String, percent: u8 },
    AgentCompleted { agent_id: String, task_id: String },
    AgentFailed {
        agent_id: String,
        task_id: String,
        error: String,
    },
    /// Stopped by the operator; the task went back to todo.
    AgentStopped { agent_id: String, task_id: String },
    /// Full queue contents after a change.
    MergeQueueChanged { items: Vec<MergeItem> },
    Merged { task_id: String, manual: bool },
    Escalated { task_id: String },
    CheckpointCreated { tag: String },
    RolledBack {
        level: String,
        target: String,
        affected_tasks: Vec<String>,
    },
}

impl SessionEvent {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::SessionStarted { .. } => "session_started",
            SessionEvent::SessionEnded { .. } => "session_ended",
            SessionEvent::ModeChanged { .. } => "mode_changed",
            SessionEvent::Paused => "paused",
            SessionEvent::Resumed => "resumed",
            SessionEvent::AgentSpawned { .. } => "agent_spawned",
            SessionEvent::AgentStatusChanged { .. } => "agent_status_changed",
            SessionEvent::IterationStarted { .. } => "iteration_started",
            SessionEvent::AgentProgress { .. } => "agent_progress",
            SessionEvent::AgentCompleted { .. } => "agent_completed",
            SessionEvent::AgentFailed { .. } => "agent_failed",
            SessionEvent::AgentStopped { .. } => "agent_stopped",
            SessionEvent::MergeQueueChanged { .. } => "merge_queue_changed",
            SessionEvent::Merged { .. } => "merged",
            SessionEvent::Escalated { .. } => "escalated",
            SessionEvent::CheckpointCreated { .. } => "checkpoint_created",
            SessionEvent::RolledBack { .. } => "rolled_back",
        }
    }
}

/// One line of `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Position in the log, strictly increasing across rotations and truncations.
    pub seq: u64,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// The domain event.
    pub event: SessionEvent,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_record_wire_format() {
        let record = EventRecord {
            seq: 7,
            timestamp: Utc::now(),
            event: SessionEvent::Merged {
                task_id: "ch-3".into(),
                manual: false,
            },
        };
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["event"]["type"], "merged");
        assert_eq!(json["event"]["task_id"], "ch-3");

        let unit = serde_json::to_string(&SessionEvent::Paused).unwrap();
        assert_eq!(unit, r#"{"type":"paused"}"#);
        assert_eq!(SessionEvent::Paused.name(), "paused");
    }
}
