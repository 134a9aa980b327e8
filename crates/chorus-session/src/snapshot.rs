use crate::events::{EventRecord, SessionEvent};
use chorus_core::{write_atomic, ChorusError, ChorusResult};
use chorus_merge::MergeItem;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Snapshot format version written by this build.
pub const STATE_VERSION: u32 = 1;

/// Who assigns tasks to agents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// The operator assigns tasks.
    #[default]
    SemiAuto,
    /// The controller self-assigns ready tasks up to capacity.
    Autopilot,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::SemiAuto => write!(f, "semi-auto"),
            Mode::Autopilot => write!(f, "autopilot"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = ChorusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "semi-auto" | "semiauto" | "semi_auto" => Ok(Mode::SemiAuto),
            "autopilot" => Ok(Mode::Autopilot),
            other => Err(ChorusError::Config(format!("unknown mode: {other}"))),
        }
    }
}

/// Coarse agent state as recorded in the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Preparing,
    Running,
    CheckingQuality,
    Blocked,
    Completed,
    Failed,
}

/// One row of the agent table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Agent id, `agent-<task>`.
    pub agent_id: String,
    /// Task the agent works on.
    pub task_id: String,
    /// Current process, if one is running.
    pub pid: Option<u32>,
    /// Agent worktree.
    pub worktree: PathBuf,
    /// Agent branch.
    pub branch: String,
    /// Lifecycle status.
    pub status: AgentStatus,
    /// Current iteration, starting at 0.
    pub iteration: u32,
    /// Last reported progress, 0 to 100.
    #[serde(default)]
    pub progress: Option<u8>,
}

/// Cumulative session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Tasks finished by agents.
    pub tasks_completed: u64,
    /// Tasks that failed.
    pub tasks_failed: u64,
    /// Branches merged by the pipeline.
    pub merges_auto: u64,
    /// Branches merged by an operator.
    pub merges_manual: u64,
    /// Agent iterations started.
    pub total_iterations: u64,
    /// Time spent in earlier runs of this session.
    pub total_runtime_secs: u64,
}

/// Everything needed to resume a session after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Snapshot format version.
    pub version: u32,
    /// Stable across restarts.
    pub session_id: Uuid,
    /// When the session was first opened.
    pub started_at: DateTime<Utc>,
    /// Who assigns tasks.
    pub mode: Mode,
    /// Whether the operator paused the session.
    pub paused: bool,
    /// Keyed by agent id.
    pub agents: BTreeMap<String, AgentRecord>,
    /// Queued merges, restored into the pipeline on start.
    pub merge_queue: Vec<MergeItem>,
    /// Tag of the most recent checkpoint.
    pub checkpoint: Option<String>,
    /// Cumulative counters.
    pub stats: SessionStats,
    /// Highest event sequence folded into this snapshot.
    #[serde(default)]
    pub last_event_seq: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            session_id: Uuid::nil(),
            started_at: DateTime::<Utc>::default(),
            mode: Mode::default(),
            paused: false,
            agents: BTreeMap::new(),
            merge_queue: Vec::new(),
            checkpoint: None,
            stats: SessionStats::default(),
            last_event_seq: 0,
        }
    }
}

impl SessionState {
    /// A fresh session in `mode`, with a new id.
    pub fn new(mode: Mode) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            mode,
            ..Self::default()
        }
    }

    /// The event that starts this session, for the event log.
    pub fn started_event(&self) -> SessionEvent {
        SessionEvent::SessionStarted {
            session_id: self.session_id,
            mode: self.mode,
            started_at: self.started_at,
        }
    }

    /// Fold one event into the snapshot.
    pub fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::SessionStarted {
                session_id,
                mode,
                started_at,
            } => {
                self.session_id = *session_id;
                self.mode = *mode;
                self.started_at = *started_at;
                self.paused = false;
            }
            SessionEvent::SessionEnded { runtime_secs } => {
                self.stats.total_runtime_secs += runtime_secs;
            }
            SessionEvent::ModeChanged { mode } => self.mode = *mode,
            SessionEvent::Paused => self.paused = true,
            SessionEvent::Resumed => self.paused = false,
            SessionEvent::AgentSpawned {
                agent_id,
                task_id,
                worktree,
                branch,
                pid,
            } => {
                self.agents.insert(
                    agent_id.clone(),
                    AgentRecord {
                        agent_id: agent_id.clone(),
                        task_id: task_id.clone(),
                        pid: *pid,
                        worktree: worktree.clone(),
                        branch: branch.clone(),
                        status: AgentStatus::Preparing,
                        iteration: 0,
                        progress: None,
                    },
                );
            }
            SessionEvent::AgentStatusChanged { agent_id, status } => {
                if let Some(agent) = self.agents.get_mut(agent_id) {
                    agent.status = *status;
                }
            }
            SessionEvent::IterationStarted {
                agent_id,
                iteration,
            } => {
                if let Some(agent) = self.agents.get_mut(agent_id) {
                    agent.iteration = *iteration;
                    agent.status = AgentStatus::Running;
                }
                self.stats.total_iterations += 1;
            }
            SessionEvent::AgentProgress { agent_id, percent } => {
                if let Some(agent) = self.agents.get_mut(agent_id) {
                    agent.progress = Some(*percent);
                }
            }
            SessionEvent::AgentCompleted { agent_id, .. } => {
                self.agents.remove(agent_id);
                self.stats.tasks_completed += 1;
            }
            SessionEvent::AgentFailed { agent_id, .. } => {
                self.agents.remove(agent_id);
                self.stats.tasks_failed += 1;
            }
            SessionEvent::AgentStopped { agent_id, .. } => {
                self.agents.remove(agent_id);
            }
            SessionEvent::MergeQueueChanged { items } => self.merge_queue = items.clone(),
            SessionEvent::Merged { manual, .. } => {
                if *manual {
                    self.stats.merges_manual += 1;
                } else {
                    self.stats.merges_auto += 1;
                }
            }
            SessionEvent::Escalated { .. } | SessionEvent::RolledBack { .. } => {}
            SessionEvent::CheckpointCreated { tag } => self.checkpoint = Some(tag.clone()),
        }
    }

    /// Fold a logged record. Records at or below `last_event_seq` are already
    /// part of the snapshot and are skipped; returns whether it was applied.
    pub fn apply_record(&mut self, record: &EventRecord) -> bool {
        if record.seq <= self.last_event_seq {
            return false;
        }
        self.apply(&record.event);
        self.last_event_seq = record.seq;
        true
    }

    /// Structural checks run on load.
    pub fn validate(&self) -> Result<(), String> {
        if self.version != STATE_VERSION {
            return Err(format!(
                "unsupported snapshot version {} (expected {STATE_VERSION})",
                self.version
            ));
        }
        for (key, agent) in &self.agents {
            if key != &agent.agent_id {
                return Err(format!("agent table key {key} holds agent {}", agent.agent_id));
            }
        }
        let mut branches = HashSet::new();
        for item in &self.merge_queue {
            if !branches.insert(item.branch.as_str()) {
                return Err(format!("branch {} queued twice", item.branch));
            }
        }
        Ok(())
    }
}

/// Rebuild a snapshot from scratch by folding `records` in order.
pub fn replay<'a>(records: impl IntoIterator<Item = &'a EventRecord>) -> SessionState {
    let mut state = SessionState::default();
    for record in records {
        state.apply_record(record);
    }
    state
}

/// Reads and writes `state.json`.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Store the snapshot at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot. A missing file is `None`; a malformed one is
    /// [`ChorusError::CorruptState`].
    pub async fn load(&self) -> ChorusResult<Option<SessionState>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: SessionState = serde_json::from_str(&data)
            .map_err(|e| ChorusError::corrupt(&self.path, e.to_string()))?;
        state
            .validate()
            .map_err(|reason| ChorusError::corrupt(&self.path, reason))?;
        debug!(path = %self.path.display(), session_id = %state.session_id, "Loaded session snapshot");
        Ok(Some(state))
    }

    /// Write the snapshot atomically.
    pub async fn save(&self, state: &SessionState) -> ChorusResult<()> {
        let json = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path, &json).await
    }

    /// Delete the snapshot, if present.
    pub async fn clear(&self) -> ChorusResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "Cleared session snapshot");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
