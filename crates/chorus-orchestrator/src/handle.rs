use crate::controller::OrchestrationState;
use crate::rollback::RollbackReport;
use chorus_checkpoint::Checkpoint;
use chorus_core::{ChorusError, ChorusResult};
use chorus_merge::{
    Admission, AdmissionError, EscalationAction, MergeHandle, MergeOutcome, MergeStatus,
};
use chorus_session::{AgentRecord, Mode, SessionStats};
use chorus_tasks::{NewTask, Task, TaskCounts};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// Which work a rollback targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackRequest {
    /// Undo the last `iterations` iterations of a blocked agent.
    Iteration { agent_id: String, iterations: u32 },
    Task(String),
    TaskChain(String),
    Session,
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerStatus {
    /// Idle, running or paused.
    pub state: OrchestrationState,
    /// Who assigns tasks.
    pub mode: Mode,
    /// Maximum concurrent agents.
    pub capacity: usize,
    /// Agents holding a slot.
    pub slots_in_use: usize,
    /// Agent table.
    pub agents: Vec<AgentRecord>,
    /// Tasks per status.
    pub tasks: TaskCounts,
    /// Merge pipeline view.
    pub merge: MergeStatus,
    /// Cumulative counters.
    pub stats: SessionStats,
}

/// Requests accepted by the controller loop.
pub enum ControllerCommand {
    SpawnAgent {
        task_id: String,
        reply: oneshot::Sender<ChorusResult<String>>,
    },
    StopAgent {
        agent_id: String,
        reply: oneshot::Sender<ChorusResult<()>>,
    },
    StopAll {
        preserve_changes: bool,
        reply: oneshot::Sender<ChorusResult<()>>,
    },
    Pause {
        reply: oneshot::Sender<ChorusResult<()>>,
    },
    Resume {
        reply: oneshot::Sender<ChorusResult<()>>,
    },
    SetMode {
        mode: Mode,
        reply: oneshot::Sender<ChorusResult<()>>,
    },
    Unblock {
        agent_id: String,
        reply: oneshot::Sender<ChorusResult<()>>,
    },
    CreateTask {
        task: NewTask,
        reply: oneshot::Sender<ChorusResult<Task>>,
    },
    Rollback {
        request: RollbackRequest,
        reply: oneshot::Sender<ChorusResult<RollbackReport>>,
    },
    Checkpoint {
        reply: oneshot::Sender<ChorusResult<Checkpoint>>,
    },
    Status {
        reply: oneshot::Sender<ControllerStatus>,
    },
    /// Stop every agent, close the session and end the loop.
    Shutdown { preserve_changes: bool },
}

fn stopped() -> ChorusError {
    ChorusError::Orchestrator("controller is not running".to_string())
}

/// Cloneable handle to a running controller.
///
/// Merge admission and escalation decisions go straight to the merge worker.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerCommand>,
    merge: MergeHandle,
}

impl ControllerHandle {
    pub(crate) fn new(tx: mpsc::Sender<ControllerCommand>, merge: MergeHandle) -> Self {
        Self { tx, merge }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ControllerCommand,
    ) -> ChorusResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    /// Assign a ready task to a new agent and return the agent id.
    pub async fn spawn_agent(&self, task_id: &str) -> ChorusResult<String> {
        let task_id = task_id.to_string();
        self.request(|reply| ControllerCommand::SpawnAgent { task_id, reply })
            .await?
    }

    /// Kill an agent and release its task back to todo.
    pub async fn stop_agent(&self, agent_id: &str) -> ChorusResult<()> {
        let agent_id = agent_id.to_string();
        self.request(|reply| ControllerCommand::StopAgent { agent_id, reply })
            .await?
    }

    /// Stop every agent. With `preserve_changes`, uncommitted work is stashed.
    pub async fn stop_all(&self, preserve_changes: bool) -> ChorusResult<()> {
        self.request(|reply| ControllerCommand::StopAll {
            preserve_changes,
            reply,
        })
        .await?
    }

    /// Stop self-assignment and merging until [`Self::resume`].
    pub async fn pause(&self) -> ChorusResult<()> {
        self.request(|reply| ControllerCommand::Pause { reply })
            .await?
    }

    /// Re-enable self-assignment and merging.
    pub async fn resume(&self) -> ChorusResult<()> {
        self.request(|reply| ControllerCommand::Resume { reply })
            .await?
    }

    /// Switch between semi-auto and autopilot. Entering autopilot takes a checkpoint.
    pub async fn set_mode(&self, mode: Mode) -> ChorusResult<()> {
        self.request(|reply| ControllerCommand::SetMode { mode, reply })
            .await?
    }

    /// Start the next iteration of a blocked agent.
    pub async fn unblock(&self, agent_id: &str) -> ChorusResult<()> {
        let agent_id = agent_id.to_string();
        self.request(|reply| ControllerCommand::Unblock { agent_id, reply })
            .await?
    }

    /// Add a task to the store.
    pub async fn create_task(&self, task: NewTask) -> ChorusResult<Task> {
        self.request(|reply| ControllerCommand::CreateTask { task, reply })
            .await?
    }

    /// Undo work at the requested level.
    pub async fn rollback(&self, request: RollbackRequest) -> ChorusResult<RollbackReport> {
        self.request(|reply| ControllerCommand::Rollback { request, reply })
            .await?
    }

    /// Take a manual checkpoint.
    pub async fn checkpoint(&self) -> ChorusResult<Checkpoint> {
        self.request(|reply| ControllerCommand::Checkpoint { reply })
            .await?
    }

    /// Snapshot of agents, tasks, merges and stats.
    pub async fn status(&self) -> ChorusResult<ControllerStatus> {
        self.request(|reply| ControllerCommand::Status { reply })
            .await
    }

    /// Validate and queue an operator branch.
    pub async fn merge_branch(
        &self,
        branch: &str,
        priority: Option<u8>,
    ) -> Result<Admission, AdmissionError> {
        self.merge.admit(branch, priority).await
    }

    /// Decide the pending merge escalation.
    pub async fn resolve_escalation(&self, action: EscalationAction) -> ChorusResult<MergeOutcome> {
        self.merge.resolve_escalation(action).await
    }

    /// Ask the loop to stop. Await the controller's join handle for the final state.
    pub async fn shutdown(&self, preserve_changes: bool) -> ChorusResult<()> {
        self.tx
            .send(ControllerCommand::Shutdown { preserve_changes })
            .await
            .map_err(|_| stopped())
    }
}
