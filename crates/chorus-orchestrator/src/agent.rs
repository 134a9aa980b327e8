use chorus_core::{ChorusError, ChorusResult};
use chorus_session::AgentStatus;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level lifecycle phase of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentPhase {
    Idle,
    Preparing,
    Executing(ExecutionStep),
    Blocked,
    Completed,
    Failed,
}

/// Sub-state of [`AgentPhase::Executing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionStep {
    /// The agent subprocess is working.
    Iteration,
    /// Quality commands are checking the iteration.
    CheckQuality,
}

impl AgentPhase {
    /// `Completed` and `Failed` accept no further events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentPhase::Completed | AgentPhase::Failed)
    }

    /// The coarse status written to the session snapshot.
    pub fn status(&self) -> AgentStatus {
        match self {
            AgentPhase::Idle => AgentStatus::Idle,
            AgentPhase::Preparing => AgentStatus::Preparing,
            AgentPhase::Executing(ExecutionStep::Iteration) => AgentStatus::Running,
            AgentPhase::Executing(ExecutionStep::CheckQuality) => AgentStatus::CheckingQuality,
            AgentPhase::Blocked => AgentStatus::Blocked,
            AgentPhase::Completed => AgentStatus::Completed,
            AgentPhase::Failed => AgentStatus::Failed,
        }
    }
}

impl fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentPhase::Idle => write!(f, "idle"),
            AgentPhase::Preparing => write!(f, "preparing"),
            AgentPhase::Executing(ExecutionStep::Iteration) => write!(f, "executing.iteration"),
            AgentPhase::Executing(ExecutionStep::CheckQuality) => {
                write!(f, "executing.check_quality")
            }
            AgentPhase::Blocked => write!(f, "blocked"),
            AgentPhase::Completed => write!(f, "completed"),
            AgentPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Inputs to [`AgentLifecycleMachine::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Start,
    Ready,
    IterationDone,
    AllPass,
    Retry,
    Blocked(String),
    Fail(String),
}

impl AgentEvent {
    fn name(&self) -> &'static str {
        match self {
            AgentEvent::Start => "START",
            AgentEvent::Ready => "READY",
            AgentEvent::IterationDone => "ITERATION_DONE",
            AgentEvent::AllPass => "ALL_PASS",
            AgentEvent::Retry => "RETRY",
            AgentEvent::Blocked(_) => "BLOCKED",
            AgentEvent::Fail(_) => "FAIL",
        }
    }
}

/// Deterministic agent id for a task.
pub fn agent_id_for(task_id: &str) -> String {
    format!("agent-{task_id}")
}

/// Deterministic branch name for a task.
pub fn branch_for(task_id: &str) -> String {
    format!("agent/{task_id}")
}

/// Execution state of one agent working one task.
///
/// The machine knows nothing about slots, processes or merging. It only
/// validates transitions; the controller reacts to the phases it reaches.
/// Iterations are not capped here: callers compare [`iteration`](Self::iteration)
/// with [`max_iterations`](Self::max_iterations) and send `Fail` themselves.
#[derive(Debug, Clone)]
pub struct AgentLifecycleMachine {
    task_id: String,
    agent_id: String,
    worktree: PathBuf,
    branch: String,
    phase: AgentPhase,
    iteration: u32,
    max_iterations: u32,
    last_error: Option<String>,
    blocked_reason: Option<String>,
}

impl AgentLifecycleMachine {
    /// An idle machine for `task_id`, with its worktree under `worktree_dir`.
    pub fn new(task_id: impl Into<String>, worktree_dir: &Path, max_iterations: u32) -> Self {
        let task_id = task_id.into();
        let agent_id = agent_id_for(&task_id);
        Self {
            worktree: worktree_dir.join(&agent_id),
            branch: branch_for(&task_id),
            agent_id,
            task_id,
            phase: AgentPhase::Idle,
            iteration: 0,
            max_iterations,
            last_error: None,
            blocked_reason: None,
        }
    }

    /// Apply `event`, returning the new phase.
    ///
    /// Events the current phase does not accept fail with
    /// [`ChorusError::InvalidTransition`] and leave the machine unchanged.
    pub fn send(&mut self, event: AgentEvent) -> ChorusResult<AgentPhase> {
        let next = match (&self.phase, &event) {
            (AgentPhase::Idle, AgentEvent::Start) => AgentPhase::Preparing,
            (AgentPhase::Preparing, AgentEvent::Ready) => {
                AgentPhase::Executing(ExecutionStep::Iteration)
            }
            (AgentPhase::Blocked, AgentEvent::Ready) => {
                self.blocked_reason = None;
                AgentPhase::Executing(ExecutionStep::Iteration)
            }
            (AgentPhase::Executing(ExecutionStep::Iteration), AgentEvent::IterationDone) => {
                AgentPhase::Executing(ExecutionStep::CheckQuality)
            }
            (AgentPhase::Executing(ExecutionStep::CheckQuality), AgentEvent::AllPass) => {
                AgentPhase::Completed
            }
            (AgentPhase::Executing(ExecutionStep::CheckQuality), AgentEvent::Retry) => {
                self.iteration += 1;
                AgentPhase::Executing(ExecutionStep::Iteration)
            }
            (AgentPhase::Executing(_), AgentEvent::Blocked(reason)) => {
                self.blocked_reason = Some(reason.clone());
                AgentPhase::Blocked
            }
            (AgentPhase::Executing(_), AgentEvent::Fail(error)) => {
                self.last_error = Some(error.clone());
                AgentPhase::Failed
            }
            _ => {
                return Err(ChorusError::invalid_transition(
                    &self.agent_id,
                    self.phase,
                    event.name(),
                ))
            }
        };
        debug!(
            agent_id = %self.agent_id,
            from = %self.phase,
            to = %next,
            event = event.name(),
            "Agent transition"
        );
        self.phase = next;
        Ok(next)
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    /// Coarse status derived from the phase.
    pub fn status(&self) -> AgentStatus {
        self.phase.status()
    }

    /// Task this agent works on.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Agent id, `agent-<task>`.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Checkout the agent runs in.
    pub fn worktree(&self) -> &Path {
        &self.worktree
    }

    /// Branch the agent commits to.
    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Zero-based iteration counter, bumped by `Retry`.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Iteration budget.
    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Whether another `Retry` would exceed the iteration budget.
    pub fn iterations_exhausted(&self) -> bool {
        self.iteration + 1 >= self.max_iterations
    }

    /// Error recorded by the last failure, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Reason given with the last `BLOCKED` signal.
    pub fn blocked_reason(&self) -> Option<&str> {
        self.blocked_reason.as_deref()
    }

    /// Whether the agent has finished for good.
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}
