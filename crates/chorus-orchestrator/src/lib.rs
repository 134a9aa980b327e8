//! Agent orchestration for Chorus.
//!
//! The [`Controller`] drives everything: it picks tasks from the
//! [`TaskStore`](chorus_tasks::TaskStore), takes a slot from the
//! [`SlotManager`], prepares a worktree and runs the agent through its
//! [`AgentLifecycleMachine`]. Finished branches go to the merge worker.
//! [`Rollback`] undoes work at iteration, task, chain or session level.

/// Agent lifecycle state machine.
pub mod agent;
/// `[orchestrator]` configuration.
pub mod config;
/// The orchestration loop.
pub mod controller;
/// Commands and the cloneable controller handle.
pub mod handle;
/// Agent prompt construction.
pub mod prompt;
/// Quality commands run between iterations.
pub mod quality;
/// Rollback levels.
pub mod rollback;
/// Fixed-capacity agent slots.
pub mod slots;
/// Agent subprocess supervision.
pub mod supervisor;
/// Per-agent git worktrees.
pub mod worktree;

pub use agent::{
    agent_id_for, branch_for, AgentEvent, AgentLifecycleMachine, AgentPhase, ExecutionStep,
};
pub use config::OrchestratorConfig;
pub use controller::{Controller, OrchestrationState};
pub use handle::{ControllerCommand, ControllerHandle, ControllerStatus, RollbackRequest};
pub use prompt::build_prompt;
pub use quality::{CheckResult, QualityGate, QualityReport, TIMEOUT_EXIT_CODE};
pub use rollback::{Rollback, RollbackLevel, RollbackReport};
pub use slots::SlotManager;
pub use supervisor::{ProcessEvent, ProcessSupervisor, SpawnSpec, TokioSupervisor};
pub use worktree::{WorktreeManager, DEFAULT_SCRATCHPAD};
