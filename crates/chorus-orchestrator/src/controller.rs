use crate::agent::{agent_id_for, branch_for, AgentEvent, AgentLifecycleMachine, AgentPhase, ExecutionStep};
use crate::config::OrchestratorConfig;
use crate::handle::{ControllerCommand, ControllerHandle, ControllerStatus, RollbackRequest};
use crate::prompt::build_prompt;
use crate::quality::{QualityGate, QualityReport};
use crate::rollback::{Rollback, RollbackReport};
use crate::slots::SlotManager;
use crate::supervisor::{ProcessEvent, ProcessSupervisor, SpawnSpec};
use crate::worktree::WorktreeManager;
use chorus_checkpoint::{Checkpoint, CheckpointType, Checkpointer};
use chorus_core::{ChorusError, ChorusResult, SignalParser, SignalType};
use chorus_git::Repo;
use chorus_merge::{EscalationAction, MergeHandle, MergeOutcome, MergeRequest};
use chorus_session::{AgentStatus, Mode, SessionEvent, SessionRecorder, SessionState};
use chorus_tasks::{NewTask, Task, TaskStatus, TaskStore};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const INTERNAL_CHANNEL_CAPACITY: usize = 64;

/// Session-level orchestration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    /// No agent is working.
    Idle,
    /// At least one agent holds a slot.
    Running,
    /// New spawns are refused; running agents finish.
    Paused,
}

impl fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestrationState::Idle => write!(f, "idle"),
            OrchestrationState::Running => write!(f, "running"),
            OrchestrationState::Paused => write!(f, "paused"),
        }
    }
}

/// Results produced off the control loop and fed back into it.
#[derive(Debug)]
pub(crate) enum Internal {
    QualityChecked {
        agent_id: String,
        report: QualityReport,
    },
}

struct ActiveAgent {
    machine: AgentLifecycleMachine,
    /// Process of the current iteration, if one is running.
    pid: Option<u32>,
    saw_complete: bool,
    /// `HEAD` of the worktree when each iteration started.
    iteration_starts: Vec<String>,
    feedback: Option<String>,
}

/// The single-threaded orchestration loop.
///
/// Owns the task store, the slot manager and every agent machine. Events
/// from agent processes, the merge worker, the tick timer and operator
/// commands are handled one at a time, so no state is shared across tasks.
/// `slots.in_use()` always equals the number of active agents.
pub struct Controller {
    config: OrchestratorConfig,
    repo: Repo,
    tasks: TaskStore,
    slots: SlotManager,
    agents: BTreeMap<String, ActiveAgent>,
    supervisor: Arc<dyn ProcessSupervisor>,
    worktrees: WorktreeManager,
    quality: QualityGate,
    rollback: Rollback,
    merge: MergeHandle,
    checkpointer: Arc<Mutex<Checkpointer>>,
    recorder: SessionRecorder,
    parser: SignalParser,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    last_periodic: Instant,
}

impl Controller {
    /// Build a controller. Nothing runs until [`Self::spawn`].
    pub fn new(
        config: OrchestratorConfig,
        repo: Repo,
        tasks: TaskStore,
        recorder: SessionRecorder,
        merge: MergeHandle,
        checkpointer: Arc<Mutex<Checkpointer>>,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> ChorusResult<Self> {
        config.validate()?;
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_CHANNEL_CAPACITY);
        Ok(Self {
            slots: SlotManager::new(config.max_agents),
            worktrees: WorktreeManager::new(repo.clone(), config.integration_branch.clone()),
            quality: QualityGate::new(config.quality_commands.clone(), config.quality_timeout()),
            rollback: Rollback::new(repo.clone()),
            config,
            repo,
            tasks,
            agents: BTreeMap::new(),
            supervisor,
            merge,
            checkpointer,
            recorder,
            parser: SignalParser::new(),
            internal_tx,
            internal_rx,
            last_periodic: Instant::now(),
        })
    }

    /// Seed new worktrees' scratchpads from the template at `path`.
    pub fn with_scratchpad_template(mut self, path: impl Into<PathBuf>) -> Self {
        self.worktrees = WorktreeManager::new(
            self.repo.clone(),
            self.config.integration_branch.clone(),
        )
        .with_template(path);
        self
    }

    /// Run the loop on its own task.
    ///
    /// `processes` must be the receiving end of the channel the supervisor
    /// reports on; `merges` the outcome channel of the merge worker.
    pub fn spawn(
        self,
        processes: mpsc::Receiver<ProcessEvent>,
        merges: mpsc::Receiver<MergeOutcome>,
    ) -> (ControllerHandle, JoinHandle<ChorusResult<SessionState>>) {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let handle = ControllerHandle::new(tx, self.merge.clone());
        let task = tokio::spawn(self.run(rx, processes, merges));
        (handle, task)
    }

    /// Handle events until shutdown, then close the session.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<ControllerCommand>,
        mut processes: mpsc::Receiver<ProcessEvent>,
        mut merges: mpsc::Receiver<MergeOutcome>,
    ) -> ChorusResult<SessionState> {
        self.start().await?;
        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(mode = %self.mode(), max_agents = self.slots.capacity(), "Controller started");

        loop {
            let result = tokio::select! {
                Some(event) = processes.recv() => self.handle_process_event(event).await,
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal).await,
                Some(outcome) = merges.recv() => self.handle_merge_outcome(outcome).await,
                command = commands.recv() => match command {
                    Some(ControllerCommand::Shutdown { preserve_changes }) => {
                        self.stop_all(preserve_changes).await?;
                        break;
                    }
                    Some(command) => {
                        self.handle_command(command).await;
                        Ok(())
                    }
                    None => break,
                },
                _ = tick.tick() => self.tick().await,
            };

            if let Err(e) = result {
                if e.is_programming_error() {
                    error!(error = %e, "Controller invariant violated");
                    return Err(e);
                }
                warn!(error = %e, "Controller event failed");
            }
            if let Err(e) = self.persist().await {
                warn!(error = %e, "Persisting session failed");
            }
        }

        let _ = self.merge.shutdown().await;
        self.tasks.flush().await?;
        let state = self.recorder.close().await?;
        info!(session_id = %state.session_id, "Controller stopped");
        Ok(state)
    }

    /// Reconcile what a previous run left behind.
    ///
    /// Agents recorded in the snapshot have no process any more: their tasks
    /// go back to `todo` and the agents are recorded as stopped.
    pub async fn start(&mut self) -> ChorusResult<()> {
        let stale: Vec<(String, String)> = self
            .recorder
            .state()
            .agents
            .values()
            .map(|a| (a.agent_id.clone(), a.task_id.clone()))
            .collect();
        for (agent_id, task_id) in stale {
            warn!(agent_id = %agent_id, task_id = %task_id, "Releasing agent from previous run");
            if self.tasks.get(&task_id).map(|t| t.status) == Some(TaskStatus::Doing) {
                self.tasks.release(&task_id)?;
            }
            self.recorder
                .record(SessionEvent::AgentStopped { agent_id, task_id })
                .await?;
        }

        let mut checkpointer = self.checkpointer.lock().await;
        if let Err(e) = checkpointer.rebuild().await {
            warn!(error = %e, "Could not rebuild checkpoint list");
        }
        drop(checkpointer);
        self.persist().await
    }

    // --- queries ---

    /// Current assignment mode.
    pub fn mode(&self) -> Mode {
        self.recorder.state().mode
    }

    /// Whether the operator paused the session.
    pub fn is_paused(&self) -> bool {
        self.recorder.state().paused
    }

    /// `Paused` wins over activity; otherwise idle means no active task.
    pub fn orchestration_state(&self) -> OrchestrationState {
        if self.is_paused() {
            OrchestrationState::Paused
        } else if self.agents.is_empty() {
            OrchestrationState::Idle
        } else {
            OrchestrationState::Running
        }
    }

    /// Task ids with an active agent.
    pub fn active_task_ids(&self) -> Vec<String> {
        self.agents
            .values()
            .map(|a| a.machine.task_id().to_string())
            .collect()
    }

    /// Ids of active agents.
    pub fn active_agent_ids(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    /// Task store.
    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    /// Agent slots.
    pub fn slots(&self) -> &SlotManager {
        &self.slots
    }

    /// Session snapshot as last recorded.
    pub fn session(&self) -> &SessionState {
        self.recorder.state()
    }

    /// Phase of an active agent.
    pub fn agent_phase(&self, agent_id: &str) -> Option<AgentPhase> {
        self.agents.get(agent_id).map(|a| a.machine.phase())
    }

    /// Snapshot for status queries.
    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            state: self.orchestration_state(),
            mode: self.mode(),
            capacity: self.slots.capacity(),
            slots_in_use: self.slots.in_use(),
            agents: self.recorder.state().agents.values().cloned().collect(),
            tasks: self.tasks.counts(),
            merge: self.merge.latest_status(),
            stats: self.recorder.state().stats,
        }
    }

    // --- operator commands ---

    async fn handle_command(&mut self, command: ControllerCommand) {
        match command {
            ControllerCommand::SpawnAgent { task_id, reply } => {
                let result = self.spawn_agent(&task_id).await;
                let _ = reply.send(self.observe(result));
            }
            ControllerCommand::StopAgent { agent_id, reply } => {
                let result = self.stop_agent(&agent_id).await;
                let _ = reply.send(self.observe(result));
            }
            ControllerCommand::StopAll {
                preserve_changes,
                reply,
            } => {
                let result = self.stop_all(preserve_changes).await;
                let _ = reply.send(self.observe(result));
            }
            ControllerCommand::Pause { reply } => {
                let result = self.pause().await;
                let _ = reply.send(self.observe(result));
            }
            ControllerCommand::Resume { reply } => {
                let result = self.resume().await;
                let _ = reply.send(self.observe(result));
            }
            ControllerCommand::SetMode { mode, reply } => {
                let result = self.set_mode(mode).await;
                let _ = reply.send(self.observe(result));
            }
            ControllerCommand::Unblock { agent_id, reply } => {
                let result = self.unblock(&agent_id).await;
                let _ = reply.send(self.observe(result));
            }
            ControllerCommand::CreateTask { task, reply } => {
                let result = self.create_task(task);
                let _ = reply.send(result);
            }
            ControllerCommand::Rollback { request, reply } => {
                let result = self.rollback(request).await;
                let _ = reply.send(self.observe(result));
            }
            ControllerCommand::Checkpoint { reply } => {
                let result = self.checkpoint(CheckpointType::Manual).await;
                let _ = reply.send(result);
            }
            ControllerCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            // Handled by the loop itself.
            ControllerCommand::Shutdown { .. } => {}
        }
    }

    /// Log controller bugs loudly before handing the error to the caller.
    fn observe<T>(&self, result: ChorusResult<T>) -> ChorusResult<T> {
        if let Err(e) = &result {
            if e.is_programming_error() {
                error!(error = %e, "Controller invariant violated by command");
            }
        }
        result
    }

    /// Add a task to the store.
    pub fn create_task(&mut self, task: NewTask) -> ChorusResult<Task> {
        self.tasks.create(task)
    }

    /// Start an agent on `task_id`. Returns the agent id.
    ///
    /// Fails with [`ChorusError::NoSlotsAvailable`] when every slot is taken.
    /// Any failure after the slot was acquired gives the slot and the task back.
    pub async fn spawn_agent(&mut self, task_id: &str) -> ChorusResult<String> {
        if self.is_paused() {
            return Err(ChorusError::Orchestrator(
                "orchestration is paused; not spawning agents".into(),
            ));
        }
        if self.tasks.get(task_id).is_none() {
            return Err(ChorusError::TaskNotFound(task_id.to_string()));
        }
        let agent_id = agent_id_for(task_id);
        if self.agents.contains_key(&agent_id) {
            return Err(ChorusError::Orchestrator(format!(
                "{agent_id} is already running"
            )));
        }

        if !self.slots.acquire() {
            return Err(ChorusError::NoSlotsAvailable(self.slots.capacity()));
        }
        if let Err(e) = self.tasks.claim(task_id, Some(&agent_id)) {
            self.slots.release()?;
            return Err(e);
        }

        let mut machine = AgentLifecycleMachine::new(
            task_id,
            Path::new(&self.config.worktree_dir),
            self.config.max_iterations,
        );
        machine.send(AgentEvent::Start)?;
        if let Err(e) = self
            .worktrees
            .ensure(task_id, machine.worktree(), machine.branch())
            .await
        {
            warn!(task_id = %task_id, error = %e, "Worktree setup failed");
            self.tasks.release(task_id)?;
            self.slots.release()?;
            return Err(e);
        }
        machine.send(AgentEvent::Ready)?;

        let worktree = machine.worktree().to_path_buf();
        let branch = machine.branch().to_string();
        self.agents.insert(
            agent_id.clone(),
            ActiveAgent {
                machine,
                pid: None,
                saw_complete: false,
                iteration_starts: Vec::new(),
                feedback: None,
            },
        );

        let pid = match self.launch_iteration(&agent_id).await {
            Ok(pid) => pid,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Agent failed to start");
                self.agents.remove(&agent_id);
                self.tasks.release(task_id)?;
                self.slots.release()?;
                return Err(e);
            }
        };

        self.recorder
            .record(SessionEvent::AgentSpawned {
                agent_id: agent_id.clone(),
                task_id: task_id.to_string(),
                worktree,
                branch,
                pid: Some(pid),
            })
            .await?;
        self.recorder
            .record(SessionEvent::IterationStarted {
                agent_id: agent_id.clone(),
                iteration: 0,
            })
            .await?;
        info!(agent_id = %agent_id, task_id = %task_id, pid, "Agent spawned");
        Ok(agent_id)
    }

    /// Terminate an agent, stash its uncommitted work and put its task back to `todo`.
    pub async fn stop_agent(&mut self, agent_id: &str) -> ChorusResult<()> {
        self.stop(agent_id, true).await
    }

    /// Stop every agent. Without `preserve_changes` the worktrees are removed
    /// instead of stashed.
    pub async fn stop_all(&mut self, preserve_changes: bool) -> ChorusResult<()> {
        for agent_id in self.active_agent_ids() {
            self.stop(&agent_id, preserve_changes).await?;
        }
        Ok(())
    }

    async fn stop(&mut self, agent_id: &str, preserve_changes: bool) -> ChorusResult<()> {
        let agent = self
            .agents
            .remove(agent_id)
            .ok_or_else(|| ChorusError::Orchestrator(format!("unknown agent: {agent_id}")))?;
        let task_id = agent.machine.task_id().to_string();

        if let Err(e) = self.supervisor.kill(agent_id).await {
            warn!(agent_id = %agent_id, error = %e, "Kill failed");
        }
        let worktree = agent.machine.worktree();
        let cleanup = if preserve_changes {
            self.worktrees.stash(worktree).await.map(|_| ())
        } else {
            self.worktrees.remove(worktree).await
        };
        if let Err(e) = cleanup {
            warn!(agent_id = %agent_id, error = %e, "Worktree cleanup failed");
        }

        if self.tasks.get(&task_id).map(|t| t.status) == Some(TaskStatus::Doing) {
            self.tasks.release(&task_id)?;
        }
        self.slots.release()?;
        self.recorder
            .record(SessionEvent::AgentStopped {
                agent_id: agent_id.to_string(),
                task_id: task_id.clone(),
            })
            .await?;
        info!(agent_id = %agent_id, task_id = %task_id, preserve_changes, "Agent stopped");
        Ok(())
    }

    /// Refuse new spawns. Running agents carry on.
    pub async fn pause(&mut self) -> ChorusResult<()> {
        if self.is_paused() {
            return Ok(());
        }
        self.recorder.record(SessionEvent::Paused).await?;
        info!(active = self.agents.len(), "Orchestration paused");
        Ok(())
    }

    /// Allow spawns again and let the merge worker drain.
    pub async fn resume(&mut self) -> ChorusResult<()> {
        if !self.is_paused() {
            return Ok(());
        }
        self.recorder.record(SessionEvent::Resumed).await?;
        self.merge.resume().await?;
        info!("Orchestration resumed");
        Ok(())
    }

    /// Switch between operator-assigned and self-assigned work.
    /// Running agents are not affected.
    pub async fn set_mode(&mut self, mode: Mode) -> ChorusResult<()> {
        if self.mode() == mode {
            return Ok(());
        }
        if mode == Mode::Autopilot {
            self.checkpoint_if_enabled(CheckpointType::AutopilotStart).await;
        }
        self.recorder
            .record(SessionEvent::ModeChanged { mode })
            .await?;
        info!(mode = %mode, "Mode changed");
        Ok(())
    }

    /// Resume a blocked agent with a fresh iteration.
    pub async fn unblock(&mut self, agent_id: &str) -> ChorusResult<()> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ChorusError::Orchestrator(format!("unknown agent: {agent_id}")))?;
        let phase = agent.machine.phase();
        if phase != AgentPhase::Blocked {
            return Err(ChorusError::invalid_transition(agent_id, phase, "unblock"));
        }
        if agent.pid.take().is_some() {
            // The blocked process may still be alive; its exit is ignored by pid.
            if let Err(e) = self.supervisor.kill(agent_id).await {
                warn!(agent_id = %agent_id, error = %e, "Could not kill blocked agent process");
            }
        }
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.machine.send(AgentEvent::Ready)?;
        }
        info!(agent_id = %agent_id, "Agent unblocked");
        self.next_iteration(agent_id).await
    }

    /// Take a checkpoint and record it.
    pub async fn checkpoint(&mut self, kind: CheckpointType) -> ChorusResult<Checkpoint> {
        let mut checkpointer = self.checkpointer.lock().await;
        let checkpoint = checkpointer.create(kind, None).await?;
        if let Err(e) = checkpointer.prune_to_config().await {
            warn!(error = %e, "Checkpoint pruning failed");
        }
        drop(checkpointer);
        self.recorder
            .record(SessionEvent::CheckpointCreated {
                tag: checkpoint.tag.clone(),
            })
            .await?;
        Ok(checkpoint)
    }

    async fn checkpoint_if_enabled(&mut self, kind: CheckpointType) {
        if !self.checkpointer.lock().await.should_create(kind) {
            return;
        }
        if let Err(e) = self.checkpoint(kind).await {
            warn!(kind = %kind, error = %e, "Checkpoint failed");
        }
    }

    /// Undo work at the requested level.
    pub async fn rollback(&mut self, request: RollbackRequest) -> ChorusResult<RollbackReport> {
        let report = match request {
            RollbackRequest::Iteration {
                agent_id,
                iterations,
            } => self.rollback_iterations(&agent_id, iterations).await?,
            RollbackRequest::Task(task_id) => {
                self.stop_agents_for(&[task_id.clone()]).await?;
                self.quiesce_merges().await?;
                let result = self.rollback.task(&mut self.tasks, &task_id).await;
                self.release_merges().await;
                result?
            }
            RollbackRequest::TaskChain(task_id) => {
                let chain = self.tasks.dependents_transitive(&task_id);
                self.stop_agents_for(&chain).await?;
                self.quiesce_merges().await?;
                let result = self.rollback.task_chain(&mut self.tasks, &task_id).await;
                self.release_merges().await;
                result?
            }
            RollbackRequest::Session => {
                self.stop_all(true).await?;
                self.quiesce_merges().await?;
                let mut checkpointer = self.checkpointer.lock().await;
                let result = self.rollback.session(&mut checkpointer, &mut self.tasks).await;
                drop(checkpointer);
                self.release_merges().await;
                result?
            }
        };

        self.recorder
            .record(SessionEvent::RolledBack {
                level: report.level.to_string(),
                target: report.target.clone(),
                affected_tasks: report.affected_tasks.clone(),
            })
            .await?;
        warn!(
            level = %report.level,
            target = %report.target,
            affected = report.affected_tasks.len(),
            "Rollback applied"
        );
        Ok(report)
    }

    async fn rollback_iterations(
        &mut self,
        agent_id: &str,
        iterations: u32,
    ) -> ChorusResult<RollbackReport> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ChorusError::Orchestrator(format!("unknown agent: {agent_id}")))?;
        if agent.machine.phase() != AgentPhase::Blocked {
            return Err(ChorusError::Orchestrator(format!(
                "{agent_id} must be blocked to roll back iterations (is {})",
                agent.machine.phase()
            )));
        }
        let recorded = agent.iteration_starts.len();
        let n = iterations as usize;
        if n == 0 || n > recorded {
            return Err(ChorusError::Orchestrator(format!(
                "cannot roll back {n} iterations of {agent_id}: {recorded} recorded"
            )));
        }
        let target = agent.iteration_starts[recorded - n].clone();
        let worktree = self.worktrees.absolute(agent.machine.worktree());
        let report = self.rollback.iteration(agent_id, &worktree, &target).await?;
        agent.iteration_starts.truncate(recorded - n);
        Ok(report)
    }

    async fn stop_agents_for(&mut self, task_ids: &[String]) -> ChorusResult<()> {
        let targets: Vec<String> = self
            .agents
            .iter()
            .filter(|(_, a)| task_ids.iter().any(|t| t == a.machine.task_id()))
            .map(|(id, _)| id.clone())
            .collect();
        for agent_id in targets {
            self.stop(&agent_id, true).await?;
        }
        Ok(())
    }

    /// Hold the merge worker so nothing else touches the main checkout.
    /// The status round-trip returns only once no merge is in flight.
    async fn quiesce_merges(&self) -> ChorusResult<()> {
        self.merge.pause().await?;
        self.merge.status().await.map(|_| ())
    }

    async fn release_merges(&self) {
        if self.is_paused() {
            return;
        }
        if let Err(e) = self.merge.resume().await {
            warn!(error = %e, "Resuming merge worker failed");
        }
    }

    // --- autopilot ---

    /// Periodic work: self-assignment in autopilot and periodic checkpoints.
    pub async fn tick(&mut self) -> ChorusResult<()> {
        if self.mode() == Mode::Autopilot && !self.is_paused() {
            while self.slots.available() > 0 {
                let exclude = self.active_task_ids();
                let Some(task_id) = self.tasks.select_next(&exclude).map(|t| t.id.clone()) else {
                    break;
                };
                if let Err(e) = self.spawn_agent(&task_id).await {
                    if e.is_programming_error() {
                        return Err(e);
                    }
                    warn!(task_id = %task_id, error = %e, "Autopilot spawn failed");
                    break;
                }
            }
        }

        let interval = self.checkpointer.lock().await.config().periodic_interval();
        if let Some(interval) = interval {
            if self.last_periodic.elapsed() >= interval {
                self.last_periodic = Instant::now();
                self.checkpoint_if_enabled(CheckpointType::Periodic).await;
            }
        }
        Ok(())
    }

    // --- agent events ---

    /// React to one line of agent output or a process exit.
    pub async fn handle_process_event(&mut self, event: ProcessEvent) -> ChorusResult<()> {
        let Some(agent) = self.agents.get(event.agent_id()) else {
            debug!(agent_id = %event.agent_id(), "Event for inactive agent");
            return Ok(());
        };
        if agent.pid != Some(event.pid()) {
            debug!(agent_id = %event.agent_id(), pid = event.pid(), "Event from a previous process");
            return Ok(());
        }

        match event {
            ProcessEvent::Output { agent_id, line, .. } => self.handle_output(&agent_id, &line).await,
            ProcessEvent::Exited { agent_id, code, .. } => self.handle_exit(&agent_id, code).await,
        }
    }

    async fn handle_output(&mut self, agent_id: &str, line: &str) -> ChorusResult<()> {
        for signal in self.parser.parse_all(line) {
            let Some(agent) = self.agents.get_mut(agent_id) else {
                return Ok(());
            };
            match signal.kind {
                SignalType::Complete => {
                    debug!(agent_id = %agent_id, "Agent signalled completion");
                    agent.saw_complete = true;
                }
                SignalType::Blocked | SignalType::NeedsHelp => {
                    if !matches!(agent.machine.phase(), AgentPhase::Executing(_)) {
                        continue;
                    }
                    let reason = signal.payload.clone().unwrap_or_default();
                    agent.machine.send(AgentEvent::Blocked(reason.clone()))?;
                    warn!(agent_id = %agent_id, kind = %signal.kind, reason = %reason, "Agent blocked");
                    self.record_status(agent_id, AgentStatus::Blocked).await?;
                }
                SignalType::Progress => {
                    if let Some(percent) = signal.progress() {
                        self.recorder
                            .record(SessionEvent::AgentProgress {
                                agent_id: agent_id.to_string(),
                                percent,
                            })
                            .await?;
                    }
                }
                SignalType::Resolved | SignalType::NeedsHuman => {
                    debug!(agent_id = %agent_id, kind = %signal.kind, "Ignoring merge signal from task agent");
                }
            }
        }
        Ok(())
    }

    async fn handle_exit(&mut self, agent_id: &str, code: i32) -> ChorusResult<()> {
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return Ok(());
        };
        agent.pid = None;
        if agent.machine.phase() != AgentPhase::Executing(ExecutionStep::Iteration) {
            // Blocked agents wait for the operator.
            info!(agent_id = %agent_id, code, phase = %agent.machine.phase(), "Agent process exited");
            return Ok(());
        }

        agent.machine.send(AgentEvent::IterationDone)?;
        let complete = agent.saw_complete;
        self.record_status(agent_id, AgentStatus::CheckingQuality)
            .await?;

        if complete {
            self.run_quality_gate(agent_id);
            Ok(())
        } else {
            let feedback = format!("The agent exited with code {code} without signalling COMPLETE.");
            self.retry_or_fail(agent_id, feedback).await
        }
    }

    fn run_quality_gate(&self, agent_id: &str) {
        let Some(agent) = self.agents.get(agent_id) else {
            return;
        };
        let gate = self.quality.clone();
        let cwd = self.worktrees.absolute(agent.machine.worktree());
        let tx = self.internal_tx.clone();
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            let report = gate.run(&cwd).await;
            let _ = tx
                .send(Internal::QualityChecked { agent_id, report })
                .await;
        });
    }

    pub(crate) async fn handle_internal(&mut self, internal: Internal) -> ChorusResult<()> {
        match internal {
            Internal::QualityChecked { agent_id, report } => {
                let checking = self.agents.get(&agent_id).map(|a| a.machine.phase())
                    == Some(AgentPhase::Executing(ExecutionStep::CheckQuality));
                if !checking {
                    debug!(agent_id = %agent_id, "Quality result for an agent no longer checking");
                    return Ok(());
                }
                if report.all_passed {
                    self.complete_agent(&agent_id).await
                } else {
                    let feedback = report
                        .feedback()
                        .unwrap_or_else(|| "Quality checks failed.".to_string());
                    self.retry_or_fail(&agent_id, feedback).await
                }
            }
        }
    }

    async fn retry_or_fail(&mut self, agent_id: &str, feedback: String) -> ChorusResult<()> {
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return Ok(());
        };
        if agent.machine.iterations_exhausted() {
            let error = format!(
                "gave up after {} iterations: {feedback}",
                agent.machine.max_iterations()
            );
            return self.fail_agent(agent_id, error).await;
        }
        agent.machine.send(AgentEvent::Retry)?;
        agent.feedback = Some(feedback);
        info!(agent_id = %agent_id, iteration = agent.machine.iteration(), "Retrying agent");
        self.next_iteration(agent_id).await
    }

    /// Launch the process for the machine's current iteration and record it.
    /// A launch failure fails the agent.
    async fn next_iteration(&mut self, agent_id: &str) -> ChorusResult<()> {
        match self.launch_iteration(agent_id).await {
            Ok(_) => {
                let iteration = self
                    .agents
                    .get(agent_id)
                    .map(|a| a.machine.iteration())
                    .unwrap_or_default();
                self.recorder
                    .record(SessionEvent::IterationStarted {
                        agent_id: agent_id.to_string(),
                        iteration,
                    })
                    .await
            }
            Err(e) => self.fail_agent(agent_id, e.to_string()).await,
        }
    }

    async fn launch_iteration(&mut self, agent_id: &str) -> ChorusResult<u32> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ChorusError::Orchestrator(format!("unknown agent: {agent_id}")))?;
        let task_id = agent.machine.task_id().to_string();
        let task = self
            .tasks
            .get(&task_id)
            .ok_or_else(|| ChorusError::TaskNotFound(task_id.clone()))?;
        let cwd = self.worktrees.absolute(agent.machine.worktree());

        match self.repo.head(&cwd).await {
            Ok(sha) => agent.iteration_starts.push(sha),
            Err(e) => warn!(agent_id = %agent_id, error = %e, "Could not record iteration start"),
        }

        let prompt = build_prompt(
            task,
            agent.machine.branch(),
            agent.machine.iteration(),
            agent.feedback.as_deref(),
        );
        let (program, rest) = self
            .config
            .agent_command
            .split_first()
            .ok_or_else(|| ChorusError::Config("agent_command must not be empty".into()))?;
        let mut args = rest.to_vec();
        args.push(prompt);

        let spec = SpawnSpec {
            agent_id: agent_id.to_string(),
            program: program.clone(),
            args,
            cwd,
            env: vec![
                ("CHORUS_TASK_ID".to_string(), task_id),
                ("CHORUS_AGENT_ID".to_string(), agent_id.to_string()),
                ("CHORUS_BRANCH".to_string(), agent.machine.branch().to_string()),
                (
                    "CHORUS_ITERATION".to_string(),
                    agent.machine.iteration().to_string(),
                ),
            ],
        };
        agent.saw_complete = false;
        let pid = self.supervisor.spawn(spec).await?;
        agent.pid = Some(pid);
        Ok(pid)
    }

    /// Queue the agent's branch and close its task. A branch the merge queue
    /// rejects fails the task instead, so it can be reopened and retried.
    async fn complete_agent(&mut self, agent_id: &str) -> ChorusResult<()> {
        let Some(mut agent) = self.agents.remove(agent_id) else {
            return Ok(());
        };
        agent.machine.send(AgentEvent::AllPass)?;
        self.slots.release()?;
        let task_id = agent.machine.task_id().to_string();
        let task = self
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| ChorusError::TaskNotFound(task_id.clone()))?;

        let request = MergeRequest {
            task_id: task.id.clone(),
            branch: agent.machine.branch().to_string(),
            worktree: Some(self.worktrees.absolute(agent.machine.worktree())),
            priority: task.priority,
            dependencies: task.dependencies.iter().map(|d| branch_for(d)).collect(),
        };
        if let Err(e) = self.merge.enqueue(request).await {
            let error = format!("merge queue rejected {}: {e}", agent.machine.branch());
            self.tasks.fail(&task_id, Some(&error))?;
            self.recorder
                .record(SessionEvent::AgentFailed {
                    agent_id: agent_id.to_string(),
                    task_id: task_id.clone(),
                    error: error.clone(),
                })
                .await?;
            warn!(agent_id = %agent_id, task_id = %task_id, error = %error, "Completed work not queued");
            return Ok(());
        }
        self.tasks.complete(&task_id)?;

        self.recorder
            .record(SessionEvent::AgentCompleted {
                agent_id: agent_id.to_string(),
                task_id: task_id.clone(),
            })
            .await?;
        info!(agent_id = %agent_id, task_id = %task_id, "Agent completed");
        Ok(())
    }

    async fn fail_agent(&mut self, agent_id: &str, error: String) -> ChorusResult<()> {
        let Some(mut agent) = self.agents.remove(agent_id) else {
            return Ok(());
        };
        agent.machine.send(AgentEvent::Fail(error.clone()))?;
        self.slots.release()?;
        let task_id = agent.machine.task_id().to_string();
        self.tasks.fail(&task_id, Some(&error))?;
        self.recorder
            .record(SessionEvent::AgentFailed {
                agent_id: agent_id.to_string(),
                task_id: task_id.clone(),
                error: error.clone(),
            })
            .await?;
        warn!(agent_id = %agent_id, task_id = %task_id, error = %error, "Agent failed");
        Ok(())
    }

    async fn record_status(&mut self, agent_id: &str, status: AgentStatus) -> ChorusResult<()> {
        self.recorder
            .record(SessionEvent::AgentStatusChanged {
                agent_id: agent_id.to_string(),
                status,
            })
            .await
    }

    // --- merge events ---

    /// Fold a merge worker outcome into the session.
    pub async fn handle_merge_outcome(&mut self, outcome: MergeOutcome) -> ChorusResult<()> {
        match outcome {
            MergeOutcome::Merged {
                task_id, strategy, ..
            } => {
                info!(task_id = %task_id, strategy = ?strategy, "Branch merged");
                self.recorder
                    .record(SessionEvent::Merged {
                        task_id,
                        manual: false,
                    })
                    .await?;
            }
            MergeOutcome::Resolved {
                task_id, action, ..
            } => {
                info!(task_id = %task_id, action = %action, "Escalation resolved");
                match action {
                    EscalationAction::Merged => {
                        self.recorder
                            .record(SessionEvent::Merged {
                                task_id,
                                manual: true,
                            })
                            .await?;
                    }
                    EscalationAction::Cancelled => self.pause().await?,
                    EscalationAction::Skipped => {}
                }
            }
            MergeOutcome::Deferred {
                task_id,
                retry_count,
                reason,
            } => {
                info!(task_id = %task_id, retry_count, reason = %reason, "Merge deferred");
            }
            MergeOutcome::Escalated(request) => {
                warn!(task_id = %request.task_id, "Merge escalated to operator");
                self.recorder
                    .record(SessionEvent::Escalated {
                        task_id: request.task_id,
                    })
                    .await?;
            }
            MergeOutcome::PauseRequested { task_id, reason } => {
                warn!(task_id = %task_id, reason = %reason, "Merge pipeline requested a pause");
                self.pause().await?;
            }
        }
        Ok(())
    }

    /// Bring the snapshot in line with the merge queue, flush the task store
    /// and write the snapshot.
    async fn persist(&mut self) -> ChorusResult<()> {
        let items = self.merge.latest_status().items;
        if items != self.recorder.state().merge_queue {
            self.recorder
                .record(SessionEvent::MergeQueueChanged { items })
                .await?;
        }
        self.tasks.flush().await?;
        self.recorder.persist().await
    }
}
