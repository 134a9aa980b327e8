use crate::config::ChorusConfig;
use crate::console::{self, ConsoleCommand};
use anyhow::Context as _;
use chorus_checkpoint::{CheckpointType, Checkpointer};
use chorus_git::{CliGitRunner, Repo};
use chorus_merge::{HumanEscalation, MergeOutcome, MergePipeline, MergeWorker};
use chorus_orchestrator::{Controller, ControllerHandle, ControllerStatus, TokioSupervisor};
use chorus_session::{Mode, SessionRecorder, SessionState, StateStore, STATE_FILE};
use chorus_tasks::{NewTask, Task, TaskStatus, TaskStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

const TASKS_FILE: &str = "tasks.jsonl";
const ESCALATION_FILE: &str = "escalation.json";
const SCRATCHPAD_TEMPLATE: &str = "scratchpad.md";

/// Repository root plus its configuration.
pub struct Workspace {
    root: PathBuf,
    config: ChorusConfig,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, config: ChorusConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    fn data_dir(&self) -> PathBuf {
        self.config.data_dir(&self.root)
    }

    fn repo(&self) -> Repo {
        Repo::new(Arc::new(CliGitRunner::new()), &self.root)
    }

    async fn tasks(&self) -> anyhow::Result<TaskStore> {
        let path = self.data_dir().join(TASKS_FILE);
        let store = TaskStore::load(&path)
            .await
            .with_context(|| format!("Failed to load tasks from '{}'", path.display()))?;
        Ok(store.with_prefix(&self.config.orchestrator.task_prefix))
    }

    async fn checkpointer(&self) -> anyhow::Result<Checkpointer> {
        let mut checkpointer = Checkpointer::new(
            self.repo(),
            self.config.checkpoint.clone(),
            &self.config.orchestrator.task_prefix,
        )?;
        checkpointer.rebuild().await?;
        Ok(checkpointer)
    }

    async fn merge_pipeline(&self, checkpointer: Arc<Mutex<Checkpointer>>) -> anyhow::Result<MergePipeline> {
        let escalation = HumanEscalation::load(
            self.data_dir().join(ESCALATION_FILE),
            self.config.merge.max_retries,
        )
        .await?;
        Ok(
            MergePipeline::new(self.repo(), self.config.merge.clone(), escalation)?
                .with_checkpointer(checkpointer)
                .with_worktree_dir(&self.config.orchestrator.worktree_dir),
        )
    }

    // --- tasks ---

    pub async fn task_add(&self, task: NewTask) -> anyhow::Result<()> {
        let mut store = self.tasks().await?;
        let task = store.create(task)?;
        store.flush().await?;
        println!("{}", task.id);
        Ok(())
    }

    pub async fn task_list(&self, filter: Option<TaskFilter>) -> anyhow::Result<()> {
        let store = self.tasks().await?;
        let tasks: Vec<&Task> = match filter {
            None => store.all(),
            Some(TaskFilter::Ready) => store.ready(),
            Some(TaskFilter::Status(status)) => store
                .all()
                .into_iter()
                .filter(|t| t.status == status)
                .collect(),
        };
        if tasks.is_empty() {
            println!("No tasks.");
            return Ok(());
        }
        for task in tasks {
            println!("{}", task_line(task));
        }
        Ok(())
    }

    // --- merge ---

    /// Queue `branch` and drain the queue once, outside of a running session.
    pub async fn merge(&self, branch: &str, priority: Option<u8>) -> anyhow::Result<()> {
        let checkpointer = Arc::new(Mutex::new(self.checkpointer().await?));
        let mut pipeline = self.merge_pipeline(checkpointer).await?;
        let admission = pipeline.admit(branch, priority).await?;
        println!(
            "Queued {} as {} ({} commit(s) ahead, priority {})",
            admission.branch, admission.task_id, admission.commits_ahead, admission.priority
        );
        for outcome in pipeline.drain().await? {
            println!("{}", outcome_line(&outcome));
        }
        Ok(())
    }

    // --- checkpoints ---

    pub async fn checkpoint_create(&self) -> anyhow::Result<()> {
        let mut checkpointer = self.checkpointer().await?;
        let checkpoint = checkpointer.create(CheckpointType::Manual, None).await?;
        checkpointer.prune_to_config().await?;
        println!("{}", checkpoint.id);
        Ok(())
    }

    pub async fn checkpoint_list(&self) -> anyhow::Result<()> {
        let checkpointer = self.checkpointer().await?;
        if checkpointer.list().is_empty() {
            println!("No checkpoints.");
        }
        for checkpoint in checkpointer.list() {
            println!(
                "{}  {}  {}{}",
                checkpoint.timestamp.format("%Y-%m-%d %H:%M:%S"),
                checkpoint.kind,
                checkpoint.id,
                checkpoint
                    .task_id
                    .as_deref()
                    .map(|t| format!("  [{t}]"))
                    .unwrap_or_default()
            );
        }
        Ok(())
    }

    /// Hard-reset to `id` and reopen the tasks whose commits were dropped.
    pub async fn checkpoint_restore(&self, id: &str) -> anyhow::Result<()> {
        let mut checkpointer = self.checkpointer().await?;
        let affected = checkpointer.restore(id).await?;
        let mut store = self.tasks().await?;
        for task_id in &affected {
            match store.get(task_id).map(|t| t.status) {
                Some(status) if status.is_closed() => {
                    store.reopen(task_id)?;
                }
                Some(_) => {}
                None => warn!(task_id = %task_id, "Restored commits mention an unknown task"),
            }
        }
        store.flush().await?;
        println!("Restored {id}; reopened {} task(s)", affected.len());
        Ok(())
    }

    pub async fn checkpoint_prune(&self, keep: Option<usize>) -> anyhow::Result<()> {
        let mut checkpointer = self.checkpointer().await?;
        let removed = match keep {
            Some(keep) => checkpointer.prune(keep).await?,
            None => checkpointer.prune_to_config().await?,
        };
        println!("Removed {removed} checkpoint(s)");
        Ok(())
    }

    // --- run ---

    /// Start the controller and read operator commands from stdin until
    /// `quit` or Ctrl-C.
    pub async fn run(&self, mode: Option<Mode>) -> anyhow::Result<()> {
        let data = self.data_dir();
        tokio::fs::create_dir_all(&data).await?;

        let previous_mode = StateStore::new(data.join(STATE_FILE))
            .load()
            .await?
            .map(|state| state.mode)
            .unwrap_or_default();
        let recorder = SessionRecorder::open(&data, previous_mode).await?;
        let tasks = self.tasks().await?;

        let checkpointer = Arc::new(Mutex::new(self.checkpointer().await?));
        let mut pipeline = self.merge_pipeline(checkpointer.clone()).await?;
        pipeline.restore(recorder.state().merge_queue.clone());
        let (outcome_tx, outcome_rx) = mpsc::channel(64);
        let (merge, _worker) = MergeWorker::spawn(pipeline, outcome_tx);

        let (process_tx, process_rx) = mpsc::channel(256);
        let controller = Controller::new(
            self.config.orchestrator.clone(),
            self.repo(),
            tasks,
            recorder,
            merge,
            checkpointer,
            Arc::new(TokioSupervisor::new(process_tx)),
        )?
        .with_scratchpad_template(data.join(SCRATCHPAD_TEMPLATE));
        let (handle, mut controller) = controller.spawn(process_rx, outcome_rx);

        if let Some(mode) = mode {
            handle.set_mode(mode).await?;
        }
        println!("chorus is running in {} mode; type 'help' for commands", handle.status().await?.mode);

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
                finished = &mut controller => {
                    let state = finished??;
                    print_summary(&state);
                    return Ok(());
                }
                line = lines.next_line(), if stdin_open => match line? {
                    Some(line) => match console::parse(&line) {
                        Ok(Some(ConsoleCommand::Quit)) => break,
                        Ok(Some(command)) => {
                            if let Err(e) = self.execute(&handle, command).await {
                                println!("error: {e}");
                            }
                        }
                        Ok(None) => {}
                        Err(message) => println!("{message}"),
                    },
                    None => {
                        info!("stdin closed; running until interrupted");
                        stdin_open = false;
                    }
                },
            }
        }

        handle.shutdown(true).await?;
        let state = controller.await??;
        print_summary(&state);
        Ok(())
    }

    async fn execute(&self, handle: &ControllerHandle, command: ConsoleCommand) -> anyhow::Result<()> {
        match command {
            ConsoleCommand::Status => print_status(&handle.status().await?),
            ConsoleCommand::Tasks => self.task_list(None).await?,
            ConsoleCommand::Add { title } => {
                let task = handle.create_task(NewTask::new(title)).await?;
                println!("{}", task.id);
            }
            ConsoleCommand::Spawn { task_id } => {
                let agent_id = handle.spawn_agent(&task_id).await?;
                println!("{agent_id} started");
            }
            ConsoleCommand::Stop { agent_id } => handle.stop_agent(&agent_id).await?,
            ConsoleCommand::StopAll => handle.stop_all(true).await?,
            ConsoleCommand::Unblock { agent_id } => handle.unblock(&agent_id).await?,
            ConsoleCommand::Pause => handle.pause().await?,
            ConsoleCommand::Resume => handle.resume().await?,
            ConsoleCommand::Mode(mode) => handle.set_mode(mode).await?,
            ConsoleCommand::Merge { branch, priority } => {
                let admission = handle.merge_branch(&branch, priority).await?;
                println!(
                    "Queued {} as {} at position {}",
                    admission.branch, admission.task_id, admission.position
                );
            }
            ConsoleCommand::Resolve(action) => {
                let outcome = handle.resolve_escalation(action).await?;
                println!("{}", outcome_line(&outcome));
            }
            ConsoleCommand::Checkpoint => {
                let checkpoint = handle.checkpoint().await?;
                println!("{}", checkpoint.id);
            }
            ConsoleCommand::Rollback(request) => {
                let report = handle.rollback(request).await?;
                println!(
                    "Rolled back {} {}: {} commit(s) reverted, reopened {}",
                    report.level,
                    report.target,
                    report.reverted_commits,
                    if report.affected_tasks.is_empty() {
                        "nothing".to_string()
                    } else {
                        report.affected_tasks.join(", ")
                    }
                );
            }
            ConsoleCommand::Help => println!("{}", console::HELP),
            ConsoleCommand::Quit => {}
        }
        Ok(())
    }
}

/// Which tasks `task list` shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFilter {
    Status(TaskStatus),
    /// Open tasks whose dependencies are all done.
    Ready,
}

fn task_line(task: &Task) -> String {
    let status = task.status.to_string();
    let mut line = format!("{:<8} {status:<6} P{} {}", task.id, task.priority, task.title);
    if !task.dependencies.is_empty() {
        line.push_str(&format!("  (after {})", task.dependencies.join(", ")));
    }
    if let Some(assignee) = &task.assignee {
        line.push_str(&format!("  @{assignee}"));
    }
    line
}

fn outcome_line(outcome: &MergeOutcome) -> String {
    match outcome {
        MergeOutcome::Merged {
            task_id,
            branch,
            strategy,
        } => match strategy {
            Some(strategy) => format!("merged {branch} [{task_id}] after {strategy} resolution"),
            None => format!("merged {branch} [{task_id}]"),
        },
        MergeOutcome::Deferred {
            task_id,
            retry_count,
            reason,
        } => format!("deferred {task_id} (attempt {retry_count}): {reason}"),
        MergeOutcome::Escalated(request) => format!(
            "escalated {} ({}): decide with 'resolve merged|skipped|cancelled'",
            request.task_id, request.branch
        ),
        MergeOutcome::Resolved {
            task_id, action, ..
        } => format!("escalation for {task_id} resolved: {action}"),
        MergeOutcome::PauseRequested { task_id, reason } => {
            format!("paused on {task_id}: {reason}")
        }
    }
}

fn print_status(status: &ControllerStatus) {
    println!(
        "{} / {} | slots {}/{} | tasks todo {} doing {} done {} failed {}",
        status.state,
        status.mode,
        status.slots_in_use,
        status.capacity,
        status.tasks.todo,
        status.tasks.doing,
        status.tasks.done,
        status.tasks.failed
    );
    for agent in &status.agents {
        println!(
            "  {:<14} {:<8} {:?} iteration {}{}",
            agent.agent_id,
            agent.task_id,
            agent.status,
            agent.iteration + 1,
            agent
                .progress
                .map(|p| format!(" ({p}%)"))
                .unwrap_or_default()
        );
    }
    for item in &status.merge.items {
        println!(
            "  merge {:<10} {:<24} {:?} P{} retries {}",
            item.task_id, item.branch, item.status, item.priority, item.retry_count
        );
    }
    if let Some(request) = &status.merge.pending_escalation {
        println!("  escalation pending: {} ({})", request.task_id, request.branch);
    }
    println!(
        "  merged {} auto / {} manual, {} iteration(s)",
        status.stats.merges_auto, status.stats.merges_manual, status.stats.total_iterations
    );
}

fn print_summary(state: &SessionState) {
    println!(
        "session {} ended: {} task(s) completed, {} failed, {} merge(s)",
        state.session_id,
        state.stats.tasks_completed,
        state.stats.tasks_failed,
        state.stats.merges_auto + state.stats.merges_manual
    );
}

/// Resolve `path` against `root` unless it is absolute.
pub fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chorus_tasks::TaskType;

    fn sample(store: &mut TaskStore) -> Task {
        let first = store.create(NewTask::new("schema")).unwrap();
        store
            .create(
                NewTask::new("api")
                    .with_type(TaskType::Feature)
                    .with_dependencies(vec![first.id]),
            )
            .unwrap()
    }

    #[test]
    fn test_task_line_shows_dependencies_and_assignee() {
        let mut store = TaskStore::new("/tmp/unused.jsonl");
        let task = sample(&mut store);
        assert_eq!(task_line(&task), "ch-2     todo   P2 api  (after ch-1)");

        let claimed = store.claim("ch-1", Some("agent-ch-1")).unwrap();
        assert!(task_line(&claimed).ends_with("@agent-ch-1"));
    }

    #[test]
    fn test_outcome_lines() {
        let merged = MergeOutcome::Merged {
            task_id: "ch-1".into(),
            branch: "agent/ch-1".into(),
            strategy: None,
        };
        assert_eq!(outcome_line(&merged), "merged agent/ch-1 [ch-1]");
        let paused = MergeOutcome::PauseRequested {
            task_id: "ch-2".into(),
            reason: "force-push".into(),
        };
        assert!(outcome_line(&paused).starts_with("paused on ch-2"));
    }

    #[test]
    fn test_resolve_relative_paths() {
        let root = Path::new("/work/repo");
        assert_eq!(
            resolve(root, Path::new("chorus.toml")),
            PathBuf::from("/work/repo/chorus.toml")
        );
        assert_eq!(resolve(root, Path::new("/etc/chorus.toml")), PathBuf::from("/etc/chorus.toml"));
    }

    #[tokio::test]
    async fn test_task_add_then_list_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(tmp.path(), ChorusConfig::default());
        workspace.task_add(NewTask::new("first")).await.unwrap();
        workspace
            .task_add(NewTask::new("second").with_dependencies(vec!["ch-1".into()]))
            .await
            .unwrap();

        let store = workspace.tasks().await.unwrap();
        assert_eq!(store.len(), 2);
        let ready: Vec<&str> = store.ready().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["ch-1"]);
        workspace.task_list(Some(TaskFilter::Ready)).await.unwrap();
    }
}
