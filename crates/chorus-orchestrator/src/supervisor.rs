use async_trait::async_trait;
use chorus_core::{ChorusError, ChorusResult};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

/// What to run for one agent iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    /// Agent the process belongs to.
    pub agent_id: String,
    /// Executable to run.
    pub program: String,
    /// Arguments, the prompt last.
    pub args: Vec<String>,
    /// Agent worktree.
    pub cwd: PathBuf,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

/// Reported by a supervisor for each process it runs.
///
/// For a given process every `Output` line arrives before its `Exited`.
/// `pid` tells successive processes of the same agent apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One line of stdout.
    Output {
        agent_id: String,
        pid: u32,
        line: String,
    },
    /// The process ended. `code` is `-1` when it was killed by a signal.
    Exited {
        agent_id: String,
        pid: u32,
        code: i32,
    },
}

impl ProcessEvent {
    /// Agent the event belongs to.
    pub fn agent_id(&self) -> &str {
        match self {
            ProcessEvent::Output { agent_id, .. } | ProcessEvent::Exited { agent_id, .. } => {
                agent_id
            }
        }
    }

    /// Process the event came from.
    pub fn pid(&self) -> u32 {
        match self {
            ProcessEvent::Output { pid, .. } | ProcessEvent::Exited { pid, .. } => *pid,
        }
    }
}

/// Starts and stops agent subprocesses and streams their output as
/// [`ProcessEvent`]s on the channel it was built with.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Start a process; returns its pid. At most one process per agent id.
    async fn spawn(&self, spec: SpawnSpec) -> ChorusResult<u32>;

    /// Ask the agent's process to terminate. Returns `false` when nothing was running.
    async fn kill(&self, agent_id: &str) -> ChorusResult<bool>;
}

struct Running {
    generation: u64,
    kill: oneshot::Sender<()>,
}

type Registry = Arc<Mutex<HashMap<String, Running>>>;

/// Runs agents as tokio child processes.
pub struct TokioSupervisor {
    events: mpsc::Sender<ProcessEvent>,
    running: Registry,
    generation: AtomicU64,
}

impl TokioSupervisor {
    /// Events for every process are sent to `events`.
    pub fn new(events: mpsc::Sender<ProcessEvent>) -> Self {
        Self {
            events,
            running: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Number of processes currently supervised.
    pub async fn running(&self) -> usize {
        self.running.lock().await.len()
    }
}

#[async_trait]
impl ProcessSupervisor for TokioSupervisor {
    async fn spawn(&self, spec: SpawnSpec) -> ChorusResult<u32> {
        let mut running = self.running.lock().await;
        if running.contains_key(&spec.agent_id) {
            return Err(ChorusError::Agent(format!(
                "{} already has a running process",
                spec.agent_id
            )));
        }

        let mut child = tokio::process::Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ChorusError::Agent(format!("failed to spawn {}: {e}", spec.program)))?;

        let pid = child.id().unwrap_or_default();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (kill, kill_rx) = oneshot::channel();
        running.insert(spec.agent_id.clone(), Running { generation, kill });
        drop(running);

        info!(agent_id = %spec.agent_id, pid, program = %spec.program, "Agent process started");
        tokio::spawn(watch(
            spec.agent_id,
            pid,
            generation,
            child,
            stdout,
            stderr,
            kill_rx,
            self.events.clone(),
            self.running.clone(),
        ));
        Ok(pid)
    }

    async fn kill(&self, agent_id: &str) -> ChorusResult<bool> {
        let entry = self.running.lock().await.remove(agent_id);
        match entry {
            Some(running) => {
                info!(agent_id = %agent_id, "Killing agent process");
                let _ = running.kill.send(());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn watch(
    agent_id: String,
    pid: u32,
    generation: u64,
    mut child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    mut kill_rx: oneshot::Receiver<()>,
    events: mpsc::Sender<ProcessEvent>,
    running: Registry,
) {
    if let Some(stderr) = stderr {
        let id = agent_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(agent_id = %id, line = %line, "agent stderr");
            }
        });
    }

    let mut killed = false;
    if let Some(stdout) = stdout {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let event = ProcessEvent::Output { agent_id: agent_id.clone(), pid, line };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(agent_id = %agent_id, error = %e, "Reading agent stdout failed");
                        break;
                    }
                },
                _ = &mut kill_rx => {
                    killed = true;
                    let _ = child.start_kill();
                    // Grandchildren may hold the pipe open; stop reading now.
                    break;
                }
            }
        }
    }

    let status = if killed {
        child.wait().await
    } else {
        tokio::select! {
            status = child.wait() => status,
            _ = &mut kill_rx => {
                let _ = child.start_kill();
                child.wait().await
            }
        }
    };
    let code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            warn!(agent_id = %agent_id, error = %e, "Waiting for agent process failed");
            -1
        }
    };

    {
        let mut running = running.lock().await;
        if running.get(&agent_id).map(|r| r.generation) == Some(generation) {
            running.remove(&agent_id);
        }
    }

    info!(agent_id = %agent_id, pid, code, "Agent process exited");
    let _ = events.send(ProcessEvent::Exited { agent_id, pid, code }).await;
}
