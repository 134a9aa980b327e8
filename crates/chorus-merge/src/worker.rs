use crate::admission::{Admission, AdmissionError};
use crate::escalation::EscalationAction;
use crate::pipeline::{MergeOutcome, MergePipeline, MergeStatus};
use crate::queue::MergeRequest;
use chorus_core::{ChorusError, ChorusResult};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

enum MergeCommand {
    Enqueue {
        request: MergeRequest,
        reply: oneshot::Sender<ChorusResult<usize>>,
    },
    Admit {
        branch: String,
        priority: Option<u8>,
        reply: oneshot::Sender<Result<Admission, AdmissionError>>,
    },
    ResolveEscalation {
        action: EscalationAction,
        reply: oneshot::Sender<ChorusResult<MergeOutcome>>,
    },
    Status {
        reply: oneshot::Sender<MergeStatus>,
    },
    Pause,
    Resume,
    Shutdown,
}

/// Runs a [`MergePipeline`] on its own task so merges never block the caller.
///
/// Admission and enqueueing are accepted at any time; draining happens one
/// item at a time between commands. Every outcome is also published on the
/// outcome channel given to [`MergeWorker::spawn`].
pub struct MergeWorker;

impl MergeWorker {
    /// Start the worker. The join handle yields the pipeline back after shutdown.
    pub fn spawn(
        pipeline: MergePipeline,
        outcomes: mpsc::Sender<MergeOutcome>,
    ) -> (MergeHandle, JoinHandle<MergePipeline>) {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (status_tx, status) = watch::channel(pipeline.status());
        let task = tokio::spawn(run(pipeline, rx, outcomes, status_tx));
        (MergeHandle { tx, status }, task)
    }
}

async fn run(
    mut pipeline: MergePipeline,
    mut rx: mpsc::Receiver<MergeCommand>,
    outcomes: mpsc::Sender<MergeOutcome>,
    status: watch::Sender<MergeStatus>,
) -> MergePipeline {
    let mut paused = false;
    info!("Merge worker started");

    loop {
        if !paused && pipeline.queue().has_ready() {
            // Commands that arrived while merging take precedence over the next item.
            match rx.try_recv() {
                Ok(cmd) => {
                    if !handle(&mut pipeline, cmd, &mut paused, &outcomes).await {
                        break;
                    }
                    status.send_replace(pipeline.status());
                    continue;
                }
                Err(mpsc::error::TryRecvError::Disconnected) => break,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }

            let step = pipeline.process_next().await;
            status.send_replace(pipeline.status());
            match step {
                Ok(Some(outcome)) => {
                    if outcome.needs_pause() {
                        paused = true;
                    }
                    let _ = outcomes.send(outcome).await;
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "Merge step failed"),
            }
        } else {
            match rx.recv().await {
                Some(cmd) => {
                    if !handle(&mut pipeline, cmd, &mut paused, &outcomes).await {
                        break;
                    }
                    status.send_replace(pipeline.status());
                }
                None => break,
            }
        }
    }

    info!("Merge worker stopped");
    pipeline
}

/// Returns `false` when the worker should stop.
async fn handle(
    pipeline: &mut MergePipeline,
    cmd: MergeCommand,
    paused: &mut bool,
    outcomes: &mpsc::Sender<MergeOutcome>,
) -> bool {
    match cmd {
        MergeCommand::Enqueue { request, reply } => {
            let _ = reply.send(pipeline.enqueue(request));
        }
        MergeCommand::Admit {
            branch,
            priority,
            reply,
        } => {
            let _ = reply.send(pipeline.admit(&branch, priority).await);
        }
        MergeCommand::ResolveEscalation { action, reply } => {
            let result = pipeline.resolve_escalation(action).await;
            if let Ok(outcome) = &result {
                if outcome.needs_pause() {
                    *paused = true;
                }
                let _ = outcomes.send(outcome.clone()).await;
            }
            let _ = reply.send(result);
        }
        MergeCommand::Status { reply } => {
            let _ = reply.send(pipeline.status());
        }
        MergeCommand::Pause => *paused = true,
        MergeCommand::Resume => *paused = false,
        MergeCommand::Shutdown => return false,
    }
    true
}

/// Cloneable handle to a running [`MergeWorker`].
#[derive(Clone)]
pub struct MergeHandle {
    tx: mpsc::Sender<MergeCommand>,
    status: watch::Receiver<MergeStatus>,
}

fn stopped() -> ChorusError {
    ChorusError::Merge("merge worker is not running".to_string())
}

impl MergeHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> MergeCommand,
    ) -> ChorusResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    /// Queue an agent branch.
    pub async fn enqueue(&self, request: MergeRequest) -> ChorusResult<usize> {
        self.request(|reply| MergeCommand::Enqueue { request, reply })
            .await?
    }

    /// Validate and queue an operator branch.
    pub async fn admit(
        &self,
        branch: &str,
        priority: Option<u8>,
    ) -> Result<Admission, AdmissionError> {
        let branch = branch.to_string();
        self.request(|reply| MergeCommand::Admit {
            branch,
            priority,
            reply,
        })
        .await?
    }

    /// Apply an operator decision to the pending escalation.
    pub async fn resolve_escalation(&self, action: EscalationAction) -> ChorusResult<MergeOutcome> {
        self.request(|reply| MergeCommand::ResolveEscalation { action, reply })
            .await?
    }

    /// Last published status. Never waits for an in-flight merge.
    pub fn latest_status(&self) -> MergeStatus {
        self.status.borrow().clone()
    }

    /// Current queue, counters and pending escalation, from the worker itself.
    pub async fn status(&self) -> ChorusResult<MergeStatus> {
        self.request(|reply| MergeCommand::Status { reply }).await
    }

    /// Stop draining; admission keeps working.
    pub async fn pause(&self) -> ChorusResult<()> {
        self.tx.send(MergeCommand::Pause).await.map_err(|_| stopped())
    }

    /// Resume draining.
    pub async fn resume(&self) -> ChorusResult<()> {
        self.tx.send(MergeCommand::Resume).await.map_err(|_| stopped())
    }

    /// Stop the worker after the current item.
    pub async fn shutdown(&self) -> ChorusResult<()> {
        self.tx.send(MergeCommand::Shutdown).await.map_err(|_| stopped())
    }
}
