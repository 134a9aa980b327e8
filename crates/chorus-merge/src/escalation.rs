use crate::classifier::Strategy;
use chorus_core::{write_atomic, ChorusError, ChorusResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, oneshot};
use tracing::{info, warn};

/// Default number of failed attempts before escalating.
pub const DEFAULT_ESCALATION_THRESHOLD: u32 = 3;

/// A merge the pipeline gave up on, waiting for an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRequest {
    /// Task the branch belongs to.
    pub task_id: String,
    /// Branch that failed to merge.
    pub branch: String,
    /// Checkout the operator can inspect.
    pub worktree: Option<PathBuf>,
    /// Files still in conflict at the last attempt.
    pub conflict_files: Vec<String>,
    /// Automatic attempts made.
    pub retry_count: u32,
    /// Strategy of the last attempt.
    pub last_attempt: Strategy,
    /// Failure message from the last attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the item was escalated.
    pub created_at: DateTime<Utc>,
}

/// Operator decision for a pending escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationAction {
    /// The operator merged the branch by hand.
    Merged,
    /// Drop the item; the branch is kept.
    Skipped,
    /// Drop the item and stop autopilot.
    Cancelled,
}

impl std::fmt::Display for EscalationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscalationAction::Merged => write!(f, "merged"),
            EscalationAction::Skipped => write!(f, "skipped"),
            EscalationAction::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Escalation notifications.
#[derive(Debug, Clone)]
pub enum EscalationEvent {
    /// A new request is pending.
    Escalated(EscalationRequest),
    /// The pending request was resolved.
    Resolved {
        request: EscalationRequest,
        action: EscalationAction,
    },
}

struct Pending {
    request: EscalationRequest,
    reply: Option<oneshot::Sender<EscalationAction>>,
}

/// Tracks the single pending escalation and persists it so it survives a restart.
pub struct HumanEscalation {
    path: PathBuf,
    threshold: u32,
    pending: Option<Pending>,
    events: broadcast::Sender<EscalationEvent>,
}

impl HumanEscalation {
    /// Persist pending escalations to `path`.
    pub fn new(path: impl Into<PathBuf>, threshold: u32) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            path: path.into(),
            threshold,
            pending: None,
            events,
        }
    }

    /// Create and restore a pending escalation from `path` if one exists.
    pub async fn load(path: impl Into<PathBuf>, threshold: u32) -> ChorusResult<Self> {
        let mut this = Self::new(path, threshold);
        if tokio::fs::try_exists(&this.path).await? {
            let contents = tokio::fs::read_to_string(&this.path).await?;
            let request: EscalationRequest = serde_json::from_str(&contents)
                .map_err(|e| ChorusError::corrupt(&this.path, e.to_string()))?;
            info!(task_id = %request.task_id, "Restored pending escalation");
            this.pending = Some(Pending {
                request,
                reply: None,
            });
        }
        Ok(this)
    }

    /// Whether `retry_count` failed attempts warrant escalation.
    pub fn should_escalate(&self, retry_count: u32) -> bool {
        retry_count >= self.threshold
    }

    /// The pending request, if any.
    pub fn pending(&self) -> Option<&EscalationRequest> {
        self.pending.as_ref().map(|p| &p.request)
    }

    /// Whether a request is waiting for an operator.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Subscribe to escalation events.
    pub fn subscribe(&self) -> broadcast::Receiver<EscalationEvent> {
        self.events.subscribe()
    }

    /// Record a new escalation. The receiver resolves with the operator's decision.
    ///
    /// Only one request may be pending; a second call fails with
    /// [`ChorusError::EscalationPending`].
    pub async fn escalate(
        &mut self,
        request: EscalationRequest,
    ) -> ChorusResult<oneshot::Receiver<EscalationAction>> {
        if let Some(pending) = &self.pending {
            return Err(ChorusError::EscalationPending(
                pending.request.task_id.clone(),
            ));
        }
        write_atomic(&self.path, &serde_json::to_vec_pretty(&request)?).await?;

        warn!(
            task_id = %request.task_id,
            branch = %request.branch,
            retries = request.retry_count,
            last_attempt = %request.last_attempt,
            "Merge escalated to operator"
        );
        let (tx, rx) = oneshot::channel();
        let _ = self.events.send(EscalationEvent::Escalated(request.clone()));
        self.pending = Some(Pending {
            request,
            reply: Some(tx),
        });
        Ok(rx)
    }

    /// Clear the pending request with `action`, returning it.
    pub async fn resolve(&mut self, action: EscalationAction) -> ChorusResult<EscalationRequest> {
        let Some(pending) = self.pending.take() else {
            return Err(ChorusError::Merge("No escalation pending".to_string()));
        };
        if let Err(e) = remove_if_exists(&self.path).await {
            // Keep the request pending so the file and memory agree.
            self.pending = Some(pending);
            return Err(e);
        }
        if let Some(reply) = pending.reply {
            let _ = reply.send(action);
        }
        info!(task_id = %pending.request.task_id, action = %action, "Escalation resolved");
        let _ = self.events.send(EscalationEvent::Resolved {
            request: pending.request.clone(),
            action,
        });
        Ok(pending.request)
    }

    /// Resolve as merged by hand.
    pub async fn mark_resolved(&mut self) -> ChorusResult<EscalationRequest> {
        self.resolve(EscalationAction::Merged).await
    }

    /// Resolve by skipping the item.
    pub async fn mark_skipped(&mut self) -> ChorusResult<EscalationRequest> {
        self.resolve(EscalationAction::Skipped).await
    }

    /// Resolve by cancelling.
    pub async fn mark_cancelled(&mut self) -> ChorusResult<EscalationRequest> {
        self.resolve(EscalationAction::Cancelled).await
    }
}

async fn remove_if_exists(path: &Path) -> ChorusResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request(task: &str) -> EscalationRequest {
        EscalationRequest {
            task_id: task.into(),
            branch: format!("agent/{task}"),
            worktree: Some(PathBuf::from(format!(".worktrees/agent-{task}"))),
            conflict_files: vec!["src/lib.rs".into()],
            retry_count: 3,
            last_attempt: Strategy::Rebase,
            error: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_should_escalate_threshold() {
        let esc = HumanEscalation::new("/tmp/unused.json", DEFAULT_ESCALATION_THRESHOLD);
        assert!(!esc.should_escalate(0));
        assert!(!esc.should_escalate(2));
        assert!(esc.should_escalate(3));
        assert!(esc.should_escalate(7));
    }

    #[tokio::test]
    async fn test_escalate_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("escalation.json");
        let mut esc = HumanEscalation::new(&path, 3);
        let mut events = esc.subscribe();

        let rx = esc.escalate(request("ch-1")).await.unwrap();
        assert!(path.exists());
        assert_eq!(esc.pending().unwrap().task_id, "ch-1");

        let resolved = esc.mark_skipped().await.unwrap();
        assert_eq!(resolved.task_id, "ch-1");
        assert_eq!(rx.await.unwrap(), EscalationAction::Skipped);
        assert!(!path.exists());
        assert!(!esc.has_pending());

        assert!(matches!(events.recv().await.unwrap(), EscalationEvent::Escalated(_)));
        assert!(matches!(
            events.recv().await.unwrap(),
            EscalationEvent::Resolved {
                action: EscalationAction::Skipped,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_second_escalation_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut esc = HumanEscalation::new(dir.path().join("escalation.json"), 3);
        let _rx = esc.escalate(request("ch-1")).await.unwrap();
        let err = esc.escalate(request("ch-2")).await.unwrap_err();
        assert!(matches!(err, ChorusError::EscalationPending(ref id) if id == "ch-1"));
    }

    #[tokio::test]
    async fn test_pending_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("escalation.json");
        {
            let mut esc = HumanEscalation::new(&path, 3);
            let _rx = esc.escalate(request("ch-4")).await.unwrap();
        }
        let mut esc = HumanEscalation::load(&path, 3).await.unwrap();
        assert_eq!(esc.pending().unwrap().task_id, "ch-4");
        let resolved = esc.mark_resolved().await.unwrap();
        assert_eq!(resolved.conflict_files, vec!["src/lib.rs"]);
    }

    #[tokio::test]
    async fn test_resolve_without_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mut esc = HumanEscalation::new(dir.path().join("escalation.json"), 3);
        assert!(esc.mark_cancelled().await.is_err());
    }
}
