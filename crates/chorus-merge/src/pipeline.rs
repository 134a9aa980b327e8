use crate::admission::{self, Admission, AdmissionError};
use crate::classifier::{ConflictClassifier, Strategy};
use crate::config::MergeConfig;
use crate::escalation::{EscalationAction, EscalationRequest, HumanEscalation};
use crate::force_push::ForcePushRecovery;
use crate::queue::{MergeItem, MergeQueue, MergeRequest, QueueStats};
use crate::rebase::RebaseRetry;
use crate::resolver::{
    CommandResolver, ConflictInspector, ConflictResolver, ResolveOutcome, ResolveRequest,
};
use chorus_checkpoint::{CheckpointType, Checkpointer};
use chorus_core::ChorusResult;
use chorus_git::Repo;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What one drain step did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// The branch is on the target. `strategy` is `None` for a clean merge.
    Merged {
        task_id: String,
        branch: String,
        strategy: Option<Strategy>,
    },
    /// The attempt failed and the item went to the back of the queue.
    Deferred {
        task_id: String,
        retry_count: u32,
        reason: String,
    },
    /// The item is parked until an operator decides.
    Escalated(EscalationRequest),
    /// An operator resolved the pending escalation.
    Resolved {
        task_id: String,
        branch: String,
        action: EscalationAction,
    },
    /// Automatic merging must stop (force-push budget spent).
    PauseRequested { task_id: String, reason: String },
}

impl MergeOutcome {
    /// Task the outcome refers to.
    pub fn task_id(&self) -> &str {
        match self {
            MergeOutcome::Merged { task_id, .. }
            | MergeOutcome::Deferred { task_id, .. }
            | MergeOutcome::Resolved { task_id, .. }
            | MergeOutcome::PauseRequested { task_id, .. } => task_id,
            MergeOutcome::Escalated(request) => &request.task_id,
        }
    }

    /// Whether the controller should stop autopilot.
    pub fn needs_pause(&self) -> bool {
        matches!(
            self,
            MergeOutcome::PauseRequested { .. }
                | MergeOutcome::Resolved {
                    action: EscalationAction::Cancelled,
                    ..
                }
        )
    }
}

/// Merges performed, by who did the work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCounters {
    /// Merged by the pipeline, including auto-resolved conflicts.
    pub merges_auto: u64,
    /// Merged by an operator after escalation.
    pub merges_manual: u64,
}

/// Point-in-time view of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStatus {
    /// Queue counters.
    pub queue: QueueStats,
    /// Queued items in merge order.
    pub items: Vec<MergeItem>,
    /// Escalation waiting for an operator.
    pub pending_escalation: Option<EscalationRequest>,
    /// Merges so far.
    pub counters: MergeCounters,
}

/// The serialized merge consumer: one item at a time, end to end.
pub struct MergePipeline {
    repo: Repo,
    config: MergeConfig,
    queue: MergeQueue,
    classifier: ConflictClassifier,
    rebaser: RebaseRetry,
    force_push: ForcePushRecovery,
    escalation: HumanEscalation,
    checkpointer: Option<Arc<Mutex<Checkpointer>>>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    inspector: Option<Arc<dyn ConflictInspector>>,
    worktree_dir: PathBuf,
    counters: MergeCounters,
}

impl MergePipeline {
    /// Build a pipeline. A configured `resolver_command` becomes the conflict resolver.
    pub fn new(repo: Repo, config: MergeConfig, escalation: HumanEscalation) -> ChorusResult<Self> {
        let resolver: Option<Arc<dyn ConflictResolver>> = match &config.resolver_command {
            Some(argv) => Some(Arc::new(CommandResolver::new(
                argv.clone(),
                Duration::from_secs(config.resolver_timeout_secs),
            )?)),
            None => None,
        };
        Ok(Self {
            force_push: ForcePushRecovery::new(
                repo.clone(),
                &config.remote,
                &config.target_branch,
                config.max_force_push_recoveries,
            ),
            rebaser: RebaseRetry::new(repo.clone()),
            worktree_dir: repo.root().join(".worktrees"),
            repo,
            config,
            queue: MergeQueue::new(),
            classifier: ConflictClassifier::new(),
            escalation,
            checkpointer: None,
            resolver,
            inspector: None,
            counters: MergeCounters::default(),
        })
    }

    /// Take a pre-merge checkpoint before each merge, when the checkpointer allows it.
    pub fn with_checkpointer(mut self, checkpointer: Arc<Mutex<Checkpointer>>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Use `resolver` for complex conflicts.
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Use `inspector` to supply line ranges and semantic flags.
    pub fn with_inspector(mut self, inspector: Arc<dyn ConflictInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    /// Directory for temporary checkouts of branches that have no agent worktree.
    pub fn with_worktree_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.worktree_dir = self.repo.root().join(dir);
        self
    }

    // --- queue access ---

    /// The queue.
    pub fn queue(&self) -> &MergeQueue {
        &self.queue
    }

    /// Queue an agent branch. Returns the queue length after insertion.
    pub fn enqueue(&mut self, request: MergeRequest) -> ChorusResult<usize> {
        self.queue.enqueue(request)
    }

    /// Validate and queue an operator branch.
    pub async fn admit(
        &mut self,
        branch: &str,
        priority: Option<u8>,
    ) -> Result<Admission, AdmissionError> {
        admission::admit(
            &self.repo,
            &mut self.queue,
            &self.config.target_branch,
            branch,
            priority,
        )
        .await
    }

    /// Reload queue items from a snapshot.
    pub fn restore(&mut self, items: Vec<MergeItem>) {
        self.queue.restore(items);
        if !self.escalation.has_pending() {
            self.queue.unpark_escalated();
        }
    }

    /// Merge counters.
    pub fn counters(&self) -> MergeCounters {
        self.counters
    }

    /// The escalation tracker.
    pub fn escalation(&self) -> &HumanEscalation {
        &self.escalation
    }

    /// Snapshot of queue, counters and pending escalation.
    pub fn status(&self) -> MergeStatus {
        MergeStatus {
            queue: self.queue.stats(),
            items: self.queue.items().to_vec(),
            pending_escalation: self.escalation.pending().cloned(),
            counters: self.counters,
        }
    }

    // --- draining ---

    /// Process the next ready item, if any.
    pub async fn process_next(&mut self) -> ChorusResult<Option<MergeOutcome>> {
        let Some(item) = self.queue.dequeue() else {
            return Ok(None);
        };
        info!(task_id = %item.task_id, branch = %item.branch, retry = item.retry_count, "Merging");
        let outcome = match self.attempt(&item).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = self.repo.abort_merge().await;
                self.fail_attempt(&item, None, Vec::new(), e.to_string())
                    .await?
            }
        };
        Ok(Some(outcome))
    }

    /// Process ready items until none remain or a pause is requested.
    pub async fn drain(&mut self) -> ChorusResult<Vec<MergeOutcome>> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.process_next().await? {
            let stop = outcome.needs_pause();
            outcomes.push(outcome);
            if stop {
                break;
            }
        }
        Ok(outcomes)
    }

    /// Apply the operator's decision to the pending escalation.
    pub async fn resolve_escalation(
        &mut self,
        action: EscalationAction,
    ) -> ChorusResult<MergeOutcome> {
        let request = self.escalation.resolve(action).await?;
        match action {
            EscalationAction::Merged => {
                if let Some(item) = self.queue.mark_completed(&request.task_id) {
                    self.cleanup(&item, true).await;
                }
                self.counters.merges_manual += 1;
            }
            EscalationAction::Skipped | EscalationAction::Cancelled => {
                if let Some(item) = self.queue.mark_failed(&request.task_id) {
                    self.cleanup(&item, false).await;
                }
            }
        }
        self.force_push.reset(&request.task_id);
        self.queue.unpark_escalated();
        Ok(MergeOutcome::Resolved {
            task_id: request.task_id,
            branch: request.branch,
            action,
        })
    }

    async fn attempt(&mut self, item: &MergeItem) -> ChorusResult<MergeOutcome> {
        let target = self.config.target_branch.clone();

        if self.force_push.detect().await? {
            info!(task_id = %item.task_id, "Upstream force-push detected");
            let cwd = self.checkout_for(item).await?;
            let check = self.force_push.recover(&item.task_id, &cwd).await?;
            if check.needs_pause {
                self.queue.release(&item.task_id);
                return Ok(MergeOutcome::PauseRequested {
                    task_id: item.task_id.clone(),
                    reason: format!(
                        "{} force-push recoveries exhausted for {}",
                        check.recovery_count, item.task_id
                    ),
                });
            }
            if let Some(rebase) = check.rebase.filter(|r| !r.success) {
                let reason = rebase.error.unwrap_or_else(|| {
                    "rebase onto rewritten target stopped on conflicts".to_string()
                });
                return self
                    .fail_attempt(item, Some(Strategy::Rebase), Vec::new(), reason)
                    .await;
            }
        }

        self.pre_merge_checkpoint(&item.task_id).await;

        self.repo.checkout(&target).await?;
        let message = merge_message(item);
        let out = self.repo.merge(&item.branch, &message).await?;
        if out.success() {
            return self.finish_merged(item, None).await;
        }

        let root = self.repo.root().to_path_buf();
        let files = self.repo.conflicted_files(&root).await?;
        if files.is_empty() {
            self.repo.abort_merge().await?;
            return self
                .fail_attempt(item, None, files, out.message().to_string())
                .await;
        }

        let infos = match &self.inspector {
            Some(inspector) => inspector.inspect(&root, &files).await?,
            None => Vec::new(),
        };
        let analysis = self.classifier.analyze(&files, &infos);
        let strategy = self
            .classifier
            .suggested_strategy(analysis.overall, item.agent_failed);
        info!(
            task_id = %item.task_id,
            files = files.len(),
            conflict = %analysis.overall,
            strategy = %strategy,
            "Merge conflict classified"
        );

        match strategy {
            Strategy::Auto => self.resolve_auto(item, files).await,
            Strategy::Rebase => {
                self.repo.abort_merge().await?;
                self.resolve_rebase(item, files).await
            }
            Strategy::Agent => {
                self.repo.abort_merge().await?;
                self.resolve_with_agent(item, files).await
            }
            Strategy::Human => {
                self.repo.abort_merge().await?;
                self.fail_attempt(
                    item,
                    Some(Strategy::Human),
                    files,
                    "resolver agent could not resolve the conflict".to_string(),
                )
                .await
            }
        }
    }

    async fn resolve_auto(
        &mut self,
        item: &MergeItem,
        files: Vec<String>,
    ) -> ChorusResult<MergeOutcome> {
        let mut result = Ok(());
        for file in &files {
            result = self.repo.resolve_theirs(file).await;
            if result.is_err() {
                break;
            }
        }
        if result.is_ok() {
            result = self.repo.commit_merge().await;
        }
        match result {
            Ok(()) => self.finish_merged(item, Some(Strategy::Auto)).await,
            Err(e) => {
                self.repo.abort_merge().await?;
                self.fail_attempt(item, Some(Strategy::Auto), files, e.to_string())
                    .await
            }
        }
    }

    async fn resolve_rebase(
        &mut self,
        item: &MergeItem,
        files: Vec<String>,
    ) -> ChorusResult<MergeOutcome> {
        let cwd = self.checkout_for(item).await?;
        let rebase = self
            .rebaser
            .rebase(&cwd, &self.config.target_branch)
            .await?;
        if !rebase.success {
            let reason = match rebase.error {
                Some(error) => error,
                None => "rebase stopped on conflicts".to_string(),
            };
            return self
                .fail_attempt(item, Some(Strategy::Rebase), files, reason)
                .await;
        }
        self.retry_merge(item, Strategy::Rebase, files).await
    }

    async fn resolve_with_agent(
        &mut self,
        item: &MergeItem,
        files: Vec<String>,
    ) -> ChorusResult<MergeOutcome> {
        let Some(resolver) = self.resolver.clone() else {
            self.queue.mark_agent_failed(&item.task_id);
            return self
                .fail_attempt(
                    item,
                    Some(Strategy::Agent),
                    files,
                    "no conflict resolver configured".to_string(),
                )
                .await;
        };

        // Reproduce the conflict in the branch checkout, where the resolver works.
        let cwd = self.checkout_for(item).await?;
        let target = self.config.target_branch.clone();
        let out = self
            .repo
            .run_in(&cwd, &["merge", "--no-edit", &target])
            .await?;
        if !out.success() {
            let request = ResolveRequest {
                task_id: item.task_id.clone(),
                worktree: cwd.clone(),
                files: files.clone(),
                target_branch: target,
            };
            let verdict = resolver.resolve(&request).await?;
            let remaining = self.repo.conflicted_files(&cwd).await?;
            let failure = match verdict {
                ResolveOutcome::Resolved if remaining.is_empty() => None,
                ResolveOutcome::Resolved => Some(format!(
                    "resolver reported success but {} files are still conflicted",
                    remaining.len()
                )),
                ResolveOutcome::NeedsHuman(reason) => Some(
                    reason.unwrap_or_else(|| "resolver asked for a human".to_string()),
                ),
                ResolveOutcome::Failed(reason) => Some(reason),
            };
            if let Some(reason) = failure {
                let _ = self.repo.run_in(&cwd, &["merge", "--abort"]).await;
                self.queue.mark_agent_failed(&item.task_id);
                return self
                    .fail_attempt(item, Some(Strategy::Agent), files, reason)
                    .await;
            }
            // The resolver may have committed already.
            let _ = self.repo.run_in(&cwd, &["commit", "--no-edit"]).await;
        }
        self.retry_merge(item, Strategy::Agent, files).await
    }

    async fn retry_merge(
        &mut self,
        item: &MergeItem,
        strategy: Strategy,
        files: Vec<String>,
    ) -> ChorusResult<MergeOutcome> {
        self.repo.checkout(&self.config.target_branch).await?;
        let out = self.repo.merge(&item.branch, &merge_message(item)).await?;
        if out.success() {
            return self.finish_merged(item, Some(strategy)).await;
        }
        self.repo.abort_merge().await?;
        self.fail_attempt(item, Some(strategy), files, out.message().to_string())
            .await
    }

    async fn finish_merged(
        &mut self,
        item: &MergeItem,
        strategy: Option<Strategy>,
    ) -> ChorusResult<MergeOutcome> {
        self.queue.mark_completed(&item.task_id);
        self.force_push.reset(&item.task_id);
        self.counters.merges_auto += 1;
        self.cleanup(item, true).await;
        info!(task_id = %item.task_id, branch = %item.branch, strategy = ?strategy, "Merged");
        Ok(MergeOutcome::Merged {
            task_id: item.task_id.clone(),
            branch: item.branch.clone(),
            strategy,
        })
    }

    /// Count a failed attempt, escalating once the retry budget is spent.
    async fn fail_attempt(
        &mut self,
        item: &MergeItem,
        strategy: Option<Strategy>,
        files: Vec<String>,
        reason: String,
    ) -> ChorusResult<MergeOutcome> {
        let retry_count = self
            .queue
            .defer_to_end(&item.task_id)
            .unwrap_or(item.retry_count + 1);
        warn!(
            task_id = %item.task_id,
            retry = retry_count,
            strategy = ?strategy,
            reason = %reason,
            "Merge attempt failed"
        );

        let wants_human =
            strategy == Some(Strategy::Human) || self.escalation.should_escalate(retry_count);
        if !wants_human {
            return Ok(MergeOutcome::Deferred {
                task_id: item.task_id.clone(),
                retry_count,
                reason,
            });
        }
        if self.escalation.has_pending() {
            // Park it; it gets another attempt once the pending escalation clears.
            debug!(task_id = %item.task_id, "Escalation already pending, parking item");
            self.queue.mark_escalated(&item.task_id);
            return Ok(MergeOutcome::Deferred {
                task_id: item.task_id.clone(),
                retry_count,
                reason,
            });
        }

        let request = EscalationRequest {
            task_id: item.task_id.clone(),
            branch: item.branch.clone(),
            worktree: item.worktree.clone(),
            conflict_files: files,
            retry_count,
            last_attempt: strategy.unwrap_or(Strategy::Rebase),
            error: Some(reason),
            created_at: Utc::now(),
        };
        // The pipeline is resolved through `resolve_escalation`, not by awaiting.
        let _decision = self.escalation.escalate(request.clone()).await?;
        self.queue.mark_escalated(&item.task_id);
        Ok(MergeOutcome::Escalated(request))
    }

    async fn pre_merge_checkpoint(&self, task_id: &str) {
        let Some(checkpointer) = &self.checkpointer else {
            return;
        };
        let mut checkpointer = checkpointer.lock().await;
        if !checkpointer.should_create(CheckpointType::PreMerge) {
            return;
        }
        if let Err(e) = checkpointer
            .create_or_replace(CheckpointType::PreMerge, Some(task_id))
            .await
        {
            warn!(task_id = %task_id, error = %e, "Pre-merge checkpoint failed");
            return;
        }
        if let Err(e) = checkpointer.prune_to_config().await {
            warn!(error = %e, "Checkpoint pruning failed");
        }
    }

    /// Working checkout for `item`: its agent worktree, or a temporary one.
    async fn checkout_for(&self, item: &MergeItem) -> ChorusResult<PathBuf> {
        if let Some(worktree) = &item.worktree {
            return Ok(worktree.clone());
        }
        let path = self.temp_worktree(item);
        if !tokio::fs::try_exists(&path).await? {
            self.repo.worktree_add_existing(&path, &item.branch).await?;
        }
        Ok(path)
    }

    fn temp_worktree(&self, item: &MergeItem) -> PathBuf {
        self.worktree_dir.join(format!("merge-{}", item.task_id))
    }

    /// Remove checkouts for an item that left the queue. Agent branches are
    /// deleted after a merge; operator branches are always kept.
    async fn cleanup(&self, item: &MergeItem, merged: bool) {
        let temp = self.temp_worktree(item);
        if tokio::fs::try_exists(&temp).await.unwrap_or(false) {
            if let Err(e) = self.repo.worktree_remove(&temp).await {
                warn!(path = %temp.display(), error = %e, "Failed to remove merge worktree");
            }
        }
        let Some(worktree) = &item.worktree else {
            return;
        };
        if !merged {
            return;
        }
        if let Err(e) = self.repo.worktree_remove(worktree).await {
            warn!(path = %worktree.display(), error = %e, "Failed to remove agent worktree");
        }
        if let Err(e) = self.repo.delete_branch(&item.branch).await {
            warn!(branch = %item.branch, error = %e, "Failed to delete merged branch");
        }
    }
}

/// Merge commit message; carries `[<task-id>]` so checkpoint restores can
/// report affected tasks.
fn merge_message(item: &MergeItem) -> String {
    format!("Merge {} [{}]", item.branch, item.task_id)
}
