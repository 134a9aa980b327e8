use crate::types::{Checkpoint, CheckpointConfig, CheckpointType};
use chorus_core::{ChorusError, ChorusResult};
use chorus_git::{Repo, TagInfo};
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{info, warn};

const TIMESTAMP_TAG_PREFIX: &str = "chorus-checkpoint-";
const PRE_MERGE_TAG_PREFIX: &str = "pre-merge-";
const MESSAGE_PREFIX: &str = "chorus checkpoint: ";

/// Creates, restores and prunes checkpoint tags.
///
/// The in-memory list is a cache of the tags; [`Checkpointer::rebuild`]
/// repopulates it from `git tag` after a restart.
pub struct Checkpointer {
    repo: Repo,
    config: CheckpointConfig,
    task_ref: Regex,
    checkpoints: Vec<Checkpoint>,
}

impl Checkpointer {
    /// Create a checkpointer. `task_prefix` is the task id prefix (e.g. `ch`)
    /// used to recognise `[ch-12]` references in commit messages.
    pub fn new(repo: Repo, config: CheckpointConfig, task_prefix: &str) -> ChorusResult<Self> {
        let pattern = format!(r"\[({}-[A-Za-z0-9]+)\]", regex::escape(task_prefix));
        let task_ref = Regex::new(&pattern)
            .map_err(|e| ChorusError::Config(format!("Invalid task prefix '{task_prefix}': {e}")))?;
        Ok(Self {
            repo,
            config,
            task_ref,
            checkpoints: Vec::new(),
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Whether a checkpoint of `kind` should be taken under the current config.
    pub fn should_create(&self, kind: CheckpointType) -> bool {
        if !self.config.enabled {
            return false;
        }
        match kind {
            CheckpointType::AutopilotStart => self.config.before_autopilot,
            CheckpointType::PreMerge => self.config.before_merge,
            CheckpointType::Periodic => self.config.periodic > 0,
            CheckpointType::Manual => true,
        }
    }

    /// Tag `HEAD` of the main checkout.
    ///
    /// Fails with [`ChorusError::CheckpointExists`] if the tag name is taken;
    /// existing tags are never overwritten.
    pub async fn create(
        &mut self,
        kind: CheckpointType,
        task_id: Option<&str>,
    ) -> ChorusResult<Checkpoint> {
        let now = Utc::now();
        let tag = tag_name(kind, task_id, now);
        let message = match task_id {
            Some(id) => format!("{MESSAGE_PREFIX}{kind} {id}"),
            None => format!("{MESSAGE_PREFIX}{kind}"),
        };

        let out = self.repo.tag(&tag, &message).await?;
        if !out.success() {
            if out.message().contains("already exists") {
                return Err(ChorusError::CheckpointExists(tag));
            }
            return Err(ChorusError::Git(format!(
                "Failed to create checkpoint {tag}: {}",
                out.message()
            )));
        }

        let checkpoint = Checkpoint {
            id: tag.clone(),
            tag,
            timestamp: now,
            kind,
            task_id: task_id.map(String::from),
        };
        info!(checkpoint = %checkpoint.id, kind = %kind, "Checkpoint created");
        self.checkpoints.push(checkpoint.clone());
        Ok(checkpoint)
    }

    /// Like [`create`](Self::create), but a tag that already exists under the
    /// same name is deleted and re-created at the current `HEAD`.
    ///
    /// Pre-merge tags are named after the task, so a task merged again after a
    /// rollback would otherwise keep pointing at its first merge.
    pub async fn create_or_replace(
        &mut self,
        kind: CheckpointType,
        task_id: Option<&str>,
    ) -> ChorusResult<Checkpoint> {
        match self.create(kind, task_id).await {
            Err(ChorusError::CheckpointExists(tag)) => {
                self.repo.delete_tag(&tag).await?;
                self.checkpoints.retain(|c| c.tag != tag);
                info!(checkpoint = %tag, "Replacing stale checkpoint");
                self.create(kind, task_id).await
            }
            other => other,
        }
    }

    /// Hard-reset the main checkout to `checkpoint_id`.
    ///
    /// Returns the task ids referenced as `[<id>]` in commits between the
    /// checkpoint and the old `HEAD`, first occurrence order, duplicates removed.
    pub async fn restore(&mut self, checkpoint_id: &str) -> ChorusResult<Vec<String>> {
        if self.repo.rev_parse(checkpoint_id).await?.is_none() {
            return Err(ChorusError::Git(format!(
                "Unknown checkpoint: {checkpoint_id}"
            )));
        }

        let log = self
            .repo
            .log_oneline(&format!("{checkpoint_id}..HEAD"))
            .await?;
        let affected = self.affected_tasks(&log);

        self.repo.reset_hard(checkpoint_id).await?;
        info!(
            checkpoint = %checkpoint_id,
            affected = affected.len(),
            "Checkpoint restored"
        );
        Ok(affected)
    }

    /// Task ids referenced in `log`, deduplicated in order of first appearance.
    pub fn affected_tasks(&self, log: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for caps in self.task_ref.captures_iter(log) {
            let id = &caps[1];
            if !out.iter().any(|seen| seen == id) {
                out.push(id.to_string());
            }
        }
        out
    }

    /// Delete the oldest checkpoints so that at most `keep` remain.
    /// Returns how many were deleted.
    pub async fn prune(&mut self, keep: usize) -> ChorusResult<usize> {
        if self.checkpoints.len() <= keep {
            return Ok(0);
        }
        self.checkpoints.sort_by_key(|c| c.timestamp);
        let excess = self.checkpoints.len() - keep;
        let doomed: Vec<Checkpoint> = self.checkpoints.drain(..excess).collect();

        for cp in &doomed {
            if let Err(e) = self.repo.delete_tag(&cp.tag).await {
                warn!(checkpoint = %cp.tag, error = %e, "Failed to delete checkpoint tag");
            }
        }
        info!(deleted = doomed.len(), kept = self.checkpoints.len(), "Checkpoints pruned");
        Ok(doomed.len())
    }

    /// Prune down to the configured retention count.
    pub async fn prune_to_config(&mut self) -> ChorusResult<usize> {
        self.prune(self.config.keep).await
    }

    /// Known checkpoints, oldest first.
    pub fn list(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Most recent checkpoint, optionally restricted to one kind.
    pub fn latest(&self, kind: Option<CheckpointType>) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .filter(|c| kind.map_or(true, |k| c.kind == k))
            .max_by_key(|c| c.timestamp)
    }

    /// Reload the checkpoint list from the repository's tags.
    pub async fn rebuild(&mut self) -> ChorusResult<usize> {
        let patterns = [
            format!("{TIMESTAMP_TAG_PREFIX}*"),
            format!("{PRE_MERGE_TAG_PREFIX}*"),
        ];
        let patterns: Vec<&str> = patterns.iter().map(String::as_str).collect();
        let tags = self.repo.list_tags(&patterns).await?;

        let mut checkpoints: Vec<Checkpoint> = tags.iter().map(from_tag).collect();
        checkpoints.sort_by_key(|c| c.timestamp);
        self.checkpoints = checkpoints;
        info!(count = self.checkpoints.len(), "Checkpoint list rebuilt from tags");
        Ok(self.checkpoints.len())
    }
}

/// Deterministic tag name: `pre-merge-<task>` for pre-merge checkpoints with a
/// task, `chorus-checkpoint-<unix seconds>` otherwise.
pub fn tag_name(kind: CheckpointType, task_id: Option<&str>, at: DateTime<Utc>) -> String {
    match (kind, task_id) {
        (CheckpointType::PreMerge, Some(id)) => format!("{PRE_MERGE_TAG_PREFIX}{id}"),
        _ => format!("{TIMESTAMP_TAG_PREFIX}{}", at.timestamp()),
    }
}

fn from_tag(tag: &TagInfo) -> Checkpoint {
    let (kind, task_id) = match tag.subject.strip_prefix(MESSAGE_PREFIX) {
        Some(rest) => {
            let mut parts = rest.splitn(2, ' ');
            let kind = parts
                .next()
                .and_then(|k| k.parse().ok())
                .unwrap_or(CheckpointType::Manual);
            let task = parts.next().map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
            (kind, task)
        }
        // Lightweight or foreign tag; infer from the name.
        None => match tag.name.strip_prefix(PRE_MERGE_TAG_PREFIX) {
            Some(task) => (CheckpointType::PreMerge, Some(task.to_string())),
            None => (CheckpointType::Manual, None),
        },
    };
    Checkpoint {
        id: tag.name.clone(),
        tag: tag.name.clone(),
        timestamp: DateTime::from_timestamp(tag.created_unix, 0).unwrap_or_default(),
        kind,
        task_id,
    }
}
