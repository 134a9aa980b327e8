use chorus_core::{ChorusError, ChorusResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::path::PathBuf;
use tracing::debug;

/// Ordering boost per priority level; higher sorts earlier.
pub const PRIORITY_BOOST: [u32; 5] = [200, 100, 50, 10, 0];

/// Highest valid priority value (lowest urgency).
pub const MAX_PRIORITY: u8 = 4;

/// Where a queued item stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeItemStatus {
    /// Eligible for the next drain cycle.
    Ready,
    /// A branch it depends on is still queued.
    WaitingDependency,
    /// Currently being merged.
    Processing,
    /// Parked until an operator resolves the escalation.
    Escalated,
}

impl MergeItemStatus {
    fn rank(self) -> u8 {
        match self {
            MergeItemStatus::Processing => 0,
            MergeItemStatus::Ready => 1,
            MergeItemStatus::WaitingDependency => 2,
            MergeItemStatus::Escalated => 3,
        }
    }
}

/// Input for [`MergeQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequest {
    /// Task the branch belongs to.
    pub task_id: String,
    /// Branch to merge.
    pub branch: String,
    /// Agent worktree holding the branch, if any.
    pub worktree: Option<PathBuf>,
    /// 0 (highest) to 4.
    pub priority: u8,
    /// Branches that must merge first.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// A branch waiting to be merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeItem {
    /// Task the branch belongs to.
    pub task_id: String,
    /// Branch to merge.
    pub branch: String,
    /// Agent worktree holding the branch, if any.
    pub worktree: Option<PathBuf>,
    /// 0 (highest) to 4.
    pub priority: u8,
    /// When the item entered the queue.
    pub enqueued_at: DateTime<Utc>,
    /// Where the item stands.
    pub status: MergeItemStatus,
    /// Branches that must merge first.
    pub dependencies: Vec<String>,
    /// Failed automatic attempts so far.
    pub retry_count: u32,
    /// Set when a failed attempt moved the item to the back.
    pub deferred_at: Option<DateTime<Utc>>,
    /// A resolver agent already gave up on this item.
    #[serde(default)]
    pub agent_failed: bool,
    /// Enqueue sequence number, for FIFO ordering.
    seq: u64,
}

impl MergeItem {
    fn sort_key(&self) -> (u8, bool, Reverse<u32>, u64) {
        let boost = PRIORITY_BOOST
            .get(usize::from(self.priority))
            .copied()
            .unwrap_or(0);
        (
            self.status.rank(),
            self.deferred_at.is_some(),
            Reverse(boost),
            self.seq,
        )
    }
}

/// Queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Items ready to merge.
    pub pending: usize,
    /// Items waiting on a dependency.
    pub waiting: usize,
    /// Items being merged.
    pub processing: usize,
    /// Items parked for an operator.
    pub escalated: usize,
    /// Items merged since start.
    pub completed: u64,
    /// Items abandoned since start.
    pub failed: u64,
}

/// Ordered set of branches waiting to merge.
///
/// Order: processing first, then ready, waiting, escalated; within a status
/// non-deferred before deferred, then by priority, then first come first served.
/// A branch appears at most once.
#[derive(Debug, Default)]
pub struct MergeQueue {
    items: Vec<MergeItem>,
    next_seq: u64,
    completed: u64,
    failed: u64,
}

impl MergeQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a branch. Returns the queue length after insertion.
    pub fn enqueue(&mut self, request: MergeRequest) -> ChorusResult<usize> {
        if self.contains_branch(&request.branch) {
            return Err(ChorusError::Merge(format!(
                "branch already in queue: {}",
                request.branch
            )));
        }
        if request.priority > MAX_PRIORITY {
            return Err(ChorusError::Merge(format!(
                "invalid priority {} for {}",
                request.priority, request.branch
            )));
        }
        let status = if self.has_unmerged(&request.dependencies) {
            MergeItemStatus::WaitingDependency
        } else {
            MergeItemStatus::Ready
        };
        let item = MergeItem {
            task_id: request.task_id,
            branch: request.branch,
            worktree: request.worktree,
            priority: request.priority,
            enqueued_at: Utc::now(),
            status,
            dependencies: request.dependencies,
            retry_count: 0,
            deferred_at: None,
            agent_failed: false,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        debug!(task_id = %item.task_id, branch = %item.branch, status = ?item.status, "Merge item enqueued");
        self.items.push(item);
        self.sort();
        Ok(self.items.len())
    }

    /// Mark the first ready item as processing and return a copy of it.
    pub fn dequeue(&mut self) -> Option<MergeItem> {
        let item = self
            .items
            .iter_mut()
            .find(|i| i.status == MergeItemStatus::Ready)?;
        item.status = MergeItemStatus::Processing;
        let item = item.clone();
        self.sort();
        Some(item)
    }

    /// Send an item to the back of its class after a failed attempt.
    /// Returns the new retry count.
    pub fn defer_to_end(&mut self, task_id: &str) -> Option<u32> {
        let item = self.items.iter_mut().find(|i| i.task_id == task_id)?;
        item.retry_count += 1;
        item.status = MergeItemStatus::Ready;
        item.deferred_at = Some(Utc::now());
        item.seq = self.next_seq;
        self.next_seq += 1;
        let count = item.retry_count;
        self.sort();
        Some(count)
    }

    /// Put a processing item back to ready without counting a failed attempt.
    pub fn release(&mut self, task_id: &str) {
        if let Some(item) = self.items.iter_mut().find(|i| i.task_id == task_id) {
            if item.status == MergeItemStatus::Processing {
                item.status = MergeItemStatus::Ready;
            }
        }
        self.sort();
    }

    /// Reload items from a snapshot. Items that were mid-merge become ready again.
    pub fn restore(&mut self, items: Vec<MergeItem>) {
        self.items.clear();
        self.next_seq = 0;
        for mut item in items {
            if self.contains_branch(&item.branch) {
                continue;
            }
            if item.status == MergeItemStatus::Processing {
                item.status = MergeItemStatus::Ready;
            }
            item.seq = self.next_seq;
            self.next_seq += 1;
            self.items.push(item);
        }
        self.refresh_dependencies();
    }

    /// Park an item until its escalation is resolved.
    pub fn mark_escalated(&mut self, task_id: &str) -> bool {
        let Some(item) = self.items.iter_mut().find(|i| i.task_id == task_id) else {
            return false;
        };
        item.status = MergeItemStatus::Escalated;
        self.sort();
        true
    }

    /// Return every parked item to ready, keeping its retry count.
    pub fn unpark_escalated(&mut self) {
        for item in &mut self.items {
            if item.status == MergeItemStatus::Escalated {
                item.status = MergeItemStatus::Ready;
            }
        }
        self.sort();
    }

    /// Record that a resolver agent could not fix this item.
    pub fn mark_agent_failed(&mut self, task_id: &str) {
        if let Some(item) = self.items.iter_mut().find(|i| i.task_id == task_id) {
            item.agent_failed = true;
        }
    }

    /// Remove a merged item and unblock anything waiting on it.
    pub fn mark_completed(&mut self, task_id: &str) -> Option<MergeItem> {
        let item = self.take(task_id);
        self.completed += 1;
        self.refresh_dependencies();
        item
    }

    /// Remove an abandoned item.
    pub fn mark_failed(&mut self, task_id: &str) -> Option<MergeItem> {
        let item = self.take(task_id);
        self.failed += 1;
        self.refresh_dependencies();
        item
    }

    /// Look up an item by task id.
    pub fn get(&self, task_id: &str) -> Option<&MergeItem> {
        self.items.iter().find(|i| i.task_id == task_id)
    }

    /// Whether `branch` is queued in any status.
    pub fn contains_branch(&self, branch: &str) -> bool {
        self.items.iter().any(|i| i.branch == branch)
    }

    /// Items in queue order.
    pub fn items(&self) -> &[MergeItem] {
        &self.items
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether [`MergeQueue::dequeue`] would return an item.
    pub fn has_ready(&self) -> bool {
        self.items.iter().any(|i| i.status == MergeItemStatus::Ready)
    }

    /// Counters by status plus lifetime completed/failed totals.
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            completed: self.completed,
            failed: self.failed,
            ..QueueStats::default()
        };
        for item in &self.items {
            match item.status {
                MergeItemStatus::Ready => stats.pending += 1,
                MergeItemStatus::WaitingDependency => stats.waiting += 1,
                MergeItemStatus::Processing => stats.processing += 1,
                MergeItemStatus::Escalated => stats.escalated += 1,
            }
        }
        stats
    }

    fn take(&mut self, task_id: &str) -> Option<MergeItem> {
        let idx = self.items.iter().position(|i| i.task_id == task_id)?;
        Some(self.items.remove(idx))
    }

    /// A dependency is unmet while its branch is still in the queue.
    fn has_unmerged(&self, deps: &[String]) -> bool {
        deps.iter().any(|d| self.contains_branch(d))
    }

    fn refresh_dependencies(&mut self) {
        let queued: Vec<String> = self.items.iter().map(|i| i.branch.clone()).collect();
        for item in &mut self.items {
            if item.status == MergeItemStatus::WaitingDependency
                && !item.dependencies.iter().any(|d| queued.contains(d))
            {
                item.status = MergeItemStatus::Ready;
            }
        }
        self.sort();
    }

    fn sort(&mut self) {
        self.items.sort_by_key(MergeItem::sort_key);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request(task: &str, priority: u8) -> MergeRequest {
        MergeRequest {
            task_id: task.into(),
            branch: format!("agent/{task}"),
            worktree: None,
            priority,
            dependencies: vec![],
        }
    }

    fn order(queue: &MergeQueue) -> Vec<&str> {
        queue.items().iter().map(|i| i.task_id.as_str()).collect()
    }

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = MergeQueue::new();
        queue.enqueue(request("ch-1", 2)).unwrap();
        queue.enqueue(request("ch-2", 0)).unwrap();
        queue.enqueue(request("ch-3", 2)).unwrap();
        assert_eq!(queue.enqueue(request("ch-4", 4)).unwrap(), 4);
        assert_eq!(order(&queue), vec!["ch-2", "ch-1", "ch-3", "ch-4"]);
    }

    #[test]
    fn test_duplicate_branch_rejected() {
        let mut queue = MergeQueue::new();
        queue.enqueue(request("ch-1", 2)).unwrap();
        let err = queue.enqueue(request("ch-1", 1)).unwrap_err();
        assert!(err.to_string().contains("already in queue"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_dequeue_marks_processing() {
        let mut queue = MergeQueue::new();
        queue.enqueue(request("ch-1", 2)).unwrap();
        queue.enqueue(request("ch-2", 1)).unwrap();
        let item = queue.dequeue().unwrap();
        assert_eq!(item.task_id, "ch-2");
        assert_eq!(queue.get("ch-2").unwrap().status, MergeItemStatus::Processing);
        assert_eq!(queue.stats().processing, 1);
        assert_eq!(queue.dequeue().unwrap().task_id, "ch-1");
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_defer_to_end_sorts_after_fresh_items() {
        let mut queue = MergeQueue::new();
        queue.enqueue(request("ch-1", 0)).unwrap();
        queue.enqueue(request("ch-2", 3)).unwrap();
        queue.dequeue().unwrap();
        assert_eq!(queue.defer_to_end("ch-1"), Some(1));
        assert_eq!(order(&queue), vec!["ch-2", "ch-1"]);
        assert_eq!(queue.get("ch-1").unwrap().status, MergeItemStatus::Ready);
        assert_eq!(queue.defer_to_end("ch-9"), None);
    }

    #[test]
    fn test_waiting_dependency_unblocked_on_completion() {
        let mut queue = MergeQueue::new();
        queue.enqueue(request("ch-1", 2)).unwrap();
        let mut child = request("ch-2", 0);
        child.dependencies = vec!["agent/ch-1".into()];
        queue.enqueue(child).unwrap();

        assert_eq!(queue.get("ch-2").unwrap().status, MergeItemStatus::WaitingDependency);
        assert_eq!(queue.dequeue().unwrap().task_id, "ch-1");
        assert!(queue.dequeue().is_none());

        queue.mark_completed("ch-1").unwrap();
        assert_eq!(queue.get("ch-2").unwrap().status, MergeItemStatus::Ready);
        let stats = queue.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 1);
    }

    #[test]
    fn test_escalated_items_are_not_dequeued() {
        let mut queue = MergeQueue::new();
        queue.enqueue(request("ch-1", 0)).unwrap();
        queue.enqueue(request("ch-2", 2)).unwrap();
        assert!(queue.mark_escalated("ch-1"));
        assert_eq!(queue.dequeue().unwrap().task_id, "ch-2");
        assert!(queue.dequeue().is_none());
        assert_eq!(queue.stats().escalated, 1);
        queue.mark_failed("ch-1").unwrap();
        assert_eq!(queue.stats().failed, 1);
    }

    #[test]
    fn test_restore_resets_processing() {
        let mut queue = MergeQueue::new();
        queue.enqueue(request("ch-1", 1)).unwrap();
        queue.enqueue(request("ch-2", 2)).unwrap();
        queue.dequeue().unwrap();
        let snapshot = queue.items().to_vec();

        let mut restored = MergeQueue::new();
        restored.restore(snapshot);
        assert_eq!(restored.stats().processing, 0);
        assert_eq!(restored.dequeue().unwrap().task_id, "ch-1");
    }

    #[test]
    fn test_invalid_priority() {
        let mut queue = MergeQueue::new();
        assert!(queue.enqueue(request("ch-1", 5)).is_err());
    }
}
