use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default priority for new tasks (0 = highest, 4 = lowest).
pub const DEFAULT_PRIORITY: u8 = 2;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Todo,
    /// Claimed by an agent.
    Doing,
    /// Finished successfully.
    Done,
    /// The agent could not finish it.
    Failed,
}

impl TaskStatus {
    /// Whether this status closes the task (done or failed).
    pub fn is_closed(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Todo => write!(f, "todo"),
            TaskStatus::Doing => write!(f, "doing"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// General work.
    #[default]
    Task,
    /// A defect to fix.
    Bug,
    /// New functionality.
    Feature,
    /// Maintenance with no user-facing change.
    Chore,
}

/// A unit of work in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Stable id, `<prefix>-<n>`.
    pub id: String,
    /// One-line summary.
    pub title: String,
    /// Longer instructions for the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Kind of work.
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    /// Free-form labels.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Tasks that must be done before this one is ready.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// 0 (highest) to 4.
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Agent currently working on the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    /// Why the last attempt failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last mutation.
    pub updated_at: DateTime<Utc>,
    /// How many times the task went through review.
    #[serde(default)]
    pub review_count: u32,
    /// Bumped on every mutation.
    #[serde(default)]
    pub version: u64,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl Task {
    /// Whether the task carries `tag`.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version += 1;
    }
}

/// Input for [`crate::TaskStore::create`].
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    /// One-line summary.
    pub title: String,
    /// Longer instructions for the agent.
    pub description: Option<String>,
    /// Kind of work.
    pub task_type: TaskType,
    /// Free-form labels.
    pub tags: Vec<String>,
    /// Ids of existing tasks this one waits for.
    pub dependencies: Vec<String>,
    /// 0 (highest) to 4; defaults to [`DEFAULT_PRIORITY`].
    pub priority: Option<u8>,
}

impl NewTask {
    /// A task with `title` and everything else defaulted.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Wait for `deps` before becoming ready.
    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Set the priority. Values above 4 are clamped on create.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Replace the tags.
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Set the kind of work.
    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Field changes for [`crate::TaskStore::update`]. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    /// New title.
    pub title: Option<String>,
    /// New description.
    pub description: Option<String>,
    /// Replacement tag list.
    pub tags: Option<Vec<String>>,
    /// New priority, 0 to 4.
    pub priority: Option<u8>,
    /// New review count.
    pub review_count: Option<u32>,
}

/// Count of tasks per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    /// Tasks waiting to be claimed.
    pub todo: usize,
    /// Tasks claimed by an agent.
    pub doing: usize,
    /// Finished tasks.
    pub done: usize,
    /// Failed tasks.
    pub failed: usize,
}
