use crate::types::{Task, TaskStatus};
use tokio::sync::broadcast;

/// Capacity of the task event channel. Subscribers that fall further behind
/// than this see `RecvError::Lagged` and should resync from [`TaskEvent::Change`].
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notification emitted by [`crate::TaskStore`] after each mutation.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A task was created.
    Created(Task),
    /// A task's status or fields changed.
    Updated {
        /// The task after the change.
        task: Task,
        /// Status before the change.
        previous: TaskStatus,
    },
    /// A task entered `done` or `failed`.
    Closed(Task),
    /// Full task list after any mutation, in insertion order.
    Change(Vec<Task>),
}

impl TaskEvent {
    /// Short event name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Created(_) => "created",
            TaskEvent::Updated { .. } => "updated",
            TaskEvent::Closed(_) => "closed",
            TaskEvent::Change(_) => "change",
        }
    }
}

pub(crate) fn channel() -> broadcast::Sender<TaskEvent> {
    let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tx
}
