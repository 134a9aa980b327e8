use crate::events::{self, TaskEvent};
use crate::persistence;
use crate::types::{NewTask, Task, TaskCounts, TaskStatus, TaskUpdate, DEFAULT_PRIORITY};
use chorus_core::{write_atomic, ChorusError, ChorusResult};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Dependency graph plus lifecycle state machine for tasks.
///
/// All mutation goes through `&mut self`; the orchestrator drives the store
/// from a single control loop, so there is no internal locking. Tasks are
/// never deleted, only moved between statuses.
pub struct TaskStore {
    tasks: HashMap<String, Task>,
    /// Insertion order, used for FIFO tie-breaking and persistence.
    order: Vec<String>,
    next_id: u64,
    prefix: String,
    path: PathBuf,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskStore {
    /// Create an empty store that flushes to `path` and issues ids `ch-1`, `ch-2`, ...
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            tasks: HashMap::new(),
            order: Vec::new(),
            next_id: 1,
            prefix: "ch".to_string(),
            path: path.into(),
            events: events::channel(),
        }
    }

    /// Use `prefix` for generated ids instead of `ch`.
    ///
    /// The id counter restarts after the highest id already using `prefix`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self.next_id = self.max_numeric_id() + 1;
        self
    }

    /// Load tasks from `path`. A missing file yields an empty store.
    ///
    /// The id counter continues after the highest numeric suffix found.
    pub async fn load(path: impl Into<PathBuf>) -> ChorusResult<Self> {
        let mut store = Self::new(path);
        store.reload().await?;
        Ok(store)
    }

    /// Replace in-memory state with the contents of the backing file.
    pub async fn reload(&mut self) -> ChorusResult<()> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(());
        }
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let tasks = persistence::decode(&self.path, &contents)?;

        self.tasks.clear();
        self.order.clear();
        for task in tasks {
            self.order.push(task.id.clone());
            self.tasks.insert(task.id.clone(), task);
        }
        self.next_id = self.max_numeric_id() + 1;
        info!(path = %self.path.display(), count = self.tasks.len(), "Task store loaded");
        self.emit_change();
        Ok(())
    }

    /// Write every task to the backing file atomically.
    pub async fn flush(&self) -> ChorusResult<()> {
        let contents = persistence::encode(&self.all())?;
        write_atomic(&self.path, contents.as_bytes()).await?;
        debug!(path = %self.path.display(), count = self.tasks.len(), "Task store flushed");
        Ok(())
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Subscribe to task events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    // --- creation and graph edits ---

    /// Create a task in `todo`.
    ///
    /// Every dependency must already exist. Fails with
    /// [`ChorusError::CircularDependency`] if the new edges would close a cycle,
    /// and with [`ChorusError::TaskExists`] if the generated id is taken.
    pub fn create(&mut self, input: NewTask) -> ChorusResult<Task> {
        let id = format!("{}-{}", self.prefix, self.next_id);
        if self.tasks.contains_key(&id) {
            return Err(ChorusError::TaskExists(id));
        }
        let mut deps: Vec<String> = Vec::new();
        for dep in input.dependencies {
            if !self.tasks.contains_key(&dep) {
                return Err(ChorusError::TaskNotFound(dep));
            }
            if dep == id || self.reaches(&dep, &id) {
                return Err(ChorusError::CircularDependency { from: id, to: dep });
            }
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }

        let now = Utc::now();
        let task = Task {
            id: id.clone(),
            title: input.title,
            description: input.description,
            status: TaskStatus::Todo,
            task_type: input.task_type,
            tags: input.tags,
            dependencies: deps,
            priority: input.priority.unwrap_or(DEFAULT_PRIORITY).min(4),
            assignee: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            review_count: 0,
            version: 0,
        };

        self.next_id += 1;
        self.order.push(id.clone());
        self.tasks.insert(id.clone(), task.clone());

        info!(task_id = %id, title = %task.title, deps = task.dependencies.len(), "Task created");
        self.emit(TaskEvent::Created(task.clone()));
        self.emit_change();
        Ok(task)
    }

    /// Make `from` depend on `to`.
    ///
    /// The cycle check runs before any edge is touched, so a rejected edge
    /// leaves the graph exactly as it was.
    pub fn add_dependency(&mut self, from: &str, to: &str) -> ChorusResult<()> {
        self.require(from)?;
        self.require(to)?;
        if from == to || self.reaches(to, from) {
            return Err(ChorusError::CircularDependency {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let task = self.require_mut(from)?;
        if task.dependencies.iter().any(|d| d == to) {
            return Ok(());
        }
        let previous = task.status;
        task.dependencies.push(to.to_string());
        task.touch();
        let task = task.clone();

        debug!(from = %from, to = %to, "Dependency added");
        self.emit(TaskEvent::Updated { task, previous });
        self.emit_change();
        Ok(())
    }

    /// Drop the edge `from -> to`. Returns whether it existed.
    pub fn remove_dependency(&mut self, from: &str, to: &str) -> ChorusResult<bool> {
        let task = self.require_mut(from)?;
        let before = task.dependencies.len();
        task.dependencies.retain(|d| d != to);
        if task.dependencies.len() == before {
            return Ok(false);
        }
        let previous = task.status;
        task.touch();
        let task = task.clone();
        self.emit(TaskEvent::Updated { task, previous });
        self.emit_change();
        Ok(true)
    }

    /// Change descriptive fields. Status is only changed through lifecycle methods.
    pub fn update(&mut self, id: &str, changes: TaskUpdate) -> ChorusResult<Task> {
        let task = self.require_mut(id)?;
        if let Some(title) = changes.title {
            task.title = title;
        }
        if let Some(description) = changes.description {
            task.description = Some(description);
        }
        if let Some(tags) = changes.tags {
            task.tags = tags;
        }
        if let Some(priority) = changes.priority {
            task.priority = priority.min(4);
        }
        if let Some(review_count) = changes.review_count {
            task.review_count = review_count;
        }
        let previous = task.status;
        task.touch();
        let task = task.clone();
        self.emit(TaskEvent::Updated {
            task: task.clone(),
            previous,
        });
        self.emit_change();
        Ok(task)
    }

    // --- lifecycle ---

    /// `todo -> doing`. The second of two racing claims gets `InvalidTransition`.
    pub fn claim(&mut self, id: &str, assignee: Option<&str>) -> ChorusResult<Task> {
        self.transition(id, "claim", &[TaskStatus::Todo], TaskStatus::Doing, |t| {
            t.assignee = assignee.map(String::from);
        })
    }

    /// `doing -> done`.
    pub fn complete(&mut self, id: &str) -> ChorusResult<Task> {
        self.transition(id, "complete", &[TaskStatus::Doing], TaskStatus::Done, |_| {})
    }

    /// `doing -> failed`, recording `reason`.
    pub fn fail(&mut self, id: &str, reason: Option<&str>) -> ChorusResult<Task> {
        self.transition(id, "fail", &[TaskStatus::Doing], TaskStatus::Failed, |t| {
            t.last_error = reason.map(String::from);
        })
    }

    /// `done | failed -> todo`.
    pub fn reopen(&mut self, id: &str) -> ChorusResult<Task> {
        self.transition(
            id,
            "reopen",
            &[TaskStatus::Done, TaskStatus::Failed],
            TaskStatus::Todo,
            |t| {
                t.assignee = None;
                t.last_error = None;
            },
        )
    }

    /// `doing -> todo`, used when an agent is stopped before finishing.
    pub fn release(&mut self, id: &str) -> ChorusResult<Task> {
        self.transition(id, "release", &[TaskStatus::Doing], TaskStatus::Todo, |t| {
            t.assignee = None;
        })
    }

    fn transition(
        &mut self,
        id: &str,
        action: &str,
        allowed: &[TaskStatus],
        to: TaskStatus,
        apply: impl FnOnce(&mut Task),
    ) -> ChorusResult<Task> {
        let task = self.require_mut(id)?;
        let previous = task.status;
        if !allowed.contains(&previous) {
            return Err(ChorusError::invalid_transition(id, previous, action));
        }
        task.status = to;
        apply(task);
        task.touch();
        let task = task.clone();

        info!(task_id = %id, from = %previous, to = %to, "Task {action}");
        self.emit(TaskEvent::Updated {
            task: task.clone(),
            previous,
        });
        if to.is_closed() {
            self.emit(TaskEvent::Closed(task.clone()));
        }
        self.emit_change();
        Ok(task)
    }

    // --- queries ---

    /// Get a task by id.
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// All tasks in insertion order.
    pub fn all(&self) -> Vec<&Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id)).collect()
    }

    /// Total number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the store holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// `todo` tasks whose every dependency is `done`, in insertion order.
    pub fn ready(&self) -> Vec<&Task> {
        self.all()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Todo && self.deps_done(t))
            .collect()
    }

    /// `todo` tasks with at least one dependency that is not `done`.
    pub fn stuck(&self) -> Vec<&Task> {
        self.all()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Todo && !self.deps_done(t))
            .collect()
    }

    /// Highest-priority ready task not in `exclude`, ties broken by insertion order.
    pub fn select_next(&self, exclude: &[String]) -> Option<&Task> {
        self.ready()
            .into_iter()
            .enumerate()
            .filter(|(_, t)| !exclude.contains(&t.id))
            .min_by_key(|(idx, t)| (t.priority, *idx))
            .map(|(_, t)| t)
    }

    /// Tasks carrying `tag`.
    pub fn by_tag(&self, tag: &str) -> Vec<&Task> {
        self.all().into_iter().filter(|t| t.has_tag(tag)).collect()
    }

    /// Tasks that list `id` as a direct dependency.
    pub fn dependents(&self, id: &str) -> Vec<&Task> {
        self.all()
            .into_iter()
            .filter(|t| t.dependencies.iter().any(|d| d == id))
            .collect()
    }

    /// `id` and everything that transitively depends on it, leaves first and `id` last.
    pub fn dependents_transitive(&self, id: &str) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        self.visit_dependents(id, &mut visited, &mut out);
        out
    }

    fn visit_dependents(&self, id: &str, visited: &mut HashSet<String>, out: &mut Vec<String>) {
        if !visited.insert(id.to_string()) {
            return;
        }
        let children: Vec<String> = self.dependents(id).iter().map(|t| t.id.clone()).collect();
        for child in children {
            self.visit_dependents(&child, visited, out);
        }
        out.push(id.to_string());
    }

    /// Number of tasks per status.
    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Todo => counts.todo += 1,
                TaskStatus::Doing => counts.doing += 1,
                TaskStatus::Done => counts.done += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Whether `target` is reachable from `from` by following dependency edges.
    pub fn reaches(&self, from: &str, target: &str) -> bool {
        let mut stack = vec![from.to_string()];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(task) = self.tasks.get(&id) {
                stack.extend(task.dependencies.iter().cloned());
            }
        }
        false
    }

    // --- helpers ---

    fn deps_done(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_some_and(|d| d.status == TaskStatus::Done)
        })
    }

    fn require(&self, id: &str) -> ChorusResult<&Task> {
        self.tasks
            .get(id)
            .ok_or_else(|| ChorusError::TaskNotFound(id.to_string()))
    }

    fn require_mut(&mut self, id: &str) -> ChorusResult<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| ChorusError::TaskNotFound(id.to_string()))
    }

    fn max_numeric_id(&self) -> u64 {
        let prefix = format!("{}-", self.prefix);
        self.tasks
            .keys()
            .filter_map(|id| id.strip_prefix(&prefix))
            .filter_map(|n| n.parse::<u64>().ok())
            .max()
            .unwrap_or(0)
    }

    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_change(&self) {
        if self.events.receiver_count() == 0 {
            return;
        }
        let snapshot = self.all().into_iter().cloned().collect();
        self.emit(TaskEvent::Change(snapshot));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn store() -> TaskStore {
        TaskStore::new("/tmp/unused-tasks.jsonl")
    }

    #[test]
    fn test_create_assigns_sequential_ids() {
        let mut store = store();
        let a = store.create(NewTask::new("A")).unwrap();
        let b = store.create(NewTask::new("B")).unwrap();
        assert_eq!(a.id, "ch-1");
        assert_eq!(b.id, "ch-2");
        assert_eq!(a.status, TaskStatus::Todo);
        assert_eq!(a.priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn test_create_refuses_taken_id() {
        let mut store = store();
        store.create(NewTask::new("A")).unwrap();
        store.next_id = 1;
        let err = store.create(NewTask::new("again")).unwrap_err();
        assert!(matches!(err, ChorusError::TaskExists(ref id) if id == "ch-1"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.all().len(), 1);
    }

    #[test]
    fn test_create_with_unknown_dependency() {
        let mut store = store();
        let err = store
            .create(NewTask::new("child").with_dependencies(vec!["ch-99".into()]))
            .unwrap_err();
        assert!(matches!(err, ChorusError::TaskNotFound(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_parent_child_ready_and_stuck() {
        let mut store = store();
        let parent = store.create(NewTask::new("parent")).unwrap();
        let child = store
            .create(NewTask::new("child").with_dependencies(vec![parent.id.clone()]))
            .unwrap();

        assert!(store.stuck().iter().any(|t| t.id == child.id));
        assert!(store.ready().iter().all(|t| t.id != child.id));

        store.claim(&parent.id, Some("agent-1")).unwrap();
        store.complete(&parent.id).unwrap();

        assert!(store.ready().iter().any(|t| t.id == child.id));
        assert!(store.stuck().is_empty());
    }

    #[test]
    fn test_add_dependency_rejects_cycle_without_mutation() {
        let mut store = store();
        let a = store.create(NewTask::new("A")).unwrap();
        let b = store
            .create(NewTask::new("B").with_dependencies(vec![a.id.clone()]))
            .unwrap();
        let c = store
            .create(NewTask::new("C").with_dependencies(vec![b.id.clone()]))
            .unwrap();

        let before: Vec<Task> = store.all().into_iter().cloned().collect();
        let err = store.add_dependency(&a.id, &c.id).unwrap_err();
        assert!(matches!(err, ChorusError::CircularDependency { .. }));
        let after: Vec<Task> = store.all().into_iter().cloned().collect();
        assert_eq!(before, after);

        assert!(store.add_dependency(&a.id, &a.id).is_err());
    }

    #[test]
    fn test_add_dependency_is_idempotent() {
        let mut store = store();
        let a = store.create(NewTask::new("A")).unwrap();
        let b = store.create(NewTask::new("B")).unwrap();
        store.add_dependency(&b.id, &a.id).unwrap();
        store.add_dependency(&b.id, &a.id).unwrap();
        assert_eq!(store.get(&b.id).unwrap().dependencies, vec![a.id.clone()]);
        assert!(store.remove_dependency(&b.id, &a.id).unwrap());
        assert!(!store.remove_dependency(&b.id, &a.id).unwrap());
    }

    #[test]
    fn test_claim_twice_fails() {
        let mut store = store();
        let t = store.create(NewTask::new("T")).unwrap();
        store.claim(&t.id, Some("agent-1")).unwrap();
        let err = store.claim(&t.id, Some("agent-2")).unwrap_err();
        assert!(matches!(err, ChorusError::InvalidTransition { .. }));
        assert_eq!(store.get(&t.id).unwrap().assignee.as_deref(), Some("agent-1"));
    }

    #[test]
    fn test_lifecycle_guards() {
        let mut store = store();
        let t = store.create(NewTask::new("T")).unwrap();
        assert!(store.complete(&t.id).is_err());
        assert!(store.fail(&t.id, None).is_err());
        assert!(store.reopen(&t.id).is_err());
        assert!(store.release(&t.id).is_err());

        store.claim(&t.id, None).unwrap();
        let failed = store.fail(&t.id, Some("tests red")).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("tests red"));

        let reopened = store.reopen(&t.id).unwrap();
        assert_eq!(reopened.status, TaskStatus::Todo);
        assert!(reopened.last_error.is_none());
        assert!(reopened.version > t.version);
    }

    #[test]
    fn test_release_returns_to_todo() {
        let mut store = store();
        let t = store.create(NewTask::new("T")).unwrap();
        store.claim(&t.id, Some("agent-1")).unwrap();
        let released = store.release(&t.id).unwrap();
        assert_eq!(released.status, TaskStatus::Todo);
        assert!(released.assignee.is_none());
    }

    #[test]
    fn test_select_next_priority_then_fifo() {
        let mut store = store();
        let low = store.create(NewTask::new("low").with_priority(3)).unwrap();
        let first_high = store.create(NewTask::new("high1").with_priority(0)).unwrap();
        let second_high = store.create(NewTask::new("high2").with_priority(0)).unwrap();

        assert_eq!(store.select_next(&[]).unwrap().id, first_high.id);
        assert_eq!(
            store.select_next(&[first_high.id.clone()]).unwrap().id,
            second_high.id
        );
        assert_eq!(
            store
                .select_next(&[first_high.id.clone(), second_high.id.clone()])
                .unwrap()
                .id,
            low.id
        );
        assert!(store
            .select_next(&[first_high.id, second_high.id, low.id])
            .is_none());
    }

    #[test]
    fn test_dependents_transitive() {
        let mut store = store();
        let root = store.create(NewTask::new("root")).unwrap();
        let mid = store
            .create(NewTask::new("mid").with_dependencies(vec![root.id.clone()]))
            .unwrap();
        let leaf = store
            .create(NewTask::new("leaf").with_dependencies(vec![mid.id.clone()]))
            .unwrap();
        let order = store.dependents_transitive(&root.id);
        assert_eq!(order, vec![leaf.id, mid.id, root.id]);
    }

    #[test]
    fn test_counts() {
        let mut store = store();
        let a = store.create(NewTask::new("A")).unwrap();
        store.create(NewTask::new("B")).unwrap();
        store.claim(&a.id, None).unwrap();
        let counts = store.counts();
        assert_eq!(counts.todo, 1);
        assert_eq!(counts.doing, 1);
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let mut store = store();
        let mut rx = store.subscribe();
        let t = store.create(NewTask::new("T")).unwrap();
        store.claim(&t.id, None).unwrap();
        store.complete(&t.id).unwrap();

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert_eq!(
            names,
            vec!["created", "change", "updated", "change", "updated", "closed", "change"]
        );
    }
}
