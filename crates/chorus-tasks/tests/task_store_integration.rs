#![allow(clippy::unwrap_used, clippy::expect_used)]

use chorus_core::ChorusError;
use chorus_tasks::{NewTask, TaskStatus, TaskStore};

#[tokio::test]
async fn test_flush_and_load_preserves_graph() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".chorus").join("tasks.jsonl");

    let mut store = TaskStore::new(&path);
    let a = store.create(NewTask::new("schema")).unwrap();
    let b = store
        .create(
            NewTask::new("api")
                .with_dependencies(vec![a.id.clone()])
                .with_priority(1)
                .with_tags(vec!["backend".into()]),
        )
        .unwrap();
    store.claim(&a.id, Some("agent-ch-1")).unwrap();
    store.flush().await.unwrap();

    let mut loaded = TaskStore::load(&path).await.unwrap();
    assert_eq!(loaded.len(), 2);
    let api = loaded.get(&b.id).unwrap();
    assert_eq!(api.dependencies, vec![a.id.clone()]);
    assert_eq!(api.priority, 1);
    assert!(api.has_tag("backend"));
    assert_eq!(loaded.get(&a.id).unwrap().status, TaskStatus::Doing);

    // The id counter continues after the loaded tasks.
    let c = loaded.create(NewTask::new("docs")).unwrap();
    assert_eq!(c.id, "ch-3");
}

#[tokio::test]
async fn test_custom_prefix_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.jsonl");

    let mut store = TaskStore::new(&path).with_prefix("web");
    let first = store.create(NewTask::new("landing page")).unwrap();
    store.flush().await.unwrap();

    let mut reloaded = TaskStore::load(&path).await.unwrap().with_prefix("web");
    let second = reloaded.create(NewTask::new("pricing page")).unwrap();
    assert_eq!(first.id, "web-1");
    assert_eq!(second.id, "web-2");
    assert_eq!(reloaded.len(), 2);
    reloaded.flush().await.unwrap();

    let again = TaskStore::load(&path).await.unwrap();
    assert_eq!(again.len(), 2);
}

#[tokio::test]
async fn test_load_missing_file_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::load(dir.path().join("tasks.jsonl")).await.unwrap();
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_load_corrupt_file_reports_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.jsonl");
    tokio::fs::write(&path, "not json\n").await.unwrap();

    let err = TaskStore::load(&path).await.err().unwrap();
    assert!(matches!(err, ChorusError::CorruptState { .. }));
    assert!(err.to_string().contains("line 1"));
}

#[test]
fn test_todo_tasks_partition_into_ready_and_stuck() {
    let mut store = TaskStore::new("unused.jsonl");
    let a = store.create(NewTask::new("a")).unwrap();
    let b = store
        .create(NewTask::new("b").with_dependencies(vec![a.id.clone()]))
        .unwrap();
    store
        .create(NewTask::new("c").with_dependencies(vec![a.id.clone(), b.id.clone()]))
        .unwrap();
    store.create(NewTask::new("d")).unwrap();

    let check = |store: &TaskStore| {
        let todo: Vec<String> = store
            .all()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Todo)
            .map(|t| t.id.clone())
            .collect();
        let ready: Vec<String> = store.ready().into_iter().map(|t| t.id.clone()).collect();
        let stuck: Vec<String> = store.stuck().into_iter().map(|t| t.id.clone()).collect();
        assert_eq!(ready.len() + stuck.len(), todo.len());
        for id in &todo {
            assert!(ready.contains(id) ^ stuck.contains(id), "{id} in exactly one set");
        }
    };

    check(&store);
    store.claim(&a.id, None).unwrap();
    check(&store);
    store.complete(&a.id).unwrap();
    check(&store);
    assert!(store.ready().iter().any(|t| t.id == b.id));
}
