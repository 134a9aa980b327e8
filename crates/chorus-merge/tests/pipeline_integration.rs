#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chorus_checkpoint::{CheckpointConfig, Checkpointer};
use chorus_core::ChorusResult;
use chorus_git::{GitCall, GitOutput, MockGitRunner, Repo};
use chorus_merge::{
    ConflictInfo, ConflictInspector, EscalationAction, HumanEscalation, MergeConfig,
    MergeOutcome, MergePipeline, MergeRequest, MergeWorker, Strategy,
};
use parking_lot::Mutex as SyncMutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Scripted git: `script` answers first, then fetch fails (no remote) and
/// everything else succeeds.
fn git(script: impl Fn(&GitCall) -> Option<GitOutput> + Send + Sync + 'static) -> Arc<MockGitRunner> {
    Arc::new(MockGitRunner::new(move |call| {
        if let Some(out) = script(call) {
            return out;
        }
        if call.starts_with(&["fetch"]) {
            return GitOutput::failure(128, "fatal: 'origin' does not appear to be a git repository");
        }
        GitOutput::ok("")
    }))
}

fn pipeline(git: &Arc<MockGitRunner>, dir: &Path, config: MergeConfig) -> MergePipeline {
    let repo = Repo::new(git.clone(), "/repo");
    let escalation = HumanEscalation::new(dir.join("escalation.json"), config.max_retries);
    MergePipeline::new(repo, config, escalation).unwrap()
}

fn agent_item(task: &str) -> MergeRequest {
    MergeRequest {
        task_id: task.into(),
        branch: format!("agent/{task}"),
        worktree: Some(PathBuf::from(format!("/wt/{task}"))),
        priority: 2,
        dependencies: vec![],
    }
}

fn is_merge(call: &GitCall) -> bool {
    call.starts_with(&["merge", "--no-ff"])
}

#[tokio::test]
async fn test_clean_merge_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let git = git(|_| None);
    let mut pipeline = pipeline(&git, dir.path(), MergeConfig::default());
    pipeline.enqueue(agent_item("ch-1")).unwrap();

    let outcome = pipeline.process_next().await.unwrap().unwrap();
    assert_eq!(
        outcome,
        MergeOutcome::Merged {
            task_id: "ch-1".into(),
            branch: "agent/ch-1".into(),
            strategy: None,
        }
    );
    assert!(git.ran("merge --no-ff -m Merge agent/ch-1 [ch-1] agent/ch-1"));
    assert!(git.ran("worktree remove --force /wt/ch-1"));
    assert!(git.ran("branch -D agent/ch-1"));
    assert_eq!(pipeline.counters().merges_auto, 1);
    assert!(pipeline.queue().is_empty());
    assert!(pipeline.process_next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_lockfile_conflict_auto_resolved() {
    let dir = tempfile::tempdir().unwrap();
    let git = git(|call| {
        if is_merge(call) {
            Some(GitOutput::failure(1, "CONFLICT (content): Merge conflict in package-lock.json"))
        } else if call.starts_with(&["diff", "--name-only"]) {
            Some(GitOutput::ok("package-lock.json\n"))
        } else {
            None
        }
    });
    let mut pipeline = pipeline(&git, dir.path(), MergeConfig::default());
    pipeline.enqueue(agent_item("ch-2")).unwrap();

    let outcome = pipeline.process_next().await.unwrap().unwrap();
    assert!(matches!(
        outcome,
        MergeOutcome::Merged {
            strategy: Some(Strategy::Auto),
            ..
        }
    ));
    assert!(git.ran("checkout --theirs -- package-lock.json"));
    assert!(git.ran("add -- package-lock.json"));
    assert!(git.ran("commit --no-edit"));
}

#[tokio::test]
async fn test_medium_conflict_rebases_in_worktree_then_merges() {
    let dir = tempfile::tempdir().unwrap();
    let merges = AtomicU32::new(0);
    let git = git(move |call| {
        if is_merge(call) {
            if merges.fetch_add(1, Ordering::SeqCst) == 0 {
                Some(GitOutput::failure(1, "CONFLICT"))
            } else {
                Some(GitOutput::ok(""))
            }
        } else if call.starts_with(&["diff", "--name-only"]) {
            Some(GitOutput::ok("src/lib.rs\n"))
        } else {
            None
        }
    });
    let mut pipeline = pipeline(&git, dir.path(), MergeConfig::default());
    pipeline.enqueue(agent_item("ch-3")).unwrap();

    let outcome = pipeline.process_next().await.unwrap().unwrap();
    assert!(matches!(
        outcome,
        MergeOutcome::Merged {
            strategy: Some(Strategy::Rebase),
            ..
        }
    ));
    let rebase = git
        .calls()
        .into_iter()
        .find(|c| c.starts_with(&["rebase", "main"]))
        .unwrap();
    assert_eq!(rebase.cwd, PathBuf::from("/wt/ch-3"));
    assert!(git.ran("merge --abort"));
}

#[tokio::test]
async fn test_repeated_failures_escalate_then_skip() {
    let dir = tempfile::tempdir().unwrap();
    let git = git(|call| {
        if is_merge(call) || call.starts_with(&["rebase", "main"]) {
            Some(GitOutput::failure(1, "CONFLICT"))
        } else if call.starts_with(&["diff", "--name-only"]) {
            Some(GitOutput::ok("src/lib.rs\n"))
        } else {
            None
        }
    });
    git.set_rebase_in_progress(true);
    let mut pipeline = pipeline(&git, dir.path(), MergeConfig::default());
    pipeline.enqueue(agent_item("ch-4")).unwrap();

    let outcomes = pipeline.drain().await.unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(matches!(outcomes[0], MergeOutcome::Deferred { retry_count: 1, .. }));
    assert!(matches!(outcomes[1], MergeOutcome::Deferred { retry_count: 2, .. }));
    let MergeOutcome::Escalated(request) = &outcomes[2] else {
        panic!("expected escalation, got {:?}", outcomes[2]);
    };
    assert_eq!(request.retry_count, 3);
    assert_eq!(request.last_attempt, Strategy::Rebase);
    assert_eq!(request.conflict_files, vec!["src/lib.rs"]);
    assert!(dir.path().join("escalation.json").exists());
    assert_eq!(pipeline.status().queue.escalated, 1);

    let resolved = pipeline
        .resolve_escalation(EscalationAction::Skipped)
        .await
        .unwrap();
    assert!(!resolved.needs_pause());
    assert!(pipeline.queue().is_empty());
    assert_eq!(pipeline.status().queue.failed, 1);
    assert!(!git.ran("branch -D agent/ch-4"));
    assert!(!dir.path().join("escalation.json").exists());
}

#[tokio::test]
async fn test_manual_merge_counts_separately() {
    let dir = tempfile::tempdir().unwrap();
    let git = git(|call| {
        if is_merge(call) {
            Some(GitOutput::failure(1, "CONFLICT"))
        } else if call.starts_with(&["diff", "--name-only"]) {
            Some(GitOutput::ok("src/a.rs\n"))
        } else if call.starts_with(&["rebase", "main"]) {
            Some(GitOutput::failure(1, "CONFLICT"))
        } else {
            None
        }
    });
    git.set_rebase_in_progress(true);
    let config = MergeConfig {
        max_retries: 1,
        ..MergeConfig::default()
    };
    let mut pipeline = pipeline(&git, dir.path(), config);
    pipeline.enqueue(agent_item("ch-5")).unwrap();

    let outcome = pipeline.process_next().await.unwrap().unwrap();
    assert!(matches!(outcome, MergeOutcome::Escalated(_)));

    let outcome = pipeline
        .resolve_escalation(EscalationAction::Merged)
        .await
        .unwrap();
    assert_eq!(outcome.task_id(), "ch-5");
    assert_eq!(pipeline.counters().merges_manual, 1);
    assert_eq!(pipeline.counters().merges_auto, 0);
    assert!(git.ran("branch -D agent/ch-5"));
}

struct SemanticInspector;

#[async_trait]
impl ConflictInspector for SemanticInspector {
    async fn inspect(&self, _cwd: &Path, files: &[String]) -> ChorusResult<Vec<ConflictInfo>> {
        Ok(files
            .iter()
            .map(|f| ConflictInfo {
                file: f.clone(),
                semantic_conflict: true,
                ..ConflictInfo::default()
            })
            .collect())
    }
}

#[tokio::test]
async fn test_complex_without_resolver_goes_to_human() {
    let dir = tempfile::tempdir().unwrap();
    let git = git(|call| {
        if is_merge(call) {
            Some(GitOutput::failure(1, "CONFLICT"))
        } else if call.starts_with(&["diff", "--name-only"]) {
            Some(GitOutput::ok("src/schema.rs\n"))
        } else {
            None
        }
    });
    let mut pipeline =
        pipeline(&git, dir.path(), MergeConfig::default()).with_inspector(Arc::new(SemanticInspector));
    pipeline.enqueue(agent_item("ch-6")).unwrap();

    let first = pipeline.process_next().await.unwrap().unwrap();
    assert!(matches!(first, MergeOutcome::Deferred { retry_count: 1, .. }));
    assert!(pipeline.queue().get("ch-6").unwrap().agent_failed);

    let second = pipeline.process_next().await.unwrap().unwrap();
    let MergeOutcome::Escalated(request) = second else {
        panic!("expected escalation");
    };
    assert_eq!(request.last_attempt, Strategy::Human);
    assert_eq!(request.retry_count, 2);
}

#[tokio::test]
async fn test_force_push_budget_requests_pause() {
    let dir = tempfile::tempdir().unwrap();
    let fetches = AtomicU32::new(0);
    let git = git(move |call| {
        if call.starts_with(&["fetch"]) {
            fetches.fetch_add(1, Ordering::SeqCst);
            Some(GitOutput::ok(""))
        } else if call.starts_with(&["rev-parse"]) {
            Some(GitOutput::ok(format!("sha{}\n", fetches.load(Ordering::SeqCst))))
        } else if call.starts_with(&["merge-base", "--is-ancestor"]) {
            Some(GitOutput::failure(1, ""))
        } else {
            None
        }
    });
    let config = MergeConfig {
        max_force_push_recoveries: 0,
        ..MergeConfig::default()
    };
    let mut pipeline = pipeline(&git, dir.path(), config);
    pipeline.enqueue(agent_item("ch-7")).unwrap();

    let outcomes = pipeline.drain().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].needs_pause());
    // Not counted as a failed attempt, and nothing was merged.
    let item = pipeline.queue().get("ch-7").unwrap();
    assert_eq!(item.retry_count, 0);
    assert!(!git.commands().iter().any(|c| c.starts_with("merge --no-ff")));
}

#[tokio::test]
async fn test_failed_force_push_rebase_defers_without_merging() {
    let dir = tempfile::tempdir().unwrap();
    let fetches = AtomicU32::new(0);
    let git = git(move |call| {
        if call.starts_with(&["fetch"]) {
            fetches.fetch_add(1, Ordering::SeqCst);
            Some(GitOutput::ok(""))
        } else if call.starts_with(&["rev-parse"]) {
            Some(GitOutput::ok(format!("sha{}\n", fetches.load(Ordering::SeqCst))))
        } else if call.starts_with(&["merge-base", "--is-ancestor"]) {
            Some(GitOutput::failure(1, ""))
        } else if call.starts_with(&["rebase", "origin/main"]) {
            Some(GitOutput::failure(1, "CONFLICT (content): Merge conflict in src/lib.rs"))
        } else {
            None
        }
    });
    git.set_rebase_in_progress(true);
    let mut pipeline = pipeline(&git, dir.path(), MergeConfig::default());
    pipeline.enqueue(agent_item("ch-8")).unwrap();

    let outcome = pipeline.process_next().await.unwrap().unwrap();
    let MergeOutcome::Deferred {
        task_id,
        retry_count,
        reason,
    } = outcome
    else {
        panic!("expected a deferred item, got {outcome:?}");
    };
    assert_eq!(task_id, "ch-8");
    assert_eq!(retry_count, 1);
    assert!(reason.contains("conflicts"));

    let rebase = git
        .calls()
        .into_iter()
        .find(|c| c.starts_with(&["rebase", "origin/main"]))
        .unwrap();
    assert_eq!(rebase.cwd, PathBuf::from("/wt/ch-8"));
    assert!(git.ran("rebase --abort"));
    assert!(!git.commands().iter().any(|c| c.starts_with("merge --no-ff")));
    assert!(!git.commands().iter().any(|c| c.starts_with("tag -a")));
    assert_eq!(pipeline.queue().get("ch-8").unwrap().retry_count, 1);
}

#[tokio::test]
async fn test_pre_merge_checkpoints_are_pruned_and_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let tags = Arc::new(SyncMutex::new(Vec::<String>::new()));
    let seen = tags.clone();
    let git = git(move |call| {
        if call.starts_with(&["tag", "-a"]) {
            let name = call.args[2].clone();
            let mut tags = seen.lock();
            if tags.contains(&name) {
                return Some(GitOutput::failure(128, format!("fatal: tag '{name}' already exists")));
            }
            tags.push(name);
            Some(GitOutput::ok(""))
        } else if call.starts_with(&["tag", "-d"]) {
            seen.lock().retain(|t| *t != call.args[2]);
            Some(GitOutput::ok(""))
        } else {
            None
        }
    });
    let config = CheckpointConfig {
        keep: 2,
        ..CheckpointConfig::default()
    };
    let checkpointer = Checkpointer::new(Repo::new(git.clone(), "/repo"), config, "ch").unwrap();
    let checkpointer = Arc::new(Mutex::new(checkpointer));
    let mut pipeline =
        pipeline(&git, dir.path(), MergeConfig::default()).with_checkpointer(checkpointer.clone());
    for task in ["ch-1", "ch-2", "ch-3"] {
        pipeline.enqueue(agent_item(task)).unwrap();
    }

    let outcomes = pipeline.drain().await.unwrap();
    assert_eq!(outcomes.len(), 3);
    assert_eq!(*tags.lock(), vec!["pre-merge-ch-2", "pre-merge-ch-3"]);
    assert_eq!(checkpointer.lock().await.list().len(), 2);

    // ch-2 was rolled back and merges again; its tag moves to the new merge point.
    pipeline.enqueue(agent_item("ch-2")).unwrap();
    pipeline.process_next().await.unwrap().unwrap();
    assert!(git.ran("tag -d pre-merge-ch-2"));
    assert_eq!(*tags.lock(), vec!["pre-merge-ch-3", "pre-merge-ch-2"]);
    let checkpointer = checkpointer.lock().await;
    assert_eq!(checkpointer.list().len(), 2);
    assert_eq!(checkpointer.latest(None).unwrap().tag, "pre-merge-ch-2");
}

#[tokio::test]
async fn test_worker_merges_and_reports() {
    let dir = tempfile::tempdir().unwrap();
    let git = git(|call| {
        if call.starts_with(&["rev-parse"]) {
            let missing = call.args.last().map(String::as_str) == Some("ghost");
            Some(if missing {
                GitOutput::failure(1, "")
            } else {
                GitOutput::ok("abc123\n")
            })
        } else if call.starts_with(&["rev-list"]) {
            Some(GitOutput::ok("2\n"))
        } else {
            None
        }
    });
    let pipeline = pipeline(&git, dir.path(), MergeConfig::default());
    let (tx, mut rx) = mpsc::channel(16);
    let (handle, task) = MergeWorker::spawn(pipeline, tx);

    handle.enqueue(agent_item("ch-8")).await.unwrap();
    let outcome = rx.recv().await.unwrap();
    assert!(matches!(outcome, MergeOutcome::Merged { .. }));

    let err = handle.admit("ghost", None).await.unwrap_err();
    assert!(err.to_string().contains("branch not found"));

    let admission = handle.admit("feature/login", Some(1)).await.unwrap();
    assert_eq!(admission.task_id, "user-feature-login");
    let outcome = rx.recv().await.unwrap();
    assert_eq!(outcome.task_id(), "user-feature-login");

    // Published before the outcome, so already current.
    assert_eq!(handle.latest_status().counters.merges_auto, 2);
    let status = handle.status().await.unwrap();
    assert_eq!(status.counters.merges_auto, 2);

    handle.shutdown().await.unwrap();
    let pipeline = task.await.unwrap();
    assert!(pipeline.queue().is_empty());
}
