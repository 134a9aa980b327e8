#![allow(clippy::unwrap_used, clippy::expect_used)]
//! `Repo` over the real `git` binary in a scratch repository.

use chorus_git::{CliGitRunner, Repo};
use std::path::Path;
use std::sync::Arc;

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

async fn init(root: &Path) -> Repo {
    let repo = Repo::new(Arc::new(CliGitRunner::new()), root);
    for args in [
        vec!["init", "--quiet"],
        vec!["symbolic-ref", "HEAD", "refs/heads/main"],
        vec!["config", "user.name", "Chorus Test"],
        vec!["config", "user.email", "chorus@example.com"],
        vec!["config", "commit.gpgsign", "false"],
        vec!["config", "tag.gpgsign", "false"],
    ] {
        repo.run_checked(root, &args).await.unwrap();
    }
    commit(&repo, root, "README.md", "hello\n", "initial").await;
    repo
}

async fn commit(repo: &Repo, cwd: &Path, file: &str, contents: &str, message: &str) {
    std::fs::write(cwd.join(file), contents).unwrap();
    repo.run_checked(cwd, &["add", "."]).await.unwrap();
    repo.run_checked(cwd, &["commit", "-q", "-m", message])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_branch_history_and_merge() {
    if !git_available() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let repo = init(root).await;

    assert!(repo.rev_parse("main").await.unwrap().is_some());
    assert_eq!(repo.rev_parse("agent/ch-1").await.unwrap(), None);

    repo.run_checked(root, &["checkout", "-q", "-b", "agent/ch-1"])
        .await
        .unwrap();
    commit(&repo, root, "a.txt", "a\n", "Add a [ch-1]").await;
    commit(&repo, root, "b.txt", "b\n", "Add b [ch-1]").await;
    commit(&repo, root, "c.txt", "c\n", "Add c [ch-10]").await;
    assert_eq!(repo.commits_ahead("main", "agent/ch-1").await.unwrap(), 3);

    repo.checkout("main").await.unwrap();
    let out = repo.merge("agent/ch-1", "Merge agent/ch-1 [ch-1]").await.unwrap();
    assert!(out.success(), "{}", out.message());
    assert!(repo.is_ancestor("agent/ch-1", "main").await.unwrap());

    let matching = repo.commits_matching(root, "[ch-1]").await.unwrap();
    assert_eq!(matching.len(), 2, "merge commit and [ch-10] are excluded");
    let log = repo.log_oneline("HEAD~1..HEAD").await.unwrap();
    assert!(log.contains("Merge agent/ch-1"));
}

#[tokio::test]
async fn test_tags_and_hard_reset() {
    if !git_available() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let repo = init(root).await;

    let tagged = repo.head(root).await.unwrap();
    assert!(repo
        .tag("chorus-checkpoint-1700000000", "chorus checkpoint: manual")
        .await
        .unwrap()
        .success());
    let again = repo.tag("chorus-checkpoint-1700000000", "chorus checkpoint: manual").await.unwrap();
    assert!(!again.success());
    assert!(again.message().contains("already exists"));

    let tags = repo.list_tags(&["chorus-checkpoint-*"]).await.unwrap();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].name, "chorus-checkpoint-1700000000");

    commit(&repo, root, "later.txt", "later\n", "Later work [ch-2]").await;
    repo.reset_hard("chorus-checkpoint-1700000000").await.unwrap();
    assert_eq!(repo.head(root).await.unwrap(), tagged);
    assert!(!root.join("later.txt").exists());

    repo.delete_tag("chorus-checkpoint-1700000000").await.unwrap();
    assert!(repo.list_tags(&["chorus-checkpoint-*"]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_worktree_lifecycle() {
    if !git_available() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let repo = init(root).await;
    let worktree = root.join(".worktrees/agent-ch-1");

    repo.worktree_add(&worktree, "agent/ch-1", "main").await.unwrap();
    assert!(worktree.join("README.md").exists());
    assert!(!repo.stash(&worktree).await.unwrap());

    std::fs::write(worktree.join("draft.txt"), "wip\n").unwrap();
    assert!(repo.stash(&worktree).await.unwrap());
    assert!(!worktree.join("draft.txt").exists());

    commit(&repo, &worktree, "done.txt", "done\n", "Finish [ch-1]").await;
    let start = repo.head(&worktree).await.unwrap();
    commit(&repo, &worktree, "more.txt", "more\n", "More [ch-1]").await;
    repo.reset_soft(&worktree, &start).await.unwrap();
    assert_eq!(repo.head(&worktree).await.unwrap(), start);
    assert!(worktree.join("more.txt").exists(), "soft reset keeps the files");

    repo.worktree_remove(&worktree).await.unwrap();
    assert!(!worktree.exists());
    repo.delete_branch("agent/ch-1").await.unwrap();
    assert_eq!(repo.rev_parse("agent/ch-1").await.unwrap(), None);
}
