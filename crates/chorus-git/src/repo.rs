use crate::runner::{GitOutput, GitRunner};
use chorus_core::{ChorusError, ChorusResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// A checkpoint-style tag as listed by `git tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagInfo {
    /// Short tag name.
    pub name: String,
    /// Creation time, unix seconds.
    pub created_unix: i64,
    /// First line of the tag message (empty for lightweight tags).
    pub subject: String,
}

/// Typed git operations against one repository and its worktrees.
///
/// Methods that act on an agent worktree take the worktree path explicitly;
/// everything else runs in the main checkout at [`Repo::root`].
#[derive(Clone)]
pub struct Repo {
    runner: Arc<dyn GitRunner>,
    root: PathBuf,
}

impl Repo {
    /// Wrap `runner` for the repository checked out at `root`.
    pub fn new(runner: Arc<dyn GitRunner>, root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            root: root.into(),
        }
    }

    /// Main checkout directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The underlying runner.
    pub fn runner(&self) -> &Arc<dyn GitRunner> {
        &self.runner
    }

    /// Run raw git in the main checkout.
    pub async fn run(&self, args: &[&str]) -> ChorusResult<GitOutput> {
        self.runner.run(&self.root, args).await
    }

    /// Run raw git in `cwd`.
    pub async fn run_in(&self, cwd: &Path, args: &[&str]) -> ChorusResult<GitOutput> {
        self.runner.run(cwd, args).await
    }

    /// Run git in `cwd` and turn a non-zero exit into [`ChorusError::Git`].
    pub async fn run_checked(&self, cwd: &Path, args: &[&str]) -> ChorusResult<String> {
        let out = self.runner.run(cwd, args).await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(ChorusError::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                out.message()
            )))
        }
    }

    // --- refs ---

    /// Resolve `rev` to a commit sha, `None` if it does not exist.
    pub async fn rev_parse(&self, rev: &str) -> ChorusResult<Option<String>> {
        let out = self.run(&["rev-parse", "--verify", "--quiet", rev]).await?;
        if out.success() && !out.trimmed().is_empty() {
            Ok(Some(out.trimmed().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Current `HEAD` sha in `cwd`.
    pub async fn head(&self, cwd: &Path) -> ChorusResult<String> {
        let out = self.run_checked(cwd, &["rev-parse", "HEAD"]).await?;
        Ok(out.trim().to_string())
    }

    /// Number of commits on `branch` that are not on `base`.
    pub async fn commits_ahead(&self, base: &str, branch: &str) -> ChorusResult<u32> {
        let range = format!("{base}..{branch}");
        let out = self
            .run_checked(&self.root, &["rev-list", "--count", &range])
            .await?;
        out.trim()
            .parse::<u32>()
            .map_err(|e| ChorusError::Git(format!("unexpected rev-list output '{}': {e}", out.trim())))
    }

    /// Whether `ancestor` is reachable from `descendant`.
    pub async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> ChorusResult<bool> {
        let out = self
            .run(&["merge-base", "--is-ancestor", ancestor, descendant])
            .await?;
        match out.code {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(ChorusError::Git(format!(
                "git merge-base --is-ancestor failed: {}",
                out.message()
            ))),
        }
    }

    /// Fetch `branch` from `remote`.
    pub async fn fetch(&self, remote: &str, branch: &str) -> ChorusResult<()> {
        self.run_checked(&self.root, &["fetch", remote, branch])
            .await
            .map(|_| ())
    }

    /// Check out `branch` in the main checkout.
    pub async fn checkout(&self, branch: &str) -> ChorusResult<()> {
        self.run_checked(&self.root, &["checkout", branch])
            .await
            .map(|_| ())
    }

    // --- merge ---

    /// `git merge --no-ff` of `branch` into the current branch of the main checkout.
    pub async fn merge(&self, branch: &str, message: &str) -> ChorusResult<GitOutput> {
        self.run(&["merge", "--no-ff", "-m", message, branch]).await
    }

    /// Abort an in-progress merge. Errors are logged, not returned.
    pub async fn abort_merge(&self) -> ChorusResult<()> {
        let out = self.run(&["merge", "--abort"]).await?;
        if !out.success() {
            warn!(error = %out.message(), "git merge --abort failed");
        }
        Ok(())
    }

    /// Paths with unresolved conflicts in `cwd`.
    pub async fn conflicted_files(&self, cwd: &Path) -> ChorusResult<Vec<String>> {
        let out = self
            .run_checked(cwd, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Take the incoming side of a conflicted file and stage it.
    pub async fn resolve_theirs(&self, file: &str) -> ChorusResult<()> {
        self.run_checked(&self.root, &["checkout", "--theirs", "--", file])
            .await?;
        self.run_checked(&self.root, &["add", "--", file]).await?;
        Ok(())
    }

    /// Conclude a merge whose conflicts are all staged.
    pub async fn commit_merge(&self) -> ChorusResult<()> {
        self.run_checked(&self.root, &["commit", "--no-edit"])
            .await
            .map(|_| ())
    }

    // --- rebase ---

    /// `git rebase <onto>` in `cwd`. The raw output is returned for the caller to interpret.
    pub async fn rebase(&self, cwd: &Path, onto: &str) -> ChorusResult<GitOutput> {
        self.run_in(cwd, &["rebase", onto]).await
    }

    /// `git rebase --abort` in `cwd`.
    pub async fn abort_rebase(&self, cwd: &Path) -> ChorusResult<GitOutput> {
        self.run_in(cwd, &["rebase", "--abort"]).await
    }

    /// Whether a rebase is stopped in `cwd`.
    pub async fn rebase_in_progress(&self, cwd: &Path) -> ChorusResult<bool> {
        self.runner.rebase_in_progress(cwd).await
    }

    // --- tags ---

    /// Create an annotated tag at `HEAD`. Returns the raw output so callers can
    /// tell an existing tag apart from other failures.
    pub async fn tag(&self, name: &str, message: &str) -> ChorusResult<GitOutput> {
        self.run(&["tag", "-a", name, "-m", message]).await
    }

    /// Delete a tag.
    pub async fn delete_tag(&self, name: &str) -> ChorusResult<()> {
        self.run_checked(&self.root, &["tag", "-d", name])
            .await
            .map(|_| ())
    }

    /// Tags matching any of `patterns`, with creation time and subject.
    pub async fn list_tags(&self, patterns: &[&str]) -> ChorusResult<Vec<TagInfo>> {
        let mut args = vec![
            "tag",
            "--list",
            "--format=%(refname:short)|%(creatordate:unix)|%(contents:subject)",
        ];
        args.extend_from_slice(patterns);
        let out = self.run_checked(&self.root, &args).await?;
        Ok(out.lines().filter_map(parse_tag_line).collect())
    }

    // --- history ---

    /// `git log <range> --oneline` in the main checkout.
    pub async fn log_oneline(&self, range: &str) -> ChorusResult<String> {
        self.run_checked(&self.root, &["log", range, "--oneline"])
            .await
    }

    /// Shas (newest first) of non-merge commits in `cwd` whose message
    /// contains `needle` literally.
    pub async fn commits_matching(&self, cwd: &Path, needle: &str) -> ChorusResult<Vec<String>> {
        let grep = format!("--grep={needle}");
        let out = self
            .run_checked(cwd, &["log", "--no-merges", "--fixed-strings", &grep, "--format=%H"])
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Hard reset the main checkout to `target`.
    pub async fn reset_hard(&self, target: &str) -> ChorusResult<()> {
        info!(target = %target, "git reset --hard");
        self.run_checked(&self.root, &["reset", "--hard", target])
            .await
            .map(|_| ())
    }

    /// Soft reset `cwd` to `target`, keeping the undone changes staged.
    pub async fn reset_soft(&self, cwd: &Path, target: &str) -> ChorusResult<()> {
        self.run_checked(cwd, &["reset", "--soft", target])
            .await
            .map(|_| ())
    }

    /// Revert `sha` in `cwd` without committing.
    pub async fn revert_no_commit(&self, cwd: &Path, sha: &str) -> ChorusResult<()> {
        self.run_checked(cwd, &["revert", "--no-commit", sha])
            .await
            .map(|_| ())
    }

    // --- worktrees ---

    /// Stash tracked and untracked changes in `cwd`. Returns whether anything was stashed.
    pub async fn stash(&self, cwd: &Path) -> ChorusResult<bool> {
        let out = self
            .run_checked(cwd, &["stash", "--include-untracked"])
            .await?;
        Ok(!out.contains("No local changes to save"))
    }

    /// `git worktree add <path> -b <branch> <base>`.
    pub async fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> ChorusResult<()> {
        let path = path.to_string_lossy();
        self.run_checked(&self.root, &["worktree", "add", &path, "-b", branch, base])
            .await
            .map(|_| ())
    }

    /// Check out an existing `branch` into a new worktree at `path`.
    pub async fn worktree_add_existing(&self, path: &Path, branch: &str) -> ChorusResult<()> {
        let path = path.to_string_lossy();
        self.run_checked(&self.root, &["worktree", "add", &path, branch])
            .await
            .map(|_| ())
    }

    /// `git worktree remove --force <path>`.
    pub async fn worktree_remove(&self, path: &Path) -> ChorusResult<()> {
        let path = path.to_string_lossy();
        self.run_checked(&self.root, &["worktree", "remove", "--force", &path])
            .await
            .map(|_| ())
    }

    /// Delete a local branch, forcing if it is not merged.
    pub async fn delete_branch(&self, branch: &str) -> ChorusResult<()> {
        self.run_checked(&self.root, &["branch", "-D", branch])
            .await
            .map(|_| ())
    }
}

fn parse_tag_line(line: &str) -> Option<TagInfo> {
    let mut parts = line.splitn(3, '|');
    let name = parts.next()?.trim();
    if name.is_empty() {
        return None;
    }
    let created_unix = parts.next()?.trim().parse::<i64>().unwrap_or(0);
    let subject = parts.next().unwrap_or_default().trim().to_string();
    Some(TagInfo {
        name: name.to_string(),
        created_unix,
        subject,
    })
}
