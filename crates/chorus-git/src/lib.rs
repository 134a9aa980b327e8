//! Git plumbing for Chorus.
//!
//! Git is the only durable transport in a Chorus session: agent branches,
//! merges, rebases and checkpoint tags all go through here. Everything above
//! this crate talks to git through the [`GitRunner`] trait so tests can script
//! repository behaviour without a real repository.
//!
//! # Main types
//!
//! - [`GitRunner`]: Collaborator trait that executes one git command.
//! - [`CliGitRunner`]: Runs the `git` binary as a tokio subprocess.
//! - [`Repo`]: Typed operations (merge, rebase, tag, worktree, ...) on one repository.
//! - `MockGitRunner`: Closure-scripted runner (feature `test-util`).

/// Typed repository operations.
pub mod repo;
/// The git command runner trait and its subprocess implementation.
pub mod runner;

/// Scripted runner for tests.
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

#[cfg(any(test, feature = "test-util"))]
pub use mock::{GitCall, MockGitRunner};
pub use repo::{Repo, TagInfo};
pub use runner::{CliGitRunner, GitOutput, GitRunner};
