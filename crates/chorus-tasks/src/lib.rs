//! Dependency-aware task store for Chorus.
//!
//! Tasks form a directed acyclic graph through their `dependencies` field and
//! move through a small lifecycle: `todo -> doing -> done | failed`, with
//! `reopen` and `release` leading back to `todo`. The store persists to a
//! JSONL file and broadcasts a [`TaskEvent`] after every mutation.
//!
//! # Main types
//!
//! - [`TaskStore`]: The graph, lifecycle guards, and readiness queries.
//! - [`Task`] / [`NewTask`] / [`TaskUpdate`]: Task records and inputs.
//! - [`TaskEvent`]: Change notifications for subscribers.

/// Task change notifications.
pub mod events;
/// JSONL encoding and load-time validation.
pub mod persistence;
/// The task store itself.
pub mod store;
/// Task records and status enums.
pub mod types;

pub use events::TaskEvent;
pub use store::TaskStore;
pub use types::{NewTask, Task, TaskCounts, TaskStatus, TaskType, TaskUpdate, DEFAULT_PRIORITY};
