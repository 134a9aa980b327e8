//! Serialized merge pipeline for Chorus.
//!
//! Finished agent branches (and operator-submitted ones) enter a
//! [`MergeQueue`]; a single consumer merges them into the target branch one at
//! a time. Conflicts are classified by [`ConflictClassifier`] and handled by a
//! deterministic auto-resolution, a [`RebaseRetry`], or a resolver agent.
//! Items that keep failing are escalated through [`HumanEscalation`].
//!
//! # Main types
//!
//! - [`MergePipeline`]: The drain loop and its collaborators.
//! - [`MergeWorker`] / [`MergeHandle`]: Runs the pipeline on its own task.
//! - [`MergeQueue`]: Ordering, dependencies and retry bookkeeping.
//! - [`AdmissionError`]: Typed validation failures for operator branches.

/// Operator branch admission.
pub mod admission;
/// Conflict classification and strategy selection.
pub mod classifier;
/// `[merge]` configuration.
pub mod config;
/// Pending human escalation.
pub mod escalation;
/// Upstream force-push detection and recovery.
pub mod force_push;
/// The merge drain loop.
pub mod pipeline;
/// Ordered merge queue.
pub mod queue;
/// Rebase with conflict detection.
pub mod rebase;
/// Conflict resolver agents and inspectors.
pub mod resolver;
/// Background task wrapper for the pipeline.
pub mod worker;

pub use admission::{user_task_id, Admission, AdmissionError, DEFAULT_MERGE_PRIORITY};
pub use classifier::{
    ConflictAnalysis, ConflictClassifier, ConflictInfo, ConflictType, LineRange, Strategy,
};
pub use config::MergeConfig;
pub use escalation::{
    EscalationAction, EscalationEvent, EscalationRequest, HumanEscalation,
    DEFAULT_ESCALATION_THRESHOLD,
};
pub use force_push::{ForcePushCheck, ForcePushRecovery};
pub use pipeline::{MergeCounters, MergeOutcome, MergePipeline, MergeStatus};
pub use queue::{
    MergeItem, MergeItemStatus, MergeQueue, MergeRequest, QueueStats, PRIORITY_BOOST,
};
pub use rebase::{RebaseResult, RebaseRetry};
pub use resolver::{
    CommandResolver, ConflictInspector, ConflictResolver, ResolveOutcome, ResolveRequest,
};
pub use worker::{MergeHandle, MergeWorker};
