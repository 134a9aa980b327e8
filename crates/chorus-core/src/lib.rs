//! Core types and error definitions for Chorus.
//!
//! This crate provides the foundational types shared across all Chorus crates:
//! the workspace-wide error enum and the tagged-text signal protocol that agent
//! subprocesses use to report progress on stdout.
//!
//! # Main types
//!
//! - [`ChorusError`]: Unified error enum for all Chorus subsystems.
//! - [`ChorusResult`]: Convenience alias for `Result<T, ChorusError>`.
//! - [`SignalParser`]: Scans agent output for `<chorus>TYPE[:payload]</chorus>` tags.
//! - [`Signal`] / [`SignalType`]: A parsed agent signal.

/// Agent signal protocol scanner.
pub mod signal;

pub use signal::{Signal, SignalParser, SignalType};

// --- Error types ---

/// Top-level error type for Chorus.
///
/// Variants are grouped by the taxonomy the orchestrator reacts to: lookups
/// that fail, transitions that indicate a controller bug, and infrastructure
/// failures coming back from git or agent subprocesses.
#[derive(Debug, thiserror::Error)]
pub enum ChorusError {
    /// A task id that the store does not know about.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// A generated task id collides with an existing task.
    #[error("Task already exists: {0}")]
    TaskExists(String),

    /// Adding `from -> to` would close a cycle in the dependency graph.
    #[error("Circular dependency: {from} -> {to} would create a cycle")]
    CircularDependency {
        /// Task that would gain the dependency.
        from: String,
        /// Task it would depend on.
        to: String,
    },

    /// A lifecycle transition was requested from the wrong state.
    #[error("Invalid transition for {id}: cannot {action} from {from}")]
    InvalidTransition {
        /// Entity the transition targeted (task id, agent id).
        id: String,
        /// State the entity was in.
        from: String,
        /// Attempted transition.
        action: String,
    },

    /// Every concurrency slot is occupied.
    #[error("NO_SLOTS_AVAILABLE: all {0} agent slots are in use")]
    NoSlotsAvailable(usize),

    /// `release()` was called with nothing acquired.
    #[error("Slot release with zero slots in use")]
    SlotUnderflow,

    /// An escalation is already waiting for an operator decision.
    #[error("Escalation already pending for task {0}")]
    EscalationPending(String),

    /// The checkpoint tag already exists.
    #[error("Checkpoint tag already exists: {0}")]
    CheckpointExists(String),

    /// A persisted file failed structural validation.
    #[error("Corrupted state in {path}: {reason}")]
    CorruptState {
        /// File that failed to load.
        path: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A git command failed.
    #[error("Git error: {0}")]
    Git(String),

    /// An error from the merge pipeline.
    #[error("Merge error: {0}")]
    Merge(String),

    /// An error from an agent subprocess or its lifecycle.
    #[error("Agent error: {0}")]
    Agent(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from the orchestration controller.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChorusError {
    /// Build an [`ChorusError::InvalidTransition`].
    pub fn invalid_transition(
        id: impl Into<String>,
        from: impl std::fmt::Display,
        action: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            id: id.into(),
            from: from.to_string(),
            action: action.into(),
        }
    }

    /// Build a [`ChorusError::CorruptState`].
    pub fn corrupt(path: impl AsRef<std::path::Path>, reason: impl Into<String>) -> Self {
        Self::CorruptState {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error signals a controller bug rather than an external condition.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. }
                | Self::SlotUnderflow
                | Self::EscalationPending(_)
                | Self::TaskExists(_)
        )
    }
}

/// A convenience `Result` alias using [`ChorusError`].
pub type ChorusResult<T> = Result<T, ChorusError>;

/// Write `contents` to `path` atomically: write a sibling temp file, then rename.
///
/// Parent directories are created as needed.
pub async fn write_atomic(path: &std::path::Path, contents: &[u8]) -> ChorusResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message() {
        let err = ChorusError::invalid_transition("ch-1", "doing", "claim");
        assert_eq!(
            err.to_string(),
            "Invalid transition for ch-1: cannot claim from doing"
        );
        assert!(err.is_programming_error());
    }

    #[test]
    fn test_no_slots_message_carries_code() {
        let err = ChorusError::NoSlotsAvailable(3);
        assert!(err.to_string().starts_with("NO_SLOTS_AVAILABLE"));
        assert!(!err.is_programming_error());
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("state.json");
        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!tmp.path().join("nested").join(".state.json.tmp").exists());
    }

    #[test]
    fn test_json_error_conversion() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: ChorusError = parse.unwrap_err().into();
        assert!(matches!(err, ChorusError::Json(_)));
    }
}
