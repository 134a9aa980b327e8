//! Git-tag checkpoints for Chorus.
//!
//! A checkpoint is an annotated tag on the main checkout taken before a risky
//! operation (autopilot start, a merge) or on a timer. Restoring one
//! hard-resets the checkout and reports which tasks had commits in the
//! discarded range so the controller can reopen them.

/// Tag creation, restore and retention.
pub mod checkpointer;
/// Checkpoint records and configuration.
pub mod types;

pub use checkpointer::{tag_name, Checkpointer};
pub use types::{Checkpoint, CheckpointConfig, CheckpointType};
