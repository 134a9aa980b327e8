//! Session persistence for Chorus.
//!
//! Two durable artifacts describe a running session: `state.json`, an
//! atomically written [`SessionState`] snapshot, and `events.jsonl`, the
//! append-only [`EventLog`] of everything that happened since. Replaying the
//! log onto the last snapshot reproduces the live state.
//! [`SessionRecorder`] keeps the two in step for the controller.

/// Append-only JSONL event log with an ordered writer task.
pub mod event_log;
/// Domain events and their on-disk record.
pub mod events;
/// Live state bound to its snapshot and event log.
pub mod recorder;
/// The session snapshot and its store.
pub mod snapshot;

pub use event_log::{
    read_events, recover, replay_file, rotated_path, EventLog, DEFAULT_ROTATE_BYTES,
    EVENT_QUEUE_CAPACITY,
};
pub use events::{EventRecord, SessionEvent};
pub use recorder::{SessionRecorder, EVENTS_FILE, STATE_FILE};
pub use snapshot::{
    replay, AgentRecord, AgentStatus, Mode, SessionState, SessionStats, StateStore, STATE_VERSION,
};
