use crate::event_log::{recover, replay_file, EventLog, DEFAULT_ROTATE_BYTES};
use crate::events::SessionEvent;
use crate::snapshot::{Mode, SessionState, StateStore};
use chorus_core::ChorusResult;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

/// File name of the snapshot inside the data directory.
pub const STATE_FILE: &str = "state.json";
/// File name of the event log inside the data directory.
pub const EVENTS_FILE: &str = "events.jsonl";

/// Owns the live [`SessionState`] together with its snapshot file and event
/// log. Every change goes through [`record`](Self::record), so the log and the
/// in-memory state never disagree.
pub struct SessionRecorder {
    state: SessionState,
    store: StateStore,
    log: EventLog,
    opened_at: Instant,
    resumed: bool,
}

impl SessionRecorder {
    /// Resume the session stored under `data_dir`, or start a new one in `mode`.
    ///
    /// A snapshot is brought up to date with the log written after it. With
    /// no snapshot, the log alone is replayed.
    pub async fn open(data_dir: &Path, mode: Mode) -> ChorusResult<Self> {
        let store = StateStore::new(data_dir.join(STATE_FILE));
        let log_path = data_dir.join(EVENTS_FILE);

        let (state, resumed) = match store.load().await? {
            Some(mut state) => {
                recover(&mut state, &log_path).await?;
                (state, true)
            }
            None => {
                let state = replay_file(&log_path).await?;
                let resumed = state.last_event_seq > 0;
                (state, resumed)
            }
        };

        let log = EventLog::open_after(&log_path, DEFAULT_ROTATE_BYTES, state.last_event_seq).await?;
        let mut recorder = Self {
            state,
            store,
            log,
            opened_at: Instant::now(),
            resumed,
        };

        if resumed {
            info!(session_id = %recorder.state.session_id, "Resuming session");
            if recorder.state.mode != mode {
                recorder.record(SessionEvent::ModeChanged { mode }).await?;
            }
        } else {
            let fresh = SessionState::new(mode);
            recorder.record(fresh.started_event()).await?;
            info!(session_id = %recorder.state.session_id, mode = %mode, "Session started");
        }
        Ok(recorder)
    }

    /// Current state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Whether an earlier session was picked up from disk.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// Snapshot path.
    pub fn state_path(&self) -> &Path {
        self.store.path()
    }

    /// Event log path.
    pub fn events_path(&self) -> PathBuf {
        self.log.path().to_path_buf()
    }

    /// Log `event` and fold it into the state.
    pub async fn record(&mut self, event: SessionEvent) -> ChorusResult<()> {
        let seq = self.log.append(event.clone()).await?;
        self.state.apply(&event);
        self.state.last_event_seq = seq;
        Ok(())
    }

    /// Write the snapshot, then drop the log records it now contains.
    pub async fn persist(&mut self) -> ChorusResult<()> {
        self.log.flush().await?;
        self.store.save(&self.state).await?;
        self.log.truncate().await
    }

    /// Record the runtime of this run, persist and stop the log writer.
    pub async fn close(mut self) -> ChorusResult<SessionState> {
        let runtime_secs = self.opened_at.elapsed().as_secs();
        self.record(SessionEvent::SessionEnded { runtime_secs }).await?;
        self.persist().await?;
        self.log.close().await?;
        Ok(self.state)
    }
}
