use crate::events::{EventRecord, SessionEvent};
use crate::snapshot::{replay, SessionState};
use chorus_core::{ChorusError, ChorusResult};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pending writes the queue holds before `append` waits.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Size above which the log is rotated to `<name>.1`.
pub const DEFAULT_ROTATE_BYTES: u64 = 10 * 1024 * 1024;

enum LogCommand {
    Append(EventRecord),
    Flush(oneshot::Sender<ChorusResult<()>>),
    Truncate(oneshot::Sender<ChorusResult<()>>),
    Rotate(oneshot::Sender<ChorusResult<()>>),
}

/// Append-only JSONL log of [`SessionEvent`]s.
///
/// Writes go through a bounded queue drained by one writer task, so records
/// land in the file in the order `append` was called and memory stays
/// bounded. [`flush`](Self::flush) returns once everything queued before it
/// is on disk.
pub struct EventLog {
    tx: mpsc::Sender<LogCommand>,
    path: PathBuf,
    writer: JoinHandle<()>,
    next_seq: Mutex<u64>,
}

impl EventLog {
    /// Open (or create) the log at `path`. Sequence numbers continue from the
    /// last record already in the file.
    pub async fn open(path: impl Into<PathBuf>, rotate_bytes: u64) -> ChorusResult<Self> {
        Self::open_after(path, rotate_bytes, 0).await
    }

    /// Like [`open`](Self::open), but never hands out a sequence number at or
    /// below `after`. Used when the file was truncated after a snapshot that
    /// already folded events up to `after`.
    pub async fn open_after(
        path: impl Into<PathBuf>,
        rotate_bytes: u64,
        after: u64,
    ) -> ChorusResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let last_seq = read_events(&path)
            .await?
            .last()
            .map_or(0, |r| r.seq)
            .max(after);
        let file = open_append(&path).await?;
        let size = file.metadata().await?.len();

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let writer = Writer {
            path: path.clone(),
            file,
            size,
            rotate_bytes,
            error: None,
        };
        let writer = tokio::spawn(writer.run(rx));
        info!(path = %path.display(), last_seq, "Event log opened");
        Ok(Self {
            tx,
            path,
            writer,
            next_seq: Mutex::new(last_seq + 1),
        })
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue `event` and return its sequence number. Waits only when the
    /// queue is full.
    pub async fn append(&self, event: SessionEvent) -> ChorusResult<u64> {
        // Held across the send so sequence order and queue order agree.
        let mut next = self.next_seq.lock().await;
        let seq = *next;
        debug!(seq, event = event.name(), "event");
        let record = EventRecord {
            seq,
            timestamp: Utc::now(),
            event,
        };
        self.tx
            .send(LogCommand::Append(record))
            .await
            .map_err(|_| closed())?;
        *next += 1;
        Ok(seq)
    }

    /// Wait until every queued event is written and synced. Reports the first
    /// write error since the previous flush.
    pub async fn flush(&self) -> ChorusResult<()> {
        self.request(LogCommand::Flush).await
    }

    /// Empty the log after its contents were folded into a snapshot.
    /// Sequence numbers keep counting.
    pub async fn truncate(&self) -> ChorusResult<()> {
        self.request(LogCommand::Truncate).await
    }

    /// Move the current file to `<name>.1` and start a fresh one.
    pub async fn rotate(&self) -> ChorusResult<()> {
        self.request(LogCommand::Rotate).await
    }

    /// Flush, then stop the writer task.
    pub async fn close(self) -> ChorusResult<()> {
        let result = self.flush().await;
        drop(self.tx);
        if let Err(e) = self.writer.await {
            warn!(error = %e, "Event log writer task panicked");
        }
        result
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<ChorusResult<()>>) -> LogCommand,
    ) -> ChorusResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?
    }
}

fn closed() -> ChorusError {
    ChorusError::Orchestrator("event log writer is not running".to_string())
}

async fn open_append(path: &Path) -> ChorusResult<File> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

struct Writer {
    path: PathBuf,
    file: File,
    size: u64,
    rotate_bytes: u64,
    error: Option<ChorusError>,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::Receiver<LogCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                LogCommand::Append(record) => {
                    if let Err(e) = self.write(&record).await {
                        warn!(path = %self.path.display(), error = %e, "Event log write failed");
                        self.error.get_or_insert(e);
                    }
                }
                LogCommand::Flush(reply) => {
                    let result = self.sync().await;
                    let _ = reply.send(result);
                }
                LogCommand::Truncate(reply) => {
                    let result = self.truncate().await;
                    let _ = reply.send(result);
                }
                LogCommand::Rotate(reply) => {
                    let result = self.rotate().await;
                    let _ = reply.send(result);
                }
            }
        }
        if let Err(e) = self.file.flush().await {
            warn!(error = %e, "Final event log flush failed");
        }
    }

    async fn write(&mut self, record: &EventRecord) -> ChorusResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line).await?;
        self.size += line.len() as u64;
        if self.size > self.rotate_bytes {
            self.rotate().await?;
        }
        Ok(())
    }

    async fn sync(&mut self) -> ChorusResult<()> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }

    async fn truncate(&mut self) -> ChorusResult<()> {
        self.file.flush().await?;
        self.file.set_len(0).await?;
        self.size = 0;
        info!(path = %self.path.display(), "Event log truncated");
        Ok(())
    }

    async fn rotate(&mut self) -> ChorusResult<()> {
        self.file.flush().await?;
        let rotated = rotated_path(&self.path);
        tokio::fs::rename(&self.path, &rotated).await?;
        self.file = open_append(&self.path).await?;
        self.size = 0;
        info!(path = %self.path.display(), rotated = %rotated.display(), "Event log rotated");
        Ok(())
    }
}

/// `<path>.1`
pub fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".1");
    PathBuf::from(name)
}

/// Read every record in `path`. A missing file is empty.
///
/// A final line that does not parse and has no trailing newline is a torn
/// write from a crash and is dropped; any other malformed line is
/// [`ChorusError::CorruptState`]. Sequence numbers must strictly increase.
pub async fn read_events(path: &Path) -> ChorusResult<Vec<EventRecord>> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let complete = data.ends_with('\n');
    let lines: Vec<&str> = data.lines().collect();
    let mut records: Vec<EventRecord> = Vec::with_capacity(lines.len());

    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: EventRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) if idx + 1 == lines.len() && !complete => {
                warn!(path = %path.display(), line = idx + 1, error = %e, "Dropping torn final event");
                break;
            }
            Err(e) => {
                return Err(ChorusError::corrupt(path, format!("line {}: {e}", idx + 1)));
            }
        };
        if let Some(prev) = records.last() {
            if record.seq <= prev.seq {
                return Err(ChorusError::corrupt(
                    path,
                    format!("line {}: sequence {} after {}", idx + 1, record.seq, prev.seq),
                ));
            }
        }
        records.push(record);
    }
    Ok(records)
}

/// Rebuild session state from the log alone.
pub async fn replay_file(path: &Path) -> ChorusResult<SessionState> {
    let records = read_events(path).await?;
    Ok(replay(&records))
}

/// Bring `snapshot` up to date with the records logged after it.
/// Returns how many records were applied.
pub async fn recover(snapshot: &mut SessionState, path: &Path) -> ChorusResult<usize> {
    let records = read_events(path).await?;
    let applied = records
        .iter()
        .filter(|r| snapshot.apply_record(r))
        .count();
    if applied > 0 {
        info!(applied, last_seq = snapshot.last_event_seq, "Replayed events onto snapshot");
    }
    Ok(applied)
}
