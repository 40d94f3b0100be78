//! Commit-log directory tailer.
//!
//! Streams `(event, token)` pairs out of the source's cdc directory. Files
//! are consumed oldest-first by name; the newest file is tailed as the
//! source appends to it. The reader never deletes or modifies files.
//!
//! A token is the byte position *after* an event's frame, so resuming from a
//! token re-reads nothing: any frame whose byte range ends at or before the
//! token is dropped.
//!
//! Malformed frames are skipped, not fatal: each one yields a
//! [`ReaderItem::ParseSkip`] marker and the cursor moves past it. A frame
//! with an unreadable length prefix poisons the remainder of its file (there
//! is no resync point), so the rest of that file is skipped with a single
//! marker.

use crate::codec::{self, MAX_FRAME_BYTES};
use crate::error::{CdcError, Result};
use cassflow_core::{ChangeEvent, LogPosition};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// One monitored `(keyspace, table)` pair.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TableSelector {
    pub keyspace: String,
    pub table: String,
}

impl TableSelector {
    pub fn new(keyspace: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            table: table.into(),
        }
    }

    pub fn matches(&self, keyspace: &str, table: &str) -> bool {
        self.keyspace == keyspace && self.table == table
    }
}

/// Reader configuration.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Directory the source hard-links finished commit-log segments into.
    pub directory: PathBuf,
    /// How long to wait when no new bytes are available.
    pub poll_interval: Duration,
    /// Tables to emit events for; empty means all tables observed.
    pub tables: Vec<TableSelector>,
    /// Capacity of the outbound queue (`Qparse`).
    pub queue_capacity: usize,
}

impl ReaderConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            poll_interval: Duration::from_secs(1),
            tables: Vec::new(),
            queue_capacity: 1024,
        }
    }

    fn wants(&self, keyspace: &str, table: &str) -> bool {
        self.tables.is_empty() || self.tables.iter().any(|t| t.matches(keyspace, table))
    }
}

/// Items produced by the reader.
#[derive(Debug, Clone)]
pub enum ReaderItem {
    /// A decoded event plus its resumption token (position after the frame).
    Event {
        event: ChangeEvent,
        token: LogPosition,
    },
    /// A frame that could not be decoded; the stream continues past it.
    ParseSkip {
        file: String,
        position: u64,
        reason: String,
    },
}

/// Tails the commit-log directory and decodes frames into events.
pub struct CommitLogReader {
    config: ReaderConfig,
}

impl CommitLogReader {
    pub fn new(config: ReaderConfig) -> Self {
        Self { config }
    }

    /// Start the reader task.
    ///
    /// With no start token the stream begins at the oldest commit-log file
    /// still present, position 0. With a token it resumes after the event
    /// the token points past.
    pub fn open(
        self,
        start: Option<LogPosition>,
        shutdown: watch::Receiver<bool>,
    ) -> mpsc::Receiver<ReaderItem> {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        tokio::spawn(async move {
            if let Err(e) = run(self.config, start, tx, shutdown).await {
                match e {
                    CdcError::ChannelClosed => debug!("reader queue closed, stopping"),
                    other => warn!(error = %other, "commit-log reader stopped on error"),
                }
            }
        });
        rx
    }
}

async fn run(
    config: ReaderConfig,
    start: Option<LogPosition>,
    tx: mpsc::Sender<ReaderItem>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let start_label = start
        .as_ref()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "oldest".into());
    info!(
        directory = %config.directory.display(),
        start = %start_label,
        "commit-log reader starting"
    );

    let mut cursor = start;

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let files = list_commitlog_files(&config.directory).await?;
        if files.is_empty() {
            debug!("no commit-log files present yet");
        }

        for path in &files {
            if *shutdown.borrow() {
                return Ok(());
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            // Files before the cursor's file were fully consumed earlier.
            if let Some(cur) = &cursor {
                if name < cur.file {
                    continue;
                }
            }
            let resume_pos = match &cursor {
                Some(cur) if cur.file == name => cur.position,
                _ => 0,
            };
            read_file(
                path,
                &name,
                resume_pos,
                &config,
                &tx,
                &mut cursor,
                &shutdown,
            )
            .await?;
        }

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

/// Read frames from one file starting at `resume_pos`, advancing `cursor`
/// past each consumed frame. Stops at a clean or partial end of file.
async fn read_file(
    path: &Path,
    name: &str,
    resume_pos: u64,
    config: &ReaderConfig,
    tx: &mpsc::Sender<ReaderItem>,
    cursor: &mut Option<LogPosition>,
    shutdown: &watch::Receiver<bool>,
) -> Result<()> {
    let mut file = match File::open(path).await {
        Ok(f) => f,
        Err(e) => {
            // The source may rotate files out from under us between the
            // directory listing and the open.
            warn!(file = name, error = %e, "failed to open commit-log file");
            return Ok(());
        }
    };

    let file_len = file.metadata().await?.len();
    if resume_pos >= file_len {
        return Ok(());
    }
    file.seek(SeekFrom::Start(resume_pos)).await?;

    let mut pos = resume_pos;
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let mut len_buf = [0u8; 4];
        match file.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let frame_len = u32::from_be_bytes(len_buf);

        if frame_len == 0 || frame_len > MAX_FRAME_BYTES {
            send(
                tx,
                shutdown,
                ReaderItem::ParseSkip {
                    file: name.to_string(),
                    position: pos,
                    reason: format!("invalid frame length {frame_len}"),
                },
            )
            .await?;
            // No resync point after a corrupt length; skip the rest of the file.
            *cursor = Some(LogPosition::new(name, file_len));
            return Ok(());
        }

        let mut payload = vec![0u8; frame_len as usize];
        match file.read_exact(&mut payload).await {
            Ok(_) => {}
            // Incomplete tail: the source is still writing this frame.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let end = pos + 4 + u64::from(frame_len);
        match codec::decode_payload(&payload) {
            Ok(mutation) => {
                let wanted = config.wants(&mutation.keyspace, &mutation.table);
                // Resume rule: drop frames ending at or before the token.
                if wanted && end > resume_pos {
                    match mutation.into_event(name) {
                        Ok(event) => {
                            send(
                                tx,
                                shutdown,
                                ReaderItem::Event {
                                    event,
                                    token: LogPosition::new(name, end),
                                },
                            )
                            .await?;
                        }
                        Err(e) => {
                            send(
                                tx,
                                shutdown,
                                ReaderItem::ParseSkip {
                                    file: name.to_string(),
                                    position: pos,
                                    reason: e.to_string(),
                                },
                            )
                            .await?;
                        }
                    }
                }
            }
            Err(e) => {
                send(
                    tx,
                    shutdown,
                    ReaderItem::ParseSkip {
                        file: name.to_string(),
                        position: pos,
                        reason: e.to_string(),
                    },
                )
                .await?;
            }
        }

        pos = end;
        *cursor = Some(LogPosition::new(name, end));
    }

    Ok(())
}

async fn send(
    tx: &mpsc::Sender<ReaderItem>,
    shutdown: &watch::Receiver<bool>,
    item: ReaderItem,
) -> Result<()> {
    let mut shutdown = shutdown.clone();
    tokio::select! {
        res = tx.send(item) => res.map_err(|_| CdcError::ChannelClosed),
        _ = shutdown.changed() => {
            if *shutdown.borrow() {
                Err(CdcError::ChannelClosed)
            } else {
                Ok(())
            }
        }
    }
}

/// Sorted (oldest-first) commit-log files in the cdc directory.
async fn list_commitlog_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        warn!(directory = %dir.display(), "cdc directory does not exist");
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with("CommitLog-") && name.ends_with(".log") {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}
