//! Dead-letter queue writer.
//!
//! An append-only log of events the pipeline gave up on, one JSON object per
//! line, partitioned by wall-clock day: `failed_events_YYYY-MM-DD.jsonl`.
//! Appends are fsynced before they count as written, because a successful
//! DLQ write is what permits the offset to advance past the event.

use crate::error::{ConnectorError, Result};
use cassflow_core::DeadLetterEvent;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Day-partitioned JSONL writer.
pub struct DlqWriter {
    directory: PathBuf,
}

impl DlqWriter {
    pub async fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory).await?;
        info!(directory = %directory.display(), "DLQ writer initialized");
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Append one record. Returns only after the bytes are on disk.
    pub async fn write(&self, record: &DeadLetterEvent) -> Result<()> {
        let filename = format!(
            "failed_events_{}.jsonl",
            record.dlq_written_at.format("%Y-%m-%d")
        );
        let path = self.directory.join(&filename);

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;

        warn!(
            event_id = %record.original_event.event_id(),
            destination = %record.destination,
            category = %record.error_category,
            file = %filename,
            "event written to DLQ"
        );
        Ok(())
    }

    /// DLQ files present, oldest first.
    pub async fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with("failed_events_") && name.ends_with(".jsonl") {
                    files.push(entry.path());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Total records, optionally filtered by destination label.
    pub async fn count(&self, destination: Option<cassflow_core::Destination>) -> Result<u64> {
        let mut total = 0;
        for path in self.files().await? {
            let contents = tokio::fs::read_to_string(&path).await?;
            for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<DeadLetterEvent>(line) {
                    Ok(record) => {
                        if destination.is_none() || destination == Some(record.destination) {
                            total += 1;
                        }
                    }
                    Err(e) => {
                        warn!(file = %path.display(), error = %e, "unreadable DLQ line");
                    }
                }
            }
        }
        Ok(total)
    }

    /// Read every record back, oldest file first. Used by tests and
    /// operator tooling; the pipeline itself never reads the DLQ.
    pub async fn read_all(&self) -> Result<Vec<DeadLetterEvent>> {
        let mut records = Vec::new();
        for path in self.files().await? {
            let contents = tokio::fs::read_to_string(&path).await?;
            for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                records.push(
                    serde_json::from_str(line)
                        .map_err(|e| ConnectorError::Content(format!("corrupt DLQ line: {e}")))?,
                );
            }
        }
        Ok(records)
    }

    /// Today's DLQ filename, for log correlation.
    pub fn current_filename() -> String {
        format!("failed_events_{}.jsonl", Utc::now().format("%Y-%m-%d"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cassflow_core::{
        ChangeEvent, Column, CqlType, CqlValue, Destination, EventKind, Row,
    };
    use tempfile::tempdir;
    use uuid::Uuid;

    fn record(destination: Destination) -> DeadLetterEvent {
        let event = ChangeEvent::new(
            EventKind::Insert,
            "ecommerce",
            "users",
            Row::from_columns(vec![Column::new(
                "user_id",
                CqlType::Uuid,
                CqlValue::Uuid(Uuid::new_v4()),
            )]),
            Row::new(),
            Row::from_columns(vec![Column::new("age", CqlType::Int, CqlValue::Int(1))]),
            1_700_000_000_000_000,
            None,
        )
        .unwrap();
        DeadLetterEvent::new(
            event,
            destination,
            "SchemaIncompatible",
            "unsupported type tuple for column prefs",
            0,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_write_creates_day_partitioned_file() {
        let dir = tempdir().unwrap();
        let writer = DlqWriter::new(dir.path()).await.unwrap();

        writer.write(&record(Destination::Postgres)).await.unwrap();

        let files = writer.files().await.unwrap();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("failed_events_"));
        assert!(name.ends_with(".jsonl"));
        assert_eq!(name, DlqWriter::current_filename());
    }

    #[tokio::test]
    async fn test_append_only_jsonl() {
        let dir = tempdir().unwrap();
        let writer = DlqWriter::new(dir.path()).await.unwrap();

        writer.write(&record(Destination::Postgres)).await.unwrap();
        writer.write(&record(Destination::Clickhouse)).await.unwrap();

        let files = writer.files().await.unwrap();
        let contents = tokio::fs::read_to_string(&files[0]).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
        for line in contents.lines() {
            let parsed: DeadLetterEvent = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.error_category, "SchemaIncompatible");
        }
    }

    #[tokio::test]
    async fn test_count_by_destination() {
        let dir = tempdir().unwrap();
        let writer = DlqWriter::new(dir.path()).await.unwrap();

        writer.write(&record(Destination::Postgres)).await.unwrap();
        writer.write(&record(Destination::Postgres)).await.unwrap();
        writer.write(&record(Destination::Clickhouse)).await.unwrap();

        assert_eq!(writer.count(None).await.unwrap(), 3);
        assert_eq!(writer.count(Some(Destination::Postgres)).await.unwrap(), 2);
        assert_eq!(
            writer.count(Some(Destination::Timescaledb)).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_round_trip_preserves_original_event() {
        let dir = tempdir().unwrap();
        let writer = DlqWriter::new(dir.path()).await.unwrap();

        let original = record(Destination::Postgres);
        writer.write(&original).await.unwrap();

        let records = writer.read_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0], original);
        assert!(records[0].original_event.validate().is_ok());
    }
}
