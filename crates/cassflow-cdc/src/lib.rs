//! # cassflow-cdc - Commit-Log Capture for cassflow
//!
//! The capture side of the replicator:
//!
//! - [`codec`] - Binary commit-log frame encoding/decoding
//! - [`CommitLogReader`] - Tails the source's cdc directory, yielding
//!   `(event, token)` pairs and [`ReaderItem::ParseSkip`] markers
//! - [`SchemaMonitor`] - Polls the source catalog and emits
//!   [`cassflow_core::SchemaChange`] notifications
//! - [`OffsetManager`] - Monotone per-partition, per-destination progress
//!
//! ## Architecture
//!
//! ```text
//! cdc_raw/ ──► CommitLogReader ──► (ChangeEvent, LogPosition) ──► pipeline
//!                   │
//!                   └──► ParseSkip markers (malformed frames, never fatal)
//!
//! catalog  ──► SchemaMonitor ──► SchemaChange ──► pipeline quiesce + DDL
//! ```

pub mod catalog;
pub mod codec;
mod error;
mod monitor;
mod offset_manager;
mod reader;

pub use catalog::{JsonFileCatalog, SourceCatalog, StaticCatalog};
pub use error::{CdcError, Result};
pub use monitor::{SchemaCache, SchemaMonitor};
pub use offset_manager::{Advance, OffsetManager, OFFSETS_TABLE};
pub use reader::{CommitLogReader, ReaderConfig, ReaderItem, TableSelector};
