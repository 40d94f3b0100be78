//! # cassflow-core - Data Model for the cassflow CDC Replicator
//!
//! Database-agnostic types shared by the capture and delivery layers:
//!
//! - [`ChangeEvent`] - One row mutation captured from the source commit-log
//! - [`CqlValue`] / [`CqlType`] - Typed column values with source type tags
//! - [`SchemaSnapshot`] / [`SchemaChange`] - Versioned table schemas and diffs
//! - [`ReplicationOffset`] / [`LogPosition`] - Per-partition, per-destination progress
//! - [`DeadLetterEvent`] - Terminal-failure wrapper written to the DLQ
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     cassflow-core                        │
//! ├──────────────────────────────────────────────────────────┤
//! │  ChangeEvent     ←─── produced by the commit-log reader  │
//! │  SchemaSnapshot  ←─── produced by the schema monitor     │
//! │  ReplicationOffset ←─ committed atomically with batches  │
//! │  DeadLetterEvent ←─── appended by the DLQ writer         │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod dead_letter;
mod error;
mod event;
mod offset;
mod schema;
mod value;

pub use dead_letter::DeadLetterEvent;
pub use error::{ModelError, Result};
pub use event::{deterministic_event_id, ChangeEvent, EventKind, MAX_CAPTURE_SKEW};
pub use offset::{Destination, LogPosition, OffsetKey, ReplicationOffset};
pub use schema::{
    ChangeOp, ColumnChange, ColumnDef, ColumnKind, Compatibility, SchemaChange, SchemaSnapshot,
};
pub use value::{Column, CqlType, CqlValue, Row};
