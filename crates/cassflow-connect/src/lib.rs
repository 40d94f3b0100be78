//! # cassflow-connect - Delivery Layer for cassflow
//!
//! Everything between the commit-log stream and the destination warehouses:
//!
//! - [`masking`] - PII/PHI classification and one-way masking with audit
//! - [`mapper`] / [`validator`] - Source→destination type mapping and
//!   per-destination event validation
//! - [`sinks`] - The [`sinks::Sink`] trait plus PostgreSQL, ClickHouse,
//!   TimescaleDB, and in-memory implementations
//! - [`retry`] - Exponential backoff with jitter around sink calls
//! - [`dlq`] - Append-only, day-partitioned JSONL dead-letter queue
//! - [`pipeline`] - The orchestrator: fan-out, ordering, backpressure,
//!   schema quiesce, graceful shutdown
//! - [`metrics`] / [`health`] - The pull-based observability surface
//!
//! ## Data flow
//!
//! ```text
//! reader ──► Qparse ──► mask ──► validate ──┬──► Qdest[postgres]    ──► sink workers
//!                                           ├──► Qdest[clickhouse]  ──► sink workers
//!                                           └──► Qdest[timescaledb] ──► sink workers
//!                                                      │
//!                                  retry ◄─────────────┤
//!                                  DLQ   ◄─ terminal ──┘
//! ```

pub mod config;
pub mod dlq;
pub mod error;
pub mod health;
pub mod mapper;
pub mod masking;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod sinks;
pub mod validator;

pub use config::ReplicatorConfig;
pub use error::{ConnectorError, ErrorCategory, Result};
pub use pipeline::{Pipeline, PipelineHandle};
