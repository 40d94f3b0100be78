//! TimescaleDB warehouse sink.
//!
//! The time-series destination speaks the same wire protocol and batch
//! transaction shape as the relational warehouse; what differs is the type
//! mapping (timezone-aware timestamps, applied through the time-series
//! mapper) and the destination identity in offsets, metrics, and the DLQ.
//! Hypertable bootstrap (`create_hypertable`) is destination-provisioning
//! work and happens outside the replicator.

use crate::config::DestinationConfig;
use crate::error::Result;
use crate::sinks::{PostgresSink, Sink, SinkStats, WriteResult};
use async_trait::async_trait;
use cassflow_core::{ChangeEvent, Destination, ReplicationOffset, SchemaChange};
use std::time::Duration;

/// Sink for the time-series warehouse.
pub struct TimescaleSink {
    inner: PostgresSink,
}

impl TimescaleSink {
    pub fn new(config: DestinationConfig, pool_size: usize) -> Self {
        Self {
            inner: PostgresSink::with_destination(config, pool_size, Destination::Timescaledb),
        }
    }
}

#[async_trait]
impl Sink for TimescaleSink {
    fn destination(&self) -> Destination {
        Destination::Timescaledb
    }

    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }

    async fn write_batch(
        &self,
        events: &[ChangeEvent],
        offset: &ReplicationOffset,
    ) -> Result<WriteResult> {
        self.inner.write_batch(events, offset).await
    }

    async fn apply_schema_change(&self, change: &SchemaChange) -> Result<()> {
        self.inner.apply_schema_change(change).await
    }

    async fn health_check(&self) -> Result<Duration> {
        self.inner.health_check().await
    }

    async fn load_offsets(&self) -> Result<Vec<ReplicationOffset>> {
        self.inner.load_offsets().await
    }

    fn stats(&self) -> SinkStats {
        self.inner.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_identity() {
        let sink = TimescaleSink::new(DestinationConfig::default(), 4);
        assert_eq!(sink.destination(), Destination::Timescaledb);
    }
}
