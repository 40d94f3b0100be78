//! Schema monitor.
//!
//! Polls the source catalog on a fixed cadence and diffs each monitored
//! table against the cached snapshot. First observation establishes
//! version 1 and emits nothing; a later non-empty diff bumps the version,
//! swaps the cache under a brief write lock, and emits one
//! [`SchemaChange`] to the orchestrator.

use crate::catalog::SourceCatalog;
use crate::reader::TableSelector;
use cassflow_core::{SchemaChange, SchemaSnapshot};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

/// Shared schema cache keyed by `(keyspace, table)`.
///
/// The transform stage reads it lock-free in practice (read lock, no
/// contention except during a swap); only the monitor writes.
pub type SchemaCache = Arc<RwLock<HashMap<(String, String), SchemaSnapshot>>>;

/// Periodic catalog poller.
pub struct SchemaMonitor {
    catalog: Arc<dyn SourceCatalog>,
    tables: Vec<TableSelector>,
    poll_interval: Duration,
    cache: SchemaCache,
}

impl SchemaMonitor {
    pub fn new(
        catalog: Arc<dyn SourceCatalog>,
        tables: Vec<TableSelector>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            catalog,
            tables,
            poll_interval,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Handle to the shared cache, for the validator and the orchestrator.
    pub fn cache(&self) -> SchemaCache {
        Arc::clone(&self.cache)
    }

    /// One poll pass over all monitored tables. Returns the changes
    /// detected in this pass (also useful directly from tests).
    pub async fn poll_once(&self) -> Vec<SchemaChange> {
        let mut detected = Vec::new();

        for selector in &self.tables {
            let columns = match self
                .catalog
                .fetch(&selector.keyspace, &selector.table)
                .await
            {
                Ok(cols) => cols,
                Err(e) => {
                    warn!(
                        keyspace = %selector.keyspace,
                        table = %selector.table,
                        error = %e,
                        "catalog poll failed, keeping cached schema"
                    );
                    continue;
                }
            };

            let key = (selector.keyspace.clone(), selector.table.clone());
            let cached = { self.cache.read().await.get(&key).cloned() };

            match cached {
                None => {
                    let snapshot = SchemaSnapshot::new(
                        selector.keyspace.clone(),
                        selector.table.clone(),
                        1,
                        columns,
                    );
                    info!(
                        keyspace = %selector.keyspace,
                        table = %selector.table,
                        columns = snapshot.columns.len(),
                        "initial schema observed"
                    );
                    self.cache.write().await.insert(key, snapshot);
                }
                Some(old) => {
                    let candidate = SchemaSnapshot::new(
                        selector.keyspace.clone(),
                        selector.table.clone(),
                        old.version,
                        columns,
                    );
                    let changes = old.diff(&candidate);
                    if changes.is_empty() {
                        debug!(
                            keyspace = %selector.keyspace,
                            table = %selector.table,
                            "schema unchanged"
                        );
                        continue;
                    }

                    let new_version = old.version + 1;
                    let snapshot = SchemaSnapshot {
                        version: new_version,
                        ..candidate
                    };
                    info!(
                        keyspace = %selector.keyspace,
                        table = %selector.table,
                        old_version = old.version,
                        new_version,
                        changes = changes.len(),
                        "schema change detected"
                    );
                    self.cache.write().await.insert(key, snapshot);
                    detected.push(SchemaChange {
                        keyspace: selector.keyspace.clone(),
                        table: selector.table.clone(),
                        old_version: old.version,
                        new_version,
                        changes,
                    });
                }
            }
        }

        detected
    }

    /// Run until shutdown, forwarding detected changes to the orchestrator.
    pub async fn run(self, tx: mpsc::Sender<SchemaChange>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for change in self.poll_once().await {
                        if tx.send(change).await.is_err() {
                            debug!("schema change channel closed, stopping monitor");
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
