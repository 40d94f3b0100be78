//! Source catalog access.
//!
//! The schema monitor consumes table definitions through [`SourceCatalog`].
//! The production implementation reads catalog exports from a directory of
//! JSON files (one per table, refreshed by the source-side tooling); tests
//! use [`StaticCatalog`].

use crate::error::{CdcError, Result};
use async_trait::async_trait;
use cassflow_core::ColumnDef;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// Read access to the source's table definitions.
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    /// Fetch the current column list for a table, in declaration order.
    async fn fetch(&self, keyspace: &str, table: &str) -> Result<Vec<ColumnDef>>;
}

/// Catalog backed by JSON exports: `<dir>/<keyspace>.<table>.json`, each a
/// JSON array of column definitions.
pub struct JsonFileCatalog {
    directory: PathBuf,
}

impl JsonFileCatalog {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

#[async_trait]
impl SourceCatalog for JsonFileCatalog {
    async fn fetch(&self, keyspace: &str, table: &str) -> Result<Vec<ColumnDef>> {
        let path = self.directory.join(format!("{keyspace}.{table}.json"));
        let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
            CdcError::catalog(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&contents)
            .map_err(|e| CdcError::catalog(format!("malformed catalog file {}: {e}", path.display())))
    }
}

/// Fixed in-memory catalog, mutable from tests to simulate DDL on the source.
#[derive(Default)]
pub struct StaticCatalog {
    tables: RwLock<HashMap<(String, String), Vec<ColumnDef>>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, keyspace: &str, table: &str, columns: Vec<ColumnDef>) {
        self.tables
            .write()
            .await
            .insert((keyspace.to_string(), table.to_string()), columns);
    }
}

#[async_trait]
impl SourceCatalog for StaticCatalog {
    async fn fetch(&self, keyspace: &str, table: &str) -> Result<Vec<ColumnDef>> {
        self.tables
            .read()
            .await
            .get(&(keyspace.to_string(), table.to_string()))
            .cloned()
            .ok_or_else(|| CdcError::catalog(format!("unknown table {keyspace}.{table}")))
    }
}
