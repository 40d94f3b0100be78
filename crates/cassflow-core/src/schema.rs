//! Versioned table schemas and schema diffs.
//!
//! The schema monitor builds a [`SchemaSnapshot`] per polled table and diffs
//! it against the cached one. A non-empty diff becomes a [`SchemaChange`]
//! whose per-column operations are ordered drops first, then adds, then
//! alter-type, stable by column name within each group.

use crate::value::CqlType;
use serde::{Deserialize, Serialize};

/// Role of a column within the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    PartitionKey,
    Clustering,
    Static,
    Regular,
}

/// One column as described by the source catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub cql_type: CqlType,
    pub kind: ColumnKind,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, cql_type: CqlType, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            cql_type,
            kind,
        }
    }

    pub fn is_key(&self) -> bool {
        matches!(self.kind, ColumnKind::PartitionKey | ColumnKind::Clustering)
    }
}

/// Point-in-time schema of one `(keyspace, table)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub keyspace: String,
    pub table: String,
    /// Monotone version assigned by the monitor; first observation is 1.
    pub version: u32,
    /// Columns in catalog declaration order.
    pub columns: Vec<ColumnDef>,
}

impl SchemaSnapshot {
    pub fn new(
        keyspace: impl Into<String>,
        table: impl Into<String>,
        version: u32,
        columns: Vec<ColumnDef>,
    ) -> Self {
        Self {
            keyspace: keyspace.into(),
            table: table.into(),
            version,
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn partition_keys(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns
            .iter()
            .filter(|c| c.kind == ColumnKind::PartitionKey)
    }

    pub fn clustering_keys(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns
            .iter()
            .filter(|c| c.kind == ColumnKind::Clustering)
    }

    /// Diff `self` (older) against `newer`, producing column operations in
    /// the stable order the orchestrator applies them: drops, adds, alters.
    pub fn diff(&self, newer: &SchemaSnapshot) -> Vec<ColumnChange> {
        let mut drops: Vec<ColumnChange> = self
            .columns
            .iter()
            .filter(|old| newer.column(&old.name).is_none())
            .map(|old| ColumnChange {
                op: ChangeOp::Drop,
                column: old.name.clone(),
                old_type: Some(old.cql_type),
                new_type: None,
                compatibility: if old.is_key() {
                    Compatibility::Incompatible
                } else {
                    Compatibility::Compatible
                },
            })
            .collect();

        let mut adds: Vec<ColumnChange> = newer
            .columns
            .iter()
            .filter(|new| self.column(&new.name).is_none())
            .map(|new| ColumnChange {
                op: ChangeOp::Add,
                column: new.name.clone(),
                old_type: None,
                new_type: Some(new.cql_type),
                compatibility: Compatibility::Compatible,
            })
            .collect();

        let mut alters: Vec<ColumnChange> = self
            .columns
            .iter()
            .filter_map(|old| {
                let new = newer.column(&old.name)?;
                (new.cql_type != old.cql_type).then(|| ColumnChange {
                    op: ChangeOp::AlterType,
                    column: old.name.clone(),
                    old_type: Some(old.cql_type),
                    new_type: Some(new.cql_type),
                    compatibility: if old.cql_type.widens_to(new.cql_type) {
                        Compatibility::Compatible
                    } else {
                        Compatibility::Incompatible
                    },
                })
            })
            .collect();

        drops.sort_by(|a, b| a.column.cmp(&b.column));
        adds.sort_by(|a, b| a.column.cmp(&b.column));
        alters.sort_by(|a, b| a.column.cmp(&b.column));

        let mut changes = drops;
        changes.append(&mut adds);
        changes.append(&mut alters);
        changes
    }
}

/// Kind of column-level schema operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Drop,
    Add,
    AlterType,
}

/// Whether a column change can be carried forward to destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compatibility {
    Compatible,
    Incompatible,
}

/// One column-level operation with its compatibility classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnChange {
    pub op: ChangeOp,
    pub column: String,
    pub old_type: Option<CqlType>,
    pub new_type: Option<CqlType>,
    pub compatibility: Compatibility,
}

/// A schema transition for one table, emitted by the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChange {
    pub keyspace: String,
    pub table: String,
    pub old_version: u32,
    pub new_version: u32,
    pub changes: Vec<ColumnChange>,
}

impl SchemaChange {
    pub fn is_compatible(&self) -> bool {
        self.changes
            .iter()
            .all(|c| c.compatibility == Compatibility::Compatible)
    }

    pub fn incompatible_columns(&self) -> impl Iterator<Item = &ColumnChange> {
        self.changes
            .iter()
            .filter(|c| c.compatibility == Compatibility::Incompatible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_v1() -> SchemaSnapshot {
        SchemaSnapshot::new(
            "ecommerce",
            "users",
            1,
            vec![
                ColumnDef::new("user_id", CqlType::Uuid, ColumnKind::PartitionKey),
                ColumnDef::new("email", CqlType::Text, ColumnKind::Regular),
                ColumnDef::new("age", CqlType::Int, ColumnKind::Regular),
            ],
        )
    }

    #[test]
    fn test_no_diff_for_identical() {
        let v1 = users_v1();
        assert!(v1.diff(&v1).is_empty());
    }

    #[test]
    fn test_add_column_compatible() {
        let mut v2 = users_v1();
        v2.columns
            .push(ColumnDef::new("city", CqlType::Text, ColumnKind::Regular));

        let changes = users_v1().diff(&v2);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].op, ChangeOp::Add);
        assert_eq!(changes[0].column, "city");
        assert_eq!(changes[0].compatibility, Compatibility::Compatible);
    }

    #[test]
    fn test_drop_regular_column_compatible() {
        let mut v2 = users_v1();
        v2.columns.retain(|c| c.name != "age");

        let changes = users_v1().diff(&v2);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].op, ChangeOp::Drop);
        assert_eq!(changes[0].compatibility, Compatibility::Compatible);
    }

    #[test]
    fn test_drop_key_column_incompatible() {
        let mut v2 = users_v1();
        v2.columns.retain(|c| c.name != "user_id");

        let changes = users_v1().diff(&v2);
        assert_eq!(changes[0].op, ChangeOp::Drop);
        assert_eq!(changes[0].compatibility, Compatibility::Incompatible);
    }

    #[test]
    fn test_widening_alter_compatible() {
        let mut v2 = users_v1();
        v2.columns
            .iter_mut()
            .find(|c| c.name == "age")
            .unwrap()
            .cql_type = CqlType::BigInt;

        let changes = users_v1().diff(&v2);
        assert_eq!(changes[0].op, ChangeOp::AlterType);
        assert_eq!(changes[0].compatibility, Compatibility::Compatible);
    }

    #[test]
    fn test_narrowing_alter_incompatible() {
        let mut v2 = users_v1();
        v2.columns
            .iter_mut()
            .find(|c| c.name == "age")
            .unwrap()
            .cql_type = CqlType::Text;

        let changes = users_v1().diff(&v2);
        assert_eq!(changes[0].op, ChangeOp::AlterType);
        assert_eq!(changes[0].compatibility, Compatibility::Incompatible);
        assert_eq!(changes[0].old_type, Some(CqlType::Int));
        assert_eq!(changes[0].new_type, Some(CqlType::Text));
    }

    #[test]
    fn test_diff_order_drops_adds_alters() {
        let mut v2 = users_v1();
        // drop age, add two columns, alter email
        v2.columns.retain(|c| c.name != "age");
        v2.columns
            .push(ColumnDef::new("zeta", CqlType::Text, ColumnKind::Regular));
        v2.columns
            .push(ColumnDef::new("alpha", CqlType::Text, ColumnKind::Regular));
        v2.columns
            .iter_mut()
            .find(|c| c.name == "email")
            .unwrap()
            .cql_type = CqlType::Blob;

        let ops: Vec<(ChangeOp, String)> = users_v1()
            .diff(&v2)
            .into_iter()
            .map(|c| (c.op, c.column))
            .collect();
        assert_eq!(
            ops,
            vec![
                (ChangeOp::Drop, "age".to_string()),
                (ChangeOp::Add, "alpha".to_string()),
                (ChangeOp::Add, "zeta".to_string()),
                (ChangeOp::AlterType, "email".to_string()),
            ]
        );
    }

    #[test]
    fn test_schema_change_compatibility_summary() {
        let change = SchemaChange {
            keyspace: "ecommerce".into(),
            table: "users".into(),
            old_version: 1,
            new_version: 2,
            changes: vec![ColumnChange {
                op: ChangeOp::AlterType,
                column: "age".into(),
                old_type: Some(CqlType::Int),
                new_type: Some(CqlType::Text),
                compatibility: Compatibility::Incompatible,
            }],
        };
        assert!(!change.is_compatible());
        assert_eq!(change.incompatible_columns().count(), 1);
    }
}
