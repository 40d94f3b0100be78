//! Typed column values.
//!
//! Every decoded value carries its source (CQL) type tag so downstream
//! mappers can translate per destination and the validator can reject
//! unsupported types. Tuples, counters, and collections are preserved
//! verbatim; whether a destination accepts them is decided later.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Source column type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CqlType {
    Text,
    Int,
    BigInt,
    Float,
    Double,
    Decimal,
    Boolean,
    Uuid,
    Timestamp,
    Blob,
    List,
    Set,
    Map,
    Tuple,
    Counter,
}

impl CqlType {
    /// Canonical lowercase name, as it appears in the source catalog.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Int => "int",
            Self::BigInt => "bigint",
            Self::Float => "float",
            Self::Double => "double",
            Self::Decimal => "decimal",
            Self::Boolean => "boolean",
            Self::Uuid => "uuid",
            Self::Timestamp => "timestamp",
            Self::Blob => "blob",
            Self::List => "list",
            Self::Set => "set",
            Self::Map => "map",
            Self::Tuple => "tuple",
            Self::Counter => "counter",
        }
    }

    /// Parse a catalog type name. Parameterized collection types
    /// (`list<int>`, `map<text, int>`) resolve to their outer kind.
    pub fn parse(name: &str) -> Option<Self> {
        let base = name.split('<').next().unwrap_or(name).trim();
        match base.to_ascii_lowercase().as_str() {
            "text" | "varchar" | "ascii" => Some(Self::Text),
            "int" => Some(Self::Int),
            "bigint" => Some(Self::BigInt),
            "float" => Some(Self::Float),
            "double" => Some(Self::Double),
            "decimal" => Some(Self::Decimal),
            "boolean" => Some(Self::Boolean),
            "uuid" | "timeuuid" => Some(Self::Uuid),
            "timestamp" => Some(Self::Timestamp),
            "blob" => Some(Self::Blob),
            "list" => Some(Self::List),
            "set" => Some(Self::Set),
            "map" => Some(Self::Map),
            "tuple" => Some(Self::Tuple),
            "counter" => Some(Self::Counter),
            _ => None,
        }
    }

    /// Whether replacing a column of type `self` with `other` only widens
    /// the representable range (or is an equivalent transform).
    ///
    /// This is the shared compatibility matrix the schema monitor and the
    /// destination mappers classify alter-type changes against.
    pub fn widens_to(&self, other: CqlType) -> bool {
        if *self == other {
            return true;
        }
        matches!(
            (self, other),
            (Self::Int, Self::BigInt)
                | (Self::Int, Self::Double)
                | (Self::Float, Self::Double)
                | (Self::Decimal, Self::Double)
                | (Self::Text, Self::Blob)
        )
    }
}

impl fmt::Display for CqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded column value.
///
/// Timestamps are microseconds since epoch; decimals keep their text form to
/// preserve precision; blobs are raw bytes (hex-encoded on the wire for JSON).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CqlValue {
    Null,
    Text(String),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Decimal(String),
    Boolean(bool),
    Uuid(uuid::Uuid),
    Timestamp(i64),
    #[serde(with = "hex_bytes")]
    Blob(Vec<u8>),
    List(Vec<CqlValue>),
    Set(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
    Tuple(Vec<CqlValue>),
    Counter(i64),
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

impl CqlValue {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The type tag this value decodes under, if it carries one.
    /// `Null` carries none; the enclosing [`Column`] keeps the declared type.
    pub fn tag(&self) -> Option<CqlType> {
        match self {
            Self::Null => None,
            Self::Text(_) => Some(CqlType::Text),
            Self::Int(_) => Some(CqlType::Int),
            Self::BigInt(_) => Some(CqlType::BigInt),
            Self::Float(_) => Some(CqlType::Float),
            Self::Double(_) => Some(CqlType::Double),
            Self::Decimal(_) => Some(CqlType::Decimal),
            Self::Boolean(_) => Some(CqlType::Boolean),
            Self::Uuid(_) => Some(CqlType::Uuid),
            Self::Timestamp(_) => Some(CqlType::Timestamp),
            Self::Blob(_) => Some(CqlType::Blob),
            Self::List(_) => Some(CqlType::List),
            Self::Set(_) => Some(CqlType::Set),
            Self::Map(_) => Some(CqlType::Map),
            Self::Tuple(_) => Some(CqlType::Tuple),
            Self::Counter(_) => Some(CqlType::Counter),
        }
    }

    /// Deterministic byte form used for digesting and identity derivation.
    ///
    /// Scalars use their text form, blobs their raw bytes. Sets and maps are
    /// canonicalized (sorted lexicographically / by key) so logically equal
    /// values digest identically regardless of decode order.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            Self::Blob(b) => b.clone(),
            Self::List(items) | Self::Tuple(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.canonical_string()).collect();
                format!("[{}]", parts.join(",")).into_bytes()
            }
            Self::Set(items) => {
                let mut parts: Vec<String> = items.iter().map(|v| v.canonical_string()).collect();
                parts.sort();
                format!("{{{}}}", parts.join(",")).into_bytes()
            }
            Self::Map(entries) => {
                let mut parts: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{}:{}", k.canonical_string(), v.canonical_string()))
                    .collect();
                parts.sort();
                format!("{{{}}}", parts.join(",")).into_bytes()
            }
            other => other.canonical_string().into_bytes(),
        }
    }

    fn canonical_string(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Text(s) | Self::Decimal(s) => s.clone(),
            Self::Int(v) => v.to_string(),
            Self::BigInt(v) | Self::Timestamp(v) | Self::Counter(v) => v.to_string(),
            Self::Float(v) => format!("{v}"),
            Self::Double(v) => format!("{v}"),
            Self::Boolean(v) => v.to_string(),
            Self::Uuid(u) => u.to_string(),
            Self::Blob(b) => hex::encode(b),
            collection => String::from_utf8_lossy(&collection.canonical_bytes()).into_owned(),
        }
    }

    /// JSON rendering for destinations that store composite values in a
    /// JSON-typed column.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::{json, Value};
        match self {
            Self::Null => Value::Null,
            Self::Text(s) | Self::Decimal(s) => json!(s),
            Self::Int(v) => json!(v),
            Self::BigInt(v) | Self::Timestamp(v) | Self::Counter(v) => json!(v),
            Self::Float(v) => json!(v),
            Self::Double(v) => json!(v),
            Self::Boolean(v) => json!(v),
            Self::Uuid(u) => json!(u.to_string()),
            Self::Blob(b) => json!(hex::encode(b)),
            Self::List(items) | Self::Tuple(items) | Self::Set(items) => {
                Value::Array(items.iter().map(|v| v.to_json()).collect())
            }
            Self::Map(entries) => {
                let mut obj = serde_json::Map::new();
                for (k, v) in entries {
                    obj.insert(k.canonical_string(), v.to_json());
                }
                Value::Object(obj)
            }
        }
    }
}

/// One named, typed cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub cql_type: CqlType,
    pub value: CqlValue,
}

impl Column {
    pub fn new(name: impl Into<String>, cql_type: CqlType, value: CqlValue) -> Self {
        Self {
            name: name.into(),
            cql_type,
            value,
        }
    }
}

/// An ordered column→value mapping.
///
/// Order is the declaration order from the source; partition and clustering
/// keys rely on it for identity derivation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Row(Vec<Column>);

impl Row {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_columns(columns: Vec<Column>) -> Self {
        Self(columns)
    }

    /// Append a cell, replacing any existing cell with the same name.
    pub fn set(&mut self, column: Column) {
        if let Some(existing) = self.0.iter_mut().find(|c| c.name == column.name) {
            *existing = column;
        } else {
            self.0.push(column);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.0.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Column> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|c| c.name.as_str())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Deterministic `name=value` byte form, cells in declaration order.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, cell) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(b';');
            }
            out.extend_from_slice(cell.name.as_bytes());
            out.push(b'=');
            out.extend_from_slice(&cell.value.canonical_bytes());
        }
        out
    }
}

impl<'a> IntoIterator for &'a Row {
    type Item = &'a Column;
    type IntoIter = std::slice::Iter<'a, Column>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<Column> for Row {
    fn from_iter<T: IntoIterator<Item = Column>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
