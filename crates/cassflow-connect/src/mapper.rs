//! Source→destination type mapping.
//!
//! A static table per destination family. The time-series mapper inherits
//! the relational table with explicit overrides; collections map to a
//! destination-native JSON type where one exists; tuple and counter types
//! are unsupported everywhere and rejected by the validator.

use cassflow_core::{CqlType, Destination};

/// Table-driven type translator for one destination.
#[derive(Debug, Clone, Copy)]
pub struct TypeMapper {
    destination: Destination,
}

impl TypeMapper {
    pub fn new(destination: Destination) -> Self {
        Self { destination }
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }

    /// Destination DDL type for a source type, or `None` if unsupported.
    pub fn map(&self, t: CqlType) -> Option<&'static str> {
        match self.destination {
            Destination::Postgres => relational(t),
            Destination::Timescaledb => timescale(t),
            Destination::Clickhouse => columnar(t),
        }
    }

    /// Whether an alter from `old` to `new` is a widening (or equivalent)
    /// transform this destination can follow with a cast.
    pub fn is_widening(&self, old: CqlType, new: CqlType) -> bool {
        old.widens_to(new) && self.map(new).is_some()
    }
}

fn relational(t: CqlType) -> Option<&'static str> {
    Some(match t {
        CqlType::Text => "text",
        CqlType::Int => "integer",
        CqlType::BigInt => "bigint",
        CqlType::Float => "real",
        CqlType::Double => "double precision",
        // equivalent transform; source decimals arrive in text form and are
        // bound as float8
        CqlType::Decimal => "double precision",
        CqlType::Boolean => "boolean",
        CqlType::Uuid => "uuid",
        CqlType::Timestamp => "timestamptz",
        CqlType::Blob => "bytea",
        CqlType::List | CqlType::Set | CqlType::Map => "jsonb",
        CqlType::Tuple | CqlType::Counter => return None,
    })
}

/// Time-series family: the relational table with per-key overrides.
fn timescale(t: CqlType) -> Option<&'static str> {
    match t {
        // timestamps prefer the timezone-aware form; already the relational
        // choice, kept explicit so the override survives relational edits
        CqlType::Timestamp => Some("timestamptz"),
        other => relational(other),
    }
}

fn columnar(t: CqlType) -> Option<&'static str> {
    Some(match t {
        CqlType::Text => "String",
        CqlType::Int => "Int32",
        CqlType::BigInt => "Int64",
        CqlType::Float => "Float32",
        CqlType::Double => "Float64",
        CqlType::Decimal => "Decimal(38, 10)",
        CqlType::Boolean => "Bool",
        CqlType::Uuid => "UUID",
        CqlType::Timestamp => "DateTime64(6, 'UTC')",
        CqlType::Blob => "String",
        // no stable JSON column type; composite values are stored as their
        // JSON rendering
        CqlType::List | CqlType::Set | CqlType::Map => "String",
        CqlType::Tuple | CqlType::Counter => return None,
    })
}
