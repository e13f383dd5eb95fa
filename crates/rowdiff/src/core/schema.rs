//! Table schema model: column type classification and precision unification.
//!
//! Every driver reports columns through `information_schema`-shaped
//! metadata (type name, numeric precision/scale, datetime precision). The
//! classifier maps those strings onto a small canonical type set; the diff
//! façade then unifies precision pair-wise so both sides canonicalise to
//! the coarser representation before anything is hashed or compared.

use std::fmt;

use crate::core::value::KeyKind;
use crate::error::{DiffError, Result};

/// Default fractional-second digits when a timestamp column does not
/// declare a precision.
pub const DEFAULT_TIMESTAMP_PRECISION: u32 = 6;

/// Default rounding scale for floating-point columns, which declare no
/// scale of their own.
pub const DEFAULT_FLOAT_SCALE: u32 = 6;

/// Canonical column type classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    Decimal { scale: u32 },
    Float { scale: u32 },
    Timestamp { precision: u32 },
    Date,
    Boolean,
    Text,
    Uuid,
    /// Recognised by name but with no cross-database canonical form.
    /// Diffing such a column is a schema error.
    Unsupported(String),
}

impl ColumnType {
    /// The key domain this type parses into, if it is usable as a key.
    pub fn key_kind(&self) -> Option<KeyKind> {
        match self {
            ColumnType::Int => Some(KeyKind::Int),
            ColumnType::Text | ColumnType::Uuid => Some(KeyKind::Text),
            _ => None,
        }
    }

    /// Whether two classified types can be compared after canonicalisation.
    ///
    /// Same class is always fine; the numeric family (Int/Decimal/Float)
    /// inter-compares at unified scale; Text and Uuid inter-compare as
    /// strings. Everything else is rejected up front rather than guessed.
    pub fn comparable_with(&self, other: &ColumnType) -> bool {
        use ColumnType::*;
        match (self, other) {
            (Unsupported(_), _) | (_, Unsupported(_)) => false,
            (a, b) if std::mem::discriminant(a) == std::mem::discriminant(b) => true,
            (Int | Decimal { .. } | Float { .. }, Int | Decimal { .. } | Float { .. }) => true,
            (Text | Uuid, Text | Uuid) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Int => write!(f, "integer"),
            ColumnType::Decimal { scale } => write!(f, "decimal({scale})"),
            ColumnType::Float { scale } => write!(f, "float({scale})"),
            ColumnType::Timestamp { precision } => write!(f, "timestamp({precision})"),
            ColumnType::Date => write!(f, "date"),
            ColumnType::Boolean => write!(f, "boolean"),
            ColumnType::Text => write!(f, "text"),
            ColumnType::Uuid => write!(f, "uuid"),
            ColumnType::Unsupported(name) => write!(f, "unsupported({name})"),
        }
    }
}

/// Classify an `information_schema` type description.
pub fn classify_type(
    data_type: &str,
    numeric_scale: Option<u32>,
    datetime_precision: Option<u32>,
) -> ColumnType {
    let name = data_type.trim().to_lowercase();
    // MySQL reports e.g. "bigint unsigned"; strip the qualifier.
    let base = name
        .strip_suffix(" unsigned")
        .unwrap_or(&name)
        .split('(')
        .next()
        .unwrap_or(&name)
        .trim();

    match base {
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "int2" | "int4"
        | "int8" | "hugeint" | "serial" | "bigserial" => ColumnType::Int,
        "numeric" | "decimal" => ColumnType::Decimal {
            scale: numeric_scale.unwrap_or(0),
        },
        "real" | "float" | "float4" | "float8" | "double" | "double precision" => {
            ColumnType::Float {
                scale: numeric_scale.unwrap_or(DEFAULT_FLOAT_SCALE),
            }
        }
        "timestamp" | "timestamp without time zone" | "timestamp with time zone" | "timestamptz"
        | "datetime" | "datetime2" | "smalldatetime" => ColumnType::Timestamp {
            precision: datetime_precision.unwrap_or(DEFAULT_TIMESTAMP_PRECISION),
        },
        "date" => ColumnType::Date,
        "boolean" | "bool" | "bit" => ColumnType::Boolean,
        "uuid" | "uniqueidentifier" => ColumnType::Uuid,
        "text" | "varchar" | "character varying" | "char" | "character" | "nvarchar" | "nchar"
        | "string" | "tinytext" | "mediumtext" | "longtext" => ColumnType::Text,
        _ => ColumnType::Unsupported(name),
    }
}

/// Unify a comparable pair of column types onto the coarser side.
///
/// Returns the type both sides must canonicalise to: minimum timestamp
/// precision, minimum numeric scale. Returns an error for incomparable
/// pairs instead of guessing a coercion.
pub fn unify_types(name: &str, a: &ColumnType, b: &ColumnType) -> Result<ColumnType> {
    use ColumnType::*;

    if !a.comparable_with(b) {
        return Err(DiffError::schema(format!(
            "column '{name}' has incompatible types: {a} <-> {b}"
        )));
    }

    let unified = match (a, b) {
        (Timestamp { precision: p1 }, Timestamp { precision: p2 }) => Timestamp {
            precision: (*p1).min(*p2),
        },
        (Int, Int) => Int,
        // Mixed numeric family: compare at the minimum scale of the sides
        // that declare one. Int contributes scale 0.
        (
            Int | Decimal { .. } | Float { .. },
            Int | Decimal { .. } | Float { .. },
        ) => {
            let scale_of = |t: &ColumnType| match t {
                Int => 0,
                Decimal { scale } | Float { scale } => *scale,
                _ => unreachable!(),
            };
            let scale = scale_of(a).min(scale_of(b));
            if matches!((a, b), (Float { .. }, _) | (_, Float { .. })) {
                Float { scale }
            } else {
                Decimal { scale }
            }
        }
        (Uuid, _) | (_, Uuid) => Uuid,
        (t, _) => t.clone(),
    };
    Ok(unified)
}

/// One column of a discovered table schema.
#[derive(Debug, Clone)]
pub struct ColumnSchema {
    pub name: String,
    pub col_type: ColumnType,
}

/// Discovered schema of one table, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct TableSchema {
    columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnSchema>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    /// Resolve a column by name. With `case_sensitive = false` the lookup
    /// ignores case and the schema's spelling wins.
    pub fn resolve(&self, name: &str, case_sensitive: bool) -> Option<&ColumnSchema> {
        if case_sensitive {
            self.columns.iter().find(|c| c.name == name)
        } else {
            self.columns
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(name))
        }
    }

    /// Replace a column's type (used by precision unification).
    pub fn override_type(&mut self, name: &str, col_type: ColumnType) {
        if let Some(col) = self.columns.iter_mut().find(|c| c.name == name) {
            col.col_type = col_type;
        }
    }
}

/// Path of a table inside a database: optional schema plus table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TablePath {
    pub schema: Option<String>,
    pub table: String,
}

impl TablePath {
    /// Parse `"table"` or `"schema.table"`.
    pub fn parse(path: &str) -> Result<TablePath> {
        let mut parts = path.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(table), None, _) if !table.is_empty() => Ok(TablePath {
                schema: None,
                table: table.to_string(),
            }),
            (Some(schema), Some(table), None) if !schema.is_empty() && !table.is_empty() => {
                Ok(TablePath {
                    schema: Some(schema.to_string()),
                    table: table.to_string(),
                })
            }
            _ => Err(DiffError::config(format!("invalid table path: '{path}'"))),
        }
    }
}

impl fmt::Display for TablePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.table),
            None => write!(f, "{}", self.table),
        }
    }
}

/// Match a SQL LIKE pattern (`%` and `_` wildcards) against a column name.
/// Used to expand `-c/--columns` patterns against the discovered schema.
pub fn like_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'%'), _) => inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..])),
            (Some(b'_'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(c), Some(d)) if c.eq_ignore_ascii_case(d) => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}
