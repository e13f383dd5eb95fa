//! Database-agnostic core: value model, schema model, checksum protocol,
//! and the traits the drivers implement.

pub mod checksum;
pub mod identifier;
pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{classify_type, like_match, unify_types, ColumnSchema, ColumnType, TablePath, TableSchema};
pub use traits::{Connection, Dialect};
pub use value::{DbValue, Key, KeyBound, KeyKind, KeyValue, Row};
