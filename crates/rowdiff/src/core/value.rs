//! Value types flowing between the drivers and the diff algorithms.
//!
//! All non-aggregate projections are canonicalised to text inside the
//! database (see the dialect adapters), so a downloaded row is simply a
//! vector of optional strings. Typed values only appear in two places:
//! aggregate query results (counts, checksums, key bounds) and parsed key
//! values used for range arithmetic and merge-join ordering.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{DiffError, Result};

/// A scalar cell of an aggregate query result.
///
/// Drivers decode integer-typed result columns to `Int` and everything
/// else to its text rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Int(i64),
    Text(String),
}

impl DbValue {
    /// Interpret the value as an i64, if possible.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            DbValue::Int(v) => Some(*v),
            DbValue::Text(s) => s.trim().parse().ok(),
            DbValue::Null => None,
        }
    }

    /// Interpret the value as text. `Null` yields `None`.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DbValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Render the value the way it appears in downloaded rows.
    pub fn into_cell(self) -> Option<String> {
        match self {
            DbValue::Null => None,
            DbValue::Int(v) => Some(v.to_string()),
            DbValue::Text(s) => Some(s),
        }
    }
}

/// A downloaded row: canonicalised column values in projection order,
/// `None` for SQL NULL.
pub type Row = Vec<Option<String>>;

/// The scalar domain a key column is parsed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Integer keys, kept as i128 so checkpoint arithmetic never overflows
    /// an i64 key domain.
    Int,
    /// Strings and UUIDs rendered as strings, ordered bytewise.
    Text,
}

/// A single key column value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    Int(i128),
    Text(String),
}

impl KeyValue {
    /// Parse a canonicalised cell into a key value of the given kind.
    pub fn parse(cell: &str, kind: KeyKind) -> Result<KeyValue> {
        match kind {
            KeyKind::Int => cell
                .trim()
                .parse::<i128>()
                .map(KeyValue::Int)
                .map_err(|_| DiffError::Overflow(format!("cannot parse key value '{cell}' as an integer"))),
            KeyKind::Text => Ok(KeyValue::Text(cell.to_string())),
        }
    }

    /// Render the value as a SQL literal.
    pub fn to_sql_literal(&self) -> String {
        match self {
            KeyValue::Int(v) => v.to_string(),
            KeyValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{v}"),
            KeyValue::Text(s) => write!(f, "{s}"),
        }
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyValue::Int(a), KeyValue::Int(b)) => a.cmp(b),
            (KeyValue::Text(a), KeyValue::Text(b)) => a.cmp(b),
            // Mixed kinds never meet in a validated diff; give them a
            // stable order anyway so sorting cannot panic.
            (KeyValue::Int(_), KeyValue::Text(_)) => Ordering::Less,
            (KeyValue::Text(_), KeyValue::Int(_)) => Ordering::Greater,
        }
    }
}

/// A full key: one value per key column, compared lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(pub Vec<KeyValue>);

impl Key {
    pub fn single(v: KeyValue) -> Self {
        Key(vec![v])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse a key from the leading cells of a downloaded row.
    pub fn from_row(row: &[Option<String>], kinds: &[KeyKind]) -> Result<Key> {
        let mut values = Vec::with_capacity(kinds.len());
        for (i, kind) in kinds.iter().enumerate() {
            let cell = row
                .get(i)
                .and_then(|c| c.as_deref())
                .ok_or_else(|| DiffError::schema(format!("NULL in key column {i}")))?;
            values.push(KeyValue::parse(cell, *kind)?);
        }
        Ok(Key(values))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() == 1 {
            return write!(f, "{}", self.0[0]);
        }
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

/// Upper bound of a key range.
///
/// Interior checkpoints are always `Excluded` (half-open ranges). The root
/// bound is `Excluded(max+1)` for integer keys and `Included(max)` for text
/// keys, which have no cheap successor value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyBound {
    Unbounded,
    Excluded(Key),
    Included(Key),
}

impl KeyBound {
    pub fn is_bounded(&self) -> bool {
        !matches!(self, KeyBound::Unbounded)
    }

    pub fn key(&self) -> Option<&Key> {
        match self {
            KeyBound::Unbounded => None,
            KeyBound::Excluded(k) | KeyBound::Included(k) => Some(k),
        }
    }

    /// Whether `key` lies below this upper bound.
    pub fn admits(&self, key: &Key) -> bool {
        match self {
            KeyBound::Unbounded => true,
            KeyBound::Excluded(k) => key < k,
            KeyBound::Included(k) => key <= k,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_value_parse_int() {
        assert_eq!(
            KeyValue::parse("42", KeyKind::Int).unwrap(),
            KeyValue::Int(42)
        );
        assert_eq!(
            KeyValue::parse(" -7 ", KeyKind::Int).unwrap(),
            KeyValue::Int(-7)
        );
        assert!(KeyValue::parse("abc", KeyKind::Int).is_err());
    }

    #[test]
    fn test_key_value_int_order_is_numeric() {
        let nine = KeyValue::parse("9", KeyKind::Int).unwrap();
        let ten = KeyValue::parse("10", KeyKind::Int).unwrap();
        assert!(nine < ten);
    }

    #[test]
    fn test_key_lexicographic_order() {
        let a = Key(vec![KeyValue::Int(1), KeyValue::Int(9)]);
        let b = Key(vec![KeyValue::Int(2), KeyValue::Int(0)]);
        assert!(a < b);
    }

    #[test]
    fn test_key_bound_admits() {
        let k5 = Key::single(KeyValue::Int(5));
        let k6 = Key::single(KeyValue::Int(6));
        assert!(KeyBound::Unbounded.admits(&k6));
        assert!(KeyBound::Excluded(k6.clone()).admits(&k5));
        assert!(!KeyBound::Excluded(k5.clone()).admits(&k5));
        assert!(KeyBound::Included(k5.clone()).admits(&k5));
    }

    #[test]
    fn test_sql_literal_escaping() {
        assert_eq!(KeyValue::Int(3).to_sql_literal(), "3");
        assert_eq!(
            KeyValue::Text("o'neil".into()).to_sql_literal(),
            "'o''neil'"
        );
    }

    #[test]
    fn test_key_from_row_rejects_null_key() {
        let row: Row = vec![None, Some("x".into())];
        assert!(Key::from_row(&row, &[KeyKind::Int]).is_err());
    }

    #[test]
    fn test_db_value_coercions() {
        assert_eq!(DbValue::Int(3).as_int(), Some(3));
        assert_eq!(DbValue::Text("17".into()).as_int(), Some(17));
        assert_eq!(DbValue::Null.as_int(), None);
        assert_eq!(DbValue::Int(3).into_cell(), Some("3".to_string()));
        assert_eq!(DbValue::Null.into_cell(), None);
    }
}
