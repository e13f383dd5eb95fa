//! Identifier validation shared by the dialect adapters.
//!
//! SQL identifiers cannot be passed as query parameters, so every table
//! and column name that reaches a generated query is validated here once,
//! at segment construction, and then quoted by the owning dialect.

use crate::error::{DiffError, Result};

/// Maximum identifier length (conservative limit across databases).
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Validate an identifier for use in generated SQL.
///
/// Rejects empty identifiers, identifiers containing null bytes, and
/// identifiers exceeding the maximum length.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DiffError::config("identifier cannot be empty"));
    }

    if name.contains('\0') {
        return Err(DiffError::config(format!(
            "identifier contains null byte (possible injection attempt): {name:?}"
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(DiffError::config(format!(
            "identifier exceeds maximum length of {MAX_IDENTIFIER_LENGTH} bytes: {name:?}"
        )));
    }

    Ok(())
}

/// Quote with double quotes, doubling embedded quotes (PostgreSQL, DuckDB).
pub fn quote_double(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote with backticks, doubling embedded backticks (MySQL).
pub fn quote_backtick(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_normal() {
        assert!(validate_identifier("rating").is_ok());
        assert!(validate_identifier("updated_at").is_ok());
        assert!(validate_identifier("column with spaces").is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_bad_input() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("a\0b").is_err());
        assert!(validate_identifier(&"x".repeat(MAX_IDENTIFIER_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_quote_double_escapes() {
        assert_eq!(quote_double("users"), "\"users\"");
        assert_eq!(quote_double("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_quote_backtick_escapes() {
        assert_eq!(quote_backtick("users"), "`users`");
        assert_eq!(quote_backtick("a`b"), "`a``b`");
    }
}
