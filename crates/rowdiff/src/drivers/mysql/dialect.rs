//! MySQL SQL dialect (Strategy pattern).

use crate::core::checksum::{CHECKSUM_HEX_OFFSET, CHECKSUM_MODULUS};
use crate::core::identifier::quote_backtick;
use crate::core::schema::{ColumnType, TablePath};
use crate::core::traits::Dialect;

use crate::drivers::common::{sql_string, timestamp_canonical_len};

/// MySQL dialect implementation.
///
/// MySQL has no FULL OUTER JOIN, so same-connection MySQL pairs always
/// diff with the hash algorithm.
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlDialect;

impl MysqlDialect {
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for MysqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_ident(&self, name: &str) -> String {
        quote_backtick(name)
    }

    fn render_random(&self) -> &'static str {
        "RAND()"
    }

    fn render_concat(&self, parts: &[String]) -> String {
        // Parts are COALESCE-wrapped and never NULL, so CONCAT_WS's
        // NULL-skipping cannot drop a field.
        format!("CONCAT_WS('|', {})", parts.join(", "))
    }

    fn render_checksum(&self, expr: &str) -> String {
        format!(
            "BIT_XOR(CAST(CONV(SUBSTRING(MD5({expr}), {offset}), 16, 10) AS SIGNED) % {modulus})",
            offset = CHECKSUM_HEX_OFFSET,
            modulus = CHECKSUM_MODULUS,
        )
    }

    fn render_canonical(&self, expr: &str, col_type: &ColumnType, case_sensitive: bool) -> String {
        match col_type {
            ColumnType::Int => format!("CAST({expr} AS CHAR)"),
            ColumnType::Decimal { scale } | ColumnType::Float { scale } => {
                if *scale == 0 {
                    format!("CAST(CAST({expr} AS DECIMAL(65, 0)) AS CHAR)")
                } else {
                    format!(
                        "TRIM(TRAILING '.' FROM TRIM(TRAILING '0' FROM \
                         CAST(CAST({expr} AS DECIMAL(65, {scale})) AS CHAR)))"
                    )
                }
            }
            ColumnType::Timestamp { precision } => {
                let len = timestamp_canonical_len(*precision);
                format!("SUBSTRING(DATE_FORMAT({expr}, '%Y-%m-%d %H:%i:%S.%f'), 1, {len})")
            }
            ColumnType::Date => format!("DATE_FORMAT({expr}, '%Y-%m-%d')"),
            // BIT(1) columns render as binary strings under a plain CHAR
            // cast; go through UNSIGNED first.
            ColumnType::Boolean => format!("CAST(CAST({expr} AS UNSIGNED) AS CHAR)"),
            ColumnType::Uuid => format!("LOWER(CAST({expr} AS CHAR))"),
            ColumnType::Text if !case_sensitive => format!("LOWER(CAST({expr} AS CHAR))"),
            ColumnType::Text | ColumnType::Unsupported(_) => format!("CAST({expr} AS CHAR)"),
        }
    }

    fn render_is_distinct(&self, a: &str, b: &str) -> String {
        format!("NOT ({a} <=> {b})")
    }

    fn render_count_distinct(&self, cols: &[String]) -> String {
        format!("COUNT(DISTINCT {})", cols.join(", "))
    }

    fn render_type(&self, name: &str) -> String {
        match name.to_lowercase().as_str() {
            "text" => "LONGTEXT".to_string(),
            other => other.to_uppercase(),
        }
    }

    fn schema_query(&self, path: &TablePath) -> String {
        let table = sql_string(&path.table);
        let schema_filter = match &path.schema {
            Some(schema) => sql_string(schema),
            None => "DATABASE()".to_string(),
        };
        format!(
            "SELECT column_name, data_type, numeric_scale, datetime_precision \
             FROM information_schema.columns \
             WHERE table_name = {table} AND table_schema = {schema_filter} \
             ORDER BY ordinal_position"
        )
    }

    fn supports_full_outer_join(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_uses_conv_and_bit_xor() {
        let d = MysqlDialect::new();
        let sql = d.render_checksum("CONCAT_WS('|', `id`)");
        assert!(sql.starts_with("BIT_XOR("));
        assert!(sql.contains("CONV(SUBSTRING(MD5"));
        assert!(sql.contains(", 18)"));
        assert!(sql.contains("% 2305843009213693951"));
    }

    #[test]
    fn test_is_distinct_uses_null_safe_equal() {
        let d = MysqlDialect::new();
        assert_eq!(d.render_is_distinct("a.`x`", "b.`x`"), "NOT (a.`x` <=> b.`x`)");
    }

    #[test]
    fn test_boolean_goes_through_unsigned() {
        let d = MysqlDialect::new();
        let sql = d.render_canonical("`flag`", &ColumnType::Boolean, true);
        assert!(sql.contains("AS UNSIGNED"));
    }

    #[test]
    fn test_no_full_outer_join() {
        assert!(!MysqlDialect::new().supports_full_outer_join());
    }

    #[test]
    fn test_concat_ws() {
        let d = MysqlDialect::new();
        assert_eq!(
            d.render_concat(&["a".into(), "b".into()]),
            "CONCAT_WS('|', a, b)"
        );
    }

    #[test]
    fn test_schema_query_defaults_to_current_database() {
        let d = MysqlDialect::new();
        let sql = d.schema_query(&TablePath::parse("rating").unwrap());
        assert!(sql.contains("DATABASE()"));
    }
}
