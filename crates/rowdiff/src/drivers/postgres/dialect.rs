//! PostgreSQL SQL dialect (Strategy pattern).

use crate::core::checksum::{CHECKSUM_HEX_OFFSET, CHECKSUM_MODULUS};
use crate::core::identifier::quote_double;
use crate::core::schema::{ColumnType, TablePath};
use crate::core::traits::Dialect;
use crate::drivers::common::{sql_string, timestamp_canonical_len};

/// PostgreSQL dialect implementation.
///
/// Requires PostgreSQL 14+ for the `bit_xor` aggregate.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn quote_ident(&self, name: &str) -> String {
        quote_double(name)
    }

    fn render_random(&self) -> &'static str {
        "RANDOM()"
    }

    fn render_concat(&self, parts: &[String]) -> String {
        parts.join(" || '|' || ")
    }

    fn render_checksum(&self, expr: &str) -> String {
        // md5 hex tail -> 60-bit integer via the 'x' || hex -> bit cast.
        format!(
            "bit_xor(('x' || SUBSTRING(MD5({expr}) FROM {offset}))::bit(60)::bigint % {modulus})",
            offset = CHECKSUM_HEX_OFFSET,
            modulus = CHECKSUM_MODULUS,
        )
    }

    fn render_canonical(&self, expr: &str, col_type: &ColumnType, case_sensitive: bool) -> String {
        match col_type {
            ColumnType::Int => format!("CAST({expr} AS TEXT)"),
            ColumnType::Decimal { scale } | ColumnType::Float { scale } => {
                if *scale == 0 {
                    format!("CAST(ROUND(CAST({expr} AS NUMERIC), 0) AS TEXT)")
                } else {
                    // scale > 0 guarantees a decimal point, so trimming
                    // trailing zeros cannot eat integer digits.
                    format!(
                        "RTRIM(RTRIM(CAST(ROUND(CAST({expr} AS NUMERIC), {scale}) AS TEXT), '0'), '.')"
                    )
                }
            }
            ColumnType::Timestamp { precision } => {
                let len = timestamp_canonical_len(*precision);
                format!("SUBSTRING(TO_CHAR({expr}, 'YYYY-MM-DD HH24:MI:SS.US') FOR {len})")
            }
            ColumnType::Date => format!("TO_CHAR({expr}, 'YYYY-MM-DD')"),
            ColumnType::Boolean => format!(
                "CASE WHEN {expr} IS NULL THEN NULL WHEN {expr} THEN '1' ELSE '0' END"
            ),
            ColumnType::Uuid => format!("LOWER(CAST({expr} AS TEXT))"),
            ColumnType::Text if !case_sensitive => format!("LOWER(CAST({expr} AS TEXT))"),
            ColumnType::Text | ColumnType::Unsupported(_) => format!("CAST({expr} AS TEXT)"),
        }
    }

    fn render_count_distinct(&self, cols: &[String]) -> String {
        if cols.len() == 1 {
            format!("COUNT(DISTINCT {})", cols[0])
        } else {
            format!("COUNT(DISTINCT ({}))", cols.join(", "))
        }
    }

    fn schema_query(&self, path: &TablePath) -> String {
        let table = sql_string(&path.table);
        let schema_filter = match &path.schema {
            Some(schema) => sql_string(schema),
            None => "current_schema()".to_string(),
        };
        format!(
            "SELECT column_name::text, data_type::text, numeric_scale::int, datetime_precision::int \
             FROM information_schema.columns \
             WHERE table_name = {table} AND table_schema = {schema_filter} \
             ORDER BY ordinal_position"
        )
    }

    fn supports_tablesample(&self) -> bool {
        true
    }

    fn supports_full_outer_join(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_structure() {
        let d = PostgresDialect::new();
        let sql = d.render_checksum("\"id\" || '|' || \"name\"");
        assert!(sql.starts_with("bit_xor("));
        assert!(sql.contains("MD5"));
        assert!(sql.contains("FROM 18"));
        assert!(sql.contains("bit(60)"));
        assert!(sql.contains("% 2305843009213693951"));
    }

    #[test]
    fn test_canonical_int_and_text() {
        let d = PostgresDialect::new();
        assert_eq!(
            d.render_canonical("\"id\"", &ColumnType::Int, true),
            "CAST(\"id\" AS TEXT)"
        );
        assert_eq!(
            d.render_canonical("\"name\"", &ColumnType::Text, false),
            "LOWER(CAST(\"name\" AS TEXT))"
        );
    }

    #[test]
    fn test_canonical_decimal_trims_only_with_fraction() {
        let d = PostgresDialect::new();
        let with_scale = d.render_canonical("\"amount\"", &ColumnType::Decimal { scale: 2 }, true);
        assert!(with_scale.contains("ROUND"));
        assert!(with_scale.contains("RTRIM"));

        let scale_zero = d.render_canonical("\"amount\"", &ColumnType::Decimal { scale: 0 }, true);
        assert!(!scale_zero.contains("RTRIM"));
    }

    #[test]
    fn test_canonical_timestamp_truncates_to_precision() {
        let d = PostgresDialect::new();
        let sql = d.render_canonical("\"ts\"", &ColumnType::Timestamp { precision: 3 }, true);
        assert!(sql.contains("FOR 23"));
        let sql = d.render_canonical("\"ts\"", &ColumnType::Timestamp { precision: 0 }, true);
        assert!(sql.contains("FOR 19"));
    }

    #[test]
    fn test_boolean_preserves_null() {
        let d = PostgresDialect::new();
        let sql = d.render_canonical("\"flag\"", &ColumnType::Boolean, true);
        assert!(sql.contains("IS NULL THEN NULL"));
    }

    #[test]
    fn test_count_distinct_compound() {
        let d = PostgresDialect::new();
        assert_eq!(
            d.render_count_distinct(&["\"a\"".into(), "\"b\"".into()]),
            "COUNT(DISTINCT (\"a\", \"b\"))"
        );
    }

    #[test]
    fn test_schema_query_defaults_to_current_schema() {
        let d = PostgresDialect::new();
        let sql = d.schema_query(&TablePath::parse("rating").unwrap());
        assert!(sql.contains("current_schema()"));
        let sql = d.schema_query(&TablePath::parse("public.rating").unwrap());
        assert!(sql.contains("'public'"));
        assert!(sql.contains("ORDER BY ordinal_position"));
    }
}
