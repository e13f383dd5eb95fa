//! DuckDB SQL dialect (Strategy pattern).

use crate::core::checksum::{CHECKSUM_HEX_DIGITS, CHECKSUM_HEX_OFFSET, CHECKSUM_MODULUS};
use crate::core::identifier::quote_double;
use crate::core::schema::{ColumnType, TablePath};
use crate::core::traits::Dialect;
use crate::drivers::common::{sql_string, timestamp_canonical_len};

/// DuckDB dialect implementation.
///
/// The hex parse relies on DuckDB's `'0x…'` VARCHAR-to-integer cast.
#[derive(Debug, Clone, Copy, Default)]
pub struct DuckDbDialect;

impl DuckDbDialect {
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for DuckDbDialect {
    fn name(&self) -> &'static str {
        "duckdb"
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
        format!(
            "bit_xor(CAST('0x' || SUBSTRING(MD5({expr}), {offset}, {digits}) AS BIGINT) % {modulus})",
            offset = CHECKSUM_HEX_OFFSET,
            digits = CHECKSUM_HEX_DIGITS,
            modulus = CHECKSUM_MODULUS,
        )
    }

    fn render_canonical(&self, expr: &str, col_type: &ColumnType, case_sensitive: bool) -> String {
        match col_type {
            ColumnType::Int => format!("CAST({expr} AS VARCHAR)"),
            ColumnType::Decimal { scale } | ColumnType::Float { scale } => {
                if *scale == 0 {
                    format!("CAST(CAST(ROUND({expr}, 0) AS DECIMAL(38, 0)) AS VARCHAR)")
                } else {
                    format!(
                        "RTRIM(RTRIM(CAST(CAST(ROUND({expr}, {scale}) AS DECIMAL(38, {scale})) \
                         AS VARCHAR), '0'), '.')"
                    )
                }
            }
            ColumnType::Timestamp { precision } => {
                let len = timestamp_canonical_len(*precision);
                format!("SUBSTRING(STRFTIME({expr}, '%Y-%m-%d %H:%M:%S.%f'), 1, {len})")
            }
            ColumnType::Date => format!("STRFTIME({expr}, '%Y-%m-%d')"),
            ColumnType::Boolean => format!(
                "CASE WHEN {expr} IS NULL THEN NULL WHEN {expr} THEN '1' ELSE '0' END"
            ),
            ColumnType::Uuid => format!("LOWER(CAST({expr} AS VARCHAR))"),
            ColumnType::Text if !case_sensitive => format!("LOWER(CAST({expr} AS VARCHAR))"),
            ColumnType::Text | ColumnType::Unsupported(_) => format!("CAST({expr} AS VARCHAR)"),
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
            "SELECT column_name, data_type, numeric_scale, datetime_precision \
             FROM information_schema.columns \
             WHERE table_name = {table} AND table_schema = {schema_filter} \
             ORDER BY ordinal_position"
        )
    }

    fn supports_approx_median(&self) -> bool {
        true
    }

    fn supports_tablesample(&self) -> bool {
        true
    }

    fn supports_full_outer_join(&self) -> bool {
        true
    }
}
