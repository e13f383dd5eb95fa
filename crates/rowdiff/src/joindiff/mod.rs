//! JoinDiff: same-database diffing through one full outer join.
//!
//! When both tables live on the same connection, the whole diff is a
//! single query: a FULL OUTER JOIN over the key columns whose WHERE
//! clause isolates exclusive and mismatching rows. Optionally the diff
//! (or every row, annotated) is materialised into a table on the same
//! database.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::core::traits::Dialect;
use crate::core::value::Row;
use crate::differ::{DiffOptions, DiffRecord, DiffSink, Sign};
use crate::drivers::Database;
use crate::error::{DiffError, Result};
use crate::segment::TableSegment;

const LEFT_ALIAS: &str = "__rd_a";
const RIGHT_ALIAS: &str = "__rd_b";

/// Same-database outer-join differ.
#[derive(Default)]
pub struct JoinDiffer {
    materialize: Option<String>,
    materialize_all_rows: bool,
    sample_exclusive_rows: bool,
    sample_size: u64,
    table_write_limit: Option<u64>,
    assume_unique_key: bool,
}

impl JoinDiffer {
    pub fn new() -> JoinDiffer {
        JoinDiffer {
            sample_size: 10,
            ..JoinDiffer::default()
        }
    }

    pub fn materialize(mut self, table_name: Option<String>) -> JoinDiffer {
        self.materialize = table_name;
        self
    }

    pub fn materialize_all_rows(mut self, all_rows: bool) -> JoinDiffer {
        self.materialize_all_rows = all_rows;
        self
    }

    pub fn sample_exclusive_rows(mut self, sample: bool, sample_size: u64) -> JoinDiffer {
        self.sample_exclusive_rows = sample;
        self.sample_size = sample_size;
        self
    }

    pub fn table_write_limit(mut self, limit: Option<u64>) -> JoinDiffer {
        self.table_write_limit = limit;
        self
    }

    pub fn assume_unique_key(mut self, assume: bool) -> JoinDiffer {
        self.assume_unique_key = assume;
        self
    }

    pub(crate) fn from_options(options: &DiffOptions) -> JoinDiffer {
        JoinDiffer::new()
            .materialize(options.materialize.clone())
            .materialize_all_rows(options.materialize_all_rows)
            .sample_exclusive_rows(options.sample_exclusive_rows, options.sample_size)
            .table_write_limit(options.table_write_limit)
            .assume_unique_key(options.assume_unique_key)
    }

    pub(crate) async fn diff_into(
        self,
        left: TableSegment,
        right: TableSegment,
        sink: DiffSink,
    ) -> Result<()> {
        let db = Arc::clone(left.database());
        let cancel = sink.cancel.clone();

        if !self.assume_unique_key {
            let (lu, ru) = tokio::join!(
                left.ensure_unique_key(cancel.clone()),
                right.ensure_unique_key(cancel.clone())
            );
            lu?;
            ru?;
        }

        if let Some(name_template) = &self.materialize {
            self.materialize_diff(&db, &left, &right, name_template, cancel.clone())
                .await?;
        }

        if self.sample_exclusive_rows {
            self.sample_exclusives(&db, &left, &right, &sink).await?;
        }

        let sql = diff_query_sql(&left, &right, false)?;
        debug!("join diff query: {sql}");
        let mut stream = db.stream(sql, cancel).await?;

        let key_len = left.key_columns().len();
        let compared = left.compared_columns().len();
        while let Some(row) = stream.next().await {
            let row = row?;
            for record in explode_join_row(row, key_len, compared)? {
                sink.send(record).await?;
            }
        }
        Ok(())
    }

    async fn materialize_diff(
        &self,
        db: &Arc<Database>,
        left: &TableSegment,
        right: &TableSegment,
        name_template: &str,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<()> {
        if !db.dialect().supports_ctas() {
            return Err(DiffError::config(format!(
                "the {} dialect does not support materialisation",
                db.dialect().name()
            )));
        }
        let name = name_template.replace("%t", &Utc::now().format("%Y%m%d_%H%M%S").to_string());
        crate::core::identifier::validate_identifier(&name)?;
        let quoted = db.dialect().quote_ident(&name);

        let select = diff_query_sql(left, right, self.materialize_all_rows)?;
        let limit = match self.table_write_limit {
            Some(limit) => format!(" {}", db.dialect().render_limit(limit)),
            None => String::new(),
        };

        db.execute(format!("DROP TABLE IF EXISTS {quoted}"), cancel.clone())
            .await?;
        let created = db
            .execute(
                format!("CREATE TABLE {quoted} AS SELECT * FROM ({select}) AS __rd_diff{limit}"),
                cancel,
            )
            .await?;
        info!("materialised diff into {name} ({created} rows reported)");
        Ok(())
    }

    async fn sample_exclusives(
        &self,
        db: &Arc<Database>,
        left: &TableSegment,
        right: &TableSegment,
        sink: &DiffSink,
    ) -> Result<()> {
        let sql_a = exclusive_sample_sql(left, right, false, self.sample_size)?;
        let sql_b = exclusive_sample_sql(left, right, true, self.sample_size)?;
        let (rows_a, rows_b) = tokio::join!(
            db.fetch_all(sql_a, sink.cancel.clone()),
            db.fetch_all(sql_b, sink.cancel.clone())
        );

        let to_json = |rows: Vec<Vec<crate::core::value::DbValue>>| {
            serde_json::Value::Array(
                rows.into_iter()
                    .map(|row| {
                        serde_json::Value::Array(
                            row.into_iter()
                                .map(|cell| match cell.into_cell() {
                                    Some(text) => serde_json::Value::String(text),
                                    None => serde_json::Value::Null,
                                })
                                .collect(),
                        )
                    })
                    .collect(),
            )
        };

        let samples = serde_json::json!({
            "exclusive_a": to_json(rows_a?),
            "exclusive_b": to_json(rows_b?),
        });
        *sink
            .stats
            .exclusive_samples
            .lock()
            .expect("stats lock poisoned") = Some(samples);
        Ok(())
    }
}

fn join_on_sql(dialect: &crate::drivers::DialectImpl, key_len: usize) -> String {
    (0..key_len)
        .map(|i| {
            let key = dialect.quote_ident(&format!("__rd_k{i}"));
            format!("{LEFT_ALIAS}.{key} = {RIGHT_ALIAS}.{key}")
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// The full diff query: sign, canonical keys, left values, right values.
///
/// With `all_rows`, the WHERE clause is dropped and matching rows carry
/// an `=` sign, which is what `--materialize-all-rows` stores.
fn diff_query_sql(left: &TableSegment, right: &TableSegment, all_rows: bool) -> Result<String> {
    let d = left.database().dialect();
    let key_len = left.key_columns().len();
    let compared = left.compared_columns();

    let first_key = d.quote_ident("__rd_k0");
    let left_absent = format!("{LEFT_ALIAS}.{first_key} IS NULL");
    let right_absent = format!("{RIGHT_ALIAS}.{first_key} IS NULL");

    let distinct_checks: Vec<String> = (0..compared.len())
        .map(|j| {
            let col = d.quote_ident(&format!("__rd_c{j}"));
            d.render_is_distinct(
                &format!("{LEFT_ALIAS}.{col}"),
                &format!("{RIGHT_ALIAS}.{col}"),
            )
        })
        .collect();

    let sign_expr = if all_rows {
        let changed = if distinct_checks.is_empty() {
            "FALSE".to_string()
        } else {
            distinct_checks.join(" OR ")
        };
        format!(
            "CASE WHEN {right_absent} THEN '-' WHEN {left_absent} THEN '+' \
             WHEN {changed} THEN '!' ELSE '=' END"
        )
    } else {
        format!("CASE WHEN {right_absent} THEN '-' WHEN {left_absent} THEN '+' ELSE '!' END")
    };
    let sign_type = d.render_type("char(1)");
    let sign_col = format!("CAST({sign_expr} AS {sign_type}) AS {}", d.quote_ident("diff_sign"));

    let mut projection = vec![sign_col];
    for (i, key) in left.key_columns().iter().enumerate() {
        let alias = d.quote_ident(&format!("__rd_k{i}"));
        let coalesced = format!("COALESCE({LEFT_ALIAS}.{alias}, {RIGHT_ALIAS}.{alias})");
        let canonical = d.render_canonical(
            &coalesced,
            left.column_type(key)?,
            left.case_sensitive(),
        );
        projection.push(format!("{canonical} AS {}", d.quote_ident(key)));
    }
    for (j, col) in compared.iter().enumerate() {
        let alias = d.quote_ident(&format!("__rd_c{j}"));
        projection.push(format!(
            "{LEFT_ALIAS}.{alias} AS {}",
            d.quote_ident(&format!("{col}_a"))
        ));
    }
    for (j, col) in compared.iter().enumerate() {
        let alias = d.quote_ident(&format!("__rd_c{j}"));
        projection.push(format!(
            "{RIGHT_ALIAS}.{alias} AS {}",
            d.quote_ident(&format!("{col}_b"))
        ));
    }

    let where_sql = if all_rows {
        String::new()
    } else {
        let mut conditions = vec![left_absent, right_absent];
        conditions.extend(distinct_checks);
        format!(" WHERE {}", conditions.join(" OR "))
    };

    Ok(format!(
        "SELECT {projection} FROM ({left_sub}) AS {LEFT_ALIAS} \
         FULL OUTER JOIN ({right_sub}) AS {RIGHT_ALIAS} ON {on}{where_sql}",
        projection = projection.join(", "),
        left_sub = left.aliased_select_sql()?,
        right_sub = right.aliased_select_sql()?,
        on = join_on_sql(d, key_len),
    ))
}

/// Keys of rows present on exactly one side, in random order, capped.
fn exclusive_sample_sql(
    left: &TableSegment,
    right: &TableSegment,
    right_side: bool,
    sample_size: u64,
) -> Result<String> {
    let d = left.database().dialect();
    let key_len = left.key_columns().len();
    let (own, other, own_sub, other_sub) = if right_side {
        (RIGHT_ALIAS, LEFT_ALIAS, right.aliased_select_sql()?, left.aliased_select_sql()?)
    } else {
        (LEFT_ALIAS, RIGHT_ALIAS, left.aliased_select_sql()?, right.aliased_select_sql()?)
    };

    let keys: Vec<String> = (0..key_len)
        .map(|i| format!("{own}.{}", d.quote_ident(&format!("__rd_k{i}"))))
        .collect();
    let on = join_on_sql(d, key_len);
    let other_first_key = format!("{other}.{}", d.quote_ident("__rd_k0"));

    Ok(format!(
        "SELECT {keys} FROM ({own_sub}) AS {own} LEFT JOIN ({other_sub}) AS {other} \
         ON {on} WHERE {other_first_key} IS NULL ORDER BY {random} {limit}",
        keys = keys.join(", "),
        random = d.render_random(),
        limit = d.render_limit(sample_size),
    ))
}

/// Turn one joined row into diff records: `[sign, keys…, left…, right…]`.
fn explode_join_row(row: Row, key_len: usize, compared: usize) -> Result<Vec<DiffRecord>> {
    if row.len() != 1 + key_len + 2 * compared {
        return Err(DiffError::query(format!(
            "join diff returned {} columns, expected {}",
            row.len(),
            1 + key_len + 2 * compared
        )));
    }
    let sign = row
        .first()
        .and_then(|c| c.as_deref())
        .ok_or_else(|| DiffError::query("join diff returned a NULL sign"))?
        .to_string();

    let keys = &row[1..1 + key_len];
    let left_values = &row[1 + key_len..1 + key_len + compared];
    let right_values = &row[1 + key_len + compared..1 + key_len + 2 * compared];

    let build = |values: &[Option<String>]| {
        let mut out: Row = Vec::with_capacity(key_len + compared);
        out.extend_from_slice(keys);
        out.extend_from_slice(values);
        out
    };

    Ok(match sign.trim() {
        "-" => vec![DiffRecord {
            sign: Sign::Minus,
            row: build(left_values),
        }],
        "+" => vec![DiffRecord {
            sign: Sign::Plus,
            row: build(right_values),
        }],
        "!" => vec![
            DiffRecord {
                sign: Sign::Minus,
                row: build(left_values),
            },
            DiffRecord {
                sign: Sign::Plus,
                row: build(right_values),
            },
        ],
        "=" => Vec::new(),
        other => {
            return Err(DiffError::query(format!(
                "join diff returned an unexpected sign '{other}'"
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(values: &[Option<&str>]) -> Row {
        values.iter().map(|v| v.map(str::to_string)).collect()
    }

    #[test]
    fn test_explode_exclusive_left() {
        let row = cells(&[Some("-"), Some("7"), Some("x"), None]);
        let records = explode_join_row(row, 1, 1).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sign, Sign::Minus);
        assert_eq!(records[0].row, cells(&[Some("7"), Some("x")]));
    }

    #[test]
    fn test_explode_modified_pair() {
        let row = cells(&[Some("!"), Some("7"), Some("old"), Some("new")]);
        let records = explode_join_row(row, 1, 1).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sign, Sign::Minus);
        assert_eq!(records[0].row, cells(&[Some("7"), Some("old")]));
        assert_eq!(records[1].sign, Sign::Plus);
        assert_eq!(records[1].row, cells(&[Some("7"), Some("new")]));
    }

    #[test]
    fn test_explode_equal_row_is_dropped() {
        let row = cells(&[Some("="), Some("7"), Some("x"), Some("x")]);
        assert!(explode_join_row(row, 1, 1).unwrap().is_empty());
    }

    #[test]
    fn test_explode_rejects_garbage_sign() {
        let row = cells(&[Some("?"), Some("7")]);
        assert!(explode_join_row(row, 1, 0).is_err());
    }
}
